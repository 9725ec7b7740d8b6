mod broadcast;
mod capture;
mod source;

use std::time::Instant;

use opencv::core::Mat;
use opencv::prelude::*;
use thiserror::Error;

pub use broadcast::FrameBroadcast;
pub use capture::{capture, CaptureOptions};
pub use source::OpenCvSource;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open source {0}")]
    Open(String),
    #[error("opencv error: {0}")]
    Cv(#[from] opencv::Error),
    #[error("failed to write result: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A decoded 8-bit frame, row-major with interleaved channels.
#[derive(Debug, Clone)]
pub struct Frame {
    pub rows: i32,
    pub cols: i32,
    pub channels: i32,
    pub data: Vec<u8>,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(rows: i32, cols: i32, channels: i32, data: Vec<u8>, captured_at: Instant) -> Self {
        debug_assert_eq!(data.len(), (rows * cols * channels) as usize);
        Self {
            rows,
            cols,
            channels,
            data,
            captured_at,
        }
    }

    pub fn from_mat(mat: &Mat, captured_at: Instant) -> opencv::Result<Self> {
        let data = if mat.is_continuous() {
            mat.data_bytes()?.to_vec()
        } else {
            mat.try_clone()?.data_bytes()?.to_vec()
        };
        Ok(Self::new(mat.rows(), mat.cols(), mat.channels(), data, captured_at))
    }

    /// Owned copy of the pixels as a `Mat`.
    pub fn to_mat(&self) -> opencv::Result<Mat> {
        let flat = Mat::from_slice(&self.data)?;
        let shaped = flat.reshape(self.channels, self.rows)?;
        shaped.try_clone()
    }
}

/// Where a worker's frames come from.
pub trait FrameSource {
    fn is_open(&self) -> bool;

    /// Next frame; `Ok(None)` once the source is exhausted.
    fn read(&mut self) -> Result<Option<Frame>, CaptureError>;

    fn release(&mut self);
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};

    use super::*;

    /// Replays a fixed list of frames, optionally failing after them.
    pub struct ScriptedSource {
        frames: VecDeque<Frame>,
        fail_at_end: bool,
        pub released: bool,
    }

    impl ScriptedSource {
        pub fn new(frames: Vec<Frame>) -> Self {
            Self {
                frames: frames.into(),
                fail_at_end: false,
                released: false,
            }
        }

        pub fn failing(mut self) -> Self {
            self.fail_at_end = true;
            self
        }
    }

    impl FrameSource for ScriptedSource {
        fn is_open(&self) -> bool {
            !self.released
        }

        fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
            match self.frames.pop_front() {
                Some(frame) => Ok(Some(frame)),
                None if self.fail_at_end => Err(CaptureError::Open("scripted failure".into())),
                None => Ok(None),
            }
        }

        fn release(&mut self) {
            self.released = true;
        }
    }

    /// `count` tiny grey frames spaced `spacing` apart.
    pub fn blank_frames(count: usize, spacing: Duration) -> Vec<Frame> {
        let start = Instant::now();
        (0..count)
            .map(|i| Frame::new(2, 2, 1, vec![0; 4], start + spacing * i as u32))
            .collect()
    }
}
