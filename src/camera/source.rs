use std::time::Instant;

use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};

use super::{CaptureError, Frame, FrameSource};

/// Frames from a stream URL, file path, or local device index.
pub struct OpenCvSource {
    source_id: String,
    capture: VideoCapture,
    frame: Mat,
}

impl OpenCvSource {
    pub fn open(source_id: &str, address: &str) -> Result<Self, CaptureError> {
        let capture = match address.parse::<i32>() {
            Ok(index) => VideoCapture::new(index, videoio::CAP_ANY)?,
            Err(_) => VideoCapture::from_file(address, videoio::CAP_ANY)?,
        };

        if !capture.is_opened()? {
            return Err(CaptureError::Open(source_id.to_string()));
        }

        tracing::info!(camera = %source_id, "capture opened");
        Ok(Self {
            source_id: source_id.to_string(),
            capture,
            frame: Mat::default(),
        })
    }
}

impl FrameSource for OpenCvSource {
    fn is_open(&self) -> bool {
        self.capture.is_opened().unwrap_or(false)
    }

    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        if !self.capture.read(&mut self.frame)? || self.frame.empty() {
            return Ok(None);
        }
        Ok(Some(Frame::from_mat(&self.frame, Instant::now())?))
    }

    fn release(&mut self) {
        if let Err(e) = self.capture.release() {
            tracing::warn!(camera = %self.source_id, error = %e, "failed to release capture");
        }
    }
}

impl Drop for OpenCvSource {
    fn drop(&mut self) {
        if self.is_open() {
            self.release();
        }
    }
}
