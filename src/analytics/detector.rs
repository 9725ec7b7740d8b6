use opencv::{
    core::{self, Mat, Size},
    imgproc,
    prelude::*,
    Result as CvResult,
};

use crate::camera::Frame;
use crate::config::AnalyticsConfig;
use crate::grid::ChangeGrid;

/// Frame differencing on blurred luminance.
pub struct MotionDetector {
    kernel: Size,
    threshold: f64,
}

impl MotionDetector {
    pub fn new(config: &AnalyticsConfig) -> Self {
        Self {
            kernel: Size::new(config.blur_kernel, config.blur_kernel),
            threshold: config.diff_threshold as f64,
        }
    }

    /// Single-channel, blurred copy of `frame`, ready for differencing.
    pub fn prepare(&self, frame: &Frame) -> CvResult<Mat> {
        let gray = to_gray(frame)?;
        let mut blurred = Mat::default();
        imgproc::gaussian_blur_def(&gray, &mut blurred, self.kernel, 0.0)?;
        Ok(blurred)
    }

    /// Change grid between two prepared frames of the same size.
    pub fn diff(&self, previous: &Mat, current: &Mat) -> CvResult<ChangeGrid> {
        let mut delta = Mat::default();
        core::absdiff(previous, current, &mut delta)?;

        let mut mask = Mat::default();
        imgproc::threshold(&delta, &mut mask, self.threshold, 255.0, imgproc::THRESH_BINARY)?;

        let height = mask.rows() as usize;
        let width = mask.cols() as usize;
        Ok(ChangeGrid::from_mask(mask.data_bytes()?, height, width))
    }
}

fn to_gray(frame: &Frame) -> CvResult<Mat> {
    let mat = frame.to_mat()?;
    let code = match frame.channels {
        1 => return Ok(mat),
        3 => imgproc::COLOR_BGR2GRAY,
        4 => imgproc::COLOR_BGRA2GRAY,
        n => {
            return Err(opencv::Error::new(
                core::StsBadArg,
                format!("unsupported channel count {n}"),
            ))
        }
    };
    let mut gray = Mat::default();
    imgproc::cvt_color_def(&mat, &mut gray, code)?;
    Ok(gray)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{GRID_COLS, GRID_ROWS};
    use std::time::Instant;

    const CELL: usize = 40;

    /// Black BGR frame with a white square inside grid cell (row, col).
    fn frame_with_square(cell: Option<(usize, usize)>) -> Frame {
        let (rows, cols) = (GRID_ROWS * CELL, GRID_COLS * CELL);
        let mut data = vec![0u8; rows * cols * 3];
        if let Some((row, col)) = cell {
            for y in row * CELL + 12..row * CELL + 28 {
                for x in col * CELL + 12..col * CELL + 28 {
                    let i = (y * cols + x) * 3;
                    data[i..i + 3].copy_from_slice(&[255, 255, 255]);
                }
            }
        }
        Frame::new(rows as i32, cols as i32, 3, data, Instant::now())
    }

    #[test]
    fn test_change_confined_to_one_cell() {
        let detector = MotionDetector::new(&AnalyticsConfig::default());
        let previous = detector.prepare(&frame_with_square(None)).unwrap();
        let current = detector.prepare(&frame_with_square(Some((0, 0)))).unwrap();

        let grid = detector.diff(&previous, &current).unwrap();
        assert_eq!(grid.changed_cells().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_identical_frames_have_no_change() {
        let detector = MotionDetector::new(&AnalyticsConfig::default());
        let a = detector.prepare(&frame_with_square(Some((4, 7)))).unwrap();
        let b = detector.prepare(&frame_with_square(Some((4, 7)))).unwrap();

        assert!(detector.diff(&a, &b).unwrap().is_empty());
    }

    #[test]
    fn test_prepare_outputs_single_channel() {
        let detector = MotionDetector::new(&AnalyticsConfig::default());
        let prepared = detector.prepare(&frame_with_square(None)).unwrap();
        assert_eq!(prepared.channels(), 1);
        assert_eq!(prepared.rows() as usize, GRID_ROWS * CELL);
        assert_eq!(prepared.cols() as usize, GRID_COLS * CELL);
    }

    #[test]
    fn test_rejects_two_channel_frames() {
        let detector = MotionDetector::new(&AnalyticsConfig::default());
        let frame = Frame::new(2, 2, 2, vec![0; 8], Instant::now());
        assert!(detector.prepare(&frame).is_err());
    }
}
