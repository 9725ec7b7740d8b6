use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};

use opencv::{
    core::{self, Mat, Point, Rect, Scalar, Vector},
    imgcodecs, imgproc,
    prelude::*,
    Result as CvResult,
};

use crate::camera::Frame;
use crate::grid::{ChangeGrid, GRID_COLS, GRID_ROWS};

const ALPHA: f64 = 0.2;

fn grid_color() -> Scalar {
    Scalar::new(0.0, 255.0, 0.0, 0.0)
}

/// Debug view of one camera: the latest analysed frame with the grid drawn
/// and changed cells tinted, kept as a JPEG on disk.
///
/// Rendering happens on its own thread; frames offered while it is busy are
/// dropped.
pub struct PreviewWriter {
    tx: Option<SyncSender<(Frame, ChangeGrid)>>,
    handle: Option<JoinHandle<()>>,
}

impl PreviewWriter {
    pub fn spawn(source_id: &str, dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{source_id}.jpg"));
        let (tx, rx) = mpsc::sync_channel(1);
        let camera_id = source_id.to_string();

        let handle = thread::Builder::new()
            .name(format!("preview-{source_id}"))
            .spawn(move || render_loop(camera_id, path, rx))?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn offer(&self, frame: &Frame, grid: &ChangeGrid) {
        if let Some(tx) = &self.tx {
            match tx.try_send((frame.clone(), grid.clone())) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => {
                    tracing::trace!("preview thread gone");
                }
            }
        }
    }
}

impl Drop for PreviewWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn render_loop(camera_id: String, path: PathBuf, rx: Receiver<(Frame, ChangeGrid)>) {
    for (frame, grid) in rx {
        let written = render(&frame, &grid)
            .map_err(|e| e.to_string())
            .and_then(|img| encode_jpeg(&img).ok_or_else(|| "jpeg encoding failed".to_string()))
            .and_then(|jpeg| write_replace(&path, &jpeg).map_err(|e| e.to_string()));
        if let Err(e) = written {
            tracing::warn!(camera = %camera_id, error = %e, "failed to write preview");
        }
    }
}

fn render(frame: &Frame, grid: &ChangeGrid) -> CvResult<Mat> {
    let mat = frame.to_mat()?;
    let mut img = match frame.channels {
        3 => mat,
        channels => {
            let code = if channels == 4 {
                imgproc::COLOR_BGRA2BGR
            } else {
                imgproc::COLOR_GRAY2BGR
            };
            let mut bgr = Mat::default();
            imgproc::cvt_color_def(&mat, &mut bgr, code)?;
            bgr
        }
    };

    let (height, width) = (img.rows(), img.cols());
    let cell_height = height / GRID_ROWS as i32;
    let cell_width = width / GRID_COLS as i32;

    let mut tinted = img.try_clone()?;
    for row in 0..GRID_ROWS {
        for col in 0..GRID_COLS {
            if grid.get(row, col) {
                let cell = Rect::new(
                    col as i32 * cell_width,
                    row as i32 * cell_height,
                    cell_width,
                    cell_height,
                );
                imgproc::rectangle(&mut tinted, cell, grid_color(), imgproc::FILLED, imgproc::LINE_8, 0)?;
            }
        }
    }
    let mut blended = Mat::default();
    core::add_weighted(&tinted, ALPHA, &img, 1.0 - ALPHA, 0.0, &mut blended, -1)?;
    img = blended;

    for col in 1..GRID_COLS as i32 {
        let x = col * cell_width;
        imgproc::line(&mut img, Point::new(x, 0), Point::new(x, height), grid_color(), 1, imgproc::LINE_8, 0)?;
    }
    for row in 1..GRID_ROWS as i32 {
        let y = row * cell_height;
        imgproc::line(&mut img, Point::new(0, y), Point::new(width, y), grid_color(), 1, imgproc::LINE_8, 0)?;
    }

    Ok(img)
}

fn encode_jpeg(mat: &Mat) -> Option<Vec<u8>> {
    let mut buf = Vector::<u8>::new();
    let params = Vector::<i32>::new();
    imgcodecs::imencode(".jpg", mat, &mut buf, &params).ok()?;
    Some(buf.to_vec())
}

fn write_replace(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let temp = path.with_extension("jpg.tmp");
    std::fs::write(&temp, data)?;
    std::fs::rename(&temp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_render_keeps_frame_size() {
        let frame = Frame::new(90, 160, 1, vec![40; 90 * 160], Instant::now());
        let grid = ChangeGrid::from_cells([0]).unwrap();

        let img = render(&frame, &grid).unwrap();
        assert_eq!((img.rows(), img.cols(), img.channels()), (90, 160, 3));
        assert!(encode_jpeg(&img).is_some_and(|jpeg| jpeg.starts_with(&[0xFF, 0xD8])));
    }

    #[test]
    fn test_writer_produces_file() {
        let dir = std::env::temp_dir().join(format!("camgrid-preview-{}", std::process::id()));
        let frame = Frame::new(90, 160, 3, vec![0; 90 * 160 * 3], Instant::now());
        {
            let writer = PreviewWriter::spawn("cam1", &dir).unwrap();
            writer.offer(&frame, &ChangeGrid::default());
        }
        assert!(dir.join("cam1.jpg").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
