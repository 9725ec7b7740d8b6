use std::collections::BTreeSet;
use std::sync::PoisonError;

use chrono::NaiveTime;
use thiserror::Error;

use crate::grid::{CELLS, GRID_COLS, GRID_ROWS};

use super::clock;
use super::store::MotionStore;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("requested selection ({x}, {y}) {width}x{height} is out of bounds")]
    OutOfBounds {
        x: i64,
        y: i64,
        width: i64,
        height: i64,
    },
    #[error("no motion data for camera {camera} on {day}")]
    NoData { day: String, camera: String },
    #[error("invalid selection {0}")]
    InvalidSelection(String),
    #[error("span size must be at least 1")]
    InvalidSpan,
}

/// Rectangle in cell coordinates, `x`/`width` along columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl CellRect {
    /// Validates a rectangle against the grid. Rectangles are rejected, not clamped.
    pub fn new(x: i64, y: i64, width: i64, height: i64) -> Result<Self, QueryError> {
        if !fits(x, width, GRID_COLS) || !fits(y, height, GRID_ROWS) {
            return Err(QueryError::OutOfBounds {
                x,
                y,
                width,
                height,
            });
        }
        Ok(Self {
            x: x as usize,
            y: y as usize,
            width: width as usize,
            height: height as usize,
        })
    }

    /// Maps a selection given in fractions of the frame to cells.
    ///
    /// Extents are widened by one cell so a selection never falls between
    /// cell borders; a full-frame selection therefore does not fit.
    pub fn from_fractions(left: f64, top: f64, width: f64, height: f64) -> Result<Self, QueryError> {
        if [left, top, width, height]
            .iter()
            .any(|f| !(0.0..=1.0).contains(f))
        {
            return Err(QueryError::InvalidSelection(format!(
                "left={left} top={top} width={width} height={height}"
            )));
        }
        let cols = GRID_COLS as f64;
        let rows = GRID_ROWS as f64;
        Self::new(
            (left * cols).floor() as i64,
            (top * rows).floor() as i64,
            (width * cols).floor() as i64 + 1,
            (height * rows).floor() as i64 + 1,
        )
    }

    /// Maps a selection in pixels of a `frame_width` x `frame_height` frame
    /// to cells, widening extents by one cell like [`from_fractions`](Self::from_fractions).
    pub fn from_pixels(
        x: i64,
        y: i64,
        width: i64,
        height: i64,
        frame_width: i64,
        frame_height: i64,
    ) -> Result<Self, QueryError> {
        let invalid = || {
            QueryError::InvalidSelection(format!(
                "{x},{y} {width}x{height} in a {frame_width}x{frame_height} frame"
            ))
        };
        if frame_width < GRID_COLS as i64 || frame_height < GRID_ROWS as i64 {
            return Err(invalid());
        }
        let to_cells = |pixels: i64, frame: i64, cells: usize| {
            if pixels < 0 {
                return None;
            }
            pixels.checked_mul(cells as i64).map(|scaled| scaled / frame)
        };
        let cell_x = to_cells(x, frame_width, GRID_COLS).ok_or_else(invalid)?;
        let cell_y = to_cells(y, frame_height, GRID_ROWS).ok_or_else(invalid)?;
        let cell_w = to_cells(width, frame_width, GRID_COLS).ok_or_else(invalid)?;
        let cell_h = to_cells(height, frame_height, GRID_ROWS).ok_or_else(invalid)?;
        Self::new(cell_x, cell_y, cell_w.saturating_add(1), cell_h.saturating_add(1))
    }

    pub fn full() -> Self {
        Self {
            x: 0,
            y: 0,
            width: GRID_COLS,
            height: GRID_ROWS,
        }
    }

    /// Cell indices covered, row by row.
    pub fn cells(&self) -> impl Iterator<Item = usize> + '_ {
        (self.y..self.y + self.height).flat_map(move |row| {
            (self.x..self.x + self.width).map(move |col| row * GRID_COLS + col)
        })
    }
}

/// Whether `start..start + extent` lies within `0..limit`.
fn fits(start: i64, extent: i64, limit: usize) -> bool {
    start >= 0
        && extent >= 0
        && start
            .checked_add(extent)
            .is_some_and(|end| end <= limit as i64)
}

/// Collapses slots into spans of `span_size` slots each.
pub fn coarsen(slots: &BTreeSet<u32>, span_size: u32) -> Result<BTreeSet<u32>, QueryError> {
    if span_size == 0 {
        return Err(QueryError::InvalidSpan);
    }
    Ok(slots.iter().map(|slot| slot / span_size).collect())
}

impl MotionStore {
    fn no_data(day: &str, camera: &str) -> QueryError {
        QueryError::NoData {
            day: day.to_string(),
            camera: camera.to_string(),
        }
    }

    /// Motion slots per cell.
    pub fn heatmap(&self, day: &str, source_id: &str) -> Result<Vec<u32>, QueryError> {
        let matrix = self
            .matrix(day, source_id)
            .ok_or_else(|| Self::no_data(day, source_id))?;
        let matrix = matrix.read().unwrap_or_else(PoisonError::into_inner);
        let counts = matrix.row_counts();
        debug_assert_eq!(counts.len(), CELLS);
        Ok(counts)
    }

    /// Slots in which any cell of `rect` saw motion.
    pub fn motions_in_area(
        &self,
        day: &str,
        source_id: &str,
        rect: CellRect,
    ) -> Result<BTreeSet<u32>, QueryError> {
        let matrix = self
            .matrix(day, source_id)
            .ok_or_else(|| Self::no_data(day, source_id))?;
        let matrix = matrix.read().unwrap_or_else(PoisonError::into_inner);
        Ok(matrix.union_rows(rect.cells()))
    }

    /// Times of day with motion anywhere in the frame.
    pub fn motion_timestamps(
        &self,
        day: &str,
        source_id: &str,
    ) -> Result<BTreeSet<NaiveTime>, QueryError> {
        let matrix = self
            .matrix(day, source_id)
            .ok_or_else(|| Self::no_data(day, source_id))?;
        let matrix = matrix.read().unwrap_or_else(PoisonError::into_inner);
        Ok(matrix
            .union_all()
            .into_iter()
            .filter_map(clock::slot_time)
            .collect())
    }
}
