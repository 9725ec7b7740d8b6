use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rows of the spatial grid every frame is partitioned into.
pub const GRID_ROWS: usize = 9;
/// Columns of the spatial grid every frame is partitioned into.
pub const GRID_COLS: usize = 16;
/// Number of cells; a cell index is `row * GRID_COLS + col`.
pub const CELLS: usize = GRID_ROWS * GRID_COLS;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cell index {0} is outside the {GRID_ROWS}x{GRID_COLS} grid")]
pub struct CellOutOfRange(pub usize);

/// Per-cell change flags for one analysed frame pair.
///
/// On the wire a grid is the ascending list of changed cell indices, which
/// keeps the common "almost nothing moved" case to a few bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct ChangeGrid {
    cells: Vec<bool>,
}

impl Default for ChangeGrid {
    fn default() -> Self {
        Self {
            cells: vec![false; CELLS],
        }
    }
}

impl ChangeGrid {
    /// Reduces a binarised difference image (row-major, one byte per pixel)
    /// to the grid.
    ///
    /// Cell bounds are `height / GRID_ROWS` by `width / GRID_COLS`; remainder
    /// rows and columns at the bottom and right edge belong to no cell and are
    /// never inspected.
    pub fn from_mask(mask: &[u8], height: usize, width: usize) -> Self {
        let cell_height = height / GRID_ROWS;
        let cell_width = width / GRID_COLS;
        let mut grid = Self::default();

        if cell_height == 0 || cell_width == 0 {
            return grid;
        }

        for row in 0..GRID_ROWS {
            for col in 0..GRID_COLS {
                let x0 = col * cell_width;
                let changed = (row * cell_height..(row + 1) * cell_height).any(|y| {
                    let start = y * width + x0;
                    mask.get(start..start + cell_width)
                        .is_some_and(|line| line.iter().any(|&px| px != 0))
                });
                grid.cells[row * GRID_COLS + col] = changed;
            }
        }

        grid
    }

    pub fn from_cells<I>(indices: I) -> Result<Self, CellOutOfRange>
    where
        I: IntoIterator<Item = usize>,
    {
        let mut grid = Self::default();
        for index in indices {
            grid.set(index)?;
        }
        Ok(grid)
    }

    pub fn set(&mut self, index: usize) -> Result<(), CellOutOfRange> {
        match self.cells.get_mut(index) {
            Some(cell) => {
                *cell = true;
                Ok(())
            }
            None => Err(CellOutOfRange(index)),
        }
    }

    pub fn get(&self, row: usize, col: usize) -> bool {
        row < GRID_ROWS && col < GRID_COLS && self.cells[row * GRID_COLS + col]
    }

    /// Indices of the changed cells, ascending.
    pub fn changed_cells(&self) -> impl Iterator<Item = usize> + '_ {
        self.cells
            .iter()
            .enumerate()
            .filter_map(|(index, &changed)| changed.then_some(index))
    }

    pub fn is_empty(&self) -> bool {
        !self.cells.iter().any(|&c| c)
    }
}

impl TryFrom<Vec<usize>> for ChangeGrid {
    type Error = CellOutOfRange;

    fn try_from(indices: Vec<usize>) -> Result<Self, Self::Error> {
        Self::from_cells(indices)
    }
}

impl From<ChangeGrid> for Vec<usize> {
    fn from(grid: ChangeGrid) -> Self {
        grid.changed_cells().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_mask(height: usize, width: usize) -> Vec<u8> {
        vec![0u8; height * width]
    }

    #[test]
    fn test_single_pixel_marks_one_cell() {
        let (height, width) = (GRID_ROWS * 4, GRID_COLS * 4);
        let mut mask = blank_mask(height, width);
        // row 1, col 2 of the grid
        mask[5 * width + 9] = 255;

        let grid = ChangeGrid::from_mask(&mask, height, width);
        assert!(grid.get(1, 2));
        assert_eq!(grid.changed_cells().collect::<Vec<_>>(), vec![GRID_COLS + 2]);
    }

    #[test]
    fn test_remainder_row_is_ignored() {
        let (k, m) = (3, 5);
        let (height, width) = (GRID_ROWS * k + 1, GRID_COLS * m);
        let mut mask = blank_mask(height, width);
        for px in &mut mask[(height - 1) * width..] {
            *px = 255;
        }

        let grid = ChangeGrid::from_mask(&mask, height, width);
        assert!(grid.is_empty());
    }

    #[test]
    fn test_remainder_column_is_ignored() {
        let (height, width) = (GRID_ROWS * 2, GRID_COLS * 2 + 1);
        let mut mask = blank_mask(height, width);
        for y in 0..height {
            mask[y * width + width - 1] = 255;
        }

        assert!(ChangeGrid::from_mask(&mask, height, width).is_empty());
    }

    #[test]
    fn test_frame_smaller_than_grid() {
        let mask = vec![255u8; 4 * 4];
        assert!(ChangeGrid::from_mask(&mask, 4, 4).is_empty());
    }

    #[test]
    fn test_wire_format_is_cell_list() {
        let grid = ChangeGrid::from_cells([0, 17, 143]).unwrap();
        let json = serde_json::to_string(&grid).unwrap();
        assert_eq!(json, "[0,17,143]");

        let back: ChangeGrid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, grid);
        assert!(serde_json::from_str::<ChangeGrid>("[144]").is_err());
    }
}
