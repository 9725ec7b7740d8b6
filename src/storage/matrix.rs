use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grid::CELLS;

use super::clock::TIMEFRAMES;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatrixError {
    #[error("entry ({cell}, {slot}) is outside the {CELLS}x{TIMEFRAMES} matrix")]
    OutOfRange { cell: usize, slot: u32 },
    #[error("expected {CELLS} rows, found {0}")]
    RowCount(usize),
    #[error("row {0} is not strictly ascending")]
    Unsorted(usize),
}

#[derive(Deserialize)]
struct RawMatrix {
    rows: Vec<Vec<u32>>,
}

/// Boolean `CELLS x TIMEFRAMES` matrix stored row-wise as sorted slot lists.
///
/// Motion lands on a handful of slots per cell per day, and queries OR whole
/// rows together, so each row keeps only the slots that are set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawMatrix")]
pub struct MotionMatrix {
    rows: Vec<Vec<u32>>,
}

impl Default for MotionMatrix {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionMatrix {
    pub fn new() -> Self {
        Self {
            rows: vec![Vec::new(); CELLS],
        }
    }

    /// Marks `(cell, slot)`. Returns whether the entry was previously unset.
    pub fn set(&mut self, cell: usize, slot: u32) -> Result<bool, MatrixError> {
        if slot as usize >= TIMEFRAMES {
            return Err(MatrixError::OutOfRange { cell, slot });
        }
        let row = self
            .rows
            .get_mut(cell)
            .ok_or(MatrixError::OutOfRange { cell, slot })?;

        // Writes arrive in wall-clock order, so this is almost always an append.
        match row.last() {
            None => {
                row.push(slot);
                return Ok(true);
            }
            Some(&last) if slot > last => {
                row.push(slot);
                return Ok(true);
            }
            _ => {}
        }

        match row.binary_search(&slot) {
            Ok(_) => Ok(false),
            Err(pos) => {
                row.insert(pos, slot);
                Ok(true)
            }
        }
    }

    #[cfg(test)]
    pub fn get(&self, cell: usize, slot: u32) -> bool {
        self.rows
            .get(cell)
            .is_some_and(|row| row.binary_search(&slot).is_ok())
    }

    pub fn row(&self, cell: usize) -> &[u32] {
        self.rows.get(cell).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of set slots per cell.
    pub fn row_counts(&self) -> Vec<u32> {
        self.rows.iter().map(|row| row.len() as u32).collect()
    }

    #[cfg(test)]
    pub fn nnz(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    /// Logical OR of the given rows, as the set of slots that are set in any of them.
    pub fn union_rows<I>(&self, cells: I) -> BTreeSet<u32>
    where
        I: IntoIterator<Item = usize>,
    {
        cells
            .into_iter()
            .flat_map(|cell| self.row(cell).iter().copied())
            .collect()
    }

    pub fn union_all(&self) -> BTreeSet<u32> {
        self.union_rows(0..CELLS)
    }
}

impl TryFrom<RawMatrix> for MotionMatrix {
    type Error = MatrixError;

    fn try_from(raw: RawMatrix) -> Result<Self, Self::Error> {
        if raw.rows.len() != CELLS {
            return Err(MatrixError::RowCount(raw.rows.len()));
        }
        for (cell, row) in raw.rows.iter().enumerate() {
            if row.windows(2).any(|w| w[0] >= w[1]) {
                return Err(MatrixError::Unsorted(cell));
            }
            if let Some(&slot) = row.last() {
                if slot as usize >= TIMEFRAMES {
                    return Err(MatrixError::OutOfRange { cell, slot });
                }
            }
        }
        Ok(Self { rows: raw.rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_is_idempotent() {
        let mut matrix = MotionMatrix::new();
        assert_eq!(matrix.set(3, 100), Ok(true));
        let once = matrix.clone();
        assert_eq!(matrix.set(3, 100), Ok(false));
        assert_eq!(matrix, once);
        assert_eq!(matrix.nnz(), 1);
    }

    #[test]
    fn test_out_of_order_writes_stay_sorted() {
        let mut matrix = MotionMatrix::new();
        for slot in [50, 10, 70, 30, 10] {
            matrix.set(0, slot).unwrap();
        }
        assert_eq!(matrix.row(0), &[10, 30, 50, 70]);
        assert!(matrix.get(0, 30));
        assert!(!matrix.get(0, 31));
    }

    #[test]
    fn test_rejects_out_of_range() {
        let mut matrix = MotionMatrix::new();
        assert!(matrix.set(CELLS, 0).is_err());
        assert!(matrix.set(0, TIMEFRAMES as u32).is_err());
        assert_eq!(matrix.nnz(), 0);
    }

    #[test]
    fn test_union_rows() {
        let mut matrix = MotionMatrix::new();
        matrix.set(0, 5).unwrap();
        matrix.set(1, 5).unwrap();
        matrix.set(1, 9).unwrap();
        matrix.set(2, 1).unwrap();

        let union = matrix.union_rows([0, 1]);
        assert_eq!(union.into_iter().collect::<Vec<_>>(), vec![5, 9]);
        assert_eq!(matrix.union_all().len(), 3);
        assert_eq!(matrix.row_counts()[1], 2);
    }

    #[test]
    fn test_deserialize_validates_rows() {
        let mut rows = vec![Vec::<u32>::new(); CELLS];
        rows[4] = vec![9, 3];
        let json = serde_json::json!({ "rows": rows });
        assert!(serde_json::from_value::<MotionMatrix>(json).is_err());

        let json = serde_json::json!({ "rows": [[1, 2]] });
        assert!(serde_json::from_value::<MotionMatrix>(json).is_err());
    }
}
