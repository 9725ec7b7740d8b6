use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::NaiveDateTime;

use crate::grid::ChangeGrid;

use super::clock::{self, DayKey};
use super::matrix::MotionMatrix;

pub type SourceId = String;

/// Plain nested form of the store, used for snapshots.
pub type MotionDays = BTreeMap<DayKey, BTreeMap<SourceId, MotionMatrix>>;

type DayMatrices = HashMap<SourceId, Arc<RwLock<MotionMatrix>>>;

/// Day -> source -> motion matrix, shared between result parsers and queries.
///
/// Only the outer map is contended: each source has a single parser writing
/// its matrix, so a matrix lock is only ever shared with readers.
pub struct MotionStore {
    days: Arc<RwLock<HashMap<DayKey, DayMatrices>>>,
}

impl MotionStore {
    pub fn new() -> Self {
        Self {
            days: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn from_days(days: MotionDays) -> Self {
        let days = days
            .into_iter()
            .map(|(day, sources)| {
                let sources = sources
                    .into_iter()
                    .map(|(source, matrix)| (source, Arc::new(RwLock::new(matrix))))
                    .collect();
                (day, sources)
            })
            .collect();
        Self {
            days: Arc::new(RwLock::new(days)),
        }
    }

    /// Copies the whole store out of the locks.
    pub fn to_days(&self) -> MotionDays {
        let days = self.days.read().unwrap_or_else(PoisonError::into_inner);
        days.iter()
            .map(|(day, sources)| {
                let sources = sources
                    .iter()
                    .map(|(source, matrix)| {
                        let matrix = matrix.read().unwrap_or_else(PoisonError::into_inner);
                        (source.clone(), matrix.clone())
                    })
                    .collect();
                (day.clone(), sources)
            })
            .collect()
    }

    pub(super) fn matrix(&self, day: &str, source_id: &str) -> Option<Arc<RwLock<MotionMatrix>>> {
        let days = self.days.read().unwrap_or_else(PoisonError::into_inner);
        days.get(day)?.get(source_id).cloned()
    }

    fn matrix_or_insert(&self, day: &str, source_id: &str) -> Arc<RwLock<MotionMatrix>> {
        if let Some(matrix) = self.matrix(day, source_id) {
            return matrix;
        }

        let mut days = self.days.write().unwrap_or_else(PoisonError::into_inner);
        let matrix = days
            .entry(day.to_string())
            .or_default()
            .entry(source_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(camera = %source_id, day = %day, "creating motion matrix");
                Arc::new(RwLock::new(MotionMatrix::new()))
            });
        Arc::clone(matrix)
    }

    /// Records a change grid for the current wall-clock slot.
    pub fn apply_change_grid(&self, grid: &ChangeGrid, source_id: &str) -> usize {
        self.apply_change_grid_at(grid, source_id, clock::now())
    }

    /// Records a change grid at `at`. Returns how many entries were newly set.
    pub fn apply_change_grid_at(
        &self,
        grid: &ChangeGrid,
        source_id: &str,
        at: NaiveDateTime,
    ) -> usize {
        if grid.is_empty() {
            return 0;
        }

        let day = clock::day_key(at.date());
        let slot = clock::time_slot(at.time());
        let matrix = self.matrix_or_insert(&day, source_id);
        let mut matrix = matrix.write().unwrap_or_else(PoisonError::into_inner);

        let mut added = 0;
        for cell in grid.changed_cells() {
            match matrix.set(cell, slot) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(camera = %source_id, error = %e, "dropping change"),
            }
        }
        added
    }

    pub fn days(&self) -> Vec<DayKey> {
        let days = self.days.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<DayKey> = days.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Sources with a matrix on `day`, sorted.
    pub fn sources(&self, day: &str) -> Vec<SourceId> {
        let days = self.days.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<SourceId> = days
            .get(day)
            .map(|sources| sources.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.days
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

impl Default for MotionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MotionStore {
    fn clone(&self) -> Self {
        Self {
            days: Arc::clone(&self.days),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_lazy_creation_per_day_and_source() {
        let store = MotionStore::new();
        assert!(store.is_empty());
        assert_eq!(store.apply_change_grid_at(&ChangeGrid::default(), "cam1", at(1, 0, 0)), 0);
        assert!(store.is_empty());

        let grid = ChangeGrid::from_cells([0, 5]).unwrap();
        assert_eq!(store.apply_change_grid_at(&grid, "cam1", at(1, 0, 0)), 2);
        store.apply_change_grid_at(&grid, "cam2", at(1, 0, 0));

        assert_eq!(store.days(), vec!["2024-05-01".to_string()]);
        assert_eq!(store.sources("2024-05-01"), vec!["cam1", "cam2"]);
        assert!(store.sources("2024-05-02").is_empty());
    }

    #[test]
    fn test_entries_are_never_cleared() {
        let store = MotionStore::new();
        let grid = ChangeGrid::from_cells([7]).unwrap();
        store.apply_change_grid_at(&grid, "cam1", at(8, 0, 0));

        // Later grids without cell 7 leave the earlier bit alone.
        store.apply_change_grid_at(&ChangeGrid::from_cells([8]).unwrap(), "cam1", at(8, 0, 0));
        store.apply_change_grid_at(&ChangeGrid::default(), "cam1", at(8, 0, 1));

        let matrix = store.matrix("2024-05-01", "cam1").unwrap();
        let matrix = matrix.read().unwrap();
        assert!(matrix.get(7, 28_800));
        assert!(matrix.get(8, 28_800));
    }

    #[test]
    fn test_same_grid_twice_is_idempotent() {
        let store = MotionStore::new();
        let grid = ChangeGrid::from_cells([1, 2, 3]).unwrap();
        assert_eq!(store.apply_change_grid_at(&grid, "cam1", at(9, 30, 0)), 3);
        let once = store.to_days();
        assert_eq!(store.apply_change_grid_at(&grid, "cam1", at(9, 30, 0)), 0);
        assert_eq!(store.to_days(), once);
    }

    #[test]
    fn test_concurrent_sources() {
        let store = MotionStore::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let grid = ChangeGrid::from_cells([i]).unwrap();
                    for s in 0..100 {
                        store.apply_change_grid_at(&grid, &format!("cam{i}"), at(0, 0, s % 60));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.sources("2024-05-01").len(), 8);
        let days = store.to_days();
        assert_eq!(days["2024-05-01"]["cam3"].row(3).len(), 60);
    }
}
