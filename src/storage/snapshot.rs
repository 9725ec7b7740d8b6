use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::store::{MotionDays, MotionStore};

pub const SNAPSHOT_FILE: &str = "motions.json";
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode or decode snapshot: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("unsupported snapshot version {0}")]
    Version(u32),
}

#[derive(Serialize, Deserialize)]
struct SnapshotDocument {
    version: u32,
    days: MotionDays,
}

/// The single file holding every day and source of the motion store.
#[derive(Debug, Clone)]
pub struct Snapshot {
    path: PathBuf,
}

impl Snapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(SNAPSHOT_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the store; a missing file is a fresh start.
    pub fn load(&self) -> Result<MotionStore, SnapshotError> {
        tracing::debug!(path = %self.path.display(), "loading motion data");

        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no saved motion data found, starting fresh");
                return Ok(MotionStore::new());
            }
            Err(e) => return Err(e.into()),
        };

        let document: SnapshotDocument = serde_json::from_reader(BufReader::new(file))?;
        if document.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version(document.version));
        }

        tracing::info!(
            path = %self.path.display(),
            days = document.days.len(),
            "loaded motion data"
        );
        Ok(MotionStore::from_days(document.days))
    }

    /// Writes the whole store next to the snapshot and renames it into place,
    /// so a crash mid-write leaves the previous snapshot intact.
    pub fn save(&self, store: &MotionStore) -> Result<(), SnapshotError> {
        let document = SnapshotDocument {
            version: SNAPSHOT_VERSION,
            days: store.to_days(),
        };
        let data = serde_json::to_vec(&document)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp_path = temp_path_for(&self.path);
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;

        tracing::info!(
            path = %self.path.display(),
            bytes = data.len(),
            "wrote motion analysis results to disk"
        );
        Ok(())
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    PathBuf::from(temp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::ChangeGrid;
    use crate::storage::CellRect;
    use chrono::NaiveDate;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("camgrid-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_missing_snapshot_is_empty_store() {
        let dir = temp_dir("missing");
        let store = Snapshot::in_dir(&dir).load().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_round_trip_keeps_queries() {
        let dir = temp_dir("roundtrip");
        let snapshot = Snapshot::in_dir(&dir);

        let store = MotionStore::new();
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let grid = ChangeGrid::from_cells([0, 20, 143]).unwrap();
        store.apply_change_grid_at(&grid, "cam1", day.and_hms_opt(12, 0, 0).unwrap());
        store.apply_change_grid_at(&grid, "cam2", day.and_hms_opt(18, 30, 5).unwrap());
        let next = day.succ_opt().unwrap().and_hms_opt(0, 0, 1).unwrap();
        store.apply_change_grid_at(&ChangeGrid::from_cells([3]).unwrap(), "cam1", next);

        snapshot.save(&store).unwrap();
        assert!(!temp_path_for(snapshot.path()).exists());

        let loaded = snapshot.load().unwrap();
        assert_eq!(loaded.to_days(), store.to_days());
        assert_eq!(
            loaded.heatmap("2024-05-01", "cam2").unwrap(),
            store.heatmap("2024-05-01", "cam2").unwrap()
        );
        let rect = CellRect::new(0, 0, 4, 2).unwrap();
        assert_eq!(
            loaded.motions_in_area("2024-05-02", "cam1", rect).unwrap(),
            store.motions_in_area("2024-05-02", "cam1", rect).unwrap()
        );

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_save_replaces_previous_snapshot() {
        let dir = temp_dir("replace");
        let snapshot = Snapshot::in_dir(&dir);
        let store = MotionStore::new();
        snapshot.save(&store).unwrap();

        let at = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(1, 2, 3)
            .unwrap();
        store.apply_change_grid_at(&ChangeGrid::from_cells([9]).unwrap(), "cam1", at);
        snapshot.save(&store).unwrap();

        assert_eq!(snapshot.load().unwrap().sources("2024-05-01"), vec!["cam1"]);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_rejects_unknown_version() {
        let dir = temp_dir("version");
        fs::create_dir_all(&dir).unwrap();
        let snapshot = Snapshot::in_dir(&dir);
        fs::write(snapshot.path(), r#"{"version": 7, "days": {}}"#).unwrap();

        assert!(matches!(snapshot.load(), Err(SnapshotError::Version(7))));
        fs::remove_dir_all(&dir).unwrap();
    }
}
