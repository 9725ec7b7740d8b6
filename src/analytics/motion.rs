use std::path::PathBuf;
use std::time::{Duration, Instant};

use opencv::core::Mat;

use crate::camera::Frame;
use crate::config::AnalyticsConfig;
use crate::grid::ChangeGrid;
use crate::storage::{MotionStore, Snapshot};

use super::detector::MotionDetector;
use super::preview::PreviewWriter;
use super::{Analysis, AnalysisError, AnalysisStage};

pub const MOTION_SEARCH: &str = "motion_search";

/// Per-cell motion search feeding the motion store.
pub struct MotionSearch {
    config: AnalyticsConfig,
    store: MotionStore,
    snapshot: Option<Snapshot>,
    preview_dir: Option<PathBuf>,
}

impl MotionSearch {
    pub fn new(config: AnalyticsConfig, store: MotionStore) -> Self {
        Self {
            config,
            store,
            snapshot: None,
            preview_dir: None,
        }
    }

    /// Saves the store to `snapshot` on termination.
    pub fn with_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Where visualised cameras write their debug view.
    pub fn with_preview_dir(mut self, dir: PathBuf) -> Self {
        self.preview_dir = Some(dir);
        self
    }
}

impl Analysis for MotionSearch {
    fn name(&self) -> &'static str {
        MOTION_SEARCH
    }

    fn stage(
        &self,
        source_id: &str,
        visualize: bool,
    ) -> Result<Box<dyn AnalysisStage>, AnalysisError> {
        let preview = match (&self.preview_dir, visualize) {
            (Some(dir), true) => Some(PreviewWriter::spawn(source_id, dir)?),
            _ => None,
        };
        Ok(Box::new(MotionStage {
            throttle: Throttle::new(self.config.frame_period()),
            detector: MotionDetector::new(&self.config),
            previous: None,
            preview,
        }))
    }

    fn apply(&self, payload: serde_json::Value, source_id: &str) -> Result<(), AnalysisError> {
        let grid: ChangeGrid = serde_json::from_value(payload)?;
        let added = self.store.apply_change_grid(&grid, source_id);
        if added > 0 {
            tracing::trace!(camera = %source_id, cells = added, "motion recorded");
        }
        Ok(())
    }

    fn on_termination(&self) -> Result<(), AnalysisError> {
        if let Some(snapshot) = &self.snapshot {
            snapshot.save(&self.store)?;
        }
        Ok(())
    }
}

/// Lets through at most one frame per period; the rest are dropped.
struct Throttle {
    period: Duration,
    last: Option<Instant>,
}

impl Throttle {
    fn new(period: Duration) -> Self {
        Self { period, last: None }
    }

    fn accept(&mut self, at: Instant) -> bool {
        match self.last {
            Some(last) if at.saturating_duration_since(last) < self.period => false,
            _ => {
                self.last = Some(at);
                true
            }
        }
    }
}

struct MotionStage {
    throttle: Throttle,
    detector: MotionDetector,
    previous: Option<Mat>,
    preview: Option<PreviewWriter>,
}

impl MotionStage {
    fn next_grid(&mut self, frame: &Frame) -> Result<Option<ChangeGrid>, AnalysisError> {
        if !self.throttle.accept(frame.captured_at) {
            return Ok(None);
        }

        let prepared = self.detector.prepare(frame)?;
        let Some(previous) = self.previous.replace(prepared) else {
            return Ok(None);
        };
        let current = self.previous.as_ref().unwrap_or(&previous);
        Ok(Some(self.detector.diff(&previous, current)?))
    }
}

impl AnalysisStage for MotionStage {
    fn process(&mut self, frame: &Frame) -> Result<Option<serde_json::Value>, AnalysisError> {
        let Some(grid) = self.next_grid(frame)? else {
            return Ok(None);
        };
        if let Some(preview) = &self.preview {
            preview.offer(frame, &grid);
        }
        Ok(Some(serde_json::to_value(&grid)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{GRID_COLS, GRID_ROWS};
    use crate::storage::clock;

    fn frame(at: Instant, lit: Option<usize>) -> Frame {
        // 40x40 pixel cells, one channel, square lit in grid row 0
        let (rows, cols) = (GRID_ROWS * 40, GRID_COLS * 40);
        let mut data = vec![0u8; rows * cols];
        if let Some(col) = lit {
            for y in 12..28 {
                for x in col * 40 + 12..col * 40 + 28 {
                    data[y * cols + x] = 255;
                }
            }
        }
        Frame::new(rows as i32, cols as i32, 1, data, at)
    }

    #[test]
    fn test_throttle() {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_millis(200));
        let accepted: Vec<bool> = [0, 50, 199, 200, 250, 450]
            .into_iter()
            .map(|ms| throttle.accept(start + Duration::from_millis(ms)))
            .collect();
        assert_eq!(accepted, vec![true, false, false, true, false, true]);
    }

    #[test]
    fn test_first_frame_yields_nothing() {
        let search = MotionSearch::new(AnalyticsConfig::default(), MotionStore::new());
        let mut stage = search.stage("cam1", false).unwrap();
        assert!(stage.process(&frame(Instant::now(), None)).unwrap().is_none());
    }

    #[test]
    fn test_pairs_of_accepted_frames_are_diffed() {
        let search = MotionSearch::new(AnalyticsConfig::default(), MotionStore::new());
        let mut stage = search.stage("cam1", false).unwrap();
        let start = Instant::now();
        let at = |ms| start + Duration::from_millis(ms);

        assert!(stage.process(&frame(at(0), None)).unwrap().is_none());
        // throttled: arrives too soon, lit cell never seen
        assert!(stage.process(&frame(at(100), Some(5))).unwrap().is_none());

        let grid = stage.process(&frame(at(200), Some(2))).unwrap().unwrap();
        assert_eq!(grid, serde_json::json!([2]));

        let grid = stage.process(&frame(at(400), Some(2))).unwrap().unwrap();
        assert_eq!(grid, serde_json::json!([]));
    }

    #[test]
    fn test_apply_updates_store_for_today() {
        let store = MotionStore::new();
        let search = MotionSearch::new(AnalyticsConfig::default(), store.clone());

        search.apply(serde_json::json!([0, 17]), "cam1").unwrap();

        let heatmap = store.heatmap(&clock::today(), "cam1").unwrap();
        assert_eq!(heatmap[0], 1);
        assert_eq!(heatmap[17], 1);
        assert_eq!(heatmap.iter().sum::<u32>(), 2);
        assert!(search.apply(serde_json::json!("bogus"), "cam1").is_err());
    }

    #[test]
    fn test_termination_saves_snapshot() {
        let dir = std::env::temp_dir().join(format!("camgrid-motion-{}", std::process::id()));
        let snapshot = Snapshot::in_dir(&dir);
        let store = MotionStore::new();
        let search =
            MotionSearch::new(AnalyticsConfig::default(), store.clone()).with_snapshot(snapshot.clone());

        search.apply(serde_json::json!([3]), "cam1").unwrap();
        search.on_termination().unwrap();

        let loaded = snapshot.load().unwrap();
        assert_eq!(loaded.to_days(), store.to_days());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
