mod detector;
mod motion;
mod preview;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::camera::Frame;
use crate::grid::CellOutOfRange;
use crate::storage::SnapshotError;

pub use detector::MotionDetector;
pub use motion::{MotionSearch, MOTION_SEARCH};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("opencv error: {0}")]
    Cv(#[from] opencv::Error),
    #[error("invalid result payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("invalid change grid: {0}")]
    Grid(#[from] CellOutOfRange),
    #[error("failed to persist results: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown analysis {0}")]
    Unknown(String),
}

/// One analysis result on its way from a worker to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedResult {
    pub analysis: String,
    pub payload: serde_json::Value,
}

/// A way of looking at a camera's frames.
///
/// `stage` runs inside the worker process that owns the camera, `apply` runs
/// in the supervisor on every result the stage produced, and
/// `on_termination` runs once after all workers have stopped.
pub trait Analysis: Send + Sync {
    fn name(&self) -> &'static str;

    fn stage(
        &self,
        source_id: &str,
        visualize: bool,
    ) -> Result<Box<dyn AnalysisStage>, AnalysisError>;

    fn apply(&self, payload: serde_json::Value, source_id: &str) -> Result<(), AnalysisError>;

    fn on_termination(&self) -> Result<(), AnalysisError> {
        Ok(())
    }
}

/// Per-camera state of an analysis, fed frames in arrival order.
pub trait AnalysisStage: Send {
    fn process(&mut self, frame: &Frame) -> Result<Option<serde_json::Value>, AnalysisError>;
}

#[derive(Clone, Default)]
pub struct AnalysisRegistry {
    analyses: BTreeMap<&'static str, Arc<dyn Analysis>>,
}

impl AnalysisRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, analysis: impl Analysis + 'static) -> Self {
        self.register(Arc::new(analysis));
        self
    }

    pub fn register(&mut self, analysis: Arc<dyn Analysis>) {
        if self.analyses.insert(analysis.name(), analysis).is_some() {
            tracing::warn!("analysis registered twice, keeping the latest");
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Analysis>> {
        self.analyses.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Analysis>> {
        self.analyses.values()
    }

    /// Hands a received result to the analysis that produced it.
    pub fn dispatch(&self, result: TaggedResult, source_id: &str) -> Result<(), AnalysisError> {
        let analysis = self
            .get(&result.analysis)
            .ok_or_else(|| AnalysisError::Unknown(result.analysis.clone()))?;
        analysis.apply(result.payload, source_id)
    }

    /// Runs every termination hook once; failures are logged and do not stop the others.
    pub fn terminate_all(&self) {
        for analysis in self.iter() {
            if let Err(e) = analysis.on_termination() {
                tracing::error!(analysis = %analysis.name(), error = %e, "termination hook failed");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::CountingAnalysis;
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_dispatch_routes_by_name() {
        let counting = CountingAnalysis::new("counting");
        let applied = Arc::clone(&counting.applied);
        let registry = AnalysisRegistry::new().with(counting);

        let result = TaggedResult {
            analysis: "counting".into(),
            payload: serde_json::json!(3),
        };
        registry.dispatch(result, "cam1").unwrap();
        assert_eq!(
            applied.lock().unwrap().as_slice(),
            &[("cam1".to_string(), serde_json::json!(3))]
        );

        let unknown = TaggedResult {
            analysis: "nope".into(),
            payload: serde_json::Value::Null,
        };
        assert!(matches!(
            registry.dispatch(unknown, "cam1"),
            Err(AnalysisError::Unknown(_))
        ));
    }

    #[test]
    fn test_terminate_all_runs_each_hook_once() {
        let a = CountingAnalysis::new("a");
        let b = CountingAnalysis::new("b");
        let (ta, tb) = (Arc::clone(&a.terminations), Arc::clone(&b.terminations));
        let registry = AnalysisRegistry::new().with(a).with(b);

        registry.terminate_all();
        assert_eq!(ta.load(Ordering::SeqCst), 1);
        assert_eq!(tb.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tagged_result_wire_format() {
        let result = TaggedResult {
            analysis: MOTION_SEARCH.into(),
            payload: serde_json::json!([0, 5]),
        };
        let line = serde_json::to_string(&result).unwrap();
        assert_eq!(line, r#"{"analysis":"motion_search","payload":[0,5]}"#);
    }
}
