use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use crate::analytics::{AnalysisRegistry, TaggedResult};

use super::TerminationSignal;

/// Applies one worker's results until termination or until the worker's
/// stream ends. Returns how many results were applied.
///
/// Waits at most `poll` between termination checks.
pub fn parse(
    results: Receiver<TaggedResult>,
    source_id: &str,
    registry: &AnalysisRegistry,
    terminating: &TerminationSignal,
    poll: Duration,
) -> u64 {
    let mut applied = 0;

    while !terminating.is_set() {
        let result = match results.recv_timeout(poll) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                tracing::debug!(camera = %source_id, "result stream closed");
                break;
            }
        };

        let analysis = result.analysis.clone();
        match registry.dispatch(result, source_id) {
            Ok(()) => applied += 1,
            Err(e) => {
                tracing::warn!(camera = %source_id, %analysis, error = %e, "failed to apply result");
            }
        }
    }

    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::testing::CountingAnalysis;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn result(analysis: &str, n: u64) -> TaggedResult {
        TaggedResult {
            analysis: analysis.into(),
            payload: serde_json::json!(n),
        }
    }

    #[test]
    fn test_applies_until_stream_closes() {
        let counting = CountingAnalysis::new("counting");
        let applied = Arc::clone(&counting.applied);
        let registry = AnalysisRegistry::new().with(counting);

        let (tx, rx) = mpsc::channel();
        tx.send(result("counting", 1)).unwrap();
        tx.send(result("unknown", 2)).unwrap();
        tx.send(result("counting", 3)).unwrap();
        drop(tx);

        let count = parse(rx, "cam1", &registry, &TerminationSignal::new(), Duration::from_millis(10));
        assert_eq!(count, 2);
        let applied = applied.lock().unwrap();
        let payloads: Vec<_> = applied.iter().map(|(_, p)| p.as_u64().unwrap()).collect();
        assert_eq!(payloads, vec![1, 3]);
        assert!(applied.iter().all(|(source, _)| source == "cam1"));
    }

    #[test]
    fn test_returns_within_poll_after_termination() {
        let registry = AnalysisRegistry::new();
        let terminating = TerminationSignal::new();
        let (_tx, rx) = mpsc::channel::<TaggedResult>();

        let setter = {
            let terminating = terminating.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                terminating.set();
            })
        };

        let started = Instant::now();
        parse(rx, "cam1", &registry, &terminating, Duration::from_millis(20));
        assert!(started.elapsed() < Duration::from_millis(500));
        setter.join().unwrap();
    }
}
