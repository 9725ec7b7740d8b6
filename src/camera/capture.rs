use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use crate::analytics::{AnalysisRegistry, AnalysisStage, TaggedResult};

use super::{CaptureError, Frame, FrameBroadcast, FrameSource};

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub source_id: String,
    pub visualize: bool,
    pub frame_queue: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u64,
    pub results: u64,
}

/// Runs every registered analysis over one source until the source ends or
/// `stop` is raised, writing each result to `out` as one JSON line.
///
/// Frames are decoded once and fanned out; each analysis runs on its own
/// thread, so results of different analyses interleave while each analysis
/// keeps its own order.
pub fn capture<S, W>(
    source: &mut S,
    stop: &AtomicBool,
    analyses: &AnalysisRegistry,
    options: &CaptureOptions,
    out: W,
) -> Result<CaptureStats, CaptureError>
where
    S: FrameSource,
    W: Write + Send,
{
    let source_id = options.source_id.as_str();
    let (result_tx, result_rx) = mpsc::channel::<TaggedResult>();

    thread::scope(|scope| {
        let mut broadcast = FrameBroadcast::new(options.frame_queue);
        let mut stages = Vec::new();

        for analysis in analyses.iter() {
            let name = analysis.name();
            let stage = match analysis.stage(source_id, options.visualize) {
                Ok(stage) => stage,
                Err(e) => {
                    tracing::error!(camera = %source_id, analysis = %name, error = %e, "failed to start analysis");
                    continue;
                }
            };
            let frames = broadcast.subscribe(name);
            let results = result_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{source_id}"))
                .spawn_scoped(scope, move || run_stage(name, source_id, stage, frames, results))?;
            stages.push((name, handle));
        }
        drop(result_tx);

        let writer = scope.spawn(move || write_results(result_rx, out));

        let frames = acquire(source, stop, &mut broadcast, source_id);
        // Ends every analysis stream.
        drop(broadcast);

        for (name, handle) in stages {
            if handle.join().is_err() {
                tracing::error!(camera = %source_id, analysis = %name, "analysis panicked");
            }
        }

        let results = match writer.join() {
            Ok(written) => written?,
            Err(_) => {
                tracing::error!(camera = %source_id, "result writer panicked");
                0
            }
        };

        tracing::info!(camera = %source_id, frames, results, "capture finished");
        Ok(CaptureStats { frames, results })
    })
}

fn acquire<S: FrameSource>(
    source: &mut S,
    stop: &AtomicBool,
    broadcast: &mut FrameBroadcast,
    source_id: &str,
) -> u64 {
    let mut frames = 0;

    while source.is_open() && !stop.load(Ordering::Relaxed) {
        match source.read() {
            Ok(Some(frame)) => {
                frames += 1;
                if !broadcast.publish(frame) {
                    tracing::debug!(camera = %source_id, "no analysis listening, stopping capture");
                    break;
                }
            }
            Ok(None) => {
                tracing::warn!(camera = %source_id, "end of stream");
                break;
            }
            Err(e) => {
                tracing::error!(camera = %source_id, error = %e, "capture read failed");
                break;
            }
        }
    }

    source.release();
    frames
}

fn run_stage(
    name: &'static str,
    source_id: &str,
    mut stage: Box<dyn AnalysisStage>,
    frames: Receiver<Arc<Frame>>,
    results: Sender<TaggedResult>,
) {
    for frame in frames {
        match stage.process(&frame) {
            Ok(Some(payload)) => {
                let result = TaggedResult {
                    analysis: name.to_string(),
                    payload,
                };
                if results.send(result).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(camera = %source_id, analysis = %name, error = %e, "analysis failed on frame");
            }
        }
    }
}

fn write_results<W: Write>(results: Receiver<TaggedResult>, mut out: W) -> Result<u64, CaptureError> {
    let mut written = 0;
    for result in results {
        let mut line = serde_json::to_vec(&result)?;
        line.push(b'\n');
        // One write per result so a reader never sees half a line.
        out.write_all(&line)?;
        out.flush()?;
        written += 1;
    }
    Ok(written)
}
