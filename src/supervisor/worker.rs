use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analytics::{AnalysisRegistry, TaggedResult};
use crate::camera::{capture, CaptureError, CaptureOptions, OpenCvSource};
use crate::config::AnalyticsConfig;

/// Results buffered between a worker's pipe and its parser.
const RESULT_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid worker spec: {0}")]
    Spec(#[from] serde_json::Error),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Everything a worker process needs to run one camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub source_id: String,
    pub address: String,
    pub visualize: bool,
    pub analytics: AnalyticsConfig,
    pub frame_queue: usize,
    pub preview_dir: PathBuf,
}

pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerHandle>, WorkerError>;
}

/// Supervisor side of a running worker.
pub trait WorkerHandle: Send {
    /// The worker's result stream; `None` after the first call.
    fn take_results(&mut self) -> Option<Receiver<TaggedResult>>;

    /// Asks the worker to finish its current frame and exit.
    fn request_stop(&mut self);

    fn has_exited(&mut self) -> bool;

    /// Why the worker failed, once it has exited unsuccessfully.
    fn exit_failure(&self) -> Option<String>;

    fn kill(&mut self);
}

/// Starts each worker as a child process running `program args.. <spec json>`.
///
/// The child's stdout carries results, one JSON line each. Closing its stdin
/// is the stop request.
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    isolate_signals: bool,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            isolate_signals: false,
        }
    }

    /// Re-runs this executable in worker mode.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            vec!["worker".into(), "--spec".into()],
        ))
    }

    /// Puts workers in their own process group so a terminal interrupt only
    /// reaches the supervisor, which then stops them in order.
    pub fn isolate_signals(mut self, isolate: bool) -> Self {
        self.isolate_signals = isolate;
        self
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerHandle>, WorkerError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(serde_json::to_string(spec)?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        #[cfg(unix)]
        if self.isolate_signals {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn()?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("worker stdout not captured"))?;

        let (tx, rx) = mpsc::sync_channel(RESULT_QUEUE);
        let source_id = spec.source_id.clone();
        let spawned = thread::Builder::new()
            .name(format!("results-{source_id}"))
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            tracing::warn!(camera = %source_id, error = %e, "worker pipe read failed");
                            break;
                        }
                    };
                    match serde_json::from_str::<TaggedResult>(&line) {
                        Ok(result) => {
                            if tx.send(result).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(camera = %source_id, error = %e, "skipping malformed result line");
                        }
                    }
                }
            });
        if let Err(e) = spawned {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e.into());
        }

        tracing::debug!(camera = %spec.source_id, pid = child.id(), "worker started");
        Ok(Box::new(ProcessWorker {
            source_id: spec.source_id.clone(),
            child: Some(child),
            stdin,
            results: Some(rx),
            failure: None,
        }))
    }
}

struct ProcessWorker {
    source_id: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    results: Option<Receiver<TaggedResult>>,
    failure: Option<String>,
}

impl WorkerHandle for ProcessWorker {
    fn take_results(&mut self) -> Option<Receiver<TaggedResult>> {
        self.results.take()
    }

    fn request_stop(&mut self) {
        self.stdin.take();
    }

    fn has_exited(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return true;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                if status.success() {
                    tracing::debug!(camera = %self.source_id, "worker exited");
                } else {
                    tracing::warn!(camera = %self.source_id, %status, "worker exited with failure");
                    self.failure = Some(format!("worker {status}"));
                }
                self.child = None;
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::error!(camera = %self.source_id, error = %e, "failed to poll worker");
                self.failure = Some(format!("failed to poll worker: {e}"));
                true
            }
        }
    }

    fn exit_failure(&self) -> Option<String> {
        self.failure.clone()
    }

    fn kill(&mut self) {
        self.stdin.take();
        if let Some(mut child) = self.child.take() {
            tracing::warn!(camera = %self.source_id, pid = child.id(), "killing worker");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        // Still running at this point means the worker was cancelled.
        self.kill();
    }
}

/// Body of a worker process: capture one camera and stream results to stdout
/// until the source ends or stdin closes.
pub fn run_worker(spec: &WorkerSpec, registry: &AnalysisRegistry) -> Result<(), WorkerError> {
    let stop = Arc::new(AtomicBool::new(false));
    watch_stdin(Arc::clone(&stop))?;

    let mut source = OpenCvSource::open(&spec.source_id, &spec.address)?;
    let options = CaptureOptions {
        source_id: spec.source_id.clone(),
        visualize: spec.visualize,
        frame_queue: spec.frame_queue,
    };
    capture(&mut source, &stop, registry, &options, std::io::stdout())?;
    Ok(())
}

/// Raises `stop` once the supervisor closes our stdin or goes away.
fn watch_stdin(stop: Arc<AtomicBool>) -> std::io::Result<()> {
    thread::Builder::new().name("stop-watch".into()).spawn(move || {
        let mut sink = [0u8; 64];
        let mut stdin = std::io::stdin();
        while matches!(stdin.read(&mut sink), Ok(n) if n > 0) {}
        stop.store(true, Ordering::Relaxed);
    })?;
    Ok(())
}
