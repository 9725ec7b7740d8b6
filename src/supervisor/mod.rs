mod parser;
mod signal;
mod worker;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::analytics::AnalysisRegistry;
use crate::config::{AnalyticsConfig, SupervisorConfig};

pub use parser::parse;
pub use signal::TerminationSignal;
pub use worker::{run_worker, ProcessLauncher, WorkerError, WorkerHandle, WorkerLauncher, WorkerSpec};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a camera's task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Worker exited and its results were drained.
    Completed,
    /// Worker could not be started, exited unsuccessfully or its parser died.
    Failed(String),
    /// Still waiting for a worker slot when shutdown began.
    NotStarted,
    /// Still running when the grace period ran out; its worker was killed.
    ForceCancelled,
}

/// Tally of how every camera's task ended.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub completed: usize,
    pub failed: usize,
    pub not_started: usize,
    pub force_cancelled: usize,
}

impl ShutdownReport {
    fn record(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Completed => self.completed += 1,
            TaskOutcome::Failed(_) => self.failed += 1,
            TaskOutcome::NotStarted => self.not_started += 1,
            TaskOutcome::ForceCancelled => self.force_cancelled += 1,
        }
    }
}

struct TaskContext {
    launcher: Arc<dyn WorkerLauncher>,
    registry: AnalysisRegistry,
    poll_timeout: Duration,
    terminating: TerminationSignal,
}

/// Runs one worker per camera, at most `max_workers` at a time, and turns
/// their results into analysis state until terminated.
pub struct Orchestrator {
    launcher: Arc<dyn WorkerLauncher>,
    registry: AnalysisRegistry,
    supervisor: SupervisorConfig,
    analytics: AnalyticsConfig,
    preview_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        registry: AnalysisRegistry,
        supervisor: SupervisorConfig,
        analytics: AnalyticsConfig,
        preview_dir: PathBuf,
    ) -> Self {
        Self {
            launcher,
            registry,
            supervisor,
            analytics,
            preview_dir,
        }
    }

    /// Runs until `terminating` is set, then stops every worker, waits up to
    /// the grace period, cancels what is left and finally runs every
    /// analysis's termination hook once.
    pub async fn run(
        &self,
        sources: BTreeMap<String, String>,
        visualize: Option<&str>,
        terminating: TerminationSignal,
    ) -> ShutdownReport {
        let max_workers = self.supervisor.max_workers.max(1);
        if sources.len() > max_workers {
            tracing::info!(
                cameras = sources.len(),
                max_workers,
                "more cameras than worker slots, the rest wait for a free slot"
            );
        }
        if let Some(id) = visualize.filter(|id| !sources.contains_key(*id)) {
            tracing::warn!(camera = %id, "camera to visualize is not configured");
        }

        let context = Arc::new(TaskContext {
            launcher: Arc::clone(&self.launcher),
            registry: self.registry.clone(),
            poll_timeout: self.supervisor.poll_timeout(),
            terminating: terminating.clone(),
        });
        let slots = Arc::new(Semaphore::new(max_workers));
        let mut tasks = JoinSet::new();
        let mut cameras = HashMap::new();

        for (source_id, address) in sources {
            let spec = WorkerSpec {
                visualize: visualize == Some(source_id.as_str()),
                source_id: source_id.clone(),
                address,
                analytics: self.analytics.clone(),
                frame_queue: self.supervisor.frame_queue,
                preview_dir: self.preview_dir.clone(),
            };
            let handle = tasks.spawn(run_source(Arc::clone(&context), Arc::clone(&slots), spec));
            cameras.insert(handle.id(), source_id);
        }

        tracing::info!("analysis is running");
        terminating.wait().await;
        tracing::info!("terminating, stopping analysis workers");
        slots.close();

        let report = drain(&mut tasks, &cameras, self.supervisor.grace_period()).await;
        tracing::info!(
            completed = report.completed,
            failed = report.failed,
            not_started = report.not_started,
            force_cancelled = report.force_cancelled,
            "all analysis workers stopped"
        );

        let registry = self.registry.clone();
        if tokio::task::spawn_blocking(move || registry.terminate_all())
            .await
            .is_err()
        {
            tracing::error!("termination hooks panicked");
        }

        report
    }
}

/// Collects every task, aborting those still running once `grace` elapses.
async fn drain(
    tasks: &mut JoinSet<TaskOutcome>,
    cameras: &HashMap<tokio::task::Id, String>,
    grace: Duration,
) -> ShutdownReport {
    let mut report = ShutdownReport::default();
    let deadline = tokio::time::Instant::now() + grace;

    loop {
        match tokio::time::timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(Ok(outcome))) => report.record(&outcome),
            Ok(Some(Err(e))) => {
                let camera = cameras.get(&e.id()).map_or("?", String::as_str);
                tracing::error!(%camera, error = %e, "camera task panicked");
                report.failed += 1;
            }
            Ok(None) => return report,
            Err(_) => break,
        }
    }

    tracing::warn!(
        remaining = tasks.len(),
        "grace period elapsed, cancelling remaining workers"
    );
    tasks.abort_all();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => report.record(&outcome),
            Err(e) if e.is_cancelled() => {
                let camera = cameras.get(&e.id()).map_or("?", String::as_str);
                tracing::warn!(%camera, "worker force-cancelled");
                report.record(&TaskOutcome::ForceCancelled);
            }
            Err(_) => report.failed += 1,
        }
    }
    report
}

async fn run_source(context: Arc<TaskContext>, slots: Arc<Semaphore>, spec: WorkerSpec) -> TaskOutcome {
    let outcome = supervise(&context, &slots, &spec).await;
    match &outcome {
        TaskOutcome::Completed | TaskOutcome::ForceCancelled => {}
        TaskOutcome::Failed(reason) => {
            tracing::error!(camera = %spec.source_id, %reason, "camera analysis failed");
        }
        TaskOutcome::NotStarted => {
            tracing::info!(camera = %spec.source_id, "shutdown before a worker slot was free");
        }
    }
    outcome
}

async fn supervise(context: &TaskContext, slots: &Arc<Semaphore>, spec: &WorkerSpec) -> TaskOutcome {
    let terminating = &context.terminating;
    let _slot = tokio::select! {
        slot = Arc::clone(slots).acquire_owned() => match slot {
            Ok(slot) => slot,
            Err(_) => return TaskOutcome::NotStarted,
        },
        _ = terminating.wait() => return TaskOutcome::NotStarted,
    };
    if terminating.is_set() {
        return TaskOutcome::NotStarted;
    }

    let mut worker = match context.launcher.launch(spec) {
        Ok(worker) => worker,
        Err(e) => return TaskOutcome::Failed(e.to_string()),
    };
    let Some(results) = worker.take_results() else {
        return TaskOutcome::Failed("worker has no result stream".into());
    };
    tracing::info!(camera = %spec.source_id, "worker running");

    let parser = tokio::task::spawn_blocking({
        let registry = context.registry.clone();
        let terminating = terminating.clone();
        let source_id = spec.source_id.clone();
        let poll = context.poll_timeout;
        move || parse(results, &source_id, &registry, &terminating, poll)
    });

    let mut ticker = tokio::time::interval(EXIT_POLL_INTERVAL);
    let mut stop_requested = false;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if worker.has_exited() {
                    break;
                }
            }
            _ = terminating.wait(), if !stop_requested => {
                worker.request_stop();
                stop_requested = true;
            }
        }
    }
    if !stop_requested {
        tracing::warn!(camera = %spec.source_id, "worker exited before shutdown");
    }

    let failure = worker.exit_failure();
    match parser.await {
        Ok(applied) => {
            tracing::debug!(camera = %spec.source_id, applied, "result parser finished");
            match failure {
                Some(reason) => TaskOutcome::Failed(reason),
                None => TaskOutcome::Completed,
            }
        }
        Err(e) => TaskOutcome::Failed(format!("result parser failed: {e}")),
    }
}
