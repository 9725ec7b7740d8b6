use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod analytics;
mod api;
mod camera;
mod config;
mod grid;
mod storage;
mod supervisor;

use analytics::{AnalysisRegistry, MotionSearch};
use api::AppState;
use config::{AnalyticsConfig, Config};
use storage::{clock, MotionStore, Snapshot};
use supervisor::{Orchestrator, ProcessLauncher, TerminationSignal, WorkerError, WorkerSpec};

#[derive(Parser)]
#[command(name = "camgrid", version, about = "Per-cell motion capture and search across cameras")]
struct Cli {
    #[arg(long, global = true, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Analyse every camera and serve motion queries over HTTP (default).
    Serve,
    /// Analyse every camera until Enter or Ctrl-C, without HTTP.
    Analyze {
        /// Camera whose debug view is written to the preview directory.
        #[arg(long)]
        visualize: Option<String>,
    },
    /// Print the times a camera saw motion.
    Motions {
        camera: String,
        #[arg(long)]
        day: Option<String>,
        /// Snapshot directory; defaults to the config's `[storage] data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print a camera's per-cell motion counts.
    Heatmap {
        camera: String,
        #[arg(long)]
        day: Option<String>,
        /// Snapshot directory; defaults to the config's `[storage] data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// List the cameras that saw motion on a day.
    Cameras {
        #[arg(long)]
        day: Option<String>,
        /// Snapshot directory; defaults to the config's `[storage] data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        spec: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let Cli { config, command } = Cli::parse();
    let command = command.unwrap_or(Command::Serve);

    let filter = EnvFilter::from_default_env().add_directive("camgrid=debug".parse()?);
    if matches!(command, Command::Worker { .. }) {
        // stdout carries results
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match command {
        Command::Serve => serve(&config).await,
        Command::Analyze { visualize } => analyze(&config, visualize).await,
        Command::Motions {
            camera,
            day,
            data_dir,
        } => print_motions(&config::snapshot_dir(&config, data_dir)?, &camera, day),
        Command::Heatmap {
            camera,
            day,
            data_dir,
        } => print_heatmap(&config::snapshot_dir(&config, data_dir)?, &camera, day),
        Command::Cameras { day, data_dir } => print_cameras(&config::snapshot_dir(&config, data_dir)?, day),
        Command::Worker { spec } => {
            tokio::task::spawn_blocking(move || worker(&spec)).await??;
            Ok(())
        }
    }
}

fn registry(
    analytics: &AnalyticsConfig,
    store: MotionStore,
    snapshot: Option<Snapshot>,
    preview_dir: PathBuf,
) -> AnalysisRegistry {
    let mut search = MotionSearch::new(analytics.clone(), store).with_preview_dir(preview_dir);
    if let Some(snapshot) = snapshot {
        search = search.with_snapshot(snapshot);
    }
    AnalysisRegistry::new().with(search)
}

fn orchestrator(config: &Config, store: MotionStore, snapshot: Snapshot) -> std::io::Result<Orchestrator> {
    let launcher = ProcessLauncher::current_exe()?.isolate_signals(!config::is_service());
    let preview_dir = config.storage.preview_dir();
    Ok(Orchestrator::new(
        Arc::new(launcher),
        registry(&config.analytics, store, Some(snapshot), preview_dir.clone()),
        config.supervisor.clone(),
        config.analytics.clone(),
        preview_dir,
    ))
}

fn load(config_path: &Path) -> Result<(Config, MotionStore, Snapshot), Box<dyn std::error::Error>> {
    let config = Config::load_from(config_path)?;
    tracing::info!("loaded {} camera(s)", config.cameras.len());

    let snapshot = Snapshot::in_dir(&config.storage.data_dir);
    let store = snapshot.load()?;
    tracing::info!(days = store.days().len(), path = %snapshot.path().display(), "motion store ready");
    Ok((config, store, snapshot))
}

async fn serve(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let (config, store, snapshot) = load(config_path)?;
    let sources = config.sources()?;
    let terminating = TerminationSignal::new();
    watch_signals(terminating.clone());

    let server = tokio::spawn({
        let state = AppState::new(store.clone());
        let http = config.http.clone();
        let terminating = terminating.clone();
        async move {
            if let Err(e) = api::start_server(state, &http, terminating.clone()).await {
                tracing::error!(error = %e, "HTTP server failed");
                terminating.set();
            }
        }
    });

    let report = orchestrator(&config, store, snapshot)?
        .run(sources, None, terminating)
        .await;
    if let Err(e) = server.await {
        tracing::error!(error = %e, "HTTP server task failed");
    }

    tracing::info!(?report, "shutdown complete");
    Ok(())
}

async fn analyze(config_path: &Path, visualize: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let (config, store, snapshot) = load(config_path)?;
    let sources = config.sources()?;
    let terminating = TerminationSignal::new();
    watch_signals(terminating.clone());

    let stdin_signal = terminating.clone();
    std::thread::Builder::new()
        .name("stdin-watch".into())
        .spawn(move || {
            let mut line = String::new();
            if matches!(std::io::stdin().lock().read_line(&mut line), Ok(n) if n > 0) {
                stdin_signal.set();
            }
        })?;
    tracing::info!("press Enter to stop");

    let report = orchestrator(&config, store, snapshot)?
        .run(sources, visualize.as_deref(), terminating)
        .await;

    tracing::info!(?report, "shutdown complete");
    Ok(())
}

/// Sets `terminating` on Ctrl-C or SIGTERM.
fn watch_signals(terminating: TerminationSignal) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let term = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let term = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = term => {}
        }
        tracing::info!("shutdown signal received");
        terminating.set();
    });
}

fn worker(spec: &str) -> Result<(), WorkerError> {
    let spec: WorkerSpec = serde_json::from_str(spec)?;
    // Results are applied by the supervisor; this store only satisfies the analysis.
    let registry = registry(&spec.analytics, MotionStore::new(), None, spec.preview_dir.clone());
    supervisor::run_worker(&spec, &registry)
}

fn print_motions(data_dir: &Path, camera: &str, day: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let store = Snapshot::in_dir(data_dir).load()?;
    let day = day.unwrap_or_else(clock::today);
    for time in store.motion_timestamps(&day, camera)? {
        println!("{}", time.format("%H:%M:%S"));
    }
    Ok(())
}

fn print_heatmap(data_dir: &Path, camera: &str, day: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let store = Snapshot::in_dir(data_dir).load()?;
    let day = day.unwrap_or_else(clock::today);
    let counts = store.heatmap(&day, camera)?;
    for row in counts.chunks(grid::GRID_COLS) {
        let line: Vec<String> = row.iter().map(|count| format!("{count:>6}")).collect();
        println!("{}", line.join(""));
    }
    Ok(())
}

fn print_cameras(data_dir: &Path, day: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let store = Snapshot::in_dir(data_dir).load()?;
    let day = day.unwrap_or_else(clock::today);
    for camera in store.sources(&day) {
        println!("{camera}");
    }
    Ok(())
}
