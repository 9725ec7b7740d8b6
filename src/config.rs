use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
const SERVICE_ENV: &str = "RUN_AS_SERVICE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no cameras configured")]
    NoCameras,
    #[error("duplicate camera id {0}")]
    DuplicateCamera(String),
    #[error("invalid analytics setting: {0}")]
    InvalidAnalytics(&'static str),
    #[error("max_workers must be at least 1")]
    NoWorkers,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    pub url: String,
}

fn default_http_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_sample_fps() -> u32 {
    5
}

fn default_blur_kernel() -> i32 {
    21
}

fn default_diff_threshold() -> u8 {
    30
}

/// Motion search parameters. Also shipped to each worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_sample_fps")]
    pub sample_fps: u32,
    #[serde(default = "default_blur_kernel")]
    pub blur_kernel: i32,
    #[serde(default = "default_diff_threshold")]
    pub diff_threshold: u8,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            sample_fps: default_sample_fps(),
            blur_kernel: default_blur_kernel(),
            diff_threshold: default_diff_threshold(),
        }
    }
}

impl AnalyticsConfig {
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs(1) / self.sample_fps.max(1)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_fps == 0 {
            return Err(ConfigError::InvalidAnalytics("sample_fps must be positive"));
        }
        if self.blur_kernel < 1 || self.blur_kernel % 2 == 0 {
            return Err(ConfigError::InvalidAnalytics("blur_kernel must be odd and positive"));
        }
        Ok(())
    }
}

fn default_max_workers() -> usize {
    16
}

fn default_grace_period_ms() -> u64 {
    10_000
}

fn default_poll_timeout_ms() -> u64 {
    1_000
}

fn default_frame_queue() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Worker processes alive at once; further cameras wait for a slot.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Frames buffered per analysis inside a worker before frames are dropped.
    #[serde(default = "default_frame_queue")]
    pub frame_queue: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            grace_period_ms: default_grace_period_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            frame_queue: default_frame_queue(),
        }
    }
}

impl SupervisorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    pub fn preview_dir(&self) -> PathBuf {
        self.data_dir.join("preview")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

impl Config {
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;

        if config.cameras.is_empty() {
            return Err(ConfigError::NoCameras);
        }
        config.analytics.validate()?;
        if config.supervisor.max_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }

        Ok(config)
    }

    /// Camera id -> stream address.
    pub fn sources(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        let mut sources = BTreeMap::new();
        for camera in &self.cameras {
            if sources
                .insert(camera.id.clone(), camera.url.clone())
                .is_some()
            {
                return Err(ConfigError::DuplicateCamera(camera.id.clone()));
            }
        }
        Ok(sources)
    }
}

/// Directory holding the motion snapshot for the offline commands.
///
/// An explicit directory wins; otherwise the config's `[storage] data_dir` is
/// used when the config file exists, and the default when it does not.
pub fn snapshot_dir(config_path: &Path, explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    if let Some(dir) = explicit {
        return Ok(dir);
    }
    if config_path.exists() {
        return Ok(Config::load_from(config_path)?.storage.data_dir);
    }
    Ok(default_data_dir())
}

/// Whether the process runs as a long-lived service rather than interactively.
pub fn is_service() -> bool {
    std::env::var(SERVICE_ENV).is_ok_and(|v| v == "True")
}
