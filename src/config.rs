//! Configuration loader and validator for the reclaim job and erase worker.
use crate::model::ExecutionMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub store: Store,
    #[serde(default)]
    pub reclaim: Reclaim,
    #[serde(default)]
    pub worker: Worker,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Deployment environment name; `prod` selects best-effort cleanup.
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Encrypted file store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Store {
    pub dir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reclaim {
    /// Overrides the mode derived from `app.environment`.
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
}

/// Erase worker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worker {
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    pub shred_passes: u32,
}

impl Default for Worker {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_backoff_seconds: 3600,
            shred_passes: 30,
        }
    }
}

impl Worker {
    /// Backoff cap as the signed seconds the queue table works in.
    pub fn max_backoff_secs(&self) -> Result<i64, ConfigError> {
        i64::try_from(self.max_backoff_seconds)
            .map_err(|_| ConfigError::Invalid("worker.max_backoff_seconds is too large"))
    }
}

fn default_environment() -> String {
    "prod".to_string()
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.reclaim
            .mode
            .unwrap_or_else(|| ExecutionMode::for_environment(&self.app.environment))
    }

    /// Default database location unless `DATABASE_URL` is set.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/reclaim.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.environment.trim().is_empty() {
        return Err(ConfigError::Invalid("app.environment must be non-empty"));
    }
    if cfg.store.dir.trim().is_empty() {
        return Err(ConfigError::Invalid("store.dir must be non-empty"));
    }
    if cfg.worker.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("worker.poll_interval_ms must be > 0"));
    }
    if cfg.worker.shred_passes == 0 {
        return Err(ConfigError::Invalid("worker.shred_passes must be > 0"));
    }
    cfg.worker.max_backoff_secs()?;
    Ok(())
}

/// Returns the canonical example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  environment: "prod"

store:
  dir: "./data/store"

reclaim:
  # strict | best_effort. Omit to derive from app.environment.
  mode: null

worker:
  poll_interval_ms: 500
  max_backoff_seconds: 3600
  shred_passes: 30
"#
}
