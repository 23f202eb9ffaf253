//! Configuration loader and validator for the diary data core.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::sync::SyncOptions;

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
    pub remote: Remote,
    pub sync: SyncPolicy,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Default log filter, overridden by `RUST_LOG`.
    #[serde(default)]
    pub log_filter: Option<String>,
}

/// Remote diary API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub base_url: String,
    pub token: String,
    pub request_timeout_secs: u64,
}

/// Replay policy for the pending-action queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncPolicy {
    pub fan_out: usize,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub max_backoff_secs: u64,
    pub poll_interval_secs: u64,
    pub retain_failed: bool,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// SQLite URL for the cache database under `app.data_dir`.
    pub fn database_url(&self) -> String {
        format!("sqlite://{}/mealdiary.db", self.app.data_dir.trim_end_matches('/'))
    }

    /// Base URL with a trailing slash, so endpoint joins append to it.
    pub fn remote_url(&self) -> Result<reqwest::Url, ConfigError> {
        let mut raw = self.remote.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        reqwest::Url::parse(&raw)
            .map_err(|_| ConfigError::Invalid("remote.base_url must be a valid URL"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.request_timeout_secs)
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            fan_out: self.sync.fan_out,
            max_attempts: self.sync.max_attempts,
            backoff_base: Duration::from_secs(self.sync.backoff_base_secs),
            max_backoff: Duration::from_secs(self.sync.max_backoff_secs),
            request_timeout: self.request_timeout(),
            poll_interval: Duration::from_secs(self.sync.poll_interval_secs),
            retain_failed: self.sync.retain_failed,
        }
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

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.remote.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.base_url must be non-empty"));
    }
    if reqwest::Url::parse(cfg.remote.base_url.trim()).is_err() {
        return Err(ConfigError::Invalid("remote.base_url must be a valid URL"));
    }
    if cfg.remote.token.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.token must be non-empty"));
    }
    if cfg.remote.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid("remote.request_timeout_secs must be > 0"));
    }

    if cfg.sync.fan_out == 0 {
        return Err(ConfigError::Invalid("sync.fan_out must be > 0"));
    }
    if cfg.sync.max_attempts == 0 {
        return Err(ConfigError::Invalid("sync.max_attempts must be > 0"));
    }
    if cfg.sync.poll_interval_secs == 0 {
        return Err(ConfigError::Invalid("sync.poll_interval_secs must be > 0"));
    }
    // backoff_base_secs may be 0: that means retry without delay.
    if cfg.sync.max_backoff_secs < cfg.sync.backoff_base_secs {
        return Err(ConfigError::Invalid(
            "sync.max_backoff_secs must be >= sync.backoff_base_secs",
        ));
    }

    Ok(())
}

/// Example configuration in the shape `load` expects.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  log_filter: "info"

remote:
  base_url: "https://diary.example.com/api/"
  token: "YOUR_API_TOKEN"
  request_timeout_secs: 30

sync:
  fan_out: 4
  max_attempts: 5
  backoff_base_secs: 5
  max_backoff_secs: 900
  poll_interval_secs: 60
  retain_failed: true
"#
}
