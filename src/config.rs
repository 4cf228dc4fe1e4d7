//! TOML configuration for webtimer.
//!
//! A layered model: compiled-in defaults, overridden by a config file found
//! through an explicit path, the `WEBTIMER_CONFIG` environment variable or
//! `./webtimer.toml`, in that order.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::scheduler::JobConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "WEBTIMER_CONFIG";

/// Config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "webtimer.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the webtimer process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app_name: String,
    /// Start the scheduler as soon as the daemon comes up.
    pub auto_start_scheduler: bool,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub http: HttpSettings,
    pub notification: NotifierConfig,
    pub schedules: Vec<JobConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: "webtimer".to_string(),
            auto_start_scheduler: true,
            logging: LoggingConfig::default(),
            storage: StorageConfig::default(),
            http: HttpSettings::default(),
            notification: NotifierConfig::default(),
            schedules: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        ensure!(
            config.http.default_timeout > 0,
            "http.default_timeout must be at least 1 second in {}",
            path.display()
        );
        info!(path = %path.display(), schedules = config.schedules.len(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration the way the binary does.
    ///
    /// An explicit path must load; the environment variable and the working
    /// directory file are best effort and fall back to defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(&env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "WEBTIMER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(path = %local.display(), error = %e, "config file could not be loaded, using defaults");
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding request history and per-job statistics.
    pub database_path: PathBuf,
    /// History older than this many days is removed at daemon start.
    /// Statistics are never removed.
    pub retention_days: Option<u32>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/webtimer.db"),
            retention_days: None,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Settings shared by every outbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub user_agent: String,
    /// Per-attempt timeout for jobs that do not set `timeout_seconds`.
    pub default_timeout: u64,
    /// Retries for jobs that do not set `retry_count`.
    pub default_retry_count: u32,
    /// Pause between attempts for jobs that do not set `retry_delay_seconds`.
    pub default_retry_delay: u64,
    pub verify_ssl: bool,
    pub follow_redirects: bool,
    /// Upper bound on requests in flight across all jobs.
    pub max_concurrent_requests: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: format!("webtimer/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: 30,
            default_retry_count: 3,
            default_retry_delay: 5,
            verify_ssl: true,
            follow_redirects: true,
            max_concurrent_requests: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// Change detection and UDP notification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub enabled: bool,
    pub server_address: String,
    pub port: u16,
    /// Quiet period before the pending notification is sent.
    pub delay_seconds: f64,
    /// Notify on the first success of a job and on every unchanged success.
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    pub notify_on_response_change: bool,
    /// Response bodies larger than this are replaced by a size marker.
    pub max_response_size_bytes: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_address: "localhost".to_string(),
            port: 12345,
            delay_seconds: 1.0,
            notify_on_success: true,
            notify_on_failure: true,
            notify_on_response_change: true,
            max_response_size_bytes: 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
