//! Configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::executor::RetryConfig;
use crate::router::RouterRules;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level used when the CLI does not override it
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    pub storage: StorageConfig,

    pub engine: EngineConfig,

    pub signals: SignalConfig,

    pub runner: RunnerConfig,

    pub retry: RetryConfig,

    pub router: RouterRules,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// 1. Explicit path if provided
    /// 2. `./.sessionflow.yml`
    /// 3. `~/.config/sessionflow/sessionflow.yml`
    /// 4. Defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".sessionflow.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("sessionflow").join("sessionflow.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Where the session database lives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(rename = "db-path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            db_path: base.join("sessionflow").join("sessionflow.db"),
        }
    }
}

/// Workflow engine limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Consecutive failed turns before a human takes over
    #[serde(rename = "escalation-threshold")]
    pub escalation_threshold: u32,

    /// Commit conflicts tolerated within one run before escalating
    #[serde(rename = "conflict-retry-limit")]
    pub conflict_retry_limit: u32,

    /// How long a run owns an instance without committing
    #[serde(rename = "lease-ttl-ms")]
    pub lease_ttl_ms: i64,

    /// Steps one run may take before yielding
    #[serde(rename = "max-steps-per-run")]
    pub max_steps_per_run: u32,

    /// Wait before retrying a failed turn
    #[serde(rename = "failure-backoff-ms")]
    pub failure_backoff_ms: i64,

    /// Concurrent branches within one fan-out
    #[serde(rename = "fanout-concurrency")]
    pub fanout_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            escalation_threshold: 3,
            conflict_retry_limit: 3,
            lease_ttl_ms: 120_000,
            max_steps_per_run: 32,
            failure_backoff_ms: 5_000,
            fanout_concurrency: 4,
        }
    }
}

/// Signal queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Pending signals per instance before the oldest non-critical one is dropped
    #[serde(rename = "queue-capacity")]
    pub queue_capacity: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

/// Background runner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Instances advanced in parallel
    #[serde(rename = "max-concurrent-instances")]
    pub max_concurrent_instances: usize,

    /// Fallback scan for work missed by notifications
    #[serde(rename = "poll-interval-secs")]
    pub poll_interval_secs: u64,

    /// Lease owner name; generated when unset
    #[serde(rename = "worker-id")]
    pub worker_id: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_instances: 16,
            poll_interval_secs: 60,
            worker_id: None,
        }
    }
}
