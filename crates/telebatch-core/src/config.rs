//! Configuration for telebatch.
//!
//! Every section is defaulted, so an empty file (or no file) yields a
//! working configuration. Durations are expressed in milliseconds.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub storage: StorageConfig,
    pub ledger: LedgerConfig,
    pub logging: LogConfig,
}

impl Config {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeFailed(e.to_string()).into())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        if self.storage.upload_timeout_ms == Some(0) {
            return Err(ConfigError::ValidationError(
                "storage.upload_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.ledger.endpoint.as_deref().is_some_and(|e| e.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "ledger.endpoint must not be empty when set".to_string(),
            ));
        }
        self.logging
            .level
            .parse::<crate::logging::LogLevel>()
            .map_err(ConfigError::ValidationError)?;
        Ok(())
    }
}

/// Batching engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a non-empty buffer waits before an automatic flush.
    pub batch_interval_ms: u64,
    /// Flush every non-empty buffer during shutdown.
    pub flush_on_shutdown: bool,
    /// Upper bound on how long shutdown waits for the queue to drain.
    pub shutdown_timeout_ms: u64,
    /// Re-arm the device timer when a request is dead-lettered with data left.
    pub rearm_after_dead_letter: bool,
    /// Dead letters kept for inspection; the oldest are dropped past this.
    pub dead_letter_capacity: usize,
    pub upload: UploadParams,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: 60_000,
            flush_on_shutdown: true,
            shutdown_timeout_ms: 30_000,
            rearm_after_dead_letter: true,
            dead_letter_capacity: 256,
            upload: UploadParams::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "engine.batch_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.dead_letter_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "engine.dead_letter_capacity must be at least 1".to_string(),
            ));
        }
        if self.upload.max_fee.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "engine.upload.max_fee must not be empty".to_string(),
            ));
        }
        self.retry.validate()
    }
}

/// Fee and gas parameters forwarded verbatim to the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadParams {
    /// Maximum fee in the backend's smallest unit, as a decimal string.
    pub max_fee: String,
    pub gas_limit: u64,
}

impl Default for UploadParams {
    fn default() -> Self {
        Self {
            // 1 FIL
            max_fee: "1000000000000000000".to_string(),
            gas_limit: 500_000_000,
        }
    }
}

/// Retry settings for failed uploads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter_percent: f64,
    /// Attempts per flush request before it is dead-lettered. Absent = unbounded.
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(5),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_factor < 1.0 || !self.backoff_factor.is_finite() {
            return Err(ConfigError::ValidationError(format!(
                "engine.retry.backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_percent) {
            return Err(ConfigError::ValidationError(format!(
                "engine.retry.jitter_percent must be within [0, 1], got {}",
                self.jitter_percent
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::ValidationError(
                "engine.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::ValidationError(
                "engine.retry.max_delay_ms must not be below initial_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where bundled stores keep batches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the content-addressed store.
    pub dir: Option<PathBuf>,
    /// Per-call timeout applied around the store.
    pub upload_timeout_ms: Option<u64>,
}

impl StorageConfig {
    #[must_use]
    pub fn upload_timeout(&self) -> Option<Duration> {
        self.upload_timeout_ms.map(Duration::from_millis)
    }
}

/// Ledger anchoring endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// HTTP endpoint receiving `{deviceId, contentId}` anchors. Absent = log only.
    pub endpoint: Option<String>,
}
