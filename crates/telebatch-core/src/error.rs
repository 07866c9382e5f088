//! Error types for telebatch-core
//!
//! One enum per concern, wrapped by [`Error`]. Errors a user can act on
//! carry a [`Remediation`] that the CLI prints under the message.

use std::fmt::Write;
use thiserror::Error;

/// What to try next after an error.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Remediation {
    pub summary: String,
    /// `(label, command)` pairs.
    pub commands: Vec<(String, String)>,
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push((label.into(), command.into()));
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Multi-line hint block for terminal output.
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut out = format!("hint: {}\n", self.summary);
        for (label, command) in &self.commands {
            let _ = writeln!(out, "  {label}: {command}");
        }
        for alternative in &self.alternatives {
            let _ = writeln!(out, "  or: {alternative}");
        }
        out
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid reading: {0}")]
    Validation(#[from] ValidationError),

    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),

    #[error("ledger notification failed: {0}")]
    Notify(#[from] NotifyError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Validation(_) => Some(
                Remediation::new("Send readings as JSON objects with a non-empty string deviceId.")
                    .alternative("Check the device firmware payload format."),
            ),
            Self::Upload(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Engine(EngineError::Closed) => Some(
                Remediation::new("The engine is shutting down; readings are no longer accepted.")
                    .alternative("Restart the service to resume ingest."),
            ),
            Self::Io(_) => Some(Remediation::new(
                "Make sure the store directory exists and is writable.",
            )),
            Self::Json(_) => Some(
                Remediation::new("Each input line must be one complete JSON object.")
                    .alternative("Blank lines are skipped; everything else is parsed."),
            ),
            Self::Notify(_) | Self::Engine(EngineError::Dropped) => None,
        }
    }
}

/// Rejected ingest input. Never has side effects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("reading must be a JSON object")]
    NotAnObject,

    #[error("deviceId is required")]
    MissingDeviceId,

    #[error("deviceId must be a string")]
    InvalidDeviceId,

    #[error("deviceId must not be empty")]
    EmptyDeviceId,

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Failure of a single storage collaborator call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("insufficient funds: {0}")]
    Funding(String),

    #[error("batch of {size} bytes exceeds the {limit} byte limit")]
    SizeLimit { size: usize, limit: usize },

    #[error("storage call timed out after {0} ms")]
    Timeout(u64),

    #[error("failed to encode batch: {0}")]
    Encode(String),

    #[error("failed to decode batch: {0}")]
    Decode(String),

    #[error("content not found: {0}")]
    NotFound(String),

    #[error("storage I/O failure: {0}")]
    Io(String),
}

impl UploadError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Network(_) | Self::Timeout(_) => {
                Remediation::new("The storage backend is unreachable or slow; uploads retry automatically.")
                    .alternative("Raise storage.upload_timeout_ms if batches are large.")
            }
            Self::Funding(_) => Remediation::new("Top up the upload wallet; queued batches stay buffered.")
                .alternative("Lower engine.upload.max_fee only if the backend accepts it."),
            Self::SizeLimit { .. } => {
                Remediation::new("Batches are too large for the backend. Shorten the batch interval.")
                    .command("Show config", "telebatch config")
            }
            Self::Encode(_) | Self::Decode(_) => {
                Remediation::new("A batch could not be (de)serialized; check reading payloads.")
            }
            Self::NotFound(id) => Remediation::new(format!(
                "No batch is stored under {id}. Verify the content id and store location."
            ))
            .command("Fetch", format!("telebatch fetch {id} --store <DIR>")),
            Self::Io(_) => Remediation::new("Check the store directory permissions and free space."),
        }
    }
}

/// Failure of the best-effort ledger notification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("ledger transport failure: {0}")]
    Transport(String),

    #[error("ledger rejected anchor: {0}")]
    Rejected(String),
}

/// Loading or validating `telebatch.toml`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no config file at {0}")]
    FileNotFound(String),

    #[error("cannot read {0}: {1}")]
    ReadFailed(String, String),

    #[error("cannot parse config: {0}")]
    ParseFailed(String),

    #[error("cannot serialize config: {0}")]
    SerializeFailed(String),

    #[error("{0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(_) => {
                Remediation::new("Point --config (or TELEBATCH_CONFIG) at an existing file.")
                    .alternative("Omit --config to run on built-in defaults.")
            }
            Self::ReadFailed(path, _) => {
                Remediation::new(format!("Give the service user read access to {path}."))
            }
            Self::ParseFailed(_) => Remediation::new("Fix the TOML syntax reported above.")
                .command("Print a valid config", "telebatch config"),
            Self::SerializeFailed(_) => Remediation::new("Report this; defaults always serialize."),
            Self::ValidationError(_) => Remediation::new("Correct the field named above.")
                .command("Show effective config", "telebatch config"),
        }
    }
}

/// Engine lifecycle errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine is shut down")]
    Closed,

    #[error("engine dropped before the flush completed")]
    Dropped,
}
