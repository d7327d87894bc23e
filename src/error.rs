//! Error taxonomy shared by the archive, fetch, and runner layers.

use std::path::PathBuf;

use thiserror::Error;

use crate::runner::protocol::ProtocolError;
use crate::telemetry::LogError;

pub type Result<T> = std::result::Result<T, CartonError>;

#[derive(Error, Debug)]
pub enum CartonError {
    /// Malformed metadata or tensor specs.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Content did not hash to the value it was declared with.
    #[error("Integrity check failed for {what}: expected sha256 {expected}, got {actual}")]
    Integrity {
        what: String,
        expected: String,
        actual: String,
    },

    /// Every URL for a linked file failed.
    #[error("Failed to fetch linked file {sha256} after {attempts} attempt(s): {}", .failures.join("; "))]
    Fetch {
        sha256: String,
        attempts: u32,
        failures: Vec<String>,
    },

    /// An archive given by http(s) URL could not be downloaded.
    #[error("Failed to download archive {url} after {attempts} attempt(s): {}", .failures.join("; "))]
    ArchiveDownload {
        url: String,
        attempts: u32,
        failures: Vec<String>,
    },

    #[error("No runner named '{name}' was found in {}. Install it or point CARTON_RUNNER_DIR at the directory containing it", .searched.display())]
    RunnerNotFound { name: String, searched: PathBuf },

    #[error("Runner '{name}' is installed but no version satisfies '{required}' (available: {})", .available.join(", "))]
    VersionMismatch {
        name: String,
        required: String,
        available: Vec<String>,
    },

    #[error("Handshake with runner '{runner}' failed: {reason}")]
    Handshake { runner: String, reason: String },

    /// Error reported by the runner for a single call. The model stays usable.
    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Runner '{runner}' exited or disconnected: {reason}")]
    RunnerDied { runner: String, reason: String },

    #[error("Model '{0}' is no longer usable because its runner was terminated")]
    ModelDead(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Model requires one of [{}] but this host is {host}", .required.join(", "))]
    UnsupportedPlatform { required: Vec<String>, host: String },

    #[error("Invalid device '{0}': expected cpu, gpu0..gpu7, or an index 0..7")]
    InvalidDevice(String),

    #[error("Invalid archive {}: {reason}", .path.display())]
    InvalidArchive { path: PathBuf, reason: String },

    #[error("Input queue is full")]
    QueueFull,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Version requirement error: {0}")]
    Semver(#[from] semver::Error),

    #[error("Logging error: {0}")]
    Log(#[from] LogError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CartonError {
    /// True when the error means the runner behind a model is gone.
    pub fn is_fatal_to_model(&self) -> bool {
        matches!(
            self,
            CartonError::RunnerDied { .. } | CartonError::ModelDead(_) | CartonError::Timeout(_)
        )
    }

    pub(crate) fn invalid_archive(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        CartonError::InvalidArchive {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<tokio::task::JoinError> for CartonError {
    fn from(e: tokio::task::JoinError) -> Self {
        CartonError::Internal(format!("blocking task failed: {e}"))
    }
}
