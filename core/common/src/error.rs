//! Common error types for SkySync.

use thiserror::Error;

/// Top-level error type for SkySync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Durable store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Remote API call failed.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Operation did not finish within its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A single-flight operation is already running.
    #[error("Sync already in progress")]
    SyncInProgress,

    /// Connectivity monitor reports no network.
    #[error("Offline")]
    Offline,

    /// The sync scheduler task has exited.
    #[error("Scheduler not running")]
    SchedulerStopped,
}

impl Error {
    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Remote(_) | Error::Timeout(_) | Error::Io(_) | Error::Offline
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
