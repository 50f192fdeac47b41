//! Service-wide error types.

use thiserror::Error;

/// Service-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Service-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("download error: {0}")]
    Download(#[from] hlsfetch::DownloadError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("{0}")]
    Task(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn task(msg: impl Into<String>) -> Self {
        Self::Task(msg.into())
    }

    /// True when the underlying cause is the operator's stop request.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Download(err) if err.is_cancelled())
    }
}
