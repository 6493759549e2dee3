//! Errors raised by the correlation logs.

use thiserror::Error;

/// Errors returned by detail/summary log operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// `SummaryLog::end` was called on an already ended summary.
    ///
    /// Callers treat this as recoverable: check `is_end()` first or ignore it.
    #[error("summary already ended")]
    SummaryAlreadyEnded,

    /// A record could not be serialized.
    #[error("Failed to serialize log record: {0}")]
    Serialize(String),

    /// A sink could not be opened.
    #[error("Failed to open log sink: {0}")]
    Io(String),
}

impl From<serde_json::Error> for LogError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialize(e.to_string())
    }
}

impl From<std::io::Error> for LogError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
