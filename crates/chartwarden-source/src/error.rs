//! Error types for chart source operations

use thiserror::Error;

/// Result type for chart source operations
pub type Result<T> = std::result::Result<T, SourceError>;

/// Chart source errors
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SourceError {
    // ============ Readiness Errors ============
    /// The mirror backing a source is not usable yet; wait for its change signal
    #[error("git mirror for {remote} is not ready: {status}")]
    NotReady { remote: String, status: String },

    /// The mirror is ready but the chart cannot be produced from it
    #[error("chart from {remote} unavailable: {message}")]
    Unavailable { remote: String, message: String },

    #[error("invalid chart source: {message}")]
    InvalidSource { message: String },

    // ============ Git Errors ============
    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    #[error("git {command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    // ============ Network Errors ============
    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    // ============ Index Errors ============
    #[error("Index parse error: {message}")]
    IndexParseError { message: String },

    #[error("Chart not found: {name}@{version} in repository {repo}")]
    VersionNotFound {
        name: String,
        version: String,
        repo: String,
    },

    #[error("Integrity check failed for {name}: expected {expected}, got {actual}")]
    IntegrityCheckFailed {
        name: String,
        expected: String,
        actual: String,
    },

    // ============ IO Errors ============
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => SourceError::HttpError {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => SourceError::NetworkError {
                message: e.to_string(),
            },
        }
    }
}

impl SourceError {
    /// The source is still being prepared; retry on the next signal
    pub fn is_not_ready(&self) -> bool {
        matches!(self, SourceError::NotReady { .. })
    }

    /// Network hiccups and timeouts that a later attempt may not hit
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Timeout { .. } | SourceError::NetworkError { .. } => true,
            SourceError::HttpError { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
