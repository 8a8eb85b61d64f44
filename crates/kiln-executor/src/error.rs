//! Executor error types

use thiserror::Error;

/// Executor-related errors
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The request was rejected locally, before any backend call
    #[error("Invalid task request: {0}")]
    Validation(String),

    /// The backend has no capacity for the request right now
    #[error("No capacity: {0}")]
    NoCapacity(String),

    /// The call did not complete within its wall-clock bound
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// API error from the backend
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    /// The backend answered with something we could not interpret
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The backend reported a task state we do not know
    #[error("Unknown task state: {0}")]
    UnknownState(String),

    /// Task not found
    #[error("Task not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl ExecutorError {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NoCapacity(_) | Self::Timeout(_) | Self::Http(_) => true,
            Self::ApiError { status, .. } => *status == 429 || *status >= 500,
            Self::MalformedResponse(_) => true,
            Self::Validation(_)
            | Self::UnknownState(_)
            | Self::NotFound(_)
            | Self::Configuration(_)
            | Self::Json(_)
            | Self::Other(_) => false,
        }
    }
}

/// Result type for executor operations
pub type Result<T> = std::result::Result<T, ExecutorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExecutorError::NoCapacity("pool".into()).is_transient());
        assert!(ExecutorError::Timeout("trigger".into()).is_transient());
        assert!(ExecutorError::ApiError {
            status: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(!ExecutorError::ApiError {
            status: 400,
            message: "bad request".into()
        }
        .is_transient());
        assert!(!ExecutorError::Validation("dup".into()).is_transient());
        assert!(!ExecutorError::UnknownState("WEIRD".into()).is_transient());
    }
}
