//! Scheduler error types

use thiserror::Error;

use kiln_core::{KilnError, ModelError};
use kiln_executor::ExecutorError;

/// Scheduler-related errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Backend call failed
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Core error
    #[error(transparent)]
    Core(#[from] KilnError),

    /// Data model invariant violated
    #[error(transparent)]
    Model(#[from] ModelError),

    /// A commit or spec source failed
    #[error("Source error: {0}")]
    Source(String),

    /// State store error
    #[error("Store error: {0}")]
    Store(String),

    /// A completion notification could not be interpreted
    #[error("Invalid notification payload: {0}")]
    Payload(String),

    /// No job spec with the given name at the commit
    #[error("Unknown job '{job}' at {repo}@{revision}")]
    UnknownJob {
        repo: String,
        revision: String,
        job: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    /// Whether the same operation may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Executor(e) => e.is_transient(),
            Self::Source(_) | Self::Io(_) => true,
            _ => false,
        }
    }
}
