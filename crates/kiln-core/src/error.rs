//! Error types for Kiln

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using KilnError
pub type Result<T> = std::result::Result<T, KilnError>;

/// Main error type for Kiln core operations
#[derive(Debug, Error)]
pub enum KilnError {
    /// Configuration-related errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Data model invariant violations
    #[error(transparent)]
    Model(#[from] ModelError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    NotFound(PathBuf),

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// IO error
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Data model errors
#[derive(Debug, Error)]
pub enum ModelError {
    /// A dimension string was not of the form `key:value`
    #[error("Invalid dimension '{0}': expected key:value")]
    InvalidDimension(String),

    /// A task's timestamps contradict its status
    #[error("Task {id}: {message}")]
    InvalidTiming { id: String, message: String },

    /// An update tried to attach a task to the wrong key
    #[error("Task {id} belongs to {expected}, not {actual}")]
    KeyMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    /// A job spec references a task spec that does not exist
    #[error("Job '{job}' references unknown task spec '{task}'")]
    UnknownTaskSpec { job: String, task: String },

    /// A job has no slot with the given name
    #[error("Job {job} has no task slot named '{slot}'")]
    UnknownSlot { job: String, slot: String },

    /// Task spec dependencies form a cycle
    #[error("Dependency cycle detected involving task spec '{0}'")]
    DependencyCycle(String),
}
