//! Error types for the data collector.

use thiserror::Error;

/// Data collector error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error: fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The current round cannot continue.
    #[error("Round error: {0}")]
    Round(String),

    /// Core engine error.
    #[error("{0}")]
    Core(#[from] privcount_core::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for data collector operations.
pub type Result<T> = std::result::Result<T, Error>;
