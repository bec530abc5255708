//! Error types for the tally server.

use thiserror::Error;

/// Tally server error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error: fatal at startup, logged and ignored on refresh.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A round could not start or complete.
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

/// Result type alias for tally server operations.
pub type Result<T> = std::result::Result<T, Error>;
