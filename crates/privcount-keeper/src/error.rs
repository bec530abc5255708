//! Error types for the share keeper.

use thiserror::Error;

/// Share keeper error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error: fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Core engine error.
    #[error("{0}")]
    Core(#[from] privcount_core::Error),

    /// YAML error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for share keeper operations.
pub type Result<T> = std::result::Result<T, Error>;
