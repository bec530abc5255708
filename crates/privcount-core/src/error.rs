//! Error types for privcount-core.

use thiserror::Error;

/// Core error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (bad bins, bad sigmas, bad noise weights, ...).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter structure error (missing bins, detach before noise, ...).
    #[error("Counter error: {0}")]
    Counter(String),

    /// Noise allocation error (infeasible privacy budget, bad interval).
    #[error("Noise allocation error: {0}")]
    Noise(String),

    /// Wire protocol violation (bad handshake, oversize line, bad message).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Tagged event parse failure.
    #[error("Event error: {0}")]
    Event(String),

    /// Cryptographic failure (decrypt, key import, encoding).
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Traffic model configuration or processing error.
    #[error("Traffic model error: {0}")]
    TrafficModel(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// RSA key or encryption error.
    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    /// PKCS#8 key encoding error.
    #[error("Key encoding error: {0}")]
    Pkcs8(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rsa::pkcs8::Error> for Error {
    fn from(e: rsa::pkcs8::Error) -> Self {
        Error::Pkcs8(e.to_string())
    }
}

impl From<rsa::pkcs8::spki::Error> for Error {
    fn from(e: rsa::pkcs8::spki::Error) -> Self {
        Error::Pkcs8(e.to_string())
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("missing noise_weight".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing noise_weight");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
