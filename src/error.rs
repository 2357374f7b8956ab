//! Error types for the DoH gateway

use thiserror::Error;

/// Top-level error type for the bootstrap/process boundary
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
