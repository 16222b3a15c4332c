//! Error types for SDAS

use thiserror::Error;

/// Result type alias for SDAS operations
pub type Result<T> = std::result::Result<T, SdasError>;

/// Errors shared by every SDAS crate
#[derive(Error, Debug)]
pub enum SdasError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}
