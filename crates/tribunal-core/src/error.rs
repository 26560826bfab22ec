//! Unified error types for tribunal

use thiserror::Error;

/// Unified error type for all tribunal operations
#[derive(Error, Debug)]
pub enum TribunalError {
    // Persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Round protocol errors
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Invalid vote: {0}")]
    InvalidVote(String),

    // Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl TribunalError {
    /// Whether this error came from the persistence layer
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_) | Self::Serialization(_))
    }
}

/// Result type alias using TribunalError
pub type Result<T> = std::result::Result<T, TribunalError>;
