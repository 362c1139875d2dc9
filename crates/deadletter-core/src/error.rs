//! Error types for deadletter

use thiserror::Error;

/// Result type alias using deadletter's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for deadletter operations
#[derive(Error, Debug)]
pub enum Error {
    /// The dead-letter store could not accept or return records.
    ///
    /// Always fatal for the enclosing dispatch: an exhausted event must never be
    /// dropped on the floor.
    #[error("Dead-letter store unavailable: {0}")]
    StorageUnavailable(String),

    /// Configuration error (malformed alarm rules, bad channels, unreadable files)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(String),

    /// Notification delivery error
    #[error("Notification error: {0}")]
    Notification(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a storage unavailable error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageUnavailable(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
