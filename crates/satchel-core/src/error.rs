//! Error types for satchel-core

use thiserror::Error;

/// Result type alias using satchel-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in satchel-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Table name that does not map to a synchronized entity
    #[error("Unsupported table: {0}")]
    UnsupportedTable(String),

    /// Subsystem used before `initialize()`
    #[error("Sync subsystem used before initialize(): {0}")]
    NotInitialized(&'static str),

    /// Remote store failure
    #[error("Remote store error: {message}")]
    Remote {
        /// Error message
        message: String,
        /// Whether the operation can be retried later
        retryable: bool,
    },

    /// Conflict resolution failure
    #[error("Conflict resolution failed: {0}")]
    Conflict(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Creates a retryable remote error.
    pub fn remote_transient(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable remote error.
    pub fn remote_fatal(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true when the failure is worth retrying through the queue.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Remote { retryable, .. } => *retryable,
            Self::LibSql(_) | Self::Io(_) | Self::Database(_) => true,
            _ => false,
        }
    }
}
