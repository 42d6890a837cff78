//! Error types for storage backend operations.

use thiserror::Error;

/// Errors returned by a [`StorageBackend`](crate::StorageBackend).
#[derive(Debug, Error)]
pub enum StorageError {
    /// Object does not exist.
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Object already exists where a new one was requested.
    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    /// A commit referenced a block id that was never staged or committed.
    #[error("Unknown block id {id} for {path}")]
    UnknownBlock {
        /// Object path.
        path: String,
        /// Offending block id.
        id: String,
    },

    /// Local IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other backend failure (network, throttling, service error).
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Io(_) | StorageError::Backend(_))
    }
}
