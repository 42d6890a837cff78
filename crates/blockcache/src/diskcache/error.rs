//! Error types for disk spill operations.

use thiserror::Error;

/// Errors from disk spill operations.
#[derive(Debug, Error)]
pub enum DiskCacheError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Spill root could not be used.
    #[error("Invalid spill directory {path}: {reason}")]
    InvalidRoot {
        /// Configured directory.
        path: String,
        /// What is wrong with it.
        reason: String,
    },
}
