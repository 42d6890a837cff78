//! Error types for the block cache crate.

use blobmount_storage::StorageError;
use thiserror::Error;

use crate::diskcache::DiskCacheError;
use crate::executor::ExecutorError;

/// Errors surfaced by block cache operations.
///
/// Transient backend failures are retried inside the engine; only terminal
/// failures reach the caller.
#[derive(Debug, Error)]
pub enum BlockCacheError {
    /// Configuration rejected by validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Block index beyond the per-file block limit.
    #[error("Block index {index} of {path} exceeds the limit of {max} blocks")]
    IndexOutOfRange {
        /// File path.
        path: String,
        /// Requested block index.
        index: u64,
        /// Configured maximum number of blocks per file.
        max: u64,
    },

    /// Committed block does not match the configured block size.
    #[error("Block {index} of {path} is {actual} bytes, expected {expected}")]
    BlockSizeMismatch {
        /// File path.
        path: String,
        /// Block index.
        index: u64,
        /// Configured block size.
        expected: u64,
        /// Committed block size.
        actual: u64,
    },

    /// File has content but no committed block list, so it cannot be modified blockwise.
    #[error("No committed block list for {0}")]
    BlockListUnavailable(String),

    /// Download failed after exhausting retries.
    #[error("Failed to download block {index} of {path}")]
    DownloadFailed {
        /// File path.
        path: String,
        /// Block index.
        index: u64,
    },

    /// Dirty blocks remained after every staging round.
    #[error("Failed to stage {remaining} blocks of {path}")]
    StageFailed {
        /// File path.
        path: String,
        /// Dirty blocks left unstaged.
        remaining: usize,
    },

    /// Backend rejected the commit.
    #[error("Failed to commit {path}: {source}")]
    CommitFailed {
        /// File path.
        path: String,
        /// Backend error.
        #[source]
        source: StorageError,
    },

    /// Backend returned no bytes for a block inside the file.
    #[error("Zero bytes read for block {index} of {path}")]
    ZeroBytesRead {
        /// File path.
        path: String,
        /// Block index.
        index: u64,
    },

    /// Operation on a closed handle.
    #[error("Handle {0} is closed")]
    HandleClosed(u64),

    /// Write through a handle opened without write access.
    #[error("Handle {0} is not open for writing")]
    NotWritable(u64),

    /// A block of committed content has no block id to commit it under.
    #[error("Block {index} of {path} has no committed block id")]
    MissingBlockId {
        /// File path.
        path: String,
        /// Block index.
        index: u64,
    },

    /// Operation before `start()`.
    #[error("Block cache has not been started")]
    NotStarted,

    /// Handle bookkeeping is inconsistent.
    #[error("Internal consistency error: {0}")]
    Internal(String),

    /// Memory pool cannot hand out any block.
    #[error("Block pool exhausted")]
    PoolExhausted,

    /// The cache has been stopped.
    #[error("Block cache is shut down")]
    Shutdown,

    /// Storage backend error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Local spill cache error.
    #[error(transparent)]
    DiskCache(#[from] DiskCacheError),

    /// Backend executor error.
    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
}
