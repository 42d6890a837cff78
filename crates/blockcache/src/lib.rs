//! Block cache for blob-backed filesystems.
//!
//! Files are split into fixed-size blocks held in a bounded memory pool.
//! Reads download blocks in parallel and prefetch ahead of sequential
//! readers; writes land in memory, are staged to the backend as blocks, and
//! become visible when the ordered block list is committed on flush or close.
//!
//! # Architecture
//!
//! ```text
//! Layer 3: BlockCache (open, read, write, flush, close, file/dir ops)
//! Layer 2: FileHandle (cooking/cooked lists, block ids), ThreadPool, DiskSpillCache
//! Layer 1: Primitives (Block, BlockPool, BackendExecutor, StorageBackend)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use blobmount_blockcache::{BlockCache, BlockCacheOptions, OpenFlags};
//! use blobmount_storage::MemoryBackend;
//!
//! let cache = BlockCache::new(BlockCacheOptions::default(), Arc::new(MemoryBackend::new()))?;
//! cache.start()?;
//! let handle = cache.create_file("data/out.bin", 0o644)?;
//! cache.write_file(&handle, 0, b"hello")?;
//! cache.close_file(&handle)?;
//! ```

pub mod block;
pub mod block_pool;
pub mod buffers;
pub mod diskcache;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handle;
pub mod options;
pub mod stats;
pub mod threadpool;

pub use block::{Block, BlockFlags, Phase, Readiness};
pub use block_pool::{BlockPool, BlockPoolConfig, BlockPoolStats};
pub use diskcache::{DiskCacheError, DiskSpillCache, DiskSpillStats};
pub use engine::{BlockCache, BlockWorker, WorkerStats};
pub use error::BlockCacheError;
pub use executor::{BackendExecutor, ExecutorConfig, ExecutorError};
pub use handle::{FileHandle, OpenFlags};
pub use options::{BlockCacheOptions, DiskSpillOptions, Tunables};
pub use stats::BlockCacheStats;
pub use threadpool::{ThreadPool, ThreadPoolConfig, ThreadPoolStats, WorkHandler, WorkItem};
