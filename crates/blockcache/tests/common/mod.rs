//! Shared fixtures for block cache integration tests.
//!
//! Engine operations block on backend calls, so tests are plain `#[test]`
//! functions rather than tokio tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use blobmount_blockcache::{BlockCache, BlockCacheOptions};
use blobmount_storage::MemoryBackend;

/// Block size used by most tests.
pub const BLOCK: u64 = 4096;

/// A started cache over an in-memory backend.
pub struct Harness {
    pub cache: BlockCache,
    pub backend: Arc<MemoryBackend>,
}

impl Harness {
    /// Build and start a cache.
    ///
    /// # Arguments
    /// * `options` - Cache options
    pub fn new(options: BlockCacheOptions) -> Self {
        Self::with_backend(options, Arc::new(MemoryBackend::new()))
    }

    /// Build and start a cache over an existing backend.
    pub fn with_backend(options: BlockCacheOptions, backend: Arc<MemoryBackend>) -> Self {
        let cache: BlockCache = BlockCache::new(options, backend.clone()).unwrap();
        cache.start().unwrap();
        Self { cache, backend }
    }
}

/// Small-block options: 4 KiB blocks, 64 pool blocks, 4 workers.
pub fn small_options() -> BlockCacheOptions {
    BlockCacheOptions::default()
        .with_block_size_bytes(BLOCK)
        .with_pool_blocks(64)
        .with_parallelism(4)
}

/// Deterministic content where every byte depends on its offset.
///
/// # Arguments
/// * `len` - Number of bytes
/// * `seed` - Varies the content between files
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i / 7) as u8).wrapping_mul(31).wrapping_add(i as u8) ^ seed)
        .collect()
}

/// Route engine logs to the test output when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll until `cond` holds or `timeout` passes.
///
/// # Returns
/// The final value of `cond`.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline: Instant = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
