//! Download and upload callbacks run by the block workers.
//!
//! Both directions go through the same per-key lock as the spill evictor, so a
//! spilled copy is never deleted while a worker is reading or refreshing it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::BlockFlags;
use crate::diskcache::{spill_key, DiskSpillCache, KeyLocks};
use crate::error::BlockCacheError;
use crate::executor::BackendExecutor;
use crate::threadpool::{WorkHandler, WorkItem};

/// Counters kept by the worker callbacks.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Blocks fetched from the backend.
    pub downloads: u64,
    /// Blocks served from the spill cache instead of the backend.
    pub spill_hits: u64,
    /// Blocks staged on the backend.
    pub uploads: u64,
    /// Bytes fetched from the backend.
    pub bytes_downloaded: u64,
    /// Bytes staged on the backend.
    pub bytes_uploaded: u64,
    /// Items given up on.
    pub abandoned: u64,
}

/// [`WorkHandler`] that moves block content between the backend, the spill
/// cache and memory.
pub struct BlockWorker {
    executor: Arc<BackendExecutor>,
    spill: Option<Arc<DiskSpillCache>>,
    locks: KeyLocks,
    downloads: AtomicU64,
    spill_hits: AtomicU64,
    uploads: AtomicU64,
    bytes_downloaded: AtomicU64,
    bytes_uploaded: AtomicU64,
    abandoned: AtomicU64,
}

impl BlockWorker {
    /// Create a worker.
    ///
    /// # Arguments
    /// * `executor` - Runs backend calls
    /// * `spill` - Optional disk spill cache
    pub fn new(executor: Arc<BackendExecutor>, spill: Option<Arc<DiskSpillCache>>) -> Self {
        Self {
            executor,
            spill,
            locks: KeyLocks::new(),
            downloads: AtomicU64::new(0),
            spill_hits: AtomicU64::new(0),
            uploads: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            bytes_uploaded: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            downloads: self.downloads.load(Ordering::Relaxed),
            spill_hits: self.spill_hits.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        match &self.spill {
            Some(spill) => spill.key_lock(key),
            None => self.locks.get(key),
        }
    }
}

impl WorkHandler for BlockWorker {
    fn download(&self, item: &WorkItem) -> Result<(), BlockCacheError> {
        let key: String = spill_key(&item.path, item.index);
        let lock: Arc<Mutex<()>> = self.key_lock(&key);
        let _guard = lock.lock();

        if let Some(spill) = &self.spill {
            match spill.read_locked(&key) {
                Ok(Some(data)) if !data.is_empty() => {
                    item.block.load(&data);
                    self.spill_hits.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!("block {} of {} served from spill", item.index, item.path);
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("spill read of {} failed: {}", key, e);
                }
            }
        }

        let path: String = item.path.to_string();
        let offset: u64 = item.block.offset();
        let len: usize = item.block.capacity();
        let data: Vec<u8> = self
            .executor
            .call(move |backend| async move { backend.read_range(&path, offset, len).await })?;

        if data.is_empty() {
            return Err(BlockCacheError::ZeroBytesRead {
                path: item.path.to_string(),
                index: item.index,
            });
        }

        let loaded: usize = item.block.load(&data);
        self.downloads.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded
            .fetch_add(loaded as u64, Ordering::Relaxed);

        if let Some(spill) = &self.spill {
            if let Err(e) = spill.write_locked(&key, &data[..loaded]) {
                tracing::warn!("spill write of {} failed: {}", key, e);
            }
        }
        Ok(())
    }

    fn upload(&self, item: &WorkItem) -> Result<(), BlockCacheError> {
        let block_id: String = item.block_id.clone().ok_or_else(|| {
            BlockCacheError::Internal(format!(
                "upload of block {} of {} has no block id",
                item.index, item.path
            ))
        })?;

        let payload: Vec<u8> = item.block.payload();
        let size: u64 = payload.len() as u64;

        let path: String = item.path.to_string();
        let index: u64 = item.index;
        let data: Vec<u8> = payload.clone();
        self.executor.call(move |backend| async move {
            backend.stage_block(&path, &block_id, index, &data).await
        })?;

        self.uploads.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(size, Ordering::Relaxed);

        if let Some(spill) = &self.spill {
            let key: String = spill_key(&item.path, item.index);
            let lock: Arc<Mutex<()>> = spill.key_lock(&key);
            let _guard = lock.lock();
            if let Err(e) = spill.write_locked(&key, &payload) {
                tracing::warn!("spill write of {} failed: {}", key, e);
            }
        }

        item.block.set_flags(BlockFlags::SYNCED);
        item.block.clear_flags(BlockFlags::DIRTY);
        Ok(())
    }

    fn abandoned(&self, item: &WorkItem) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            "{} of block {} of {} abandoned after {} failed attempts",
            if item.upload { "upload" } else { "download" },
            item.index,
            item.path,
            item.fail_count
        );
    }
}
