//! Block cache engine: file handles over a shared block pool.
//!
//! # Architecture
//!
//! ```text
//!  open/read/write/flush/close (per-handle lock held throughout)
//!        │
//!        ▼
//!  ┌──────────────┐  try_get/must_get  ┌───────────┐
//!  │ HandleState  │◄──────────────────►│ BlockPool │
//!  │ cooking list │      release       └───────────┘
//!  │ cooked list  │
//!  │ index map    │  schedule(urgent)  ┌────────────┐  read_range / stage_block
//!  └──────────────┘───────────────────►│ ThreadPool │──► BlockWorker ──► BackendExecutor
//!         ▲                            └────────────┘        │
//!         └─────────── Block::wait / unblock ◄───────────────┘ complete()
//! ```
//!
//! Workers never touch handle state. They fill or upload a block and complete
//! its phase; the first caller that waits on the block does the list
//! bookkeeping under the handle lock.
//!
//! Cooked blocks are always clean and idle, so they can be reused for another
//! index at any time. Everything else (downloads in flight, dirty data,
//! uploads in flight) lives on the cooking list.

mod flush;
mod read;
mod worker;
mod write;

pub use worker::{BlockWorker, WorkerStats};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use blobmount_storage::{CommittedBlock, ObjectAttr, StorageBackend};
use dashmap::DashMap;

use crate::block::{Block, BlockFlags, Readiness};
use crate::block_pool::{BlockPool, BlockPoolConfig};
use crate::buffers::Queue;
use crate::diskcache::DiskSpillCache;
use crate::error::BlockCacheError;
use crate::executor::{BackendExecutor, ExecutorConfig};
use crate::handle::{FileHandle, HandleState, OpenFlags};
use crate::options::BlockCacheOptions;
use crate::stats::BlockCacheStats;
use crate::threadpool::{ThreadPool, ThreadPoolConfig, WorkItem};

/// Block cache over a storage backend.
///
/// All operations are synchronous and may block the calling thread on backend
/// I/O; call them from filesystem threads, not from inside an async runtime.
pub struct BlockCache {
    options: BlockCacheOptions,
    block_size: u64,
    pool: Arc<BlockPool>,
    threads: ThreadPool,
    worker: Arc<BlockWorker>,
    executor: Arc<BackendExecutor>,
    spill: Option<Arc<DiskSpillCache>>,
    handles: DashMap<u64, Arc<str>>,
    next_handle_id: AtomicU64,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl BlockCache {
    /// Build a cache; no worker runs until [`start`](Self::start).
    ///
    /// # Arguments
    /// * `options` - Cache configuration
    /// * `backend` - Storage backend
    pub fn new(
        options: BlockCacheOptions,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self, BlockCacheError> {
        options.validate()?;
        let block_size: u64 = options.block_size();

        let executor = Arc::new(BackendExecutor::new(
            backend,
            ExecutorConfig::default()
                .with_worker_threads(options.io_threads)
                .with_default_timeout(options.backend_timeout()),
        )?);

        let spill: Option<Arc<DiskSpillCache>> = match &options.disk {
            Some(disk) => Some(Arc::new(DiskSpillCache::new(disk.clone())?)),
            None => None,
        };

        let pool = Arc::new(BlockPool::new(BlockPoolConfig::new(
            block_size,
            options.mem_size(),
        )));

        let worker = Arc::new(BlockWorker::new(executor.clone(), spill.clone()));
        let threads: ThreadPool = ThreadPool::new(
            ThreadPoolConfig {
                workers: options.parallelism.max(1) as usize,
                priority_share_pct: options.tuning.priority_share_pct,
                max_attempts: options.tuning.max_attempts,
            },
            worker.clone(),
        );

        tracing::info!(
            "block cache: block size {} bytes, {} pool blocks, prefetch {}, {} workers",
            block_size,
            pool.max_blocks(),
            options.prefetch,
            options.parallelism
        );

        Ok(Self {
            options,
            block_size,
            pool,
            threads,
            worker,
            executor,
            spill,
            handles: DashMap::new(),
            next_handle_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Start the block workers and the spill evictor.
    pub fn start(&self) -> Result<(), BlockCacheError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(BlockCacheError::Shutdown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.threads.start()?;
        if let Some(spill) = &self.spill {
            spill.start()?;
        }
        tracing::debug!("block cache started");
        Ok(())
    }

    /// Stop workers, fail queued work and close the pool.
    ///
    /// Open handles are not flushed; callers close them first.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.handles.is_empty() {
            tracing::warn!("stopping block cache with {} open handles", self.handles.len());
        }
        self.threads.stop();
        self.pool.close();
        if let Some(spill) = &self.spill {
            spill.stop();
        }
        self.executor.cancel_all();
        tracing::debug!("block cache stopped");
    }

    /// Configuration in effect.
    pub fn options(&self) -> &BlockCacheOptions {
        &self.options
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// The disk spill cache, when enabled.
    pub fn spill(&self) -> Option<&Arc<DiskSpillCache>> {
        self.spill.as_ref()
    }

    /// Number of open handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Snapshot of pool, worker and spill counters.
    pub fn stats(&self) -> BlockCacheStats {
        BlockCacheStats {
            pool: self.pool.stats(),
            threads: self.threads.stats(),
            worker: self.worker.stats(),
            spill: self.spill.as_ref().map(|s| s.stats()),
            open_handles: self.handles.len(),
        }
    }

    // ========================================================================
    // File and directory operations
    // ========================================================================

    /// Create an empty file and open it read-write.
    ///
    /// # Arguments
    /// * `path` - File path
    /// * `mode` - Permission bits
    pub fn create_file(&self, path: &str, mode: u32) -> Result<Arc<FileHandle>, BlockCacheError> {
        self.ensure_running()?;
        let owned: String = path.to_string();
        let attr: ObjectAttr = self
            .executor
            .call(move |backend| async move { backend.create_file(&owned, mode).await })?;
        self.invalidate_spill_file(path);

        let handle: Arc<FileHandle> = self.register(path, OpenFlags::READ_WRITE, &attr);
        tracing::debug!("created {} as handle {}", path, handle.id());
        Ok(handle)
    }

    /// Open an existing file.
    ///
    /// Write-only opens without `TRUNCATE` behave like read-write opens.
    ///
    /// # Arguments
    /// * `path` - File path
    /// * `flags` - Open flags
    pub fn open_file(&self, path: &str, flags: OpenFlags) -> Result<Arc<FileHandle>, BlockCacheError> {
        self.ensure_running()?;
        let owned: String = path.to_string();
        let attr: ObjectAttr = self
            .executor
            .call(move |backend| async move { backend.get_attr(&owned).await })?;

        let handle: Arc<FileHandle> = Arc::new(FileHandle::new(
            self.next_handle_id.fetch_add(1, Ordering::Relaxed),
            path,
            flags,
            attr.size,
            attr.mtime,
        ));

        {
            let mut state = handle.lock();
            if let Err(e) = self.prepare_open(&handle, &mut state) {
                for block in state.buffers.drain() {
                    self.pool.release(block);
                }
                state.closed = true;
                return Err(e);
            }
        }

        self.handles.insert(handle.id(), handle.shared_path());
        tracing::debug!(
            "opened {} ({} bytes, {:?}) as handle {}",
            path,
            attr.size,
            flags,
            handle.id()
        );
        Ok(handle)
    }

    /// Flush pending writes and release every block of the handle.
    ///
    /// On a flush error the handle stays open with its blocks intact so the
    /// caller can retry.
    ///
    /// # Arguments
    /// * `handle` - Handle to close
    pub fn close_file(&self, handle: &FileHandle) -> Result<(), BlockCacheError> {
        let mut state = handle.lock();
        if state.closed {
            return Ok(());
        }
        if state.dirty {
            self.commit_blocks(handle, &mut state)?;
        }

        for block in state.buffers.drain() {
            self.pool.release(block);
        }
        state.block_ids.clear();
        state.uncommitted.clear();
        state.closed = true;
        drop(state);

        self.handles.remove(&handle.id());
        tracing::debug!("closed handle {} of {}", handle.id(), handle.path());
        Ok(())
    }

    /// Delete a file and its spilled blocks.
    pub fn delete_file(&self, path: &str) -> Result<(), BlockCacheError> {
        self.ensure_running()?;
        let owned: String = path.to_string();
        self.executor
            .call(move |backend| async move { backend.delete_file(&owned).await })?;
        self.invalidate_spill_file(path);
        Ok(())
    }

    /// Rename a file; spilled blocks of both names are dropped.
    pub fn rename_file(&self, src: &str, dst: &str) -> Result<(), BlockCacheError> {
        self.ensure_running()?;
        let (from, to): (String, String) = (src.to_string(), dst.to_string());
        self.executor
            .call(move |backend| async move { backend.rename_file(&from, &to).await })?;
        self.invalidate_spill_file(src);
        self.invalidate_spill_file(dst);
        Ok(())
    }

    /// Delete a directory and the spilled blocks beneath it.
    pub fn delete_dir(&self, path: &str) -> Result<(), BlockCacheError> {
        self.ensure_running()?;
        let owned: String = path.to_string();
        self.executor
            .call(move |backend| async move { backend.delete_dir(&owned).await })?;
        self.invalidate_spill_dir(path);
        Ok(())
    }

    /// Rename a directory; spilled blocks under both names are dropped.
    pub fn rename_dir(&self, src: &str, dst: &str) -> Result<(), BlockCacheError> {
        self.ensure_running()?;
        let (from, to): (String, String) = (src.to_string(), dst.to_string());
        self.executor
            .call(move |backend| async move { backend.rename_dir(&from, &to).await })?;
        self.invalidate_spill_dir(src);
        self.invalidate_spill_dir(dst);
        Ok(())
    }

    // ========================================================================
    // Shared block bookkeeping
    // ========================================================================

    fn ensure_running(&self) -> Result<(), BlockCacheError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(BlockCacheError::Shutdown);
        }
        if !self.started.load(Ordering::Acquire) {
            return Err(BlockCacheError::NotStarted);
        }
        Ok(())
    }

    fn ensure_open(&self, handle: &FileHandle, state: &HandleState) -> Result<(), BlockCacheError> {
        self.ensure_running()?;
        if state.closed {
            return Err(BlockCacheError::HandleClosed(handle.id()));
        }
        Ok(())
    }

    fn register(&self, path: &str, flags: OpenFlags, attr: &ObjectAttr) -> Arc<FileHandle> {
        let id: u64 = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(FileHandle::new(id, path, flags, attr.size, attr.mtime));
        self.handles.insert(id, handle.shared_path());
        handle
    }

    /// Apply open flags and start the initial download or prefetch burst.
    fn prepare_open(
        &self,
        handle: &FileHandle,
        state: &mut HandleState,
    ) -> Result<(), BlockCacheError> {
        let flags: OpenFlags = handle.flags();
        if flags.contains(OpenFlags::TRUNCATE) && flags.writable() {
            state.size = 0;
            state.committed_size = 0;
            state.dirty = true;
            self.invalidate_spill_file(handle.path());
        } else if flags.writable() && state.size > 0 {
            self.load_block_list(handle, state)?;
        }

        if state.size > 0 && state.size < self.block_size {
            self.refresh_block(handle, state, 0, false)?;
        } else if state.size > 0 && self.options.prefetch_on_open && self.options.prefetch_enabled() {
            state.streaming = true;
            self.start_prefetch(handle, state, 0, true)?;
        }
        Ok(())
    }

    /// Load the committed block list so existing blocks can be rewritten in place.
    fn load_block_list(
        &self,
        handle: &FileHandle,
        state: &mut HandleState,
    ) -> Result<(), BlockCacheError> {
        let owned: String = handle.path().to_string();
        let blocks: Option<Vec<CommittedBlock>> = self
            .executor
            .call(move |backend| async move { backend.committed_blocks(&owned).await })?;

        let blocks: Vec<CommittedBlock> = match blocks {
            Some(list) if !list.is_empty() => list,
            _ => return Err(BlockCacheError::BlockListUnavailable(handle.path().to_string())),
        };

        let last: usize = blocks.len() - 1;
        for (i, block) in blocks.iter().enumerate() {
            let oversized: bool = block.size > self.block_size;
            if (i < last && block.size != self.block_size) || oversized {
                return Err(BlockCacheError::BlockSizeMismatch {
                    path: handle.path().to_string(),
                    index: i as u64,
                    expected: self.block_size,
                    actual: block.size,
                });
            }
            state.block_ids.insert(i as u64, block.id.clone());
        }
        Ok(())
    }

    /// Queue a download of `block` for `index`.
    fn schedule_download(&self, handle: &FileHandle, block: Arc<Block>, index: u64, prefetch: bool) {
        block.begin(BlockFlags::DOWNLOADING);
        self.threads.schedule(
            !prefetch,
            WorkItem {
                handle_id: handle.id(),
                path: handle.shared_path(),
                block,
                index,
                prefetch,
                upload: false,
                fail_count: 0,
                block_id: None,
            },
        );
    }

    /// Wait for a download and do the first-reader bookkeeping.
    ///
    /// A failed block is dropped from the handle and returned to the pool. A
    /// successful one moves to the cooked list; when `continue_prefetch` is set
    /// and the handle is streaming, the prefetch window slides forward first.
    fn claim_download(
        &self,
        handle: &FileHandle,
        state: &mut HandleState,
        block: &Arc<Block>,
        continue_prefetch: bool,
    ) -> Result<(), BlockCacheError> {
        let first: bool = block.wait() == Readiness::First;
        if first {
            block.clear_flags(BlockFlags::DOWNLOADING);
        }

        if block.has(BlockFlags::FAILED) && !block.has(BlockFlags::DIRTY) {
            let index: u64 = block.index().unwrap_or_default();
            if first {
                block.unblock();
            }
            state.buffers.remove(block);
            self.pool.release(block.clone());
            return Err(BlockCacheError::DownloadFailed {
                path: handle.path().to_string(),
                index,
            });
        }

        if !first {
            return Ok(());
        }

        if continue_prefetch
            && state.streaming
            && self.options.prefetch_enabled()
            && state.random_reads <= self.options.tuning.random_read_threshold
        {
            let next: u64 = state.next_prefetch_index;
            if next * self.block_size < state.size {
                if let Err(e) = self.start_prefetch(handle, state, next, true) {
                    tracing::debug!("prefetch of {} from block {} failed: {}", handle.path(), next, e);
                }
            }
        }

        if !block.has(BlockFlags::DIRTY) {
            state.buffers.push_back(Queue::Cooked, block.clone());
        }
        block.unblock();
        Ok(())
    }

    /// Wait for an upload and close its phase. The block stays on the cooking
    /// list; a failed upload leaves it dirty.
    fn finish_upload(&self, block: &Block) {
        if block.wait() == Readiness::First {
            block.clear_flags(BlockFlags::UPLOADING);
            block.unblock();
        }
    }

    /// Take a clean block out of the handle's lists.
    ///
    /// A block whose content is staged but not committed leaves its index in
    /// the uncommitted set, so later reads commit before downloading it.
    fn detach(&self, state: &mut HandleState, block: &Arc<Block>) {
        if block.has(BlockFlags::SYNCED) {
            if let Some(index) = block.index() {
                state.uncommitted.insert(index);
            }
        }
        state.buffers.remove(block);
    }

    /// Get a block for an urgent need when the cooked list is empty.
    ///
    /// Order: free pool block, one of the handle's own clean blocks, room made
    /// by staging the handle's dirty blocks, then a blocking wait on the pool.
    fn acquire_block(
        &self,
        handle: &FileHandle,
        state: &mut HandleState,
    ) -> Result<Arc<Block>, BlockCacheError> {
        if let Some(block) = self.pool.try_get() {
            return Ok(block);
        }

        for _ in 0..self.options.tuning.commit_rounds.max(1) {
            let reclaimable: Option<Arc<Block>> = state
                .buffers
                .snapshot(Queue::Cooking)
                .into_iter()
                .find(|b| !b.has(BlockFlags::DIRTY) && !b.has(BlockFlags::UPLOADING));
            if let Some(block) = reclaimable {
                if block.wait() == Readiness::First {
                    block.clear_flags(BlockFlags::DOWNLOADING);
                    block.unblock();
                }
                self.detach(state, &block);
                return Ok(block);
            }

            if self.free_uploaded_blocks(handle, state, 1) == 0
                && self.stage_blocks(handle, state, 1) == 0
            {
                break;
            }
            if let Some(block) = self.pool.try_get() {
                return Ok(block);
            }
        }

        if state.buffers.total() >= self.pool.max_blocks() {
            return Err(BlockCacheError::PoolExhausted);
        }

        tracing::debug!("handle {} waiting for a free block", handle.id());
        self.pool.must_get().ok_or(BlockCacheError::PoolExhausted)
    }

    fn invalidate_spill_file(&self, path: &str) {
        if let Some(spill) = &self.spill {
            if let Err(e) = spill.invalidate_file(path) {
                tracing::warn!("failed to drop spilled blocks of {}: {}", path, e);
            }
        }
    }

    fn invalidate_spill_dir(&self, path: &str) {
        if let Some(spill) = &self.spill {
            if let Err(e) = spill.invalidate_dir(path) {
                tracing::warn!("failed to drop spilled blocks under {}: {}", path, e);
            }
        }
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.stop();
    }
}
