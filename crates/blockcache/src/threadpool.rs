//! Fixed-size worker pool running block downloads and uploads.
//!
//! # Architecture
//!
//! ```text
//!  schedule(urgent=true) ──► priority queue ──┬──► priority-only workers
//!                                              │
//!  schedule(urgent=false) ─► normal queue ─────┴──► general workers
//!                                                   (priority first)
//! ```
//!
//! A share of the workers only serves the priority queue so synchronous
//! readers are never stuck behind a long prefetch backlog. Failed items are
//! re-queued on the normal queue with their attempt count incremented; the
//! ceiling is checked before each attempt, and an item at the ceiling marks
//! its block failed and completes it so waiters wake up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

use crate::block::Block;
use crate::error::BlockCacheError;

/// A download or upload job for one block.
#[derive(Debug)]
pub struct WorkItem {
    /// Owning handle id.
    pub handle_id: u64,
    /// File path.
    pub path: Arc<str>,
    /// Target block.
    pub block: Arc<Block>,
    /// Block index within the file.
    pub index: u64,
    /// Speculative download (lower priority).
    pub prefetch: bool,
    /// Upload rather than download.
    pub upload: bool,
    /// Failed attempts so far.
    pub fail_count: u32,
    /// Staged block id (uploads only).
    pub block_id: Option<String>,
}

/// Callbacks invoked by workers.
///
/// Returning an error counts as a transient failure; the pool retries or
/// fails the block. Completion signalling is done by the pool.
pub trait WorkHandler: Send + Sync {
    /// Fill `item.block` with its content.
    fn download(&self, item: &WorkItem) -> Result<(), BlockCacheError>;

    /// Stage `item.block` under `item.block_id`.
    fn upload(&self, item: &WorkItem) -> Result<(), BlockCacheError>;

    /// Called once when an item is given up on.
    fn abandoned(&self, _item: &WorkItem) {}
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Total number of workers.
    pub workers: usize,
    /// Share of workers (percent) that only serve urgent items.
    pub priority_share_pct: u32,
    /// Attempts per item before its block is marked failed.
    pub max_attempts: u32,
}

impl ThreadPoolConfig {
    /// Number of priority-only workers; at least one general worker remains.
    pub fn priority_workers(&self) -> usize {
        let share: usize = self.workers * self.priority_share_pct as usize / 100;
        share.min(self.workers.saturating_sub(1))
    }
}

/// Counters exposed through cache stats.
#[derive(Debug, Clone, Default)]
pub struct ThreadPoolStats {
    /// Items scheduled by callers.
    pub scheduled: u64,
    /// Failed attempts that were re-queued.
    pub retried: u64,
    /// Items that exhausted their attempts or were abandoned at shutdown.
    pub failed: u64,
    /// Items waiting in either queue.
    pub queued: usize,
}

#[derive(Default)]
struct Queues {
    priority: VecDeque<WorkItem>,
    normal: VecDeque<WorkItem>,
    stopped: bool,
}

struct Shared {
    queues: Mutex<Queues>,
    priority_ready: Condvar,
    general_ready: Condvar,
    handler: Arc<dyn WorkHandler>,
    cancel: CancellationToken,
    max_attempts: u32,
    scheduled: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    fn push(&self, urgent: bool, item: WorkItem) {
        let mut queues = self.queues.lock();
        if queues.stopped {
            drop(queues);
            self.give_up(item);
            return;
        }
        if urgent {
            queues.priority.push_back(item);
            drop(queues);
            self.priority_ready.notify_one();
            self.general_ready.notify_one();
        } else {
            queues.normal.push_back(item);
            drop(queues);
            self.general_ready.notify_one();
        }
    }

    fn next(&self, priority_only: bool) -> Option<WorkItem> {
        let mut queues = self.queues.lock();
        loop {
            if queues.stopped {
                return None;
            }
            if let Some(item) = queues.priority.pop_front() {
                return Some(item);
            }
            if !priority_only {
                if let Some(item) = queues.normal.pop_front() {
                    return Some(item);
                }
                self.general_ready.wait(&mut queues);
            } else {
                self.priority_ready.wait(&mut queues);
            }
        }
    }

    fn process(&self, mut item: WorkItem) {
        if self.cancel.is_cancelled() {
            self.give_up(item);
            return;
        }
        if item.fail_count >= self.max_attempts {
            tracing::warn!(
                "giving up on {} of {} block {} after {} attempts",
                if item.upload { "upload" } else { "download" },
                item.path,
                item.index,
                item.fail_count
            );
            self.give_up(item);
            return;
        }

        let result: Result<(), BlockCacheError> = if item.upload {
            self.handler.upload(&item)
        } else {
            self.handler.download(&item)
        };

        match result {
            Ok(()) => item.block.complete(),
            Err(e) => {
                item.fail_count += 1;
                self.retried.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "attempt {} for {} block {} failed: {}",
                    item.fail_count,
                    item.path,
                    item.index,
                    e
                );
                self.push(false, item);
            }
        }
    }

    fn give_up(&self, item: WorkItem) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.handler.abandoned(&item);
        item.block.fail();
        item.block.complete();
    }
}

/// Worker pool with a priority and a normal queue.
pub struct ThreadPool {
    config: ThreadPoolConfig,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Create a pool; no threads run until [`start`](Self::start).
    ///
    /// # Arguments
    /// * `config` - Worker counts and retry ceiling
    /// * `handler` - Download/upload callbacks
    pub fn new(config: ThreadPoolConfig, handler: Arc<dyn WorkHandler>) -> Self {
        let max_attempts: u32 = config.max_attempts;
        Self {
            config,
            shared: Arc::new(Shared {
                queues: Mutex::new(Queues::default()),
                priority_ready: Condvar::new(),
                general_ready: Condvar::new(),
                handler,
                cancel: CancellationToken::new(),
                max_attempts,
                scheduled: AtomicU64::new(0),
                retried: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the workers. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), BlockCacheError> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }

        let priority_workers: usize = self.config.priority_workers();
        for i in 0..self.config.workers {
            let shared: Arc<Shared> = self.shared.clone();
            let priority_only: bool = i < priority_workers;
            let handle: JoinHandle<()> = std::thread::Builder::new()
                .name(format!("blobmount-worker-{}", i))
                .spawn(move || {
                    while let Some(item) = shared.next(priority_only) {
                        shared.process(item);
                    }
                })
                .map_err(|e| BlockCacheError::InvalidConfig(format!("worker spawn: {}", e)))?;
            workers.push(handle);
        }

        tracing::info!(
            "started {} block workers ({} priority-only)",
            self.config.workers,
            priority_workers
        );
        Ok(())
    }

    /// Queue an item.
    ///
    /// # Arguments
    /// * `urgent` - Serve ahead of prefetch work
    /// * `item` - Job to run
    pub fn schedule(&self, urgent: bool, item: WorkItem) {
        self.shared.scheduled.fetch_add(1, Ordering::Relaxed);
        self.shared.push(urgent, item);
    }

    /// Stop accepting work, let running callbacks return, fail queued items,
    /// and join every worker.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
        {
            let mut queues = self.shared.queues.lock();
            queues.stopped = true;
        }
        self.shared.priority_ready.notify_all();
        self.shared.general_ready.notify_all();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }

        let leftover: Vec<WorkItem> = {
            let mut queues = self.shared.queues.lock();
            let mut items: Vec<WorkItem> = queues.priority.drain(..).collect();
            items.extend(queues.normal.drain(..));
            items
        };
        if !leftover.is_empty() {
            tracing::debug!("failing {} queued items at shutdown", leftover.len());
        }
        for item in leftover {
            self.shared.give_up(item);
        }
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Snapshot of pool counters.
    pub fn stats(&self) -> ThreadPoolStats {
        let queued: usize = {
            let queues = self.shared.queues.lock();
            queues.priority.len() + queues.normal.len()
        };
        ThreadPoolStats {
            scheduled: self.shared.scheduled.load(Ordering::Relaxed),
            retried: self.shared.retried.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            queued,
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if !self.is_stopped() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockFlags, Readiness};
    use std::sync::atomic::AtomicU32;

    /// Handler that records call order and fails a fixed number of times.
    struct RecordingHandler {
        calls: Mutex<Vec<u64>>,
        failures_left: AtomicU32,
    }

    impl RecordingHandler {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                failures_left: AtomicU32::new(failures),
            })
        }

        fn attempt(&self, item: &WorkItem) -> Result<(), BlockCacheError> {
            self.calls.lock().push(item.index);
            let failing: bool = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                Err(BlockCacheError::ZeroBytesRead {
                    path: item.path.to_string(),
                    index: item.index,
                })
            } else {
                Ok(())
            }
        }
    }

    impl WorkHandler for RecordingHandler {
        fn download(&self, item: &WorkItem) -> Result<(), BlockCacheError> {
            self.attempt(item)
        }

        fn upload(&self, item: &WorkItem) -> Result<(), BlockCacheError> {
            self.attempt(item)
        }
    }

    fn config(workers: usize) -> ThreadPoolConfig {
        ThreadPoolConfig {
            workers,
            priority_share_pct: 10,
            max_attempts: 3,
        }
    }

    fn item(index: u64, upload: bool) -> (Arc<Block>, WorkItem) {
        let block: Arc<Block> = Arc::new(Block::new(index as usize, 8));
        block.assign(index, index * 8);
        block.begin(if upload {
            BlockFlags::UPLOADING
        } else {
            BlockFlags::DOWNLOADING
        });
        let item: WorkItem = WorkItem {
            handle_id: 1,
            path: Arc::from("file"),
            block: block.clone(),
            index,
            prefetch: false,
            upload,
            fail_count: 0,
            block_id: None,
        };
        (block, item)
    }

    #[test]
    fn test_priority_workers_leave_a_general_worker() {
        assert_eq!(config(1).priority_workers(), 0);
        assert_eq!(config(10).priority_workers(), 1);
        assert_eq!(config(128).priority_workers(), 12);
    }

    #[test]
    fn test_success_completes_block() {
        let handler: Arc<RecordingHandler> = RecordingHandler::new(0);
        let pool: ThreadPool = ThreadPool::new(config(2), handler.clone());
        pool.start().unwrap();

        let (block, item) = item(0, false);
        pool.schedule(true, item);

        assert_eq!(block.wait(), Readiness::First);
        assert!(!block.has(BlockFlags::FAILED));
        block.unblock();
        pool.stop();
        assert_eq!(handler.calls.lock().len(), 1);
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let handler: Arc<RecordingHandler> = RecordingHandler::new(2);
        let pool: ThreadPool = ThreadPool::new(config(1), handler.clone());
        pool.start().unwrap();

        let (block, item) = item(5, true);
        pool.schedule(false, item);

        block.wait();
        assert!(!block.has(BlockFlags::FAILED));
        pool.stop();
        assert_eq!(handler.calls.lock().len(), 3);
        assert_eq!(pool.stats().retried, 2);
    }

    #[test]
    fn test_retry_ceiling_marks_failed() {
        let handler: Arc<RecordingHandler> = RecordingHandler::new(u32::MAX);
        let pool: ThreadPool = ThreadPool::new(config(2), handler.clone());
        pool.start().unwrap();

        let (block, item) = item(1, false);
        pool.schedule(true, item);

        assert_eq!(block.wait(), Readiness::First);
        assert!(block.has(BlockFlags::FAILED));
        block.unblock();
        pool.stop();

        // Exactly max_attempts attempts; the ceiling check stops the next one
        assert_eq!(handler.calls.lock().len(), 3);
        assert_eq!(pool.stats().failed, 1);
    }

    #[test]
    fn test_urgent_served_before_prefetch() {
        let handler: Arc<RecordingHandler> = RecordingHandler::new(0);
        let pool: ThreadPool = ThreadPool::new(config(1), handler.clone());

        let mut blocks: Vec<Arc<Block>> = Vec::new();
        for index in 0..4 {
            let (block, item) = item(index, false);
            pool.schedule(false, item);
            blocks.push(block);
        }
        let (urgent, urgent_item) = item(99, false);
        pool.schedule(true, urgent_item);
        blocks.push(urgent);

        pool.start().unwrap();
        for block in &blocks {
            block.settle();
        }
        pool.stop();

        assert_eq!(handler.calls.lock()[0], 99);
    }

    #[test]
    fn test_stop_fails_queued_items() {
        let handler: Arc<RecordingHandler> = RecordingHandler::new(0);
        let pool: ThreadPool = ThreadPool::new(config(1), handler.clone());

        // Never started: everything stays queued until stop
        let (block, item) = item(2, false);
        pool.schedule(false, item);
        pool.stop();

        assert_eq!(block.wait(), Readiness::First);
        assert!(block.has(BlockFlags::FAILED));
        assert!(handler.calls.lock().is_empty());

        // Scheduling after stop fails immediately
        let (late, late_item) = self::item(3, false);
        pool.schedule(true, late_item);
        assert_eq!(late.try_wait(), Some(Readiness::First));
        assert!(late.has(BlockFlags::FAILED));
    }
}
