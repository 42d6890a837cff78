//! Bounded pool of reusable blocks shared by every open handle.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      BlockPool                        │
//! │  state: Mutex<PoolState>                              │
//! │    arena: Vec<Arc<Block>>   (slot -> block, grows     │
//! │                              lazily up to max_blocks) │
//! │    free:  Vec<BlockSlot>    (released, reusable)      │
//! │    outstanding: usize       (handed out right now)    │
//! │  available: Condvar         (wakes blocked must_get)  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Blocks are allocated on first demand and never freed; a slot is a stable
//! identity for the lifetime of the pool. `outstanding + free <= max_blocks`
//! at all times.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::block::{Block, BlockSlot};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the block pool.
#[derive(Debug, Clone)]
pub struct BlockPoolConfig {
    /// Maximum total size of the pool in bytes.
    pub max_size: u64,
    /// Size of each block in bytes.
    pub block_size: u64,
}

impl BlockPoolConfig {
    /// Create a configuration.
    ///
    /// # Arguments
    /// * `block_size` - Size of each block in bytes
    /// * `max_size` - Pool ceiling in bytes
    pub fn new(block_size: u64, max_size: u64) -> Self {
        Self {
            max_size,
            block_size,
        }
    }

    /// Maximum number of blocks this pool can hold.
    pub fn max_blocks(&self) -> usize {
        if self.block_size == 0 {
            return 0;
        }
        (self.max_size / self.block_size) as usize
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Snapshot of pool state.
#[derive(Debug, Clone, Default)]
pub struct BlockPoolStats {
    /// Blocks allocated so far.
    pub allocated_blocks: usize,
    /// Blocks currently handed out.
    pub outstanding_blocks: usize,
    /// Ceiling in blocks.
    pub max_blocks: usize,
    /// Callers currently blocked in `must_get`.
    pub waiters: usize,
    /// Total successful acquisitions.
    pub acquisitions: u64,
    /// Acquisitions that had to block.
    pub blocked_acquisitions: u64,
}

impl BlockPoolStats {
    /// Pool utilization as a percentage.
    pub fn utilization(&self) -> f64 {
        if self.max_blocks == 0 {
            0.0
        } else {
            (self.outstanding_blocks as f64 / self.max_blocks as f64) * 100.0
        }
    }

    /// Blocks that could be handed out without blocking.
    pub fn free_blocks(&self) -> usize {
        self.max_blocks - self.outstanding_blocks
    }
}

// ============================================================================
// Block Pool
// ============================================================================

struct PoolState {
    arena: Vec<Arc<Block>>,
    free: Vec<BlockSlot>,
    outstanding: usize,
    waiters: usize,
    closed: bool,
}

/// Thread-safe pool of fixed-size blocks.
pub struct BlockPool {
    config: BlockPoolConfig,
    max_blocks: usize,
    state: Mutex<PoolState>,
    available: Condvar,
    acquisitions: AtomicU64,
    blocked_acquisitions: AtomicU64,
}

impl BlockPool {
    /// Create an empty pool.
    ///
    /// # Arguments
    /// * `config` - Block size and ceiling
    pub fn new(config: BlockPoolConfig) -> Self {
        let max_blocks: usize = config.max_blocks();
        Self {
            config,
            max_blocks,
            state: Mutex::new(PoolState {
                arena: Vec::new(),
                free: Vec::new(),
                outstanding: 0,
                waiters: 0,
                closed: false,
            }),
            available: Condvar::new(),
            acquisitions: AtomicU64::new(0),
            blocked_acquisitions: AtomicU64::new(0),
        }
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> u64 {
        self.config.block_size
    }

    /// Ceiling in blocks.
    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    /// Take a free block without blocking.
    ///
    /// # Returns
    /// `None` if the pool is at capacity (or closed).
    pub fn try_get(&self) -> Option<Arc<Block>> {
        let mut state = self.state.lock();
        self.take(&mut state)
    }

    /// Take a free block, blocking until one is released if at capacity.
    ///
    /// # Returns
    /// `None` only if the pool cannot hold a single block or is closed.
    pub fn must_get(&self) -> Option<Arc<Block>> {
        if self.max_blocks == 0 {
            tracing::error!(
                "block pool of {} bytes cannot hold a {} byte block",
                self.config.max_size,
                self.config.block_size
            );
            return None;
        }

        let mut state = self.state.lock();
        if let Some(block) = self.take(&mut state) {
            return Some(block);
        }

        self.blocked_acquisitions.fetch_add(1, Ordering::Relaxed);
        state.waiters += 1;
        let block: Option<Arc<Block>> = loop {
            if state.closed {
                break None;
            }
            if let Some(block) = self.take(&mut state) {
                break Some(block);
            }
            self.available.wait(&mut state);
        };
        state.waiters -= 1;
        block
    }

    /// Return a block to the pool and wake one blocked caller.
    ///
    /// A block whose phase is still outstanding is drained first.
    pub fn release(&self, block: Arc<Block>) {
        if block.is_pending() {
            tracing::warn!(
                "releasing block {} with an outstanding phase; draining",
                block.slot()
            );
        }
        block.settle();
        block.reset();

        let mut state = self.state.lock();
        debug_assert!(state.outstanding > 0, "release without matching get");
        state.outstanding = state.outstanding.saturating_sub(1);
        state.free.push(block.slot());
        drop(state);
        self.available.notify_one();
    }

    /// Current utilization in percent (0-100).
    pub fn usage(&self) -> u32 {
        if self.max_blocks == 0 {
            return 100;
        }
        let outstanding: usize = self.state.lock().outstanding;
        ((outstanding * 100) / self.max_blocks) as u32
    }

    /// Wake every blocked caller; further `must_get` calls return `None`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    /// Snapshot of pool counters.
    pub fn stats(&self) -> BlockPoolStats {
        let state = self.state.lock();
        BlockPoolStats {
            allocated_blocks: state.arena.len(),
            outstanding_blocks: state.outstanding,
            max_blocks: self.max_blocks,
            waiters: state.waiters,
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            blocked_acquisitions: self.blocked_acquisitions.load(Ordering::Relaxed),
        }
    }

    /// Pop a free block or allocate a new one under the ceiling.
    fn take(&self, state: &mut PoolState) -> Option<Arc<Block>> {
        if state.closed {
            return None;
        }

        let block: Arc<Block> = if let Some(slot) = state.free.pop() {
            state.arena[slot].clone()
        } else if state.arena.len() < self.max_blocks {
            let slot: BlockSlot = state.arena.len();
            let block: Arc<Block> = Arc::new(Block::new(slot, self.config.block_size as usize));
            state.arena.push(block.clone());
            block
        } else {
            return None;
        };

        state.outstanding += 1;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        Some(block)
    }
}
