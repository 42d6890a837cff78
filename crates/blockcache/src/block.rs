//! Fixed-capacity block buffer with per-block lifecycle state.
//!
//! # Readiness State Machine
//!
//! ```text
//!            begin(DOWNLOADING | UPLOADING)
//!   Idle ─────────────────────────────────► Pending
//!    ▲                                         │ complete() (worker)
//!    │ unblock()                               ▼
//! Claimed ◄──────────── wait() / try_wait() ── Completed
//!           (first waiter only, returns First)
//! ```
//!
//! Exactly one waiter observes [`Readiness::First`] per phase and performs the
//! bookkeeping for it. Every other waiter sleeps on the condvar until that
//! waiter calls [`Block::unblock`], then observes [`Readiness::Settled`].

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, RwLock};

/// Stable arena index of a block inside its pool.
pub type BlockSlot = usize;

bitflags! {
    /// Per-block state flags.
    #[derive(Default)]
    pub struct BlockFlags: u8 {
        /// Holds bytes not yet staged to the backend.
        const DIRTY = 0b0000_0001;
        /// A download is queued or running.
        const DOWNLOADING = 0b0000_0010;
        /// An upload is queued or running.
        const UPLOADING = 0b0000_0100;
        /// Current content is staged on the backend.
        const SYNCED = 0b0000_1000;
        /// Last download or upload exhausted its attempts.
        const FAILED = 0b0001_0000;
    }
}

/// Lifecycle phase of the current download or upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No phase outstanding.
    Idle,
    /// Work queued or running on a worker.
    Pending,
    /// Worker finished; nobody has claimed the result yet.
    Completed,
    /// First waiter is doing its bookkeeping.
    Claimed,
}

/// What a waiter observed when the block became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// This caller claimed the completed phase and must call [`Block::unblock`].
    First,
    /// The phase was already settled by someone else.
    Settled,
}

#[derive(Debug)]
struct BlockState {
    index: Option<u64>,
    offset: u64,
    end_index: u64,
    flags: BlockFlags,
    phase: Phase,
}

impl BlockState {
    fn empty() -> Self {
        Self {
            index: None,
            offset: 0,
            end_index: 0,
            flags: BlockFlags::empty(),
            phase: Phase::Idle,
        }
    }
}

/// A fixed-capacity buffer holding one block of a file.
pub struct Block {
    slot: BlockSlot,
    capacity: usize,
    state: Mutex<BlockState>,
    ready: Condvar,
    data: RwLock<Vec<u8>>,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Block")
            .field("slot", &self.slot)
            .field("index", &state.index)
            .field("end_index", &state.end_index)
            .field("flags", &state.flags)
            .field("phase", &state.phase)
            .finish()
    }
}

impl Block {
    /// Allocate a zeroed block.
    ///
    /// # Arguments
    /// * `slot` - Arena index assigned by the pool
    /// * `capacity` - Buffer size in bytes
    pub fn new(slot: BlockSlot, capacity: usize) -> Self {
        Self {
            slot,
            capacity,
            state: Mutex::new(BlockState::empty()),
            ready: Condvar::new(),
            data: RwLock::new(vec![0u8; capacity]),
        }
    }

    /// Arena index of this block.
    pub fn slot(&self) -> BlockSlot {
        self.slot
    }

    /// Buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block index within the file, or `None` when unassigned.
    pub fn index(&self) -> Option<u64> {
        self.state.lock().index
    }

    /// File offset of the first byte of this block.
    pub fn offset(&self) -> u64 {
        self.state.lock().offset
    }

    /// File offset one past the last valid byte.
    pub fn end_index(&self) -> u64 {
        self.state.lock().end_index
    }

    /// Number of valid bytes.
    pub fn valid_len(&self) -> usize {
        let state = self.state.lock();
        (state.end_index - state.offset) as usize
    }

    /// Current flags.
    pub fn flags(&self) -> BlockFlags {
        self.state.lock().flags
    }

    /// Whether all of `flags` are set.
    pub fn has(&self, flags: BlockFlags) -> bool {
        self.state.lock().flags.contains(flags)
    }

    /// Set `flags`.
    pub fn set_flags(&self, flags: BlockFlags) {
        self.state.lock().flags.insert(flags);
    }

    /// Clear `flags`.
    pub fn clear_flags(&self, flags: BlockFlags) {
        self.state.lock().flags.remove(flags);
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Whether a worker still owns the current phase.
    pub fn is_pending(&self) -> bool {
        self.state.lock().phase == Phase::Pending
    }

    /// Bind the block to a file position, clearing flags and content length.
    ///
    /// # Arguments
    /// * `index` - Block index within the file
    /// * `offset` - File offset of the block (index * block size)
    pub fn assign(&self, index: u64, offset: u64) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.phase, Phase::Idle, "assigning a block with an open phase");
        state.index = Some(index);
        state.offset = offset;
        state.end_index = offset;
        state.flags = BlockFlags::empty();
    }

    /// Open a download or upload phase.
    ///
    /// # Arguments
    /// * `flag` - `DOWNLOADING` or `UPLOADING`
    pub fn begin(&self, flag: BlockFlags) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.phase, Phase::Idle, "phase already outstanding");
        state.phase = Phase::Pending;
        state.flags.remove(BlockFlags::FAILED);
        state.flags.insert(flag);
    }

    /// Signal that the worker finished the current phase.
    pub fn complete(&self) {
        let mut state = self.state.lock();
        if state.phase == Phase::Pending {
            state.phase = Phase::Completed;
        }
        self.ready.notify_all();
    }

    /// Mark the current phase as failed. Waiters see it after `complete()`.
    pub fn fail(&self) {
        self.state.lock().flags.insert(BlockFlags::FAILED);
    }

    /// Block until the current phase is ready.
    ///
    /// # Returns
    /// `First` for exactly one caller per phase, `Settled` otherwise.
    pub fn wait(&self) -> Readiness {
        let mut state = self.state.lock();
        loop {
            match state.phase {
                Phase::Idle => return Readiness::Settled,
                Phase::Completed => {
                    state.phase = Phase::Claimed;
                    return Readiness::First;
                }
                Phase::Pending | Phase::Claimed => self.ready.wait(&mut state),
            }
        }
    }

    /// Non-blocking variant of [`wait`](Self::wait).
    ///
    /// # Returns
    /// `None` while the phase is still pending or being claimed.
    pub fn try_wait(&self) -> Option<Readiness> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Idle => Some(Readiness::Settled),
            Phase::Completed => {
                state.phase = Phase::Claimed;
                Some(Readiness::First)
            }
            Phase::Pending | Phase::Claimed => None,
        }
    }

    /// Finish the first waiter's bookkeeping and release all other waiters.
    pub fn unblock(&self) {
        let mut state = self.state.lock();
        if state.phase == Phase::Claimed {
            state.phase = Phase::Idle;
        }
        self.ready.notify_all();
    }

    /// Wait out any outstanding phase and close it.
    ///
    /// Used before a block goes back to the pool so no phase leaks into its
    /// next owner.
    pub fn settle(&self) {
        if self.wait() == Readiness::First {
            self.unblock();
        }
    }

    /// Reset to the unassigned state.
    pub fn reset(&self) {
        *self.state.lock() = BlockState::empty();
    }

    /// Zero the whole buffer.
    pub fn zero(&self) {
        self.data.write().fill(0);
    }

    /// Replace the content with `src`, truncated to capacity.
    ///
    /// # Returns
    /// Number of bytes loaded.
    pub fn load(&self, src: &[u8]) -> usize {
        let n: usize = src.len().min(self.capacity);
        self.data.write()[..n].copy_from_slice(&src[..n]);
        let mut state = self.state.lock();
        state.end_index = state.offset + n as u64;
        n
    }

    /// Copy valid bytes starting at `pos` into `dst`.
    ///
    /// # Arguments
    /// * `pos` - Position within the block
    /// * `dst` - Destination buffer
    ///
    /// # Returns
    /// Number of bytes copied (0 when `pos` is past the valid range).
    pub fn read_at(&self, pos: usize, dst: &mut [u8]) -> usize {
        let valid: usize = self.valid_len();
        if pos >= valid {
            return 0;
        }
        let n: usize = dst.len().min(valid - pos);
        dst[..n].copy_from_slice(&self.data.read()[pos..pos + n]);
        n
    }

    /// Copy `src` into the block at `pos`, extending the valid range if needed.
    ///
    /// Bytes between the old valid end and `pos` are zeroed.
    ///
    /// # Arguments
    /// * `pos` - Position within the block
    /// * `src` - Bytes to write
    ///
    /// # Returns
    /// Number of bytes written (bounded by capacity).
    pub fn write_at(&self, pos: usize, src: &[u8]) -> usize {
        if pos >= self.capacity {
            return 0;
        }
        let n: usize = src.len().min(self.capacity - pos);
        let valid: usize = self.valid_len();
        {
            let mut data = self.data.write();
            if pos > valid {
                data[valid..pos].fill(0);
            }
            data[pos..pos + n].copy_from_slice(&src[..n]);
        }

        let mut state = self.state.lock();
        let end: u64 = state.offset + (pos + n) as u64;
        if end > state.end_index {
            state.end_index = end;
        }
        n
    }

    /// Zero-extend the valid range to the full capacity.
    pub fn pad_to_capacity(&self) {
        let valid: usize = self.valid_len();
        if valid < self.capacity {
            self.data.write()[valid..].fill(0);
        }
        let mut state = self.state.lock();
        state.end_index = state.offset + self.capacity as u64;
    }

    /// Copy of the valid bytes.
    pub fn payload(&self) -> Vec<u8> {
        let valid: usize = self.valid_len();
        self.data.read()[..valid].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_assign_resets_state() {
        let block: Block = Block::new(0, 16);
        block.set_flags(BlockFlags::DIRTY | BlockFlags::SYNCED);
        block.assign(3, 48);

        assert_eq!(block.index(), Some(3));
        assert_eq!(block.offset(), 48);
        assert_eq!(block.end_index(), 48);
        assert!(block.flags().is_empty());
    }

    #[test]
    fn test_write_extends_end_index() {
        let block: Block = Block::new(0, 8);
        block.assign(1, 8);

        assert_eq!(block.write_at(2, b"abc"), 3);
        assert_eq!(block.end_index(), 13);
        assert_eq!(block.valid_len(), 5);

        // Writing inside the valid range does not shrink it
        block.write_at(0, b"x");
        assert_eq!(block.valid_len(), 5);

        // Writes are bounded by capacity
        assert_eq!(block.write_at(6, b"12345"), 2);
        assert_eq!(block.valid_len(), 8);
    }

    #[test]
    fn test_read_at_bounds() {
        let block: Block = Block::new(0, 8);
        block.assign(0, 0);
        block.load(b"hello");

        let mut buf: [u8; 8] = [0; 8];
        assert_eq!(block.read_at(1, &mut buf), 4);
        assert_eq!(&buf[..4], b"ello");
        assert_eq!(block.read_at(5, &mut buf), 0);
        assert_eq!(block.payload(), b"hello".to_vec());
    }

    #[test]
    fn test_idle_wait_is_settled() {
        let block: Block = Block::new(0, 4);
        assert_eq!(block.wait(), Readiness::Settled);
        assert_eq!(block.try_wait(), Some(Readiness::Settled));
    }

    #[test]
    fn test_single_first_claim() {
        let block: Block = Block::new(0, 4);
        block.begin(BlockFlags::DOWNLOADING);
        assert_eq!(block.try_wait(), None);

        block.complete();
        assert_eq!(block.try_wait(), Some(Readiness::First));
        // Claimed: others must wait for unblock
        assert_eq!(block.try_wait(), None);

        block.unblock();
        assert_eq!(block.try_wait(), Some(Readiness::Settled));
        assert_eq!(block.phase(), Phase::Idle);
    }

    #[test]
    fn test_concurrent_waiters_one_first() {
        let block: Arc<Block> = Arc::new(Block::new(0, 4));
        block.begin(BlockFlags::DOWNLOADING);
        let firsts: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let block: Arc<Block> = block.clone();
                let firsts: Arc<AtomicUsize> = firsts.clone();
                std::thread::spawn(move || {
                    if block.wait() == Readiness::First {
                        firsts.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(10));
                        block.clear_flags(BlockFlags::DOWNLOADING);
                        block.unblock();
                    }
                    block.has(BlockFlags::DOWNLOADING)
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(20));
        block.complete();

        for waiter in waiters {
            // Every waiter returns after the bookkeeping finished
            assert!(!waiter.join().unwrap());
        }
        assert_eq!(firsts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_begin_clears_failed() {
        let block: Block = Block::new(0, 4);
        block.begin(BlockFlags::UPLOADING);
        block.fail();
        block.complete();
        block.settle();
        assert!(block.has(BlockFlags::FAILED));

        block.begin(BlockFlags::UPLOADING);
        assert!(!block.has(BlockFlags::FAILED));
    }

    #[test]
    fn test_settle_closes_phase() {
        let block: Block = Block::new(0, 4);
        block.begin(BlockFlags::DOWNLOADING);
        block.complete();
        block.settle();
        assert_eq!(block.phase(), Phase::Idle);
    }

    #[test]
    fn test_write_past_valid_end_zeroes_gap() {
        let block: Block = Block::new(0, 8);
        block.write_at(0, b"stale!!!");
        block.assign(0, 0);
        block.load(b"ab");

        block.write_at(5, b"z");
        assert_eq!(block.payload(), b"ab\0\0\0z".to_vec());
    }

    #[test]
    fn test_pad_to_capacity() {
        let block: Block = Block::new(0, 6);
        block.write_at(0, b"garbage");
        block.assign(2, 12);
        block.load(b"xy");

        block.pad_to_capacity();
        assert_eq!(block.end_index(), 18);
        assert_eq!(block.payload(), b"xy\0\0\0\0".to_vec());
    }
}
