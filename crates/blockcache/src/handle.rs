//! Open file handles and their typed per-handle state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};

use crate::buffers::BufferLists;

bitflags! {
    /// Open flags understood by the engine (a subset of `open(2)` flags).
    #[derive(Default)]
    pub struct OpenFlags: u32 {
        /// Open for writing only.
        const WRITE_ONLY = 0b0001;
        /// Open for reading and writing.
        const READ_WRITE = 0b0010;
        /// Truncate to zero length.
        const TRUNCATE = 0b0100;
    }
}

impl OpenFlags {
    /// Read-only open.
    pub fn read_only() -> Self {
        Self::empty()
    }

    /// Whether the open allows writes.
    pub fn writable(&self) -> bool {
        self.intersects(Self::WRITE_ONLY | Self::READ_WRITE)
    }
}

/// Mutable state of one open handle, guarded by the handle lock.
#[derive(Debug)]
pub struct HandleState {
    /// Current file size, including unflushed writes.
    pub size: u64,
    /// Size of the content the backend holds for this file.
    pub committed_size: u64,
    /// Last modification time seen or made through this handle.
    pub mtime: SystemTime,
    /// Handle has writes not yet committed.
    pub dirty: bool,
    /// Resident blocks.
    pub buffers: BufferLists,
    /// Block index to staged or committed block id, in commit order.
    pub block_ids: BTreeMap<u64, String>,
    /// Indices staged and released from memory but not yet committed.
    pub uncommitted: BTreeSet<u64>,
    /// Next index the sequential prefetcher would schedule.
    pub next_prefetch_index: u64,
    /// Misses that did not land on the prefetch cursor.
    pub random_reads: u32,
    /// Last miss was on the prefetch cursor.
    pub streaming: bool,
    /// Handle has been closed.
    pub closed: bool,
}

impl HandleState {
    fn new(size: u64, mtime: SystemTime) -> Self {
        Self {
            size,
            committed_size: size,
            mtime,
            dirty: false,
            buffers: BufferLists::new(),
            block_ids: BTreeMap::new(),
            uncommitted: BTreeSet::new(),
            next_prefetch_index: 0,
            random_reads: 0,
            streaming: false,
            closed: false,
        }
    }
}

/// An open file.
///
/// Every read, write, flush and close on a handle runs under its lock; different
/// handles, even on the same file, proceed independently.
#[derive(Debug)]
pub struct FileHandle {
    id: u64,
    path: Arc<str>,
    flags: OpenFlags,
    state: Mutex<HandleState>,
}

impl FileHandle {
    pub(crate) fn new(id: u64, path: &str, flags: OpenFlags, size: u64, mtime: SystemTime) -> Self {
        Self {
            id,
            path: Arc::from(path),
            flags,
            state: Mutex::new(HandleState::new(size, mtime)),
        }
    }

    /// Handle id, unique within a cache instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// File path.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn shared_path(&self) -> Arc<str> {
        self.path.clone()
    }

    /// Flags the handle was opened with.
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Current size including unflushed writes.
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    /// Whether the handle has uncommitted writes.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Misses that did not follow the prefetch cursor.
    pub fn random_read_count(&self) -> u32 {
        self.state.lock().random_reads
    }

    /// Number of blocks currently resident for this handle.
    pub fn resident_blocks(&self) -> usize {
        self.state.lock().buffers.total()
    }

    /// Whether block `index` is resident.
    pub fn is_resident(&self, index: u64) -> bool {
        self.state.lock().buffers.lookup(index).is_some()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock()
    }
}
