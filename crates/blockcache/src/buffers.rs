//! Per-handle block queues.
//!
//! A handle keeps its resident blocks in two queues:
//!
//! - **cooking** - blocks with a download or upload outstanding, or dirty
//!   blocks waiting to be staged
//! - **cooked** - settled, clean blocks: readable, and reusable for another
//!   index
//!
//! plus an index map from block index to the resident block. The queues are
//! doubly linked through `prev`/`next` slots keyed by the block's arena slot,
//! so moving a block between queues is O(1) and never holds a pointer into a
//! block that may be recycled.

use std::collections::HashMap;
use std::sync::Arc;

use crate::block::{Block, BlockSlot};

/// Which queue a block is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    /// In flight or dirty.
    Cooking,
    /// Settled and clean.
    Cooked,
}

#[derive(Debug, Clone, Copy)]
struct Link {
    queue: Queue,
    prev: Option<BlockSlot>,
    next: Option<BlockSlot>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Ends {
    head: Option<BlockSlot>,
    tail: Option<BlockSlot>,
    len: usize,
}

/// Cooking/cooked queues and the block index map of one handle.
#[derive(Debug, Default)]
pub struct BufferLists {
    blocks: HashMap<BlockSlot, Arc<Block>>,
    links: HashMap<BlockSlot, Link>,
    cooking: Ends,
    cooked: Ends,
    index_map: HashMap<u64, BlockSlot>,
    slot_index: HashMap<BlockSlot, u64>,
}

impl BufferLists {
    /// Create empty lists.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks in `queue`.
    pub fn len(&self, queue: Queue) -> usize {
        self.ends(queue).len
    }

    /// Number of resident blocks across both queues.
    pub fn total(&self) -> usize {
        self.cooking.len + self.cooked.len
    }

    /// Whether no block is resident.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Queue a block is linked into.
    pub fn queue_of(&self, block: &Block) -> Option<Queue> {
        self.links.get(&block.slot()).map(|l| l.queue)
    }

    /// Resident block mapped to `index`.
    pub fn lookup(&self, index: u64) -> Option<Arc<Block>> {
        self.index_map
            .get(&index)
            .and_then(|slot| self.blocks.get(slot))
            .cloned()
    }

    /// Map `index` to a queued block.
    pub fn map(&mut self, index: u64, block: &Block) {
        let slot: BlockSlot = block.slot();
        debug_assert!(self.links.contains_key(&slot), "mapping an unqueued block");
        if let Some(old) = self.slot_index.insert(slot, index) {
            if old != index {
                self.index_map.remove(&old);
            }
        }
        if let Some(displaced) = self.index_map.insert(index, slot) {
            if displaced != slot {
                self.slot_index.remove(&displaced);
            }
        }
    }

    /// Drop the mapping for `index` if it points at `block`.
    pub fn unmap(&mut self, index: u64, block: &Block) {
        if self.index_map.get(&index) == Some(&block.slot()) {
            self.index_map.remove(&index);
            self.slot_index.remove(&block.slot());
        }
    }

    /// Number of mapped indices.
    pub fn mapped(&self) -> usize {
        self.index_map.len()
    }

    /// First block of `queue`.
    pub fn front(&self, queue: Queue) -> Option<Arc<Block>> {
        self.ends(queue)
            .head
            .and_then(|slot| self.blocks.get(&slot))
            .cloned()
    }

    /// Blocks of `queue` from front to back.
    pub fn snapshot(&self, queue: Queue) -> Vec<Arc<Block>> {
        let mut out: Vec<Arc<Block>> = Vec::with_capacity(self.ends(queue).len);
        let mut cursor: Option<BlockSlot> = self.ends(queue).head;
        while let Some(slot) = cursor {
            if let Some(block) = self.blocks.get(&slot) {
                out.push(block.clone());
            }
            cursor = self.links.get(&slot).and_then(|l| l.next);
        }
        out
    }

    /// Link a block at the front of `queue`, unlinking it from wherever it was.
    pub fn push_front(&mut self, queue: Queue, block: Arc<Block>) {
        let slot: BlockSlot = block.slot();
        self.unlink(slot);
        let old_head: Option<BlockSlot> = self.ends(queue).head;
        self.links.insert(
            slot,
            Link {
                queue,
                prev: None,
                next: old_head,
            },
        );
        match old_head {
            Some(head) => {
                if let Some(link) = self.links.get_mut(&head) {
                    link.prev = Some(slot);
                }
            }
            None => self.ends_mut(queue).tail = Some(slot),
        }
        let ends: &mut Ends = self.ends_mut(queue);
        ends.head = Some(slot);
        ends.len += 1;
        self.blocks.insert(slot, block);
    }

    /// Link a block at the back of `queue`, unlinking it from wherever it was.
    pub fn push_back(&mut self, queue: Queue, block: Arc<Block>) {
        let slot: BlockSlot = block.slot();
        self.unlink(slot);
        let old_tail: Option<BlockSlot> = self.ends(queue).tail;
        self.links.insert(
            slot,
            Link {
                queue,
                prev: old_tail,
                next: None,
            },
        );
        match old_tail {
            Some(tail) => {
                if let Some(link) = self.links.get_mut(&tail) {
                    link.next = Some(slot);
                }
            }
            None => self.ends_mut(queue).head = Some(slot),
        }
        let ends: &mut Ends = self.ends_mut(queue);
        ends.tail = Some(slot);
        ends.len += 1;
        self.blocks.insert(slot, block);
    }

    /// Unlink a block from its queue and drop its index mapping.
    ///
    /// # Returns
    /// The block, if it was resident.
    pub fn remove(&mut self, block: &Block) -> Option<Arc<Block>> {
        let slot: BlockSlot = block.slot();
        self.unlink(slot);
        if let Some(index) = self.slot_index.remove(&slot) {
            self.index_map.remove(&index);
        }
        self.blocks.remove(&slot)
    }

    /// Remove every block from both queues.
    pub fn drain(&mut self) -> Vec<Arc<Block>> {
        let mut out: Vec<Arc<Block>> = self.snapshot(Queue::Cooking);
        out.extend(self.snapshot(Queue::Cooked));
        *self = Self::default();
        out
    }

    fn unlink(&mut self, slot: BlockSlot) {
        let link: Link = match self.links.remove(&slot) {
            Some(link) => link,
            None => return,
        };
        match link.prev {
            Some(prev) => {
                if let Some(l) = self.links.get_mut(&prev) {
                    l.next = link.next;
                }
            }
            None => self.ends_mut(link.queue).head = link.next,
        }
        match link.next {
            Some(next) => {
                if let Some(l) = self.links.get_mut(&next) {
                    l.prev = link.prev;
                }
            }
            None => self.ends_mut(link.queue).tail = link.prev,
        }
        self.ends_mut(link.queue).len -= 1;
    }

    fn ends(&self, queue: Queue) -> &Ends {
        match queue {
            Queue::Cooking => &self.cooking,
            Queue::Cooked => &self.cooked,
        }
    }

    fn ends_mut(&mut self, queue: Queue) -> &mut Ends {
        match queue {
            Queue::Cooking => &mut self.cooking,
            Queue::Cooked => &mut self.cooked,
        }
    }
}
