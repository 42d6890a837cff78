//! Read path: block lookup, sequential prefetch and random-read detection.
//!
//! A miss on the prefetch cursor is sequential and starts (or widens) a
//! prefetch burst. Any other miss is random: only the requested block is
//! downloaded, and once a handle crosses the random-read threshold its buffers
//! shrink to `min_prefetch` blocks and the window stops sliding.

use std::sync::Arc;

use super::BlockCache;
use crate::block::{Block, BlockFlags, Readiness};
use crate::buffers::Queue;
use crate::error::BlockCacheError;
use crate::handle::{FileHandle, HandleState};

impl BlockCache {
    /// Read into `buf` starting at `offset`.
    ///
    /// # Arguments
    /// * `handle` - Open handle
    /// * `offset` - File offset
    /// * `buf` - Destination buffer
    ///
    /// # Returns
    /// Bytes read; 0 at or past end of file.
    pub fn read_in_buffer(
        &self,
        handle: &FileHandle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, BlockCacheError> {
        let mut state = handle.lock();
        self.ensure_open(handle, &state)?;
        if offset >= state.size || buf.is_empty() {
            return Ok(0);
        }

        let end: u64 = state.size.min(offset + buf.len() as u64);
        let mut pos: u64 = offset;
        let mut copied: usize = 0;

        while pos < end {
            let index: u64 = pos / self.block_size;
            let block_end: u64 = ((index + 1) * self.block_size).min(end);
            let want: usize = (block_end - pos) as usize;
            let dst: &mut [u8] = &mut buf[copied..copied + want];

            if state.buffers.lookup(index).is_none() && self.is_hole(&state, index) {
                dst.fill(0);
            } else {
                let block: Arc<Block> = self.get_block(handle, &mut state, index)?;
                let n: usize = block.read_at((pos - block.offset()) as usize, dst);
                // Inside the file but past the block's content: a sparse gap
                dst[n..].fill(0);
            }

            pos += want as u64;
            copied += want;
        }

        Ok(copied)
    }

    /// Blocks past the committed size that were never staged read as zeros.
    fn is_hole(&self, state: &HandleState, index: u64) -> bool {
        index * self.block_size >= state.committed_size && !state.uncommitted.contains(&index)
    }

    /// Resident block for `index`, downloading it on a miss.
    pub(super) fn get_block(
        &self,
        handle: &FileHandle,
        state: &mut HandleState,
        index: u64,
    ) -> Result<Arc<Block>, BlockCacheError> {
        let block: Arc<Block> = match state.buffers.lookup(index) {
            Some(block) => block,
            None => {
                self.on_miss(handle, state, index)?;
                state.buffers.lookup(index).ok_or_else(|| {
                    BlockCacheError::Internal(format!(
                        "block {} of {} not resident after refresh",
                        index,
                        handle.path()
                    ))
                })?
            }
        };

        if block.has(BlockFlags::UPLOADING) {
            self.finish_upload(&block);
        } else {
            self.claim_download(handle, state, &block, true)?;
        }
        Ok(block)
    }

    fn on_miss(
        &self,
        handle: &FileHandle,
        state: &mut HandleState,
        index: u64,
    ) -> Result<(), BlockCacheError> {
        if index == state.next_prefetch_index {
            state.streaming = true;
            if self.options.prefetch_enabled() {
                self.start_prefetch(handle, state, index, false)?;
            } else {
                self.refresh_block(handle, state, index, false)?;
            }
            return Ok(());
        }

        state.random_reads += 1;
        state.streaming = false;
        if state.random_reads > self.options.tuning.random_read_threshold {
            self.shrink_buffers(state);
        }
        tracing::trace!(
            "random read of block {} of {} (cursor {}, {} random reads)",
            index,
            handle.path(),
            state.next_prefetch_index,
            state.random_reads
        );
        self.refresh_block(handle, state, index, false)?;
        Ok(())
    }

    /// Schedule a burst of downloads starting at `index`.
    ///
    /// The burst grows the handle's buffers toward the prefetch window with
    /// free pool blocks, at most `min_prefetch` per call and only one while the
    /// pool is above `max_pool_usage`. A handle in random mode gets a single
    /// block. The first index is urgent unless `prefetch` is set.
    pub(super) fn start_prefetch(
        &self,
        handle: &FileHandle,
        state: &mut HandleState,
        index: u64,
        prefetch: bool,
    ) -> Result<(), BlockCacheError> {
        let tuning = &self.options.tuning;
        let window: usize = self.options.prefetch as usize;

        let count: usize = if state.random_reads > tuning.random_read_threshold {
            self.shrink_buffers(state);
            1
        } else {
            let limit: usize = if self.pool.usage() >= tuning.max_pool_usage {
                1
            } else {
                tuning.min_prefetch.max(1) as usize
            };
            let mut grown: usize = 0;
            while state.buffers.total() < window && grown < limit {
                match self.pool.try_get() {
                    Some(block) => {
                        state.buffers.push_front(Queue::Cooked, block);
                        grown += 1;
                    }
                    None => break,
                }
            }
            grown.max(1)
        };

        let mut next: u64 = index;
        for i in 0..count {
            if next * self.block_size >= state.size {
                break;
            }
            if state.buffers.lookup(next).is_none() {
                self.refresh_block(handle, state, next, prefetch || i > 0)?;
            }
            next += 1;
        }
        Ok(())
    }

    /// Assign a block to `index` and queue its download.
    ///
    /// Speculative refreshes only reuse cooked blocks and skip indices whose
    /// staged content is not committed yet; urgent ones commit first and may
    /// wait for a block.
    ///
    /// # Returns
    /// Whether a download was scheduled.
    pub(super) fn refresh_block(
        &self,
        handle: &FileHandle,
        state: &mut HandleState,
        index: u64,
        prefetch: bool,
    ) -> Result<bool, BlockCacheError> {
        let offset: u64 = index * self.block_size;
        if offset >= state.size {
            return Ok(false);
        }

        if state.uncommitted.contains(&index) {
            if prefetch {
                return Ok(false);
            }
            tracing::debug!(
                "block {} of {} was staged but not committed; committing before download",
                index,
                handle.path()
            );
            self.commit_blocks(handle, state)?;
        }
        if self.is_hole(state, index) {
            return Ok(false);
        }

        let block: Arc<Block> = match state.buffers.front(Queue::Cooked) {
            Some(block) => {
                self.detach(state, &block);
                block
            }
            None if prefetch => return Ok(false),
            None => self.acquire_block(handle, state)?,
        };

        block.assign(index, offset);
        state.buffers.push_back(Queue::Cooking, block.clone());
        state.buffers.map(index, &block);
        state.next_prefetch_index = index + 1;

        tracing::trace!(
            "scheduling {} download of block {} of {}",
            if prefetch { "prefetch" } else { "urgent" },
            index,
            handle.path()
        );
        self.schedule_download(handle, block, index, prefetch);
        Ok(true)
    }

    /// Drop back to `min_prefetch` buffered blocks.
    ///
    /// Finished downloads are claimed into the cooked list first so they can
    /// be released; pending ones stay on the cooking list.
    pub(super) fn shrink_buffers(&self, state: &mut HandleState) {
        let keep: usize = self.options.tuning.min_prefetch as usize;
        if state.buffers.total() <= keep {
            return;
        }

        for block in state.buffers.snapshot(Queue::Cooking) {
            if block.has(BlockFlags::DIRTY) || block.has(BlockFlags::UPLOADING) {
                continue;
            }
            match block.try_wait() {
                Some(Readiness::First) => {
                    block.clear_flags(BlockFlags::DOWNLOADING);
                    block.unblock();
                    if block.has(BlockFlags::FAILED) {
                        state.buffers.remove(&block);
                        self.pool.release(block);
                    } else {
                        state.buffers.push_back(Queue::Cooked, block);
                    }
                }
                Some(Readiness::Settled) => state.buffers.push_back(Queue::Cooked, block),
                None => {}
            }
        }

        let mut released: usize = 0;
        while state.buffers.total() > keep {
            let Some(block) = state.buffers.front(Queue::Cooked) else {
                break;
            };
            self.detach(state, &block);
            self.pool.release(block);
            released += 1;
        }
        if released > 0 {
            tracing::debug!("released {} buffered blocks after random reads", released);
        }
    }
}
