//! Write path: dirty blocks, eager staging and releasing uploaded blocks.

use std::sync::Arc;
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use uuid::Uuid;

use super::BlockCache;
use crate::block::{Block, BlockFlags};
use crate::buffers::Queue;
use crate::error::BlockCacheError;
use crate::handle::{FileHandle, HandleState};
use crate::threadpool::WorkItem;

/// Fresh staging id: base64 of 16 random bytes, so every id has the same length.
pub(super) fn new_block_id() -> String {
    STANDARD.encode(Uuid::new_v4().as_bytes())
}

impl BlockCache {
    /// Write `data` at `offset`.
    ///
    /// Data lands in memory; blocks are staged eagerly once more than
    /// `min_write_blocks` are in flight, and become visible on flush or close.
    ///
    /// # Arguments
    /// * `handle` - Open handle
    /// * `offset` - File offset
    /// * `data` - Bytes to write
    ///
    /// # Returns
    /// Bytes written.
    pub fn write_file(
        &self,
        handle: &FileHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, BlockCacheError> {
        let mut state = handle.lock();
        self.ensure_open(handle, &state)?;
        if !handle.flags().writable() {
            return Err(BlockCacheError::NotWritable(handle.id()));
        }
        if data.is_empty() {
            return Ok(0);
        }

        let max: u64 = self.options.tuning.max_blocks_per_file;
        let end: u64 = match offset.checked_add(data.len() as u64) {
            Some(end) => end,
            None => {
                return Err(BlockCacheError::IndexOutOfRange {
                    path: handle.path().to_string(),
                    index: u64::MAX / self.block_size,
                    max,
                })
            }
        };
        let last_index: u64 = (end - 1) / self.block_size;
        if last_index >= max {
            return Err(BlockCacheError::IndexOutOfRange {
                path: handle.path().to_string(),
                index: last_index,
                max,
            });
        }

        // A partial last block followed by new data must become a full block
        if state.size % self.block_size != 0 {
            let tail: u64 = (state.size - 1) / self.block_size;
            if offset / self.block_size > tail {
                let block: Arc<Block> = self.get_or_create_block(handle, &mut state, tail)?;
                block.pad_to_capacity();
                block.set_flags(BlockFlags::DIRTY);
                state.dirty = true;
            }
        }

        let mut written: usize = 0;
        while written < data.len() {
            let pos: u64 = offset + written as u64;
            let index: u64 = pos / self.block_size;
            let block: Arc<Block> = self.get_or_create_block(handle, &mut state, index)?;

            let n: usize = block.write_at((pos - block.offset()) as usize, &data[written..]);
            block.set_flags(BlockFlags::DIRTY);
            state.dirty = true;
            written += n;
        }

        if end > state.size {
            state.size = end;
        }
        state.mtime = SystemTime::now();
        Ok(written)
    }

    /// Writable block for `index`, downloading existing content first.
    pub(super) fn get_or_create_block(
        &self,
        handle: &FileHandle,
        state: &mut HandleState,
        index: u64,
    ) -> Result<Arc<Block>, BlockCacheError> {
        if let Some(block) = state.buffers.lookup(index) {
            if block.has(BlockFlags::UPLOADING) {
                self.finish_upload(&block);
            } else if block.has(BlockFlags::DOWNLOADING) {
                self.claim_download(handle, state, &block, false)?;
            }
            block.clear_flags(BlockFlags::SYNCED);
            if state.buffers.queue_of(&block) != Some(Queue::Cooking) {
                state.buffers.push_back(Queue::Cooking, block.clone());
            }
            return Ok(block);
        }

        if state.uncommitted.contains(&index) {
            self.commit_blocks(handle, state)?;
        }

        let block: Arc<Block> = match self.pool.try_get() {
            Some(block) => block,
            None => match state.buffers.front(Queue::Cooked) {
                Some(block) => {
                    self.detach(state, &block);
                    block
                }
                None => self.acquire_block(handle, state)?,
            },
        };

        let offset: u64 = index * self.block_size;
        block.assign(index, offset);
        state.buffers.push_back(Queue::Cooking, block.clone());
        state.buffers.map(index, &block);

        if offset < state.committed_size {
            self.schedule_download(handle, block.clone(), index, false);
            self.claim_download(handle, state, &block, false)?;
            state.buffers.push_back(Queue::Cooking, block.clone());
        } else {
            block.zero();
        }

        if state.buffers.len(Queue::Cooking) > self.options.tuning.min_write_blocks as usize {
            self.stage_blocks(handle, state, 1);
        }
        Ok(block)
    }

    /// Queue uploads for up to `limit` dirty blocks, oldest first.
    ///
    /// # Returns
    /// Number of uploads queued.
    pub(super) fn stage_blocks(
        &self,
        handle: &FileHandle,
        state: &mut HandleState,
        limit: usize,
    ) -> usize {
        let mut staged: usize = 0;
        for block in state.buffers.snapshot(Queue::Cooking) {
            if staged >= limit {
                break;
            }
            if !block.has(BlockFlags::DIRTY) || block.has(BlockFlags::UPLOADING) || block.is_pending() {
                continue;
            }
            let Some(index) = block.index() else {
                continue;
            };

            let block_id: String = new_block_id();
            state.block_ids.insert(index, block_id.clone());
            block.begin(BlockFlags::UPLOADING);
            self.threads.schedule(
                false,
                WorkItem {
                    handle_id: handle.id(),
                    path: handle.shared_path(),
                    block,
                    index,
                    prefetch: false,
                    upload: true,
                    fail_count: 0,
                    block_id: Some(block_id),
                },
            );
            staged += 1;
        }
        if staged > 0 {
            tracing::trace!("staging {} blocks of {}", staged, handle.path());
        }
        staged
    }

    /// Wait for up to `limit` uploads and release the blocks that made it.
    ///
    /// Blocks whose upload failed stay dirty on the cooking list for the next
    /// staging round.
    ///
    /// # Returns
    /// Number of blocks returned to the pool.
    pub(super) fn free_uploaded_blocks(
        &self,
        handle: &FileHandle,
        state: &mut HandleState,
        limit: usize,
    ) -> usize {
        let mut freed: usize = 0;
        for block in state.buffers.snapshot(Queue::Cooking) {
            if freed >= limit {
                break;
            }
            if !block.has(BlockFlags::UPLOADING) {
                continue;
            }
            self.finish_upload(&block);
            if block.has(BlockFlags::DIRTY) {
                tracing::debug!(
                    "upload of block {:?} of {} failed; keeping it dirty",
                    block.index(),
                    handle.path()
                );
                continue;
            }
            self.detach(state, &block);
            self.pool.release(block);
            freed += 1;
        }
        freed
    }
}
