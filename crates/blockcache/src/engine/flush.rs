//! Flush path: stage every dirty block, then commit the ordered block list.

use std::sync::Arc;

use super::write::new_block_id;
use super::BlockCache;
use crate::block::{Block, BlockFlags};
use crate::buffers::Queue;
use crate::error::BlockCacheError;
use crate::handle::{FileHandle, HandleState};

impl BlockCache {
    /// Make all writes through `handle` visible on the backend.
    ///
    /// A clean handle is a no-op. On failure the handle stays dirty.
    pub fn flush_file(&self, handle: &FileHandle) -> Result<(), BlockCacheError> {
        let mut state = handle.lock();
        self.ensure_open(handle, &state)?;
        if !state.dirty {
            return Ok(());
        }
        self.commit_blocks(handle, &mut state)
    }

    /// Same as [`flush_file`](Self::flush_file); fsync has no stronger guarantee here.
    pub fn sync_file(&self, handle: &FileHandle) -> Result<(), BlockCacheError> {
        self.flush_file(handle)
    }

    /// Stage all dirty blocks and commit the block list.
    pub(super) fn commit_blocks(
        &self,
        handle: &FileHandle,
        state: &mut HandleState,
    ) -> Result<(), BlockCacheError> {
        for _ in 0..self.options.tuning.commit_rounds.max(1) {
            if self.count_unsettled(state) == 0 {
                break;
            }
            self.stage_blocks(handle, state, usize::MAX);
            self.free_uploaded_blocks(handle, state, usize::MAX);
        }

        let remaining: usize = self.count_unsettled(state);
        if remaining > 0 {
            tracing::warn!(
                "{} blocks of {} still dirty after {} staging rounds",
                remaining,
                handle.path(),
                self.options.tuning.commit_rounds
            );
            return Err(BlockCacheError::StageFailed {
                path: handle.path().to_string(),
                remaining,
            });
        }

        let blocks: u64 = (state.size + self.block_size - 1) / self.block_size;
        self.stage_zero_blocks(handle, state, blocks)?;
        let _ = state.block_ids.split_off(&blocks);
        let block_ids: Vec<String> = state.block_ids.values().cloned().collect();

        let path: String = handle.path().to_string();
        let block_size: u64 = self.block_size;
        let ids: Vec<String> = block_ids.clone();
        let committed: Result<(), BlockCacheError> = self.executor.call(move |backend| async move {
            backend.commit_blocks(&path, &ids, block_size).await
        });
        if let Err(e) = committed {
            return Err(match e {
                BlockCacheError::Storage(source) => BlockCacheError::CommitFailed {
                    path: handle.path().to_string(),
                    source,
                },
                other => other,
            });
        }

        state.dirty = false;
        state.uncommitted.clear();
        state.committed_size = state.size;
        for block in state.buffers.snapshot(Queue::Cooking) {
            block.clear_flags(BlockFlags::SYNCED);
        }
        for block in state.buffers.snapshot(Queue::Cooked) {
            block.clear_flags(BlockFlags::SYNCED);
        }

        tracing::debug!(
            "committed {} blocks ({} bytes) to {}",
            block_ids.len(),
            state.size,
            handle.path()
        );
        Ok(())
    }

    /// Dirty blocks, plus blocks whose upload is still outstanding.
    fn count_unsettled(&self, state: &HandleState) -> usize {
        state
            .buffers
            .snapshot(Queue::Cooking)
            .iter()
            .filter(|b: &&Arc<Block>| b.has(BlockFlags::DIRTY) || b.has(BlockFlags::UPLOADING))
            .count()
    }

    /// Stage zeros for every index below `blocks` that has no block id.
    ///
    /// These are holes left by writes past the end of the file. An index
    /// inside the committed content without an id is an error: zeros there
    /// would overwrite data.
    fn stage_zero_blocks(
        &self,
        handle: &FileHandle,
        state: &mut HandleState,
        blocks: u64,
    ) -> Result<(), BlockCacheError> {
        for index in 0..blocks {
            if state.block_ids.contains_key(&index) {
                continue;
            }
            if index * self.block_size < state.committed_size {
                return Err(BlockCacheError::MissingBlockId {
                    path: handle.path().to_string(),
                    index,
                });
            }
            let len: u64 = (state.size - index * self.block_size).min(self.block_size);
            let block_id: String = new_block_id();

            let path: String = handle.path().to_string();
            let id: String = block_id.clone();
            let zeros: Vec<u8> = vec![0u8; len as usize];
            self.executor
                .call(move |backend| async move {
                    backend.stage_block(&path, &id, index, &zeros).await
                })
                .map_err(|e: BlockCacheError| {
                    tracing::warn!("staging zero block {} of {} failed: {}", index, handle.path(), e);
                    e
                })?;
            state.block_ids.insert(index, block_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use blobmount_storage::MemoryBackend;

    use crate::error::BlockCacheError;
    use crate::handle::{FileHandle, OpenFlags};
    use crate::options::BlockCacheOptions;
    use crate::BlockCache;

    const BLOCK: u64 = 4096;

    #[test]
    fn test_commit_refuses_to_zero_committed_blocks() {
        let backend: Arc<MemoryBackend> = Arc::new(MemoryBackend::new());
        let original: Vec<u8> = vec![7u8; 3 * BLOCK as usize];
        backend.insert_blocked_file("kept.bin", original.clone(), BLOCK as usize);

        let options: BlockCacheOptions = BlockCacheOptions::default()
            .with_block_size_bytes(BLOCK)
            .with_pool_blocks(16)
            .with_parallelism(2);
        let cache: BlockCache = BlockCache::new(options, backend.clone()).unwrap();
        cache.start().unwrap();

        let handle: Arc<FileHandle> = cache.open_file("kept.bin", OpenFlags::READ_WRITE).unwrap();
        handle.lock().block_ids.remove(&0);
        cache.write_file(&handle, BLOCK + 10, b"XYZ").unwrap();

        let err: BlockCacheError = cache.flush_file(&handle).unwrap_err();
        assert!(matches!(err, BlockCacheError::MissingBlockId { index: 0, .. }));
        assert!(handle.is_dirty());
        assert_eq!(backend.commit_calls(), 0);
        assert_eq!(backend.contents("kept.bin").unwrap(), original);
    }
}
