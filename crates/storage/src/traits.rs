//! Storage backend trait consumed by the block cache.

use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::StorageError;

/// Attributes of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAttr {
    /// Object size in bytes.
    pub size: u64,
    /// Last modified time.
    pub mtime: SystemTime,
    /// Permission bits.
    pub mode: u32,
}

impl ObjectAttr {
    /// Attributes of an empty object created now.
    ///
    /// # Arguments
    /// * `mode` - Permission bits
    pub fn empty(mode: u32) -> Self {
        Self {
            size: 0,
            mtime: SystemTime::now(),
            mode,
        }
    }
}

/// One entry of an object's committed block list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedBlock {
    /// Opaque block id.
    pub id: String,
    /// Block length in bytes.
    pub size: u64,
}

/// Block-blob style storage operations.
///
/// Objects are written by staging blocks under opaque ids and then committing
/// an ordered id list, which becomes the object's content.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Get object attributes.
    ///
    /// # Arguments
    /// * `path` - Object path
    async fn get_attr(&self, path: &str) -> Result<ObjectAttr, StorageError>;

    /// Create an empty object.
    ///
    /// # Arguments
    /// * `path` - Object path
    /// * `mode` - Permission bits
    async fn create_file(&self, path: &str, mode: u32) -> Result<ObjectAttr, StorageError>;

    /// Read a byte range.
    ///
    /// # Arguments
    /// * `path` - Object path
    /// * `offset` - Start offset in bytes
    /// * `len` - Maximum number of bytes to read
    ///
    /// # Returns
    /// Up to `len` bytes; fewer when the range crosses the end of the object.
    async fn read_range(&self, path: &str, offset: u64, len: usize)
        -> Result<Vec<u8>, StorageError>;

    /// Upload a block without making it visible.
    ///
    /// # Arguments
    /// * `path` - Object path
    /// * `block_id` - Opaque id the block is staged under
    /// * `index` - Block index within the object
    /// * `data` - Block payload
    async fn stage_block(
        &self,
        path: &str,
        block_id: &str,
        index: u64,
        data: &[u8],
    ) -> Result<(), StorageError>;

    /// Replace the object content with the given ordered block list.
    ///
    /// # Arguments
    /// * `path` - Object path
    /// * `block_ids` - Staged or committed block ids in content order
    /// * `block_size` - Block size the ids were staged with
    async fn commit_blocks(
        &self,
        path: &str,
        block_ids: &[String],
        block_size: u64,
    ) -> Result<(), StorageError>;

    /// List the committed blocks of an object.
    ///
    /// # Returns
    /// `None` if the object was written without a block list.
    async fn committed_blocks(&self, path: &str)
        -> Result<Option<Vec<CommittedBlock>>, StorageError>;

    /// Delete an object.
    async fn delete_file(&self, path: &str) -> Result<(), StorageError>;

    /// Rename an object.
    async fn rename_file(&self, src: &str, dst: &str) -> Result<(), StorageError>;

    /// Delete every object under a directory prefix.
    async fn delete_dir(&self, path: &str) -> Result<(), StorageError>;

    /// Move every object under a directory prefix.
    async fn rename_dir(&self, src: &str, dst: &str) -> Result<(), StorageError>;
}
