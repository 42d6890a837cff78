//! In-memory storage backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::error::StorageError;
use crate::traits::{CommittedBlock, ObjectAttr, StorageBackend};

/// A commit call observed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    /// Object path.
    pub path: String,
    /// Block ids in the order they were committed.
    pub block_ids: Vec<String>,
    /// Block size passed with the commit.
    pub block_size: u64,
}

/// Stored object with its optional committed block list.
struct StoredObject {
    data: Vec<u8>,
    /// Committed blocks as `(id, payload)`; `None` for objects written in one piece.
    blocks: Option<Vec<(String, Vec<u8>)>>,
    mtime: SystemTime,
    mode: u32,
}

impl StoredObject {
    fn new(data: Vec<u8>, blocks: Option<Vec<(String, Vec<u8>)>>, mode: u32) -> Self {
        Self {
            data,
            blocks,
            mtime: SystemTime::now(),
            mode,
        }
    }

    fn attr(&self) -> ObjectAttr {
        ObjectAttr {
            size: self.data.len() as u64,
            mtime: self.mtime,
            mode: self.mode,
        }
    }
}

#[derive(Default)]
struct Objects {
    files: HashMap<String, StoredObject>,
    /// Staged payloads keyed by `(path, block id)`.
    staged: HashMap<(String, String), Vec<u8>>,
}

/// In-memory [`StorageBackend`] with call counters and fault injection.
///
/// Every call is counted before injected failures are applied, so a failed
/// attempt still shows up in `read_calls()` / `stage_calls()`.
#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<Objects>,
    read_calls: AtomicU64,
    stage_calls: AtomicU64,
    commit_calls: AtomicU64,
    fail_reads: AtomicU32,
    fail_stages: AtomicU32,
    fail_commits: AtomicU32,
    /// Artificial latency for `read_range`, in milliseconds.
    read_delay_ms: AtomicU64,
    commits: Mutex<Vec<CommitRecord>>,
    reads: Mutex<Vec<(String, u64, usize)>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object written in one piece (no committed block list).
    ///
    /// # Arguments
    /// * `path` - Object path
    /// * `data` - Object content
    pub fn insert_file(&self, path: impl Into<String>, data: Vec<u8>) {
        self.objects
            .write()
            .files
            .insert(path.into(), StoredObject::new(data, None, 0o644));
    }

    /// Add an object whose content is committed as blocks of `block_size`.
    ///
    /// # Arguments
    /// * `path` - Object path
    /// * `data` - Object content
    /// * `block_size` - Size of every block but the last
    pub fn insert_blocked_file(&self, path: impl Into<String>, data: Vec<u8>, block_size: usize) {
        let blocks: Vec<(String, Vec<u8>)> = data
            .chunks(block_size.max(1))
            .enumerate()
            .map(|(i, chunk)| (format!("committed-{:06}", i), chunk.to_vec()))
            .collect();
        self.objects
            .write()
            .files
            .insert(path.into(), StoredObject::new(data, Some(blocks), 0o644));
    }

    /// Current content of an object.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.read().files.get(path).map(|o| o.data.clone())
    }

    /// Whether an object exists.
    pub fn exists(&self, path: &str) -> bool {
        self.objects.read().files.contains_key(path)
    }

    /// Number of `read_range` calls, including failed ones.
    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::SeqCst)
    }

    /// Number of `stage_block` calls, including failed ones.
    pub fn stage_calls(&self) -> u64 {
        self.stage_calls.load(Ordering::SeqCst)
    }

    /// Number of `commit_blocks` calls, including failed ones.
    pub fn commit_calls(&self) -> u64 {
        self.commit_calls.load(Ordering::SeqCst)
    }

    /// Successful commits in call order.
    pub fn commits(&self) -> Vec<CommitRecord> {
        self.commits.lock().clone()
    }

    /// Every `read_range` request as `(path, offset, len)`.
    pub fn reads(&self) -> Vec<(String, u64, usize)> {
        self.reads.lock().clone()
    }

    /// Number of staged, not yet committed blocks.
    pub fn staged_count(&self) -> usize {
        self.objects.read().staged.len()
    }

    /// Make the next `count` reads fail with a backend error.
    pub fn fail_next_reads(&self, count: u32) {
        self.fail_reads.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` stage calls fail with a backend error.
    pub fn fail_next_stages(&self, count: u32) {
        self.fail_stages.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` commits fail with a backend error.
    pub fn fail_next_commits(&self, count: u32) {
        self.fail_commits.store(count, Ordering::SeqCst);
    }

    /// Delay every read by `delay`.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Consume one injected failure, if any are pending.
    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get_attr(&self, path: &str) -> Result<ObjectAttr, StorageError> {
        self.objects
            .read()
            .files
            .get(path)
            .map(StoredObject::attr)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn create_file(&self, path: &str, mode: u32) -> Result<ObjectAttr, StorageError> {
        let object: StoredObject = StoredObject::new(Vec::new(), Some(Vec::new()), mode);
        let attr: ObjectAttr = object.attr();
        self.objects.write().files.insert(path.to_string(), object);
        Ok(attr)
    }

    async fn read_range(
        &self,
        path: &str,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, StorageError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        self.reads.lock().push((path.to_string(), offset, len));

        let delay: u64 = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if Self::take_failure(&self.fail_reads) {
            return Err(StorageError::Backend(format!("injected read failure: {}", path)));
        }

        let objects = self.objects.read();
        let object: &StoredObject = objects
            .files
            .get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;

        let start: usize = (offset as usize).min(object.data.len());
        let end: usize = start.saturating_add(len).min(object.data.len());
        Ok(object.data[start..end].to_vec())
    }

    async fn stage_block(
        &self,
        path: &str,
        block_id: &str,
        _index: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.stage_calls.fetch_add(1, Ordering::SeqCst);

        if Self::take_failure(&self.fail_stages) {
            return Err(StorageError::Backend(format!("injected stage failure: {}", path)));
        }

        self.objects
            .write()
            .staged
            .insert((path.to_string(), block_id.to_string()), data.to_vec());
        Ok(())
    }

    async fn commit_blocks(
        &self,
        path: &str,
        block_ids: &[String],
        block_size: u64,
    ) -> Result<(), StorageError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);

        if Self::take_failure(&self.fail_commits) {
            return Err(StorageError::Backend(format!("injected commit failure: {}", path)));
        }

        let mut objects = self.objects.write();
        let previous: Vec<(String, Vec<u8>)> = objects
            .files
            .get(path)
            .and_then(|o| o.blocks.clone())
            .unwrap_or_default();

        let mut blocks: Vec<(String, Vec<u8>)> = Vec::with_capacity(block_ids.len());
        for id in block_ids {
            let key: (String, String) = (path.to_string(), id.clone());
            let payload: Vec<u8> = match objects.staged.remove(&key) {
                Some(data) => data,
                None => previous
                    .iter()
                    .find(|(committed, _)| committed == id)
                    .map(|(_, data)| data.clone())
                    .ok_or_else(|| StorageError::UnknownBlock {
                        path: path.to_string(),
                        id: id.clone(),
                    })?,
            };
            blocks.push((id.clone(), payload));
        }

        let data: Vec<u8> = blocks.iter().flat_map(|(_, d)| d.iter().copied()).collect();
        let mode: u32 = objects.files.get(path).map(|o| o.mode).unwrap_or(0o644);
        objects
            .files
            .insert(path.to_string(), StoredObject::new(data, Some(blocks), mode));
        drop(objects);

        tracing::debug!("memory backend committed {} blocks to {}", block_ids.len(), path);
        self.commits.lock().push(CommitRecord {
            path: path.to_string(),
            block_ids: block_ids.to_vec(),
            block_size,
        });
        Ok(())
    }

    async fn committed_blocks(
        &self,
        path: &str,
    ) -> Result<Option<Vec<CommittedBlock>>, StorageError> {
        let objects = self.objects.read();
        let object: &StoredObject = objects
            .files
            .get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;

        Ok(object.blocks.as_ref().map(|blocks| {
            blocks
                .iter()
                .map(|(id, data)| CommittedBlock {
                    id: id.clone(),
                    size: data.len() as u64,
                })
                .collect()
        }))
    }

    async fn delete_file(&self, path: &str) -> Result<(), StorageError> {
        let mut objects = self.objects.write();
        objects.staged.retain(|(p, _), _| p != path);
        objects
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn rename_file(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        let mut objects = self.objects.write();
        let object: StoredObject = objects
            .files
            .remove(src)
            .ok_or_else(|| StorageError::NotFound(src.to_string()))?;
        objects.files.insert(dst.to_string(), object);
        Ok(())
    }

    async fn delete_dir(&self, path: &str) -> Result<(), StorageError> {
        let prefix: String = format!("{}/", path.trim_end_matches('/'));
        let mut objects = self.objects.write();
        objects.files.retain(|name, _| !name.starts_with(&prefix));
        objects.staged.retain(|(name, _), _| !name.starts_with(&prefix));
        Ok(())
    }

    async fn rename_dir(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        let src_prefix: String = format!("{}/", src.trim_end_matches('/'));
        let dst_prefix: String = format!("{}/", dst.trim_end_matches('/'));
        let mut objects = self.objects.write();

        let moved: Vec<String> = objects
            .files
            .keys()
            .filter(|name| name.starts_with(&src_prefix))
            .cloned()
            .collect();
        for name in moved {
            if let Some(object) = objects.files.remove(&name) {
                let renamed: String = format!("{}{}", dst_prefix, &name[src_prefix.len()..]);
                objects.files.insert(renamed, object);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_range_clamps_to_object() {
        let backend: MemoryBackend = MemoryBackend::new();
        backend.insert_file("a.bin", vec![1, 2, 3, 4, 5]);

        let data: Vec<u8> = backend.read_range("a.bin", 3, 10).await.unwrap();
        assert_eq!(data, vec![4, 5]);

        let past_end: Vec<u8> = backend.read_range("a.bin", 9, 4).await.unwrap();
        assert!(past_end.is_empty());
        assert_eq!(backend.read_calls(), 2);
    }

    #[tokio::test]
    async fn test_read_missing_object() {
        let backend: MemoryBackend = MemoryBackend::new();
        let result: Result<Vec<u8>, StorageError> = backend.read_range("nope", 0, 1).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stage_and_commit_in_list_order() {
        let backend: MemoryBackend = MemoryBackend::new();
        backend.create_file("f", 0o644).await.unwrap();

        backend.stage_block("f", "b", 1, b"world").await.unwrap();
        backend.stage_block("f", "a", 0, b"hello ").await.unwrap();
        backend
            .commit_blocks("f", &["a".to_string(), "b".to_string()], 8)
            .await
            .unwrap();

        assert_eq!(backend.contents("f").unwrap(), b"hello world".to_vec());
        assert_eq!(backend.staged_count(), 0);

        let blocks: Vec<CommittedBlock> = backend.committed_blocks("f").await.unwrap().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].size, 6);
        assert_eq!(backend.commits()[0].block_ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_commit_reuses_committed_blocks() {
        let backend: MemoryBackend = MemoryBackend::new();
        backend.insert_blocked_file("f", b"aabbcc".to_vec(), 2);

        let ids: Vec<String> = backend
            .committed_blocks("f")
            .await
            .unwrap()
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();

        backend.stage_block("f", "new", 1, b"XX").await.unwrap();
        let list: Vec<String> = vec![ids[0].clone(), "new".to_string(), ids[2].clone()];
        backend.commit_blocks("f", &list, 2).await.unwrap();

        assert_eq!(backend.contents("f").unwrap(), b"aaXXcc".to_vec());
    }

    #[tokio::test]
    async fn test_commit_unknown_block() {
        let backend: MemoryBackend = MemoryBackend::new();
        let result = backend.commit_blocks("f", &["ghost".to_string()], 4).await;
        assert!(matches!(result, Err(StorageError::UnknownBlock { .. })));
    }

    #[tokio::test]
    async fn test_injected_failures_are_counted() {
        let backend: MemoryBackend = MemoryBackend::new();
        backend.insert_file("f", vec![7; 4]);
        backend.fail_next_reads(2);

        assert!(backend.read_range("f", 0, 4).await.is_err());
        assert!(backend.read_range("f", 0, 4).await.is_err());
        assert_eq!(backend.read_range("f", 0, 4).await.unwrap(), vec![7; 4]);
        assert_eq!(backend.read_calls(), 3);
    }

    #[tokio::test]
    async fn test_insert_file_has_no_block_list() {
        let backend: MemoryBackend = MemoryBackend::new();
        backend.insert_file("plain", vec![1; 10]);
        assert!(backend.committed_blocks("plain").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dir_operations() {
        let backend: MemoryBackend = MemoryBackend::new();
        backend.insert_file("dir/a", vec![1]);
        backend.insert_file("dir/sub/b", vec![2]);
        backend.insert_file("dirx/c", vec![3]);

        backend.rename_dir("dir", "moved").await.unwrap();
        assert!(backend.exists("moved/a"));
        assert!(backend.exists("moved/sub/b"));
        assert!(backend.exists("dirx/c"));

        backend.delete_dir("moved").await.unwrap();
        assert!(!backend.exists("moved/a"));
        assert!(backend.exists("dirx/c"));
    }
}
