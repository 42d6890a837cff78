//! Disk spill cache for block content.
//!
//! # Directory Structure
//! ```text
//! root/
//! ├── data/big.bin::0       # block 0 of "data/big.bin"
//! ├── data/big.bin::1
//! ├── data/big.bin::1.tmp   # in-progress atomic write
//! └── notes.txt::0
//! ```
//!
//! # Lifetime
//!
//! Spilled blocks carry no record of the block size or object version they
//! were read with, so they only live as long as one cache instance. The
//! directory is emptied when the cache is opened and again when it stops.
//!
//! # Locking
//!
//! Every read, write and eviction of a key runs under that key's lock, and
//! the policy mutex is only ever taken while holding (at most) one key lock.
//! The evictor picks victims under the policy mutex, releases it, then takes
//! each victim's key lock before deleting, so it cannot race a download that
//! is populating the same file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::{DiskCacheError, KeyLocks, SpillPolicy};
use crate::options::DiskSpillOptions;

/// Cache key of block `index` of `path`.
pub fn spill_key(path: &str, index: u64) -> String {
    format!("{}::{}", path.trim_start_matches('/'), index)
}

/// Snapshot of spill cache counters.
#[derive(Debug, Clone, Default)]
pub struct DiskSpillStats {
    /// Tracked entries.
    pub entries: usize,
    /// Bytes on disk.
    pub current_size: u64,
    /// Ceiling in bytes.
    pub max_size: u64,
    /// Reads served from disk.
    pub hits: u64,
    /// Reads that found nothing.
    pub misses: u64,
    /// Entries evicted by timeout, pressure, or invalidation.
    pub evictions: u64,
}

impl DiskSpillStats {
    /// Disk usage as a percentage of the ceiling.
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.current_size as f64 / self.max_size as f64) * 100.0
        }
    }
}

/// Evictor thread control.
#[derive(Default)]
struct EvictorControl {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Local-disk mirror of block content.
pub struct DiskSpillCache {
    root: PathBuf,
    options: DiskSpillOptions,
    locks: KeyLocks,
    policy: Mutex<SpillPolicy>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    control: Arc<EvictorControl>,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl DiskSpillCache {
    /// Open the spill directory, deleting anything left by a previous run.
    ///
    /// # Arguments
    /// * `options` - Spill settings
    pub fn new(options: DiskSpillOptions) -> Result<Self, DiskCacheError> {
        let root: PathBuf = options.path.clone();
        std::fs::create_dir_all(&root)?;
        if !root.is_dir() {
            return Err(DiskCacheError::InvalidRoot {
                path: root.display().to_string(),
                reason: "not a directory".to_string(),
            });
        }

        let cache = Self {
            root,
            options,
            locks: KeyLocks::new(),
            policy: Mutex::new(SpillPolicy::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            control: Arc::new(EvictorControl::default()),
            evictor: Mutex::new(None),
        };
        let removed: usize = cache.clear()?;
        if removed > 0 {
            tracing::info!(
                "removed {} stale entries from {}",
                removed,
                cache.root.display()
            );
        }
        Ok(cache)
    }

    /// Spill root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lock handle serializing all work on `key`.
    pub fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.get(key)
    }

    /// Read a spilled block. Caller holds the key lock.
    ///
    /// # Returns
    /// Block bytes, or `None` when the key is not tracked.
    pub fn read_locked(&self, key: &str) -> Result<Option<Vec<u8>>, DiskCacheError> {
        if !self.policy.lock().touch(key) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        match std::fs::read(self.local_path(key)) {
            Ok(data) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File vanished underneath us; forget it
                self.policy.lock().remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write a block (temp file + rename). Caller holds the key lock.
    pub fn write_locked(&self, key: &str, data: &[u8]) -> Result<(), DiskCacheError> {
        let path: PathBuf = self.local_path(key);
        let temp_path: PathBuf = self.temp_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&temp_path, data)?;
        std::fs::rename(&temp_path, &path)?;
        self.policy.lock().insert(key, data.len() as u64);
        Ok(())
    }

    /// Delete a block and stop tracking it. Caller holds the key lock.
    pub fn remove_locked(&self, key: &str) -> Result<bool, DiskCacheError> {
        let tracked: bool = self.policy.lock().remove(key).is_some();
        match std::fs::remove_file(self.local_path(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if tracked {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(tracked)
    }

    /// Read a block, taking its key lock.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DiskCacheError> {
        let lock: Arc<Mutex<()>> = self.key_lock(key);
        let _guard = lock.lock();
        self.read_locked(key)
    }

    /// Write a block, taking its key lock.
    pub fn put(&self, key: &str, data: &[u8]) -> Result<(), DiskCacheError> {
        let lock: Arc<Mutex<()>> = self.key_lock(key);
        let _guard = lock.lock();
        self.write_locked(key, data)
    }

    /// Evict a block, taking its key lock.
    pub fn evict(&self, key: &str) -> Result<bool, DiskCacheError> {
        let lock: Arc<Mutex<()>> = self.key_lock(key);
        let _guard = lock.lock();
        self.remove_locked(key)
    }

    /// Whether `key` is tracked.
    pub fn contains(&self, key: &str) -> bool {
        self.policy.lock().contains(key)
    }

    /// Evict every block of a file.
    ///
    /// # Returns
    /// Number of evicted blocks.
    pub fn invalidate_file(&self, path: &str) -> Result<usize, DiskCacheError> {
        let prefix: String = format!("{}::", path.trim_start_matches('/'));
        self.evict_prefix(&prefix)
    }

    /// Evict every block of every file under a directory.
    pub fn invalidate_dir(&self, path: &str) -> Result<usize, DiskCacheError> {
        let prefix: String = format!("{}/", path.trim_start_matches('/').trim_end_matches('/'));
        let evicted: usize = self.evict_prefix(&prefix)?;

        let dir: PathBuf = self.root.join(prefix.trim_end_matches('/'));
        if dir.is_dir() {
            let _ = std::fs::remove_dir_all(&dir);
        }
        Ok(evicted)
    }

    /// Drop idle entries, then drain to the low watermark if usage is above
    /// the high watermark.
    ///
    /// # Returns
    /// Number of evicted blocks.
    pub fn run_eviction(&self) -> usize {
        let timeout = self.options.timeout();
        let expired: Vec<String> = self.policy.lock().expired(Instant::now(), timeout);

        let mut evicted: usize = 0;
        for key in expired {
            let lock: Arc<Mutex<()>> = self.key_lock(&key);
            let _guard = lock.lock();
            // Re-check: the entry may have been used since selection
            let still_idle: bool = self
                .policy
                .lock()
                .peek(&key)
                .map(|e| e.last_access.elapsed() > timeout)
                .unwrap_or(false);
            if still_idle {
                evicted += self.remove_logged(&key);
            }
        }

        let max: u64 = self.options.max_bytes();
        let current: u64 = self.current_size();
        if max > 0 && current * 100 >= max * self.options.high_watermark as u64 {
            let target: u64 = max * self.options.low_watermark as u64 / 100;
            let victims: Vec<String> = self.policy.lock().victims(current - target);
            tracing::debug!(
                "spill usage {} of {} bytes, evicting {} blocks",
                current,
                max,
                victims.len()
            );
            for key in victims {
                let lock: Arc<Mutex<()>> = self.key_lock(&key);
                let _guard = lock.lock();
                evicted += self.remove_logged(&key);
            }
        }

        self.locks.prune();
        evicted
    }

    /// Start the background evictor.
    pub fn start(self: &Arc<Self>) -> Result<(), DiskCacheError> {
        let mut evictor = self.evictor.lock();
        if evictor.is_some() {
            return Ok(());
        }
        *self.control.stopped.lock() = false;

        let weak: Weak<Self> = Arc::downgrade(self);
        let control: Arc<EvictorControl> = self.control.clone();
        let interval = self.options.eviction_interval();
        let handle: JoinHandle<()> = std::thread::Builder::new()
            .name("blobmount-spill-evictor".to_string())
            .spawn(move || loop {
                {
                    let mut stopped = control.stopped.lock();
                    if !*stopped {
                        control.wake.wait_for(&mut stopped, interval);
                    }
                    if *stopped {
                        break;
                    }
                }
                match weak.upgrade() {
                    Some(cache) => {
                        cache.run_eviction();
                    }
                    None => break,
                }
            })?;
        *evictor = Some(handle);
        Ok(())
    }

    /// Stop and join the background evictor.
    pub fn stop(&self) {
        *self.control.stopped.lock() = true;
        self.control.wake.notify_all();
        if let Some(handle) = self.evictor.lock().take() {
            // The evictor may hold the last reference and end up here itself
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
        if let Err(e) = self.clear() {
            tracing::warn!("failed to clean spill directory {}: {}", self.root.display(), e);
        }
    }

    /// Drop every spilled block and empty the spill directory.
    ///
    /// # Returns
    /// Number of directory entries removed.
    pub fn clear(&self) -> Result<usize, DiskCacheError> {
        let mut policy = self.policy.lock();
        let dropped: usize = policy.clear();
        self.evictions.fetch_add(dropped as u64, Ordering::Relaxed);

        let mut removed: usize = 0;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path: PathBuf = entry.path();
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
            removed += 1;
        }
        Ok(removed)
    }

    /// Bytes currently on disk.
    pub fn current_size(&self) -> u64 {
        self.policy.lock().total_bytes()
    }

    /// Snapshot of counters.
    pub fn stats(&self) -> DiskSpillStats {
        let policy = self.policy.lock();
        DiskSpillStats {
            entries: policy.len(),
            current_size: policy.total_bytes(),
            max_size: self.options.max_bytes(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn evict_prefix(&self, prefix: &str) -> Result<usize, DiskCacheError> {
        let keys: Vec<String> = self.policy.lock().keys_with_prefix(prefix);
        let mut evicted: usize = 0;
        for key in keys {
            if self.evict(&key)? {
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    fn remove_logged(&self, key: &str) -> usize {
        match self.remove_locked(key) {
            Ok(true) => 1,
            Ok(false) => 0,
            Err(e) => {
                tracing::warn!("failed to evict spilled block {}: {}", key, e);
                0
            }
        }
    }

    fn local_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.tmp", key))
    }
}

impl Drop for DiskSpillCache {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_cache(size_mb: u64) -> (DiskSpillCache, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let options = DiskSpillOptions::with_path(temp_dir.path()).with_size_mb(size_mb);
        let cache = DiskSpillCache::new(options).unwrap();
        (cache, temp_dir)
    }

    #[test]
    fn test_key_format() {
        assert_eq!(spill_key("/dir/file.bin", 3), "dir/file.bin::3");
        assert_eq!(spill_key("file", 0), "file::0");
    }

    #[test]
    fn test_put_and_get() {
        let (cache, temp) = create_test_cache(1);
        let key: String = spill_key("dir/a.bin", 2);

        cache.put(&key, b"block bytes").unwrap();
        assert_eq!(cache.get(&key).unwrap(), Some(b"block bytes".to_vec()));
        assert!(temp.path().join("dir/a.bin::2").is_file());
        assert!(!temp.path().join("dir/a.bin::2.tmp").exists());
        assert_eq!(cache.current_size(), 11);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_get_untracked_is_miss() {
        let (cache, _temp) = create_test_cache(1);
        assert_eq!(cache.get("nothing::0").unwrap(), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_evict_removes_file_and_entry() {
        let (cache, temp) = create_test_cache(1);
        cache.put("f::0", b"abc").unwrap();

        assert!(cache.evict("f::0").unwrap());
        assert!(!cache.contains("f::0"));
        assert!(!temp.path().join("f::0").exists());
        assert!(!cache.evict("f::0").unwrap());
        assert_eq!(cache.current_size(), 0);
    }

    #[test]
    fn test_invalidate_file_only_touches_that_file() {
        let (cache, _temp) = create_test_cache(1);
        cache.put("d/a::0", b"1").unwrap();
        cache.put("d/a::1", b"2").unwrap();
        cache.put("d/ab::0", b"3").unwrap();

        assert_eq!(cache.invalidate_file("d/a").unwrap(), 2);
        assert!(cache.contains("d/ab::0"));
    }

    #[test]
    fn test_invalidate_dir() {
        let (cache, temp) = create_test_cache(1);
        cache.put("d/a::0", b"1").unwrap();
        cache.put("d/sub/b::0", b"2").unwrap();
        cache.put("other::0", b"3").unwrap();

        assert_eq!(cache.invalidate_dir("d").unwrap(), 2);
        assert!(!temp.path().join("d").exists());
        assert!(cache.contains("other::0"));
    }

    #[test]
    fn test_timeout_eviction() {
        let temp_dir = TempDir::new().unwrap();
        let options = DiskSpillOptions::with_path(temp_dir.path()).with_timeout_sec(0);
        let cache = DiskSpillCache::new(options).unwrap();

        cache.put("f::0", b"data").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.run_eviction(), 1);
        assert!(!cache.contains("f::0"));
    }

    #[test]
    fn test_watermark_eviction() {
        // 1 MB ceiling, four 300 KB blocks -> 1200 KB, above the 80% mark
        let (cache, _temp) = create_test_cache(1);
        let block: Vec<u8> = vec![7u8; 300 * 1024];
        for i in 0..4 {
            cache.put(&spill_key("big", i), &block).unwrap();
        }
        cache.get(&spill_key("big", 0)).unwrap();

        let evicted: usize = cache.run_eviction();
        assert!(evicted >= 2);
        assert!(cache.current_size() <= 1024 * 1024 / 2);
        // Most recently used survives
        assert!(cache.contains(&spill_key("big", 0)));
    }

    #[test]
    fn test_open_removes_leftovers() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("d")).unwrap();
        std::fs::write(temp_dir.path().join("d/f::0"), b"hello").unwrap();
        std::fs::write(temp_dir.path().join("d/f::1.tmp"), b"partial").unwrap();

        let cache =
            DiskSpillCache::new(DiskSpillOptions::with_path(temp_dir.path())).unwrap();

        assert!(!cache.contains("d/f::0"));
        assert_eq!(cache.current_size(), 0);
        assert!(!temp_dir.path().join("d").exists());
        assert!(temp_dir.path().is_dir());
    }

    #[test]
    fn test_stop_empties_directory() {
        let (cache, temp) = create_test_cache(1);
        cache.put("d/a::0", b"1").unwrap();
        cache.put("b::0", b"2").unwrap();

        cache.stop();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_background_evictor() {
        let temp_dir = TempDir::new().unwrap();
        let options = DiskSpillOptions::with_path(temp_dir.path())
            .with_timeout_sec(0)
            .with_eviction_interval(Duration::from_millis(10));
        let cache: Arc<DiskSpillCache> = Arc::new(DiskSpillCache::new(options).unwrap());
        cache.start().unwrap();

        cache.put("f::0", b"x").unwrap();
        let deadline: Instant = Instant::now() + Duration::from_secs(2);
        while cache.contains("f::0") && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        cache.stop();
        assert!(!cache.contains("f::0"));
    }
}
