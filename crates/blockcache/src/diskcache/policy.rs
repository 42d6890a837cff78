//! LRU-with-timeout tracking for spilled blocks.

use std::time::{Duration, Instant};

use lru::LruCache;

/// Tracking record of one spilled block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpillEntry {
    /// Bytes on disk.
    pub size: u64,
    /// Last read or write.
    pub last_access: Instant,
}

/// Recency order and sizes of spilled blocks.
pub struct SpillPolicy {
    entries: LruCache<String, SpillEntry>,
    total_bytes: u64,
}

impl Default for SpillPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SpillPolicy {
    /// Create an empty policy.
    pub fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            total_bytes: 0,
        }
    }

    /// Track or refresh `key` with a new size.
    ///
    /// # Returns
    /// Previous record, if any.
    pub fn insert(&mut self, key: &str, size: u64) -> Option<SpillEntry> {
        let entry: SpillEntry = SpillEntry {
            size,
            last_access: Instant::now(),
        };
        let previous: Option<SpillEntry> = self.entries.put(key.to_string(), entry);
        if let Some(old) = previous {
            self.total_bytes -= old.size;
        }
        self.total_bytes += size;
        previous
    }

    /// Mark `key` as just used.
    ///
    /// # Returns
    /// False if `key` is not tracked.
    pub fn touch(&mut self, key: &str) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Stop tracking `key`.
    pub fn remove(&mut self, key: &str) -> Option<SpillEntry> {
        let removed: Option<SpillEntry> = self.entries.pop(key);
        if let Some(entry) = removed {
            self.total_bytes -= entry.size;
        }
        removed
    }

    /// Whether `key` is tracked.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    /// Record for `key` without affecting recency.
    pub fn peek(&self, key: &str) -> Option<SpillEntry> {
        self.entries.peek(key).copied()
    }

    /// Keys idle for longer than `timeout`, least recent first.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<String> {
        self.entries
            .iter()
            .rev()
            .take_while(|(_, entry)| now.duration_since(entry.last_access) > timeout)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Least recently used keys whose removal frees at least `bytes`.
    pub fn victims(&self, bytes: u64) -> Vec<String> {
        let mut freed: u64 = 0;
        let mut out: Vec<String> = Vec::new();
        for (key, entry) in self.entries.iter().rev() {
            if freed >= bytes {
                break;
            }
            freed += entry.size;
            out.push(key.clone());
        }
        out
    }

    /// Keys starting with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Sum of tracked sizes.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every entry.
    ///
    /// # Returns
    /// Number of entries dropped.
    pub fn clear(&mut self) -> usize {
        let dropped: usize = self.entries.len();
        self.entries.clear();
        self.total_bytes = 0;
        dropped
    }
}
