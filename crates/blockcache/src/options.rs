//! Configuration options for the block cache.
//!
//! Options deserialize from kebab-case keys (JSON via `serde_json`, or any
//! other serde format the embedding application uses). Every field has a
//! default, so a partial document is valid.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::BlockCacheError;

/// One megabyte.
pub const MB: u64 = 1024 * 1024;

/// Default block size in MB.
pub const DEFAULT_BLOCK_SIZE_MB: f64 = 16.0;
/// Default memory pool ceiling in MB.
pub const DEFAULT_MEM_SIZE_MB: u64 = 4192;
/// Default disk spill ceiling in MB.
pub const DEFAULT_DISK_SIZE_MB: u64 = 4192;
/// Default idle timeout for spill entries in seconds.
pub const DEFAULT_DISK_TIMEOUT_SEC: u64 = 120;
/// Default prefetch window in blocks.
pub const DEFAULT_PREFETCH: u32 = 5;
/// Default number of block workers.
pub const DEFAULT_PARALLELISM: u32 = 128;

/// Engine heuristics, exposed as tunables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Tunables {
    /// Blocks kept buffered per handle in random mode; also the burst size cap.
    pub min_prefetch: u32,
    /// Cooking blocks tolerated on the write path before one is staged eagerly.
    pub min_write_blocks: u32,
    /// Random reads after which a handle is treated as randomly accessed.
    pub random_read_threshold: u32,
    /// Total attempts per download or upload before the block is marked failed.
    pub max_attempts: u32,
    /// Maximum number of blocks in a single file.
    pub max_blocks_per_file: u64,
    /// Stage-and-wait rounds before a flush gives up.
    pub commit_rounds: u32,
    /// Share of workers (percent) that only serve urgent work.
    pub priority_share_pct: u32,
    /// Pool usage (percent) above which prefetch bursts are throttled.
    pub max_pool_usage: u32,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            min_prefetch: 5,
            min_write_blocks: 3,
            random_read_threshold: 10,
            max_attempts: 3,
            max_blocks_per_file: 50_000,
            commit_rounds: 3,
            priority_share_pct: 10,
            max_pool_usage: 80,
        }
    }
}

/// Local disk spill cache settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DiskSpillOptions {
    /// Root directory for spilled blocks.
    pub path: PathBuf,
    /// Disk ceiling in MB.
    pub size_mb: u64,
    /// Entries idle longer than this are evicted.
    pub timeout_sec: u64,
    /// How often the evictor samples disk usage.
    pub eviction_interval_ms: u64,
    /// Usage percentage that triggers size-based eviction.
    pub high_watermark: u32,
    /// Usage percentage size-based eviction drains down to.
    pub low_watermark: u32,
}

impl Default for DiskSpillOptions {
    fn default() -> Self {
        Self {
            path: std::env::temp_dir().join("blobmount-blocks"),
            size_mb: DEFAULT_DISK_SIZE_MB,
            timeout_sec: DEFAULT_DISK_TIMEOUT_SEC,
            eviction_interval_ms: 5_000,
            high_watermark: 80,
            low_watermark: 50,
        }
    }
}

impl DiskSpillOptions {
    /// Create options rooted at `path`.
    ///
    /// # Arguments
    /// * `path` - Root directory for spilled blocks
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the disk ceiling.
    ///
    /// # Arguments
    /// * `size_mb` - Ceiling in MB
    pub fn with_size_mb(mut self, size_mb: u64) -> Self {
        self.size_mb = size_mb;
        self
    }

    /// Set the idle timeout.
    ///
    /// # Arguments
    /// * `timeout_sec` - Idle timeout in seconds
    pub fn with_timeout_sec(mut self, timeout_sec: u64) -> Self {
        self.timeout_sec = timeout_sec;
        self
    }

    /// Set the evictor sampling interval.
    ///
    /// # Arguments
    /// * `interval` - Time between usage samples
    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Disk ceiling in bytes.
    pub fn max_bytes(&self) -> u64 {
        self.size_mb.saturating_mul(MB)
    }

    /// Idle timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }

    /// Evictor sampling interval as a duration.
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms.max(1))
    }
}

/// Block cache configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BlockCacheOptions {
    /// Block size in MB; fractional values allow sub-MB blocks.
    pub block_size_mb: f64,
    /// Memory pool ceiling in MB.
    pub mem_size_mb: u64,
    /// Pool capacity in blocks; overrides `mem-size-mb` when set.
    pub pool_blocks: Option<u64>,
    /// Prefetch window in blocks (0 disables prefetch).
    pub prefetch: u32,
    /// Number of block worker threads.
    pub parallelism: u32,
    /// Start a prefetch burst when a file is opened.
    pub prefetch_on_open: bool,
    /// Tokio worker threads serving backend calls.
    pub io_threads: usize,
    /// Timeout applied to every backend call.
    pub backend_timeout_sec: Option<u64>,
    /// Optional disk spill cache.
    pub disk: Option<DiskSpillOptions>,
    /// Engine heuristics.
    pub tuning: Tunables,
}

impl Default for BlockCacheOptions {
    fn default() -> Self {
        Self {
            block_size_mb: DEFAULT_BLOCK_SIZE_MB,
            mem_size_mb: DEFAULT_MEM_SIZE_MB,
            pool_blocks: None,
            prefetch: DEFAULT_PREFETCH,
            parallelism: DEFAULT_PARALLELISM,
            prefetch_on_open: false,
            io_threads: 4,
            backend_timeout_sec: None,
            disk: None,
            tuning: Tunables::default(),
        }
    }
}

impl BlockCacheOptions {
    /// Parse options from a JSON document.
    ///
    /// # Arguments
    /// * `json` - JSON text with kebab-case keys
    pub fn from_json(json: &str) -> Result<Self, BlockCacheError> {
        let options: BlockCacheOptions = serde_json::from_str(json)
            .map_err(|e| BlockCacheError::InvalidConfig(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Set block size in MB.
    ///
    /// # Arguments
    /// * `block_size_mb` - Block size in MB
    pub fn with_block_size_mb(mut self, block_size_mb: f64) -> Self {
        self.block_size_mb = block_size_mb;
        self
    }

    /// Set block size in bytes.
    ///
    /// # Arguments
    /// * `bytes` - Block size in bytes
    pub fn with_block_size_bytes(mut self, bytes: u64) -> Self {
        self.block_size_mb = bytes as f64 / MB as f64;
        self
    }

    /// Set memory pool ceiling in MB.
    ///
    /// # Arguments
    /// * `mem_size_mb` - Ceiling in MB
    pub fn with_mem_size_mb(mut self, mem_size_mb: u64) -> Self {
        self.mem_size_mb = mem_size_mb;
        self
    }

    /// Size the memory pool to hold exactly `blocks` blocks.
    ///
    /// # Arguments
    /// * `blocks` - Pool capacity in blocks
    pub fn with_pool_blocks(mut self, blocks: u64) -> Self {
        self.pool_blocks = Some(blocks);
        self
    }

    /// Set prefetch window (0 disables prefetch).
    ///
    /// # Arguments
    /// * `prefetch` - Window in blocks
    pub fn with_prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Set worker parallelism.
    ///
    /// # Arguments
    /// * `parallelism` - Number of block workers
    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Enable or disable prefetch at open.
    ///
    /// # Arguments
    /// * `enabled` - Whether opens start a prefetch burst
    pub fn with_prefetch_on_open(mut self, enabled: bool) -> Self {
        self.prefetch_on_open = enabled;
        self
    }

    /// Enable the disk spill cache.
    ///
    /// # Arguments
    /// * `disk` - Spill cache settings
    pub fn with_disk(mut self, disk: DiskSpillOptions) -> Self {
        self.disk = Some(disk);
        self
    }

    /// Set engine heuristics.
    ///
    /// # Arguments
    /// * `tuning` - Tunables
    pub fn with_tuning(mut self, tuning: Tunables) -> Self {
        self.tuning = tuning;
        self
    }

    /// Set a timeout for backend calls.
    ///
    /// # Arguments
    /// * `timeout` - Per-call timeout (None = no timeout)
    pub fn with_backend_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.backend_timeout_sec = timeout.map(|t| t.as_secs().max(1));
        self
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> u64 {
        (self.block_size_mb * MB as f64) as u64
    }

    /// Memory pool ceiling in bytes.
    pub fn mem_size(&self) -> u64 {
        match self.pool_blocks {
            Some(blocks) => blocks.saturating_mul(self.block_size()),
            None => self.mem_size_mb.saturating_mul(MB),
        }
    }

    /// Backend timeout as a duration.
    pub fn backend_timeout(&self) -> Option<Duration> {
        self.backend_timeout_sec.map(Duration::from_secs)
    }

    /// Whether reads prefetch ahead of the cursor.
    pub fn prefetch_enabled(&self) -> bool {
        self.prefetch > 0
    }

    /// Check the options for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), BlockCacheError> {
        if !self.block_size_mb.is_finite() || self.block_size() == 0 {
            return Err(BlockCacheError::InvalidConfig(format!(
                "block size must be positive, got {} MB",
                self.block_size_mb
            )));
        }
        if self.mem_size() < self.block_size() {
            return Err(BlockCacheError::InvalidConfig(format!(
                "memory size {} bytes is smaller than one block of {} bytes",
                self.mem_size(),
                self.block_size()
            )));
        }
        if self.parallelism == 0 {
            return Err(BlockCacheError::InvalidConfig(
                "parallelism must be at least 1".to_string(),
            ));
        }
        if self.tuning.max_attempts == 0 || self.tuning.commit_rounds == 0 {
            return Err(BlockCacheError::InvalidConfig(
                "max-attempts and commit-rounds must be at least 1".to_string(),
            ));
        }
        if let Some(disk) = &self.disk {
            if disk.low_watermark >= disk.high_watermark || disk.high_watermark > 100 {
                return Err(BlockCacheError::InvalidConfig(format!(
                    "disk watermarks must satisfy low < high <= 100, got {} and {}",
                    disk.low_watermark, disk.high_watermark
                )));
            }
        }
        Ok(())
    }
}
