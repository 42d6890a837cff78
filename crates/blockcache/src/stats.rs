//! Statistics snapshot for a block cache.

use crate::block_pool::BlockPoolStats;
use crate::diskcache::DiskSpillStats;
use crate::engine::WorkerStats;
use crate::threadpool::ThreadPoolStats;

/// Point-in-time counters of a [`BlockCache`](crate::BlockCache).
#[derive(Debug, Clone, Default)]
pub struct BlockCacheStats {
    /// Memory pool usage.
    pub pool: BlockPoolStats,
    /// Worker queue counters.
    pub threads: ThreadPoolStats,
    /// Download and upload counters.
    pub worker: WorkerStats,
    /// Spill cache counters, when enabled.
    pub spill: Option<DiskSpillStats>,
    /// Number of open handles.
    pub open_handles: usize,
}

impl BlockCacheStats {
    /// Share of block downloads served by the spill cache, as a percentage.
    pub fn spill_hit_rate(&self) -> f64 {
        let total: u64 = self.worker.downloads + self.worker.spill_hits;
        if total == 0 {
            0.0
        } else {
            (self.worker.spill_hits as f64 / total as f64) * 100.0
        }
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "pool {:.1}% ({} blocks out), {} downloads, {} uploads, {} spill hits, {} failed, {} handles",
            self.pool.utilization(),
            self.pool.outstanding_blocks,
            self.worker.downloads,
            self.worker.uploads,
            self.worker.spill_hits,
            self.threads.failed,
            self.open_handles
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spill_hit_rate() {
        let mut stats: BlockCacheStats = BlockCacheStats::default();
        assert_eq!(stats.spill_hit_rate(), 0.0);

        stats.worker.downloads = 3;
        stats.worker.spill_hits = 1;
        assert!((stats.spill_hit_rate() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_summary_mentions_counters() {
        let mut stats: BlockCacheStats = BlockCacheStats::default();
        stats.worker.uploads = 7;
        stats.open_handles = 2;
        let summary: String = stats.summary();
        assert!(summary.contains("7 uploads"));
        assert!(summary.contains("2 handles"));
    }
}
