use std::path::PathBuf;
use std::time::Duration;

/// Configuration for an EmberDB store.
///
/// Thresholds follow the page lifecycle: a delta chain longer than
/// `max_delta_chain_len` is consolidated, a consolidated page with more than
/// `max_page_items` records is split, and one with fewer than
/// `min_page_items` is merged into its left sibling.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for the log file and lock file. `None` keeps the store
    /// memory-only: no log is opened and persistence operations are no-ops.
    pub dir: Option<PathBuf>,

    /// Delta chain length that triggers consolidation (default: 200)
    pub max_delta_chain_len: usize,

    /// Consolidated item count that triggers a page split (default: 400)
    pub max_page_items: usize,

    /// Consolidated item count that triggers a page merge (default: 25)
    pub min_page_items: usize,

    /// Number of persisted segments a page may accumulate before the next
    /// flush is forced to write the full page (default: 4)
    pub max_page_lss_segments: usize,

    /// Log segment size in bytes; trims punch holes a whole segment at a
    /// time (default: 4MB)
    pub lss_log_segment_size: u64,

    /// Bytes per flush buffer. Must exceed the largest encoded page block
    /// (default: 1MB)
    pub flush_buffer_size: usize,

    /// Number of flush buffers in the ring (default: 2)
    pub num_flush_buffers: usize,

    /// Background commit cadence. Zero commits on every buffer flush
    /// (default: 10s)
    pub sync_interval: Duration,

    /// Worker pool sizes for eviction and persistence (default: CPU count)
    pub num_evictor_threads: usize,
    pub num_persistor_threads: usize,

    /// Run the log cleaner as a background task (default: false)
    pub auto_lss_cleaning: bool,

    /// Run the swapper as a background task (default: false)
    pub auto_swapper: bool,

    /// Log fragmentation percentage that activates the cleaner (default: 70)
    pub lss_cleaner_max_threshold: u8,

    /// Minimum log size in bytes before fragmentation throttling applies
    /// (default: 1GB)
    pub lss_cleaner_throttle_min_size: u64,

    /// Compress page blocks with snappy before they reach the log
    /// (default: false)
    pub use_compression: bool,

    /// Enable MVCC snapshots, recovery points and rollback (default: false)
    pub enable_snapshots: bool,

    /// Persist the snapshot-number high water every N snapshots
    /// (default: 1)
    pub max_sn_sync_frequency: usize,
}

impl Default for Config {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            dir: None,
            max_delta_chain_len: 200,
            max_page_items: 400,
            min_page_items: 25,
            max_page_lss_segments: 4,
            lss_log_segment_size: 4 * 1024 * 1024,
            flush_buffer_size: 1024 * 1024,
            num_flush_buffers: 2,
            sync_interval: Duration::from_secs(10),
            num_evictor_threads: cpus,
            num_persistor_threads: cpus,
            auto_lss_cleaning: false,
            auto_swapper: false,
            lss_cleaner_max_threshold: 70,
            lss_cleaner_throttle_min_size: 1024 * 1024 * 1024,
            use_compression: false,
            enable_snapshots: false,
            max_sn_sync_frequency: 1,
        }
    }
}

impl Config {
    /// Create a persistent config rooted at the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Default::default()
        }
    }

    /// Create a memory-only config
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub(crate) fn should_persist(&self) -> bool {
        self.dir.is_some()
    }

    pub fn max_delta_chain_len(mut self, n: usize) -> Self {
        self.max_delta_chain_len = n;
        self
    }

    pub fn max_page_items(mut self, n: usize) -> Self {
        self.max_page_items = n;
        self
    }

    pub fn min_page_items(mut self, n: usize) -> Self {
        self.min_page_items = n;
        self
    }

    pub fn max_page_lss_segments(mut self, n: usize) -> Self {
        self.max_page_lss_segments = n;
        self
    }

    pub fn lss_log_segment_size(mut self, size: u64) -> Self {
        self.lss_log_segment_size = size;
        self
    }

    pub fn flush_buffer_size(mut self, size: usize) -> Self {
        self.flush_buffer_size = size;
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn num_evictor_threads(mut self, n: usize) -> Self {
        self.num_evictor_threads = n.max(1);
        self
    }

    pub fn num_persistor_threads(mut self, n: usize) -> Self {
        self.num_persistor_threads = n.max(1);
        self
    }

    pub fn auto_lss_cleaning(mut self, enabled: bool) -> Self {
        self.auto_lss_cleaning = enabled;
        self
    }

    pub fn auto_swapper(mut self, enabled: bool) -> Self {
        self.auto_swapper = enabled;
        self
    }

    pub fn lss_cleaner_max_threshold(mut self, pct: u8) -> Self {
        self.lss_cleaner_max_threshold = pct;
        self
    }

    pub fn lss_cleaner_throttle_min_size(mut self, size: u64) -> Self {
        self.lss_cleaner_throttle_min_size = size;
        self
    }

    pub fn use_compression(mut self, enabled: bool) -> Self {
        self.use_compression = enabled;
        self
    }

    pub fn enable_snapshots(mut self, enabled: bool) -> Self {
        self.enable_snapshots = enabled;
        self
    }

    pub fn max_sn_sync_frequency(mut self, n: usize) -> Self {
        self.max_sn_sync_frequency = n.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.dir.is_none());
        assert!(!config.should_persist());
        assert_eq!(config.max_delta_chain_len, 200);
        assert_eq!(config.max_page_items, 400);
        assert_eq!(config.min_page_items, 25);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new("/tmp/ember")
            .max_page_items(100)
            .min_page_items(10)
            .enable_snapshots(true)
            .sync_interval(Duration::from_secs(0));

        assert!(config.should_persist());
        assert_eq!(config.max_page_items, 100);
        assert_eq!(config.min_page_items, 10);
        assert!(config.enable_snapshots);
        assert_eq!(config.sync_interval, Duration::from_secs(0));
    }
}
