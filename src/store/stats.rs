//! Per-writer statistics and their aggregated snapshot.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::Serialize;

macro_rules! wstats {
    ($($field:ident),* $(,)?) => {
        /// Live counters owned by one writer context. Aggregation walks the
        /// store's context list and sums.
        #[derive(Default)]
        pub struct WStats {
            $(pub $field: AtomicI64,)*
        }

        impl WStats {
            pub fn merge_into(&self, out: &mut Stats) {
                $(out.$field += self.$field.load(Ordering::Relaxed);)*
            }
        }
    };
}

wstats!(
    compacts,
    splits,
    merges,
    inserts,
    deletes,
    compact_conflicts,
    split_conflicts,
    merge_conflicts,
    insert_conflicts,
    delete_conflicts,
    swapin_conflicts,
    bytes_incoming,
    flush_data_sz,
    alloc_sz,
    free_sz,
    reclaim_sz,
    alloc_sz_index,
    free_sz_index,
    num_record_allocs,
    num_record_frees,
    num_record_swapout,
    num_record_swapin,
    num_pages_swapout,
    num_pages_swapin,
    num_lss_reads,
    lss_read_bytes,
    cache_hits,
    cache_misses,
);

impl WStats {
    pub fn new_shared() -> Arc<WStats> {
        Arc::new(WStats::default())
    }
}

/// Point-in-time statistics snapshot, aggregated across all writer
/// contexts of a store. Renders as JSON.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Stats {
    pub memory_quota: i64,

    pub compacts: i64,
    pub splits: i64,
    pub merges: i64,
    pub inserts: i64,
    pub deletes: i64,

    pub compact_conflicts: i64,
    pub split_conflicts: i64,
    pub merge_conflicts: i64,
    pub insert_conflicts: i64,
    pub delete_conflicts: i64,
    pub swapin_conflicts: i64,

    pub bytes_incoming: i64,
    pub bytes_written: i64,

    pub flush_data_sz: i64,

    pub mem_sz: i64,
    pub mem_sz_index: i64,

    pub alloc_sz: i64,
    pub free_sz: i64,
    pub reclaim_sz: i64,
    pub alloc_sz_index: i64,
    pub free_sz_index: i64,

    pub num_record_allocs: i64,
    pub num_record_frees: i64,
    pub num_record_swapout: i64,
    pub num_record_swapin: i64,
    pub num_pages_swapout: i64,
    pub num_pages_swapin: i64,

    pub num_pages: i64,

    pub lss_frag: i64,
    pub lss_data_size: i64,
    pub lss_used_space: i64,
    pub num_lss_reads: i64,
    pub lss_read_bytes: i64,

    pub cache_hits: i64,
    pub cache_misses: i64,
    pub cache_hit_ratio: f64,

    pub write_amp: f64,
    pub resident_ratio: f64,

    pub mem_throttled: bool,
    pub lss_throttled: bool,
}

impl Stats {
    /// Logical record count.
    pub fn count(&self) -> i64 {
        self.inserts - self.deletes
    }
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string_pretty(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(std::fmt::Error),
        }
    }
}

/// Fragmentation summary of the log-structured store.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct LssInfo {
    /// Garbage percentage of the used log space.
    pub frag_percent: i64,
    /// Live page-block bytes.
    pub data_size: i64,
    /// Bytes between log head and tail.
    pub used_space: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_into_sums() {
        let w1 = WStats::default();
        let w2 = WStats::default();
        w1.inserts.store(5, Ordering::Relaxed);
        w2.inserts.store(7, Ordering::Relaxed);
        w2.deletes.store(2, Ordering::Relaxed);

        let mut out = Stats::default();
        w1.merge_into(&mut out);
        w2.merge_into(&mut out);
        assert_eq!(out.inserts, 12);
        assert_eq!(out.deletes, 2);
        assert_eq!(out.count(), 10);
    }

    #[test]
    fn test_stats_render_json() {
        let s = Stats::default();
        let text = s.to_string();
        assert!(text.contains("\"inserts\""));
        assert!(text.contains("\"lss_frag\""));
    }
}
