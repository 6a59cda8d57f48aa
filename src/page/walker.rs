//! Chain traversal and consolidation filtering.
//!
//! `collect_items` is the delta walker behind consolidation, splits and
//! iteration: it visits a chain head-to-tail, splices absorbed sibling
//! chains in at their merge delta, follows swap-ins, lazily loads
//! swapped-out content through the `ChainReader` seam, honours the
//! shrinking high fence, and gathers rollback intervals. The gathered
//! records are ordered by key with newest-first recency within a key, then
//! reduced by the compaction filter.

use std::sync::atomic::Ordering;

use crossbeam_epoch::{Guard, Shared};

use crate::error::Result;
use crate::item::{Fence, Item};

use super::{destroy_chain, ChainReader, Delta, DeltaOp};

/// Hides items whose sequence numbers fall in a rolled-back interval.
#[derive(Default)]
pub struct RollbackFilter {
    ranges: Vec<(u64, u64)>,
}

impl RollbackFilter {
    pub fn add(&mut self, start: u64, end: u64) {
        self.ranges.push((start, end));
    }

    pub fn accept(&self, itm: &Item) -> bool {
        let sn = itm.sn();
        !self.ranges.iter().any(|&(s, e)| sn >= s && sn <= e)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

enum CompactMode {
    /// Every version survives; used by iterators that filter per snapshot.
    KeepAll,
    /// Newest version per key survives; tombstones are dropped.
    Simple,
    /// One version per live snapshot interval per key survives. Items at or
    /// above the last boundary are all kept for open snapshots.
    Gc { intervals: Vec<u64> },
}

/// Reduction applied to each key group during consolidation.
pub struct CompactFilter {
    mode: CompactMode,
    pub rollback: RollbackFilter,
}

impl CompactFilter {
    pub fn keep_all() -> CompactFilter {
        CompactFilter {
            mode: CompactMode::KeepAll,
            rollback: RollbackFilter::default(),
        }
    }

    pub fn simple() -> CompactFilter {
        CompactFilter {
            mode: CompactMode::Simple,
            rollback: RollbackFilter::default(),
        }
    }

    /// `intervals` are ascending snapshot boundaries; the last entry is the
    /// GC horizon.
    pub fn gc(intervals: Vec<u64>) -> CompactFilter {
        debug_assert!(!intervals.is_empty());
        CompactFilter {
            mode: CompactMode::Gc { intervals },
            rollback: RollbackFilter::default(),
        }
    }

    /// Reduce one key group, newest first, appending survivors oldest-last.
    fn apply(&self, group: &mut Vec<Item>, out: &mut Vec<Item>) {
        group.retain(|itm| self.rollback.accept(itm));
        if group.is_empty() {
            return;
        }

        let mut survivors: Vec<Item> = Vec::new();
        match &self.mode {
            CompactMode::KeepAll => {
                out.extend(group.drain(..));
                return;
            }
            CompactMode::Simple => survivors.push(group.remove(0)),
            CompactMode::Gc { intervals } => {
                let horizon = *intervals.last().unwrap();
                let mut rest = Vec::new();
                for itm in group.drain(..) {
                    if itm.sn() >= horizon {
                        survivors.push(itm);
                    } else {
                        rest.push(itm);
                    }
                }
                // One survivor per [b[i], b[i+1]) interval, newest wins.
                for w in intervals.windows(2) {
                    if let Some(pos) = rest.iter().position(|i| i.sn() >= w[0] && i.sn() < w[1]) {
                        survivors.push(rest[pos].clone());
                    }
                }
                if let Some(first) = intervals.first() {
                    if let Some(pos) = rest.iter().position(|i| i.sn() < *first) {
                        survivors.push(rest[pos].clone());
                    }
                }
            }
        }

        // A tombstone with nothing older behind it masks nothing.
        while survivors.last().is_some_and(|i| !i.is_insert()) {
            survivors.pop();
        }
        out.extend(survivors);
    }
}

/// Result of a full logical collection over a chain.
pub struct Collected {
    /// Sorted by key; newest-first within a key.
    pub items: Vec<Item>,
    /// Persisted bytes this chain references that a consolidation would
    /// orphan.
    pub stale_fd: u64,
    /// Records materialized from the LSS during the walk.
    pub nrec_swapin: usize,
}

/// Walk the chain rooted at `head`, bounded to `[lo, hi)`, and reduce it
/// with the compaction filter.
pub fn collect_items<'g>(
    head: Shared<'g, Delta>,
    hi0: Fence,
    lo: Option<&[u8]>,
    filter: &mut CompactFilter,
    reader: &mut dyn ChainReader,
    guard: &'g Guard,
) -> Result<Collected> {
    let mut entries: Vec<(u64, Item)> = Vec::new();
    let mut stale_fd = 0u64;
    let mut nrec_swapin = 0usize;
    let mut has_reloc = false;

    let mut hi = hi0;
    let mut seq = 0u64;
    let mut curr = head;
    let mut conts: Vec<Shared<'g, Delta>> = Vec::new();
    let mut ephemeral: Vec<*const Delta> = Vec::new();

    let in_bounds = |itm: &Item, hi: &Fence| {
        hi.covers(itm.key()) && lo.map_or(true, |l| itm.key() >= l)
    };

    let walk_result = (|| -> Result<()> {
        loop {
            let Some(d) = (unsafe { curr.as_ref() }) else {
                match conts.pop() {
                    Some(next) => {
                        curr = next;
                        continue;
                    }
                    None => return Ok(()),
                }
            };

            match &d.op {
                DeltaOp::Insert(itm) | DeltaOp::Delete(itm) => {
                    if in_bounds(itm, &hi) {
                        entries.push((seq, itm.clone()));
                        seq += 1;
                    }
                }
                DeltaOp::Base(items) => {
                    for itm in items {
                        if in_bounds(itm, &hi) {
                            entries.push((seq, itm.clone()));
                            seq += 1;
                        }
                    }
                    // A base terminates this branch; resume a spliced
                    // continuation if one is pending.
                    match conts.pop() {
                        Some(next) => {
                            curr = next;
                            continue;
                        }
                        None => return Ok(()),
                    }
                }
                DeltaOp::Split => {
                    if let Some(k) = d.hi.as_key() {
                        if hi.covers(k) {
                            hi = d.hi.clone();
                        }
                    }
                }
                DeltaOp::Merge { sibling, .. } => {
                    conts.push(d.next.load(Ordering::Acquire, guard));
                    curr = sibling.load(Ordering::Acquire, guard);
                    continue;
                }
                DeltaOp::Rollback { start, end } => filter.rollback.add(*start, *end),
                DeltaOp::Flush(fi) | DeltaOp::Reloc(fi) => {
                    if !has_reloc {
                        stale_fd += u64::from(fi.data_size);
                    }
                    if matches!(d.op, DeltaOp::Reloc(_)) {
                        has_reloc = true;
                    }
                }
                DeltaOp::Swapout { offset, .. } => {
                    let loaded = reader.read_chain(*offset, guard)?;
                    nrec_swapin += loaded.num_records;
                    ephemeral.push(loaded.head.as_raw());
                    curr = loaded.head;
                    continue;
                }
                DeltaOp::Swapin { chain } => {
                    curr = chain.load(Ordering::Acquire, guard);
                    continue;
                }
                DeltaOp::Meta | DeltaOp::Remove => {}
            }
            curr = d.next.load(Ordering::Acquire, guard);
        }
    })();

    for head in ephemeral {
        unsafe { destroy_chain(head) };
    }
    walk_result?;

    // Key order with recency preserved inside each key group.
    entries.sort_by(|a, b| a.1.cmp_key(&b.1).then(a.0.cmp(&b.0)));

    let mut items = Vec::with_capacity(entries.len());
    let mut group: Vec<Item> = Vec::new();
    for (_, itm) in entries {
        if group.last().is_some_and(|g| g.key() != itm.key()) {
            filter.apply(&mut group, &mut items);
            group.clear();
        }
        group.push(itm);
    }
    if !group.is_empty() {
        filter.apply(&mut group, &mut items);
    }

    Ok(Collected {
        items,
        stale_fd,
        nrec_swapin,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(key: &str, sn: u64) -> Item {
        Item::new(key.as_bytes(), Some(b"v"), sn, true).unwrap()
    }

    fn del(key: &str, sn: u64) -> Item {
        Item::new(key.as_bytes(), None, sn, false).unwrap()
    }

    fn apply(filter: &CompactFilter, mut group: Vec<Item>) -> Vec<(u64, bool)> {
        let mut out = Vec::new();
        filter.apply(&mut group, &mut out);
        out.iter().map(|i| (i.sn(), i.is_insert())).collect()
    }

    #[test]
    fn test_simple_filter_keeps_newest() {
        let f = CompactFilter::simple();
        let kept = apply(&f, vec![ins("k", 9), ins("k", 5), ins("k", 2)]);
        assert_eq!(kept, vec![(9, true)]);
    }

    #[test]
    fn test_simple_filter_drops_tombstone() {
        let f = CompactFilter::simple();
        let kept = apply(&f, vec![del("k", 9), ins("k", 5)]);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_gc_filter_one_per_interval() {
        // Boundaries: recovery point at 10, horizon 20.
        let f = CompactFilter::gc(vec![10, 20]);
        let kept = apply(
            &f,
            vec![ins("k", 25), ins("k", 22), ins("k", 15), ins("k", 12), ins("k", 4)],
        );
        // Everything at/above the horizon survives, one survivor in
        // [10, 20), one below the first boundary.
        assert_eq!(kept, vec![(25, true), (22, true), (15, true), (4, true)]);
    }

    #[test]
    fn test_gc_filter_drops_trailing_tombstones() {
        let f = CompactFilter::gc(vec![10, 20]);
        // Oldest surviving versions are tombstones: they mask nothing.
        let kept = apply(&f, vec![ins("k", 22), del("k", 15), del("k", 4)]);
        assert_eq!(kept, vec![(22, true)]);

        // A tombstone shadowing an older surviving insert stays.
        let kept = apply(&f, vec![del("k", 15), ins("k", 4)]);
        assert_eq!(kept, vec![(15, false), (4, true)]);
    }

    #[test]
    fn test_rollback_filter() {
        let mut f = CompactFilter::simple();
        f.rollback.add(5, 9);
        let kept = apply(&f, vec![ins("k", 7), ins("k", 3)]);
        assert_eq!(kept, vec![(3, true)]);
    }
}
