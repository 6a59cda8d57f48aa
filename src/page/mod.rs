//! Delta-chained page representation.
//!
//! A page covers the half-open key range `[low, hi)` and materializes as a
//! singly-linked chain of immutable delta nodes rooted at a head pointer.
//! Writers prepend deltas and publish the new head with a CAS on the
//! page's slot in the separator index; replaced chains are retired through
//! epoch-based reclamation, so readers traversing a chain only need to
//! hold an epoch guard.
//!
//! A chain has exactly one terminal: a `Base` delta (consolidated
//! snapshot), a `Swapout` delta (content lives in the log-structured
//! store), or nothing right after a recovery reset. The high fence only
//! shrinks along the chain (`Split` tightens it); the low fence is
//! immutable.

pub mod marshal;
pub mod walker;

use std::sync::atomic::Ordering;

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use crate::error::Result;
use crate::item::{Fence, Item};

use walker::{collect_items, CompactFilter, RollbackFilter};

/// Packed page state: `| 14-bit version | evicted | flushed |`.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct PageState(pub u16);

impl PageState {
    pub fn version(self) -> u16 {
        self.0 & 0x3fff
    }

    pub fn is_flushed(self) -> bool {
        self.0 & 0x8000 != 0
    }

    pub fn set_flushed(&mut self) {
        self.0 |= 0x8000;
    }

    pub fn is_evicted(self) -> bool {
        self.0 & 0x4000 != 0
    }

    pub fn set_evicted(&mut self, v: bool) {
        if v {
            self.0 |= 0x4000;
        } else {
            self.0 &= 0xbfff;
        }
    }

    /// Bump the version and clear the flag bits: a new consolidation or
    /// relocation is neither flushed nor evicted until marked so.
    pub fn incr_version(&mut self) {
        let v = self.0 & 0x3fff;
        self.0 = (v + 1) & 0x3fff;
    }
}

/// Where a persisted chain segment lives in the LSS.
#[derive(Clone, Copy, Debug)]
pub struct FlushInfo {
    pub offset: u64,
    pub data_size: u32,
    pub num_segments: u32,
}

/// Per-delta operation payload.
pub enum DeltaOp {
    /// Empty seed / decode marker.
    Meta,
    Insert(Item),
    Delete(Item),
    /// Consolidated snapshot; always chain-terminal.
    Base(Vec<Item>),
    /// Logical split; the delta's high fence is the split key.
    Split,
    /// The right sibling's chain has been absorbed; `sep` is its low key.
    Merge { sep: Fence, sibling: Atomic<Delta> },
    /// The page is closed; the next SMO must splice it out of the index.
    Remove,
    /// The chain above was persisted at `FlushInfo.offset`.
    Flush(FlushInfo),
    /// Rewrite by the log cleaner; resets the version.
    Reloc(FlushInfo),
    /// Reads skip items with sn inside `[start, end]`.
    Rollback { start: u64, end: u64 },
    /// The chain below was evicted to the LSS.
    Swapout { offset: u64, num_segments: u32 },
    /// Transient head over a chain re-read from the LSS.
    Swapin { chain: Atomic<Delta> },
}

/// One node of a delta chain.
pub struct Delta {
    pub op: DeltaOp,
    pub chain_len: u16,
    pub num_items: u16,
    pub state: PageState,
    pub hi: Fence,
    pub right: Fence,
    pub next: Atomic<Delta>,
}

impl Delta {
    /// Memory footprint including inline payloads, for accounting.
    pub fn mem_size(&self) -> usize {
        let payload = match &self.op {
            DeltaOp::Insert(itm) | DeltaOp::Delete(itm) => itm.size(),
            DeltaOp::Base(items) => items
                .iter()
                .map(|i| i.size() + std::mem::size_of::<Item>())
                .sum(),
            DeltaOp::Merge { sep, .. } => sep.heap_size(),
            _ => 0,
        };
        std::mem::size_of::<Delta>() + self.hi.heap_size() + self.right.heap_size() + payload
    }

    pub fn is_record(&self) -> bool {
        matches!(self.op, DeltaOp::Insert(_) | DeltaOp::Delete(_))
    }
}

/// A chain segment loaded back from the LSS.
pub struct LoadedChain<'g> {
    pub head: Shared<'g, Delta>,
    pub num_segments: u32,
    pub num_records: usize,
    /// Memory footprint of the materialized chain, for accounting when it
    /// gets published.
    pub mem: usize,
}

/// Access to persisted chains, implemented by the store's writer context.
/// Page-level code reads evicted content through this seam.
pub trait ChainReader {
    fn read_chain<'g>(&mut self, offset: u64, guard: &'g Guard) -> Result<LoadedChain<'g>>;
}

/// Reader for stores without a log; evicted chains cannot exist there.
pub struct NoChainReader;

impl ChainReader for NoChainReader {
    fn read_chain<'g>(&mut self, _offset: u64, _guard: &'g Guard) -> Result<LoadedChain<'g>> {
        unreachable!("swapped-out chain in a store without a log")
    }
}

/// A chain retired by a successful head CAS, destroyed once all readers
/// have left their epoch.
pub struct RetiredChain {
    pub head: *const Delta,
    pub evicted: bool,
}

unsafe impl Send for RetiredChain {}

/// Transient, single-writer view of a page between a head load and the
/// publishing CAS. Mutations prepend deltas locally; `prev_head` is the
/// CAS expectation.
pub struct Page<'g> {
    pub low: Fence,
    pub head: Shared<'g, Delta>,
    pub prev_head: Shared<'g, Delta>,
    /// Right sibling when the chain is empty (recovery reset only).
    pub next_pid: Fence,
    pub tail: Shared<'g, Delta>,

    /// Chains to retire when the CAS wins.
    pub free_list: Vec<RetiredChain>,
    /// Accounting deltas applied to writer stats at publish time.
    pub mem_alloc: usize,
    pub nrec_allocs: usize,
    pub nrec_swapin: usize,
}

impl<'g> Page<'g> {
    pub fn new(low: Fence, head: Shared<'g, Delta>) -> Page<'g> {
        Page {
            low,
            head,
            prev_head: head,
            next_pid: Fence::Hi,
            tail: Shared::null(),
            free_list: Vec::new(),
            mem_alloc: 0,
            nrec_allocs: 0,
            nrec_swapin: 0,
        }
    }

    pub fn head_ref(&self) -> Option<&'g Delta> {
        unsafe { self.head.as_ref() }
    }

    fn head_delta(&self) -> &'g Delta {
        self.head_ref().expect("operation on an empty chain")
    }

    fn alloc(&mut self, delta: Delta, guard: &'g Guard) -> Shared<'g, Delta> {
        self.mem_alloc += delta.mem_size();
        Owned::new(delta).into_shared(guard)
    }

    /// Prepend a delta carrying the head's bookkeeping fields.
    fn prepend(&mut self, op: DeltaOp, guard: &'g Guard) {
        let head = self.head_delta();
        let d = Delta {
            op,
            chain_len: head.chain_len + 1,
            num_items: head.num_items,
            state: head.state,
            hi: head.hi.clone(),
            right: head.right.clone(),
            next: Atomic::from(self.head.as_raw() as *const Delta),
        };
        self.head = self.alloc(d, guard);
    }

    pub fn min_fence(&self) -> &Fence {
        &self.low
    }

    pub fn max_fence(&self) -> Fence {
        match self.head_ref() {
            Some(h) => h.hi.clone(),
            None => Fence::Hi,
        }
    }

    pub fn next_pid(&self) -> Fence {
        match self.head_ref() {
            Some(h) => h.right.clone(),
            None => self.next_pid.clone(),
        }
    }

    /// Point the page at a new right sibling. Only valid while recovery
    /// owns the chain exclusively.
    pub unsafe fn set_next(&mut self, pid: Fence) {
        match self.head_ref() {
            Some(_) => {
                let head = self.head.as_raw() as *mut Delta;
                (*head).right = pid;
            }
            None => self.next_pid = pid,
        }
    }

    pub fn in_range(&self, key: &[u8]) -> bool {
        self.head_delta().hi.covers(key)
    }

    pub fn version(&self) -> u16 {
        self.head_ref().map_or(0, |h| h.state.version())
    }

    pub fn state(&self) -> PageState {
        self.head_ref().map_or(PageState(0), |h| h.state)
    }

    pub fn is_flushed(&self) -> bool {
        self.head_ref().is_some_and(|h| h.state.is_flushed())
    }

    pub fn is_evicted(&self) -> bool {
        self.head_ref().is_some_and(|h| h.state.is_evicted())
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn insert(&mut self, itm: Item, guard: &'g Guard) {
        self.nrec_allocs += 1;
        self.prepend(DeltaOp::Insert(itm), guard);
    }

    pub fn delete(&mut self, itm: Item, guard: &'g Guard) {
        self.nrec_allocs += 1;
        self.prepend(DeltaOp::Delete(itm), guard);
    }

    /// Walk the chain for the newest visible record at `key`. Returns the
    /// record for an insert, None for a tombstone or absence.
    pub fn lookup(
        &mut self,
        key: &[u8],
        reader: &mut dyn ChainReader,
        guard: &'g Guard,
    ) -> Result<Option<Item>> {
        let mut hi = self.max_fence();
        let mut filter = RollbackFilter::default();
        let mut curr = self.head;
        // Chains loaded from the log for this walk only; freed on exit.
        let mut ephemeral: Vec<*const Delta> = Vec::new();

        let result = loop {
            let Some(d) = (unsafe { curr.as_ref() }) else {
                break None;
            };

            match &d.op {
                DeltaOp::Insert(itm) => {
                    if itm.key() == key && hi.covers(key) && filter.accept(itm) {
                        break Some(itm.clone());
                    }
                }
                DeltaOp::Delete(itm) => {
                    if itm.key() == key && hi.covers(key) && filter.accept(itm) {
                        break None;
                    }
                }
                DeltaOp::Base(items) => {
                    let idx = items.partition_point(|i| i.key() < key);
                    let mut found = None;
                    for itm in &items[idx..] {
                        if itm.key() != key || !hi.covers(key) {
                            break;
                        }
                        if filter.accept(itm) {
                            found = Some(itm.clone());
                            break;
                        }
                    }
                    break found;
                }
                DeltaOp::Split => {
                    if let Some(k) = d.hi.as_key() {
                        if hi.covers(k) {
                            hi = d.hi.clone();
                        }
                    }
                }
                DeltaOp::Merge { sep, sibling } => {
                    if sep.cmp_key(key) != std::cmp::Ordering::Greater {
                        // Key belongs to the absorbed sibling.
                        curr = sibling.load(Ordering::Acquire, guard);
                        continue;
                    }
                }
                DeltaOp::Rollback { start, end } => filter.add(*start, *end),
                DeltaOp::Swapout { offset, .. } => {
                    let loaded = reader.read_chain(*offset, guard)?;
                    self.nrec_swapin += loaded.num_records;
                    ephemeral.push(loaded.head.as_raw());
                    curr = loaded.head;
                    continue;
                }
                DeltaOp::Swapin { chain } => {
                    curr = chain.load(Ordering::Acquire, guard);
                    continue;
                }
                DeltaOp::Meta | DeltaOp::Remove | DeltaOp::Flush(_) | DeltaOp::Reloc(_) => {}
            }
            curr = d.next.load(Ordering::Acquire, guard);
        };

        for head in ephemeral {
            unsafe { destroy_chain(head) };
        }
        Ok(result)
    }

    pub fn need_compaction(&self, threshold: usize) -> bool {
        usize::from(self.head_delta().chain_len) > threshold
    }

    pub fn need_split(&self, threshold: usize) -> bool {
        usize::from(self.head_delta().num_items) > threshold
    }

    pub fn need_merge(&self, threshold: usize) -> bool {
        usize::from(self.head_delta().num_items) < threshold
    }

    pub fn need_removal(&self) -> bool {
        matches!(self.head_delta().op, DeltaOp::Remove)
    }

    /// Close the page. It is unfit for writes from here on; the parent
    /// removal SMO must eventually succeed.
    pub fn close(&mut self, guard: &'g Guard) {
        self.prepend(DeltaOp::Remove, guard);
    }

    pub fn rollback(&mut self, start_sn: u64, end_sn: u64, guard: &'g Guard) {
        self.prepend(
            DeltaOp::Rollback {
                start: start_sn,
                end: end_sn,
            },
            guard,
        );
    }

    /// Replace the chain with a single consolidated base. Returns the
    /// flush-data bytes made stale for the persistor's accounting.
    pub fn compact(
        &mut self,
        filter: &mut CompactFilter,
        reader: &mut dyn ChainReader,
        guard: &'g Guard,
    ) -> Result<u64> {
        let head = self.head_delta();
        let mut state = head.state;
        let hi = head.hi.clone();
        let right = head.right.clone();

        let collected = collect_items(self.head, hi.clone(), None, filter, reader, guard)?;
        self.nrec_swapin += collected.nrec_swapin;

        self.free(false);
        state.incr_version();

        let n = collected.items.len();
        self.nrec_allocs += n;
        let base = Delta {
            op: DeltaOp::Base(collected.items),
            chain_len: 0,
            num_items: n as u16,
            state,
            hi,
            right,
            next: Atomic::null(),
        };
        self.head = self.alloc(base, guard);
        Ok(collected.stale_fd)
    }

    /// Split at an item boundary near the midpoint, strictly above the
    /// predecessor and strictly below the high fence so both halves get a
    /// distinct key range. Returns the new right-hand page, or None when no
    /// valid midpoint exists (the caller consolidates instead).
    pub fn split(
        &mut self,
        filter: &mut CompactFilter,
        reader: &mut dyn ChainReader,
        guard: &'g Guard,
    ) -> Result<Option<Page<'g>>> {
        let head = self.head_delta();
        let hi = head.hi.clone();
        let right = head.right.clone();

        // Find the terminal base.
        let mut curr = self.head;
        let base_items = loop {
            let Some(d) = (unsafe { curr.as_ref() }) else {
                return Ok(None);
            };
            match &d.op {
                DeltaOp::Base(items) => break items,
                DeltaOp::Swapout { .. } | DeltaOp::Flush(_) | DeltaOp::Reloc(_) => {
                    return Ok(None)
                }
                _ => curr = d.next.load(Ordering::Acquire, guard),
            }
        };

        let mut mid = base_items.len() / 2;
        while mid > 0 {
            let k = base_items[mid].key();
            if hi.covers(k) && base_items[mid - 1].key() < k {
                break;
            }
            mid -= 1;
        }
        if mid == 0 {
            return Ok(None);
        }

        let split_key = base_items[mid].key().to_vec();
        let lower_count = mid;

        let collected = collect_items(
            self.head,
            hi.clone(),
            Some(&split_key),
            filter,
            reader,
            guard,
        )?;
        if collected.items.is_empty() {
            return Ok(None);
        }

        let split_fence = Fence::from_key(&split_key);
        let n = collected.items.len();
        let mut new_page = Page::new(split_fence.clone(), Shared::null());
        let base = Delta {
            op: DeltaOp::Base(collected.items),
            chain_len: 0,
            num_items: n as u16,
            state: PageState(0),
            hi,
            right,
            next: Atomic::null(),
        };
        new_page.nrec_allocs = n;
        new_page.head = new_page.alloc(base, guard);
        new_page.prev_head = Shared::null();

        // Split delta on self: high fence tightens to the split key.
        let head = self.head_delta();
        let d = Delta {
            op: DeltaOp::Split,
            chain_len: head.chain_len + 1,
            num_items: lower_count as u16,
            state: head.state,
            hi: split_fence.clone(),
            right: split_fence,
            next: Atomic::from(self.head.as_raw() as *const Delta),
        };
        self.head = self.alloc(d, guard);

        Ok(Some(new_page))
    }

    /// Absorb the right sibling: counters add, the high fence widens to the
    /// sibling's, and the sibling's chain hangs off the merge delta.
    pub fn merge(&mut self, sibling: &Page<'g>, guard: &'g Guard) {
        let head = self.head_delta();
        let sib_head = sibling.head_delta();

        let d = Delta {
            op: DeltaOp::Merge {
                sep: head.hi.clone(),
                sibling: Atomic::from(sibling.head.as_raw() as *const Delta),
            },
            chain_len: head.chain_len + sib_head.chain_len + 1,
            num_items: head.num_items + sib_head.num_items,
            state: head.state,
            hi: sib_head.hi.clone(),
            right: sib_head.right.clone(),
            next: Atomic::from(self.head.as_raw() as *const Delta),
        };
        self.head = self.alloc(d, guard);
    }

    /// Record that the chain above was persisted. `num_segments == 0` marks
    /// a relocation, which starts a fresh segment chain and a new version.
    pub fn add_flush_record(
        &mut self,
        offset: u64,
        data_size: u64,
        num_segments: u32,
        guard: &'g Guard,
    ) {
        let head = self.head_delta();
        let mut state = head.state;
        let (op, chain_len) = if num_segments == 0 {
            state.incr_version();
            state.set_flushed();
            (
                DeltaOp::Reloc(FlushInfo {
                    offset,
                    data_size: data_size as u32,
                    num_segments: 1,
                }),
                head.chain_len,
            )
        } else {
            state.set_flushed();
            (
                DeltaOp::Flush(FlushInfo {
                    offset,
                    data_size: data_size as u32,
                    num_segments,
                }),
                head.chain_len,
            )
        };

        let d = Delta {
            op,
            chain_len,
            num_items: head.num_items,
            state,
            hi: head.hi.clone(),
            right: head.right.clone(),
            next: Atomic::from(self.head.as_raw() as *const Delta),
        };
        self.head = self.alloc(d, guard);
    }

    /// Evict the chain: retire everything and leave a terminal swapout
    /// delta carrying the persisted location.
    pub fn evict(&mut self, offset: u64, num_segments: u32, guard: &'g Guard) {
        let head = self.head_delta();
        let mut state = head.state;
        let num_segments = if num_segments == 0 {
            state.incr_version();
            1
        } else {
            num_segments
        };
        state.set_flushed();
        state.set_evicted(true);

        self.free(true);

        let d = Delta {
            op: DeltaOp::Swapout {
                offset,
                num_segments,
            },
            chain_len: head.chain_len,
            num_items: head.num_items,
            state,
            hi: head.hi.clone(),
            right: head.right.clone(),
            next: Atomic::null(),
        };
        self.head = self.alloc(d, guard);
    }

    /// Splice a recovered chain over the evicted content.
    pub fn swap_in(&mut self, chain: Shared<'g, Delta>, guard: &'g Guard) {
        let head = self.head_delta();
        let mut state = head.state;
        state.set_evicted(false);

        let chain_ref = unsafe { chain.as_ref() }.expect("swap-in of an empty chain");
        let d = Delta {
            op: DeltaOp::Swapin {
                chain: Atomic::from(chain.as_raw() as *const Delta),
            },
            chain_len: head.chain_len + chain_ref.chain_len,
            num_items: chain_ref.num_items,
            state,
            hi: head.hi.clone(),
            right: head.right.clone(),
            next: Atomic::from(self.head.as_raw() as *const Delta),
        };
        self.head = self.alloc(d, guard);
    }

    /// The head is a flush record whose offset can serve as the swapout
    /// location without rewriting the page.
    pub fn is_evictable(&self) -> bool {
        self.head_ref()
            .is_some_and(|h| matches!(h.op, DeltaOp::Flush(_) | DeltaOp::Reloc(_)))
    }

    /// Anything above the last flush record still needs to reach the log.
    pub fn needs_flush(&self) -> bool {
        self.head_ref().is_some_and(|h| {
            !matches!(
                h.op,
                DeltaOp::Flush(_) | DeltaOp::Reloc(_) | DeltaOp::Remove | DeltaOp::Swapout { .. }
            )
        })
    }

    /// Location of the newest persisted segment for a flushed or evicted
    /// head.
    pub fn flush_info(&self) -> FlushInfo {
        let head = self.head_delta();
        match &head.op {
            DeltaOp::Flush(fi) | DeltaOp::Reloc(fi) => *fi,
            DeltaOp::Swapout {
                offset,
                num_segments,
            } => FlushInfo {
                offset: *offset,
                data_size: 0,
                num_segments: *num_segments,
            },
            _ => panic!("flush info requested for an unflushed head"),
        }
    }

    /// Live flush-data bytes: flush records above the base, ignoring
    /// anything older than a relocation.
    pub fn flush_data_size(&self, guard: &'g Guard) -> u64 {
        let mut size = 0u64;
        let mut has_reloc = false;
        let mut curr = self.head;
        while let Some(d) = unsafe { curr.as_ref() } {
            match &d.op {
                DeltaOp::Base(_) => break,
                DeltaOp::Flush(fi) => {
                    if !has_reloc {
                        size += u64::from(fi.data_size);
                    }
                }
                DeltaOp::Reloc(fi) => {
                    if !has_reloc {
                        size += u64::from(fi.data_size);
                    }
                    has_reloc = true;
                }
                DeltaOp::Swapin { chain } => {
                    curr = chain.load(Ordering::Acquire, guard);
                    continue;
                }
                _ => {}
            }
            curr = d.next.load(Ordering::Acquire, guard);
        }
        size
    }

    /// Correct the segment count on a freshly assembled flush head.
    ///
    /// # Safety
    /// The chain must not have been published yet.
    pub unsafe fn set_num_segments(&mut self, n: u32) {
        let head = self.head.as_raw() as *mut Delta;
        match &mut (*head).op {
            DeltaOp::Flush(fi) => fi.num_segments = n,
            op => panic!("segment count on non-flush delta {}", op_name(op)),
        }
    }

    /// Concatenate another page's chain under this one. Recovery-only; the
    /// chains are exclusively owned.
    pub fn append(&mut self, other: Page<'g>) {
        if self.head.is_null() {
            self.low = other.low;
            self.head = other.head;
            self.tail = other.tail;
        } else {
            let tail = self.tail.as_raw() as *mut Delta;
            assert!(!tail.is_null(), "append to a chain without a tail");
            unsafe {
                (*tail).next = Atomic::from(other.head.as_raw() as *const Delta);
            }
            self.tail = other.tail;
        }
        self.mem_alloc += other.mem_alloc;
        self.nrec_allocs += other.nrec_allocs;
    }

    /// Queue the current chain for retirement at publish time.
    pub fn free(&mut self, evicted: bool) {
        if !self.head.is_null() {
            self.free_list.push(RetiredChain {
                head: self.head.as_raw(),
                evicted,
            });
        }
    }

    pub fn reset(&mut self) {
        self.low = Fence::Lo;
        self.head = Shared::null();
        self.prev_head = Shared::null();
        self.tail = Shared::null();
        self.next_pid = Fence::Hi;
        self.free_list.clear();
        self.mem_alloc = 0;
        self.nrec_allocs = 0;
        self.nrec_swapin = 0;
    }
}

fn op_name(op: &DeltaOp) -> &'static str {
    match op {
        DeltaOp::Meta => "meta",
        DeltaOp::Insert(_) => "insert",
        DeltaOp::Delete(_) => "delete",
        DeltaOp::Base(_) => "base",
        DeltaOp::Split => "split",
        DeltaOp::Merge { .. } => "merge",
        DeltaOp::Remove => "remove",
        DeltaOp::Flush(_) => "flush",
        DeltaOp::Reloc(_) => "reloc",
        DeltaOp::Rollback { .. } => "rollback",
        DeltaOp::Swapout { .. } => "swapout",
        DeltaOp::Swapin { .. } => "swapin",
    }
}

/// Seed chain for an empty store: a meta delta covering the whole key
/// space.
pub fn seed_chain<'g>(guard: &'g Guard) -> Shared<'g, Delta> {
    Owned::new(Delta {
        op: DeltaOp::Meta,
        chain_len: 0,
        num_items: 0,
        state: PageState(0),
        hi: Fence::Hi,
        right: Fence::Hi,
        next: Atomic::null(),
    })
    .into_shared(guard)
}

/// Record count and memory footprint of a chain, recursing through merge
/// siblings and swap-ins.
pub fn compute_mem_used(head: *const Delta) -> (usize, usize) {
    let mut n = 0usize;
    let mut size = 0usize;
    let mut curr = head;
    while !curr.is_null() {
        let d = unsafe { &*curr };
        size += d.mem_size();
        match &d.op {
            DeltaOp::Base(items) => {
                n += items.len();
                break;
            }
            DeltaOp::Insert(_) | DeltaOp::Delete(_) => n += 1,
            DeltaOp::Merge { sibling, .. } => {
                let (nx, sx) = compute_mem_used(sibling.load_raw_const());
                n += nx;
                size += sx;
            }
            DeltaOp::Swapin { chain } => {
                let (nx, sx) = compute_mem_used(chain.load_raw_const());
                n += nx;
                size += sx;
                break;
            }
            DeltaOp::Swapout { .. } => break,
            _ => {}
        }
        curr = d.next.load_raw_const();
    }
    (n, size)
}

/// Raw-pointer load for traversals that own the chain or run under a
/// pinned epoch.
trait AtomicDeltaExt {
    fn load_raw_const(&self) -> *const Delta;
}

impl AtomicDeltaExt for Atomic<Delta> {
    fn load_raw_const(&self) -> *const Delta {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        self.load(Ordering::Acquire, guard).as_raw()
    }
}

/// Drop every node of a retired chain, following merge-sibling and swap-in
/// branches. The chain must be unreachable: either never published, or
/// retired behind an epoch barrier.
///
/// # Safety
/// No other thread may hold references into the chain.
pub unsafe fn destroy_chain(head: *const Delta) {
    let mut worklist = vec![head];
    while let Some(mut curr) = worklist.pop() {
        while !curr.is_null() {
            let d = &*curr;
            let next = match &d.op {
                DeltaOp::Base(_) | DeltaOp::Swapout { .. } => std::ptr::null(),
                DeltaOp::Merge { sibling, .. } => {
                    worklist.push(sibling.load_raw_const());
                    d.next.load_raw_const()
                }
                DeltaOp::Swapin { chain } => {
                    worklist.push(chain.load_raw_const());
                    std::ptr::null()
                }
                _ => d.next.load_raw_const(),
            };
            drop(Box::from_raw(curr as *mut Delta));
            curr = next;
        }
    }
}

/// Drop the unpublished nodes between a failed CAS's head and the still
/// live `stop` node. Merge siblings are owned by other live chains and are
/// left alone; swap-in branches were loaded by this writer and go with the
/// prefix.
///
/// # Safety
/// The prefix must never have been published.
pub unsafe fn destroy_prefix(head: *const Delta, stop: *const Delta) {
    let mut curr = head;
    while !curr.is_null() && curr != stop {
        let d = &*curr;
        if let DeltaOp::Swapin { chain } = &d.op {
            destroy_chain(chain.load_raw_const());
        }
        let next = match &d.op {
            DeltaOp::Base(_) | DeltaOp::Swapout { .. } | DeltaOp::Swapin { .. } => {
                std::ptr::null()
            }
            _ => d.next.load_raw_const(),
        };
        drop(Box::from_raw(curr as *mut Delta));
        curr = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch as epoch;

    fn itm(key: &str, val: &str, sn: u64) -> Item {
        Item::new(key.as_bytes(), Some(val.as_bytes()), sn, true).unwrap()
    }

    fn tomb(key: &str, sn: u64) -> Item {
        Item::new(key.as_bytes(), None, sn, false).unwrap()
    }

    fn lookup_val<'a>(page: &mut Page<'a>, key: &str, guard: &'a Guard) -> Option<String> {
        page.lookup(key.as_bytes(), &mut NoChainReader, guard)
            .unwrap()
            .map(move |i| String::from_utf8_lossy(i.value()).into_owned())
    }

    fn destroy_page(page: Page) {
        unsafe { destroy_chain(page.head.as_raw()) };
    }

    #[test]
    fn test_insert_delete_lookup() {
        let guard = epoch::pin();
        let mut pg = Page::new(Fence::Lo, seed_chain(&guard));

        pg.insert(itm("a", "1", 0), &guard);
        pg.insert(itm("b", "2", 0), &guard);
        assert_eq!(lookup_val(&mut pg, "a", &guard), Some("1".into()));
        assert_eq!(lookup_val(&mut pg, "b", &guard), Some("2".into()));
        assert_eq!(lookup_val(&mut pg, "c", &guard), None);

        // Most recent write wins.
        pg.insert(itm("a", "3", 0), &guard);
        assert_eq!(lookup_val(&mut pg, "a", &guard), Some("3".into()));

        pg.delete(tomb("a", 0), &guard);
        assert_eq!(lookup_val(&mut pg, "a", &guard), None);
        assert_eq!(lookup_val(&mut pg, "b", &guard), Some("2".into()));

        assert_eq!(usize::from(pg.head_delta().chain_len), 4);
        destroy_page(pg);
    }

    #[test]
    fn test_compact_dedupes_and_drops_tombstones() {
        let guard = epoch::pin();
        let mut pg = Page::new(Fence::Lo, seed_chain(&guard));

        for i in 0..10 {
            pg.insert(itm(&format!("key{i:02}"), "v0", 0), &guard);
        }
        pg.insert(itm("key03", "v1", 0), &guard);
        pg.delete(tomb("key07", 0), &guard);

        let mut filter = CompactFilter::simple();
        pg.compact(&mut filter, &mut NoChainReader, &guard).unwrap();

        let head = pg.head_delta();
        assert_eq!(usize::from(head.chain_len), 0);
        assert_eq!(usize::from(head.num_items), 9);
        assert_eq!(head.state.version(), 1);

        assert_eq!(lookup_val(&mut pg, "key03", &guard), Some("v1".into()));
        assert_eq!(lookup_val(&mut pg, "key07", &guard), None);
        assert_eq!(lookup_val(&mut pg, "key00", &guard), Some("v0".into()));

        // The replaced chain is queued for retirement.
        assert_eq!(pg.free_list.len(), 1);
        for fc in pg.free_list.drain(..) {
            unsafe { destroy_chain(fc.head) };
        }
        destroy_page(pg);
    }

    #[test]
    fn test_split_key_boundary() {
        let guard = epoch::pin();
        let mut pg = Page::new(Fence::Lo, seed_chain(&guard));

        for i in 0..8 {
            pg.insert(itm(&format!("key{i}"), "v", 0), &guard);
        }
        let mut filter = CompactFilter::simple();
        pg.compact(&mut filter, &mut NoChainReader, &guard).unwrap();

        let new_pg = pg
            .split(&mut CompactFilter::simple(), &mut NoChainReader, &guard)
            .unwrap()
            .expect("split should produce a page");

        // Every item on the new page strictly exceeds the parent's.
        let split_key = new_pg.low.as_key().unwrap().to_vec();
        assert_eq!(pg.max_fence(), Fence::Key(split_key.clone().into()));
        match &new_pg.head_delta().op {
            DeltaOp::Base(items) => {
                assert!(!items.is_empty());
                for i in items {
                    assert!(i.key() >= split_key.as_slice());
                }
            }
            _ => panic!("new page head should be a base"),
        }

        // Parent no longer serves keys above the boundary.
        assert!(!pg.in_range(b"key7"));
        assert!(pg.in_range(b"key0"));

        destroy_page(new_pg);
        for fc in pg.free_list.drain(..) {
            unsafe { destroy_chain(fc.head) };
        }
        destroy_page(pg);
    }

    #[test]
    fn test_split_without_boundary_returns_none() {
        let guard = epoch::pin();
        let mut pg = Page::new(Fence::Lo, seed_chain(&guard));

        // A single distinct key cannot be split.
        pg.insert(itm("only", "v", 0), &guard);
        let mut filter = CompactFilter::simple();
        pg.compact(&mut filter, &mut NoChainReader, &guard).unwrap();

        assert!(pg
            .split(&mut CompactFilter::simple(), &mut NoChainReader, &guard)
            .unwrap()
            .is_none());
        for fc in pg.free_list.drain(..) {
            unsafe { destroy_chain(fc.head) };
        }
        destroy_page(pg);
    }

    #[test]
    fn test_merge_absorbs_sibling() {
        let guard = epoch::pin();
        let mut left = Page::new(Fence::Lo, seed_chain(&guard));
        for i in 0..6 {
            left.insert(itm(&format!("key{i}"), "v", 0), &guard);
        }
        let mut filter = CompactFilter::simple();
        left.compact(&mut filter, &mut NoChainReader, &guard)
            .unwrap();
        let mut right = left
            .split(&mut CompactFilter::simple(), &mut NoChainReader, &guard)
            .unwrap()
            .unwrap();

        assert_eq!(lookup_val(&mut left, "key5", &guard), None);
        assert_eq!(lookup_val(&mut right, "key5", &guard), Some("v".into()));

        right.close(&guard);
        assert!(right.need_removal());

        left.merge(&right, &guard);
        assert_eq!(left.max_fence(), Fence::Hi);
        for i in 0..6 {
            assert_eq!(
                lookup_val(&mut left, &format!("key{i}"), &guard),
                Some("v".into())
            );
        }

        // The sibling chain now belongs to the surviving chain.
        for fc in left.free_list.drain(..) {
            unsafe { destroy_chain(fc.head) };
        }
        destroy_page(left);
    }

    #[test]
    fn test_rollback_hides_range() {
        let guard = epoch::pin();
        let mut pg = Page::new(Fence::Lo, seed_chain(&guard));

        pg.insert(itm("k", "old", 5), &guard);
        pg.insert(itm("k", "new", 9), &guard);
        assert_eq!(lookup_val(&mut pg, "k", &guard), Some("new".into()));

        pg.rollback(8, 12, &guard);
        assert_eq!(lookup_val(&mut pg, "k", &guard), Some("old".into()));

        pg.rollback(2, 7, &guard);
        assert_eq!(lookup_val(&mut pg, "k", &guard), None);
        destroy_page(pg);
    }

    #[test]
    fn test_predicates() {
        let guard = epoch::pin();
        let mut pg = Page::new(Fence::Lo, seed_chain(&guard));

        for i in 0..5 {
            pg.insert(itm(&format!("k{i}"), "v", 0), &guard);
        }
        assert!(pg.need_compaction(4));
        assert!(!pg.need_compaction(5));
        // num_items only reflects consolidated state.
        assert!(!pg.need_split(3));

        let mut filter = CompactFilter::simple();
        pg.compact(&mut filter, &mut NoChainReader, &guard).unwrap();
        assert!(pg.need_split(3));
        assert!(!pg.need_merge(3));
        assert!(pg.need_merge(8));
        assert!(pg.needs_flush());
        assert!(!pg.is_evictable());

        pg.add_flush_record(0, 128, 0, &guard);
        assert!(!pg.needs_flush());
        assert!(pg.is_evictable());
        assert!(pg.is_flushed());

        for fc in pg.free_list.drain(..) {
            unsafe { destroy_chain(fc.head) };
        }
        destroy_page(pg);
    }
}
