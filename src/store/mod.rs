//! The page store: an ordered separator-key index mapping each page's low
//! fence to its delta-chain head, the SMO driver, writers, recovery, and
//! the background daemons.
//!
//! Every structural change follows the same protocol: build the new chain
//! privately, write any log blocks first, then publish with a single CAS
//! on the page slot. Losers discard their reserved log space with a
//! `Discard` marker, retire nothing, and retry; at most one in-flight SMO
//! per page succeeds.

pub mod cleaner;
pub mod iterator;
pub mod persistor;
pub mod stats;
pub mod swapper;
pub mod wctx;

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use byteorder::{BigEndian, ByteOrder};
use crossbeam_epoch::{self as epoch, Atomic, Guard, Shared};
use crossbeam_skiplist::map::Entry;
use crossbeam_skiplist::SkipMap;

use crate::config::Config;
use crate::error::Result;
use crate::flock::FileLock;
use crate::item::{Fence, Item};
use crate::log::Log;
use crate::lss::{Lss, Reservation};
use crate::mvcc::{self, MvccState, RecoveryPoint, Snapshot};
use crate::page::marshal::{
    decode_page_low, marshal, marshal_page_low, unmarshal_delta, FULL_MARSHAL,
};
use crate::page::{
    compute_mem_used, destroy_chain, destroy_prefix, seed_chain, Delta, Page, RetiredChain,
};
use crate::scheduler::Scheduler;

use iterator::EmberIterator;
use stats::{LssInfo, Stats, WStats};
use swapper::ClockHandle;
use wctx::{maybe_compress, maybe_decompress, WCtx};

const LOCK_FILE: &str = "ember.lock";
const LOG_FILE: &str = "log.data";
const RECOVERY_EVICT_INTERVAL: usize = 256;

pub(crate) const LSS_BLOCK_TYPE_SIZE: usize = 2;
pub(crate) const BT_PAGE_DATA: u16 = 0;
pub(crate) const BT_PAGE_RELOC: u16 = 1;
pub(crate) const BT_PAGE_UPDATE: u16 = 2;
pub(crate) const BT_PAGE_REMOVE: u16 = 3;
pub(crate) const BT_RECOVERY_POINTS: u16 = 4;
pub(crate) const BT_MAX_SN: u16 = 5;
pub(crate) const BT_DISCARD: u16 = 6;

pub(crate) fn block_type(payload: &[u8]) -> u16 {
    BigEndian::read_u16(&payload[..LSS_BLOCK_TYPE_SIZE])
}

pub(crate) fn write_block(lss: &Lss, res: &Reservation, i: usize, typ: u16, body: &[u8]) {
    let mut t = [0u8; LSS_BLOCK_TYPE_SIZE];
    BigEndian::write_u16(&mut t, typ);
    lss.fill_at(res, i, 0, &t);
    lss.fill_at(res, i, LSS_BLOCK_TYPE_SIZE, body);
}

/// Mark a lost reservation so visitors skip over it.
pub(crate) fn discard_block(lss: &Lss, res: &Reservation, i: usize) {
    let mut t = [0u8; LSS_BLOCK_TYPE_SIZE];
    BigEndian::write_u16(&mut t, BT_DISCARD);
    lss.fill_at(res, i, 0, &t);
}

/// One separator-index slot: the page's chain head (CAS-only) and the
/// clock sweeper's reference bit.
pub struct PageSlot {
    pub(crate) head: Atomic<Delta>,
    pub(crate) cache: AtomicBool,
}

impl PageSlot {
    fn new(head: Shared<'_, Delta>) -> PageSlot {
        PageSlot {
            head: Atomic::from(head.as_raw() as *const Delta),
            cache: AtomicBool::new(false),
        }
    }
}

pub(crate) type IndexEntry<'a> = Entry<'a, Fence, PageSlot>;

fn slot_ptr(entry: &IndexEntry<'_>) -> *const PageSlot {
    entry.value() as *const PageSlot
}

// Process-wide directory of live stores, so the swapper trigger can
// compare aggregate resident bytes against the quota.
static INSTANCES: OnceLock<SkipMap<u64, std::sync::Weak<Core>>> = OnceLock::new();
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);
static MEM_QUOTA: AtomicI64 = AtomicI64::new(1024 * 1024 * 1024 * 1024);

fn instances() -> &'static SkipMap<u64, std::sync::Weak<Core>> {
    INSTANCES.get_or_init(SkipMap::new)
}

/// Set the process-wide memory quota for all stores.
pub fn set_memory_quota(quota: i64) {
    MEM_QUOTA.store(quota, Ordering::Release);
}

/// Resident bytes across every live store in the process.
pub fn memory_in_use() -> i64 {
    let mut total = 0;
    for entry in instances().iter() {
        if let Some(core) = entry.value().upgrade() {
            total += core.memory_in_use();
        }
    }
    total
}

/// True while aggregate usage sits at or above the quota.
pub(crate) fn quota_exceeded() -> bool {
    memory_in_use() >= MEM_QUOTA.load(Ordering::Acquire)
}

/// Shared store state; writers, daemons and snapshots hold it through an
/// `Arc`.
pub struct Core {
    pub(crate) config: Config,
    pub(crate) index: SkipMap<Fence, PageSlot>,
    pub(crate) lss: Option<Lss>,

    pub(crate) stats_list: Mutex<Vec<Arc<WStats>>>,
    pub(crate) gstats: Arc<WStats>,

    // MVCC
    pub(crate) curr_sn: AtomicU64,
    pub(crate) gc_sn: AtomicU64,
    pub(crate) min_rp_sn: AtomicU64,
    pub(crate) rp_sns: RwLock<Vec<u64>>,
    pub(crate) mvcc: Mutex<MvccState>,

    /// Writers hold this shared; rollback takes it exclusively to quiesce
    /// them while it visits every page.
    pub(crate) store_lock: RwLock<()>,

    pub(crate) clock: Mutex<ClockHandle>,
    pub(crate) mem_pressure: AtomicBool,
    pub(crate) lss_pressure: AtomicBool,

    instance_id: u64,
    pub(crate) closed: AtomicBool,
}

impl Core {
    pub(crate) fn should_persist(&self) -> bool {
        self.lss.is_some()
    }

    pub(crate) fn read_page<'g>(&self, entry: &IndexEntry<'_>, guard: &'g Guard) -> Page<'g> {
        let head = entry.value().head.load(Ordering::Acquire, guard);
        Page::new(entry.key().clone(), head)
    }

    /// Resolve the page covering `key`, driving pending removals and
    /// installing swap-ins along the way.
    pub(crate) fn fetch<'a, 'g>(
        &'a self,
        key: &[u8],
        ctx: &mut WCtx,
        guard: &'g Guard,
    ) -> Result<(IndexEntry<'a>, Page<'g>)> {
        let target = Fence::from_key(key);
        'retry: loop {
            let mut entry = self
                .index
                .upper_bound(Bound::Included(&target))
                .expect("separator index lost its seed page");

            loop {
                let mut pg = self.read_page(&entry, guard);

                if !pg.in_range(key) {
                    let next = pg.next_pid();
                    match self.index.get(&next) {
                        Some(e) => {
                            entry = e;
                            continue;
                        }
                        None => {
                            // Sibling is mid-split or mid-merge.
                            std::thread::yield_now();
                            continue 'retry;
                        }
                    }
                }

                if pg.need_removal() {
                    self.try_page_removal(entry.key(), slot_ptr(&entry), ctx, guard)?;
                    continue 'retry;
                }

                if pg.is_evicted() {
                    self.try_page_swapin(&mut pg, ctx, guard)?;
                    if self.update_mapping(&entry, &mut pg, ctx, guard) {
                        ctx.sts.num_pages_swapin.fetch_add(1, Ordering::Relaxed);
                    } else {
                        ctx.sts.swapin_conflicts.fetch_add(1, Ordering::Relaxed);
                        continue 'retry;
                    }
                }

                entry.value().cache.store(true, Ordering::Release);
                return Ok((entry, pg));
            }
        }
    }

    /// Load the evicted content and splice it under a swap-in delta. The
    /// caller publishes with its next CAS.
    pub(crate) fn try_page_swapin<'g>(
        &self,
        pg: &mut Page<'g>,
        ctx: &mut WCtx,
        guard: &'g Guard,
    ) -> Result<bool> {
        if !pg.is_evicted() {
            return Ok(false);
        }

        // The terminal swapout carries the persisted location.
        let mut curr = pg.head;
        let offset = loop {
            let d = unsafe { curr.as_ref() }.expect("evicted page without a swapout delta");
            match &d.op {
                crate::page::DeltaOp::Swapout { offset, .. } => break *offset,
                _ => curr = d.next.load(Ordering::Acquire, guard),
            }
        };

        let loaded = crate::page::ChainReader::read_chain(ctx, offset, guard)?;
        pg.nrec_allocs += loaded.num_records;
        pg.mem_alloc += loaded.mem;
        pg.swap_in(loaded.head, guard);
        Ok(true)
    }

    /// Publish the page's new head. On success, retire replaced chains
    /// behind the epoch and settle accounting; on failure, drop the
    /// unpublished prefix.
    pub(crate) fn update_mapping<'g>(
        &self,
        entry: &IndexEntry<'_>,
        pg: &mut Page<'g>,
        ctx: &mut WCtx,
        guard: &'g Guard,
    ) -> bool {
        let slot = entry.value();
        match slot
            .head
            .compare_exchange(pg.prev_head, pg.head, Ordering::AcqRel, Ordering::Acquire, guard)
        {
            Ok(_) => {
                ctx.sts
                    .alloc_sz
                    .fetch_add(pg.mem_alloc as i64, Ordering::Relaxed);
                ctx.sts
                    .num_record_allocs
                    .fetch_add(pg.nrec_allocs as i64, Ordering::Relaxed);

                for fc in pg.free_list.drain(..) {
                    self.retire_chain(fc, ctx, guard);
                }

                pg.prev_head = pg.head;
                pg.mem_alloc = 0;
                pg.nrec_allocs = 0;
                true
            }
            Err(_) => {
                unsafe { destroy_prefix(pg.head.as_raw(), pg.prev_head.as_raw()) };
                pg.head = pg.prev_head;
                pg.free_list.clear();
                pg.mem_alloc = 0;
                pg.nrec_allocs = 0;
                false
            }
        }
    }

    fn retire_chain(&self, fc: RetiredChain, ctx: &mut WCtx, guard: &Guard) {
        let (nrecs, size) = compute_mem_used(fc.head);
        ctx.sts.free_sz.fetch_add(size as i64, Ordering::Relaxed);
        ctx.sts
            .num_record_frees
            .fetch_add(nrecs as i64, Ordering::Relaxed);
        if fc.evicted {
            ctx.sts
                .num_record_swapout
                .fetch_add(nrecs as i64, Ordering::Relaxed);
        }

        let sts = ctx.sts.clone();
        let head_addr = fc.head as usize;
        unsafe {
            guard.defer_unchecked(move || {
                destroy_chain(head_addr as *const Delta);
                sts.reclaim_sz.fetch_add(size as i64, Ordering::Relaxed);
            });
        }
    }

    fn index_page<'g>(&self, low: Fence, head: Shared<'g, Delta>, ctx: &WCtx, guard: &Guard) {
        let key_size = low.heap_size();
        let entry = self.index.get_or_insert(low, PageSlot::new(head));
        let current = entry.value().head.load(Ordering::Acquire, guard);
        assert!(
            current.as_raw() == head.as_raw(),
            "duplicate separator index entry"
        );
        ctx.sts
            .alloc_sz_index
            .fetch_add((key_size + std::mem::size_of::<PageSlot>()) as i64, Ordering::Relaxed);
    }

    fn unindex_page(&self, key: &Fence, ctx: &WCtx) {
        if let Some(entry) = self.index.remove(key) {
            let size = entry.key().heap_size() + std::mem::size_of::<PageSlot>();
            ctx.sts
                .free_sz_index
                .fetch_add(size as i64, Ordering::Relaxed);
        }
    }

    /// Pick and run at most one structure-modification path for the page,
    /// publishing with a CAS. Returns whether the page head was updated.
    pub(crate) fn try_smo<'g>(
        &self,
        entry: &IndexEntry<'_>,
        pg: &mut Page<'g>,
        ctx: &mut WCtx,
        do_update: bool,
        guard: &'g Guard,
    ) -> Result<bool> {
        let cfg = &self.config;

        if pg.need_compaction(cfg.max_delta_chain_len) {
            let mut filter = self.compact_filter();
            let stale = pg.compact(&mut filter, ctx, guard)?;
            if self.update_mapping(entry, pg, ctx, guard) {
                ctx.sts.compacts.fetch_add(1, Ordering::Relaxed);
                ctx.sts
                    .flush_data_sz
                    .fetch_sub(stale as i64, Ordering::Relaxed);
                Ok(true)
            } else {
                ctx.sts.compact_conflicts.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
        } else if pg.need_split(cfg.max_page_items) {
            let mut filter = self.compact_filter();
            let Some(mut new_pg) = pg.split(&mut filter, ctx, guard)? else {
                // No valid split boundary; consolidate instead.
                let mut filter = self.compact_filter();
                let stale = pg.compact(&mut filter, ctx, guard)?;
                let updated = self.update_mapping(entry, pg, ctx, guard);
                if updated {
                    ctx.sts
                        .flush_data_sz
                        .fetch_sub(stale as i64, Ordering::Relaxed);
                }
                return Ok(updated);
            };

            let mut lss_write = None;
            if let Some(lss) = &self.lss {
                // Replace one page with two pages: both blocks reserved and
                // written before the publishing CAS.
                let mut pg_buf = std::mem::take(&mut ctx.buf_enc_page);
                let mut split_buf = std::mem::take(&mut ctx.buf_enc_meta);
                let mut comp_buf = std::mem::take(&mut ctx.buf_compress);
                let mut comp_buf2 = std::mem::take(&mut ctx.buf_decompress);

                let enc = marshal(pg, &mut pg_buf, cfg.max_page_lss_segments, ctx, guard)?;
                let enc_split = marshal(&new_pg, &mut split_buf, 1, ctx, guard)?;

                let body = maybe_compress(
                    cfg.use_compression,
                    pg_buf.slice(0, enc.len),
                    &mut comp_buf,
                )?;
                let body_split = maybe_compress(
                    cfg.use_compression,
                    split_buf.slice(0, enc_split.len),
                    &mut comp_buf2,
                )?;

                let sizes = [
                    LSS_BLOCK_TYPE_SIZE + body.len(),
                    LSS_BLOCK_TYPE_SIZE + body_split.len(),
                ];
                let (offsets, res) = lss.reserve_multi(&sizes);

                let typ = page_flush_block_type(enc.num_segments);
                write_block(lss, &res, 0, typ, body);
                write_block(lss, &res, 1, BT_PAGE_DATA, body_split);
                let body_len = body.len() as u64;
                let body_split_len = body_split.len() as u64;

                pg.add_flush_record(offsets[0], body_len, enc.num_segments, guard);
                new_pg.add_flush_record(offsets[1], body_split_len, enc_split.num_segments, guard);

                ctx.buf_enc_page = pg_buf;
                ctx.buf_enc_meta = split_buf;
                ctx.buf_compress = comp_buf;
                ctx.buf_decompress = comp_buf2;

                lss_write = Some((res, body_len + body_split_len, enc.stale_fd));
            }

            if self.update_mapping(entry, pg, ctx, guard) {
                self.index_page(new_pg.low.clone(), new_pg.head, ctx, guard);
                ctx.sts.splits.fetch_add(1, Ordering::Relaxed);
                ctx.sts
                    .alloc_sz
                    .fetch_add(new_pg.mem_alloc as i64, Ordering::Relaxed);
                ctx.sts
                    .num_record_allocs
                    .fetch_add(new_pg.nrec_allocs as i64, Ordering::Relaxed);

                if let Some((res, fd, stale)) = lss_write {
                    ctx.sts
                        .flush_data_sz
                        .fetch_add(fd as i64 - stale as i64, Ordering::Relaxed);
                    self.lss.as_ref().unwrap().finalize(res);
                }
                Ok(true)
            } else {
                ctx.sts.split_conflicts.fetch_add(1, Ordering::Relaxed);
                unsafe { destroy_chain(new_pg.head.as_raw()) };
                new_pg.free_list.clear();

                if let Some((res, _, _)) = lss_write {
                    let lss = self.lss.as_ref().unwrap();
                    discard_block(lss, &res, 0);
                    discard_block(lss, &res, 1);
                    lss.finalize(res);
                }
                Ok(false)
            }
        } else if pg.need_merge(cfg.min_page_items) && self.is_mergable(entry, guard) {
            // Closing the page makes it immutable; the parent-removal SMO
            // splices it out of the index.
            self.try_page_swapin(pg, ctx, guard)?;
            pg.close(guard);

            if self.update_mapping(entry, pg, ctx, guard) {
                self.try_page_removal(entry.key(), slot_ptr(entry), ctx, guard)?;
                ctx.sts.merges.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            } else {
                ctx.sts.merge_conflicts.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
        } else if do_update {
            Ok(self.update_mapping(entry, pg, ctx, guard))
        } else {
            Ok(false)
        }
    }

    /// The head page never merges away, and the page must still be visible
    /// in the index.
    fn is_mergable(&self, entry: &IndexEntry<'_>, _guard: &Guard) -> bool {
        if *entry.key() == Fence::Lo {
            return false;
        }
        self.index
            .get(entry.key())
            .is_some_and(|e| slot_ptr(&e) == slot_ptr(entry))
    }

    /// Splice a closed page out of its parent: merge the dead chain into
    /// the left sibling, persist a removal marker plus the merged parent,
    /// CAS the parent, then drop the dead separator.
    pub(crate) fn try_page_removal(
        &self,
        dead_key: &Fence,
        dead_slot: *const PageSlot,
        ctx: &mut WCtx,
        guard: &Guard,
    ) -> Result<()> {
        loop {
            // Already spliced out by a competing writer?
            let Some(dead_entry) = self.index.get(dead_key) else {
                return Ok(());
            };
            if slot_ptr(&dead_entry) != dead_slot {
                return Ok(());
            }

            let dead_pg = self.read_page(&dead_entry, guard);
            if !dead_pg.need_removal() {
                return Ok(());
            }

            let parent_entry = self
                .index
                .upper_bound(Bound::Excluded(dead_key))
                .expect("closed page has no left sibling");
            let mut ppg = self.read_page(&parent_entry, guard);

            if ppg.need_removal() {
                // The parent is being removed itself; let that one finish.
                std::thread::yield_now();
                continue;
            }
            if ppg.next_pid() != *dead_key {
                // The parent split or merged concurrently.
                std::thread::yield_now();
                continue;
            }

            self.try_page_swapin(&mut ppg, ctx, guard)?;
            ppg.merge(&dead_pg, guard);

            let mut lss_write = None;
            if let Some(lss) = &self.lss {
                let mut meta_buf = std::mem::take(&mut ctx.buf_enc_meta);
                let mut pg_buf = std::mem::take(&mut ctx.buf_enc_page);
                let mut comp_buf = std::mem::take(&mut ctx.buf_compress);

                let meta_len = marshal_page_low(dead_key, &mut meta_buf);
                let enc = marshal(&ppg, &mut pg_buf, FULL_MARSHAL, ctx, guard)?;
                let body = maybe_compress(
                    self.config.use_compression,
                    pg_buf.slice(0, enc.len),
                    &mut comp_buf,
                )?;

                let sizes = [
                    LSS_BLOCK_TYPE_SIZE + meta_len,
                    LSS_BLOCK_TYPE_SIZE + body.len(),
                ];
                let (offsets, res) = lss.reserve_multi(&sizes);
                write_block(lss, &res, 0, BT_PAGE_REMOVE, meta_buf.slice(0, meta_len));
                write_block(lss, &res, 1, BT_PAGE_DATA, body);
                let body_len = body.len() as u64;

                ppg.add_flush_record(offsets[1], body_len, enc.num_segments, guard);

                ctx.buf_enc_meta = meta_buf;
                ctx.buf_enc_page = pg_buf;
                ctx.buf_compress = comp_buf;

                lss_write = Some((res, body_len, enc.stale_fd));
            }

            if self.update_mapping(&parent_entry, &mut ppg, ctx, guard) {
                self.unindex_page(dead_key, ctx);
                if let Some((res, fd, stale)) = lss_write {
                    ctx.sts
                        .flush_data_sz
                        .fetch_add(fd as i64 - stale as i64, Ordering::Relaxed);
                    self.lss.as_ref().unwrap().finalize(res);
                }
                return Ok(());
            }

            if let Some((res, _, _)) = lss_write {
                let lss = self.lss.as_ref().unwrap();
                discard_block(lss, &res, 0);
                discard_block(lss, &res, 1);
                lss.finalize(res);
            }
            std::thread::yield_now();
        }
    }

    /// Replay the log from head to tail, rebuilding the page index, then
    /// stitch right siblings and verify key coverage.
    fn do_recovery(&self, ctx: &mut WCtx) -> Result<()> {
        let Some(lss) = &self.lss else {
            return Ok(());
        };
        let use_comp = self.config.use_compression;
        let guard = unsafe { epoch::unprotected() };

        let mut rps: Option<(u16, Vec<RecoveryPoint>)> = None;
        let mut max_sn = 0u64;
        let mut blocks = 0usize;
        let mut ra = lss.new_ra_buffer(crate::log::BLOCK_SIZE * 16);

        let mut decompress_buf = std::mem::take(&mut ctx.buf_decompress);
        let visit = lss.visitor(
            &mut |offset, payload| {
                blocks += 1;
                match block_type(payload) {
                    BT_DISCARD => {}
                    BT_RECOVERY_POINTS => {
                        rps = Some(mvcc::unmarshal_recovery_points(
                            &payload[LSS_BLOCK_TYPE_SIZE..],
                        ));
                    }
                    BT_MAX_SN => {
                        max_sn = BigEndian::read_u64(&payload[LSS_BLOCK_TYPE_SIZE..]);
                    }
                    BT_PAGE_REMOVE => {
                        let low = match decode_page_low(&payload[LSS_BLOCK_TYPE_SIZE..]) {
                            Some(k) => Fence::Key(k.into()),
                            None => Fence::Lo,
                        };
                        if let Some(entry) = self.index.get(&low) {
                            let pg = self.read_page(&entry, guard);
                            self.gstats.flush_data_sz.fetch_sub(
                                pg.flush_data_size(guard) as i64,
                                Ordering::Relaxed,
                            );
                            let head = pg.head.as_raw();
                            self.index.remove(&low);
                            unsafe { destroy_chain(head) };
                        }
                    }
                    typ @ (BT_PAGE_DATA | BT_PAGE_RELOC | BT_PAGE_UPDATE) => {
                        let body = &payload[LSS_BLOCK_TYPE_SIZE..];
                        let flush_size = body.len() as u64;
                        let data = maybe_decompress(use_comp, body, &mut decompress_buf)?;
                        let decoded = unmarshal_delta(data, guard);
                        let full_block = typ == BT_PAGE_DATA || typ == BT_PAGE_RELOC;
                        let low = decoded.low.clone();

                        match self.index.get(&low) {
                            None => {
                                if full_block {
                                    let mut pg = decoded.into_page();
                                    pg.add_flush_record(offset, flush_size, 1, guard);
                                    self.index.insert(low, PageSlot::new(pg.head));
                                    self.gstats
                                        .flush_data_sz
                                        .fetch_add(flush_size as i64, Ordering::Relaxed);
                                } else {
                                    // Update block for a page removed later
                                    // in history; nothing to apply it to.
                                    unsafe { destroy_chain(decoded.head.as_raw()) };
                                }
                            }
                            Some(entry) => {
                                self.gstats
                                    .flush_data_sz
                                    .fetch_add(flush_size as i64, Ordering::Relaxed);
                                let curr_pg = self.read_page(&entry, guard);
                                let mut pg = decoded.into_page();

                                if full_block {
                                    // A full block supersedes the chain.
                                    self.gstats.flush_data_sz.fetch_sub(
                                        curr_pg.flush_data_size(guard) as i64,
                                        Ordering::Relaxed,
                                    );
                                    let old = curr_pg.head.as_raw();
                                    pg.add_flush_record(offset, flush_size, 1, guard);
                                    entry.value().head.store(pg.head, Ordering::Release);
                                    unsafe { destroy_chain(old) };
                                } else {
                                    let segs = curr_pg.flush_info().num_segments;
                                    pg.append(curr_pg);
                                    pg.add_flush_record(offset, flush_size, segs + 1, guard);
                                    entry.value().head.store(pg.head, Ordering::Release);
                                }
                            }
                        }
                    }
                    typ => panic!("unknown block type {typ} at offset {offset}"),
                }

                if blocks % RECOVERY_EVICT_INTERVAL == 0 && quota_exceeded() {
                    let _ = swapper::try_evict_pages(self, ctx);
                }
                Ok(true)
            },
            &mut ra,
        );
        ctx.buf_decompress = decompress_buf;
        visit?;

        if let Some((version, points)) = rps {
            let mut mv = self.mvcc.lock().unwrap();
            mv.rp_version = version;
            mv.recovery_points = points;
            let sns: Vec<u64> = mv.recovery_points.iter().map(|rp| rp.sn()).collect();
            self.min_rp_sn
                .store(sns.first().copied().unwrap_or(0), Ordering::Release);
            *self.rp_sns.write().unwrap() = sns;
        }
        if max_sn > 0 {
            self.curr_sn.store(max_sn, Ordering::Release);
        }

        self.link_siblings(guard);
        self.gc_sn
            .store(self.curr_sn.load(Ordering::Acquire), Ordering::Release);
        Ok(())
    }

    /// Initialize right siblings so every page's high fence equals its
    /// successor's low fence. Coverage violations here are structural
    /// invariant breaks, not recoverable errors.
    fn link_siblings(&self, guard: &Guard) {
        let mut prev: Option<Page> = None;
        for entry in self.index.iter() {
            let pg = self.read_page(&entry, guard);
            if let Some(mut last) = prev.take() {
                assert!(
                    last.max_fence() == *entry.key(),
                    "page fence does not meet its successor's low key"
                );
                unsafe { last.set_next(entry.key().clone()) };
            } else {
                assert!(
                    *entry.key() == Fence::Lo,
                    "first page does not cover the low sentinel"
                );
            }
            prev = Some(pg);
        }

        if let Some(mut last) = prev {
            unsafe { last.set_next(Fence::Hi) };
            assert!(
                last.max_fence() == Fence::Hi,
                "last page does not cover the high sentinel"
            );
        }
    }

    pub(crate) fn memory_in_use(&self) -> i64 {
        let mut mem = 0;
        for sts in self.stats_list.lock().unwrap().iter() {
            mem += sts.alloc_sz.load(Ordering::Relaxed) - sts.free_sz.load(Ordering::Relaxed);
            mem += sts.alloc_sz_index.load(Ordering::Relaxed)
                - sts.free_sz_index.load(Ordering::Relaxed);
        }
        mem
    }

    pub(crate) fn lss_info(&self) -> LssInfo {
        let mut data = 0i64;
        for sts in self.stats_list.lock().unwrap().iter() {
            data += sts.flush_data_sz.load(Ordering::Relaxed);
        }
        let used = self.lss.as_ref().map_or(0, |l| l.used_space()) as i64;
        let frag = if used > 0 {
            ((used - data).max(0) * 100) / used
        } else {
            0
        };
        LssInfo {
            frag_percent: frag,
            data_size: data,
            used_space: used,
        }
    }

    pub(crate) fn collect_stats(&self) -> Stats {
        let mut sts = Stats {
            memory_quota: MEM_QUOTA.load(Ordering::Acquire),
            num_pages: self.index.len() as i64,
            mem_throttled: self.mem_pressure.load(Ordering::Acquire),
            lss_throttled: self.lss_pressure.load(Ordering::Acquire),
            ..Default::default()
        };
        for w in self.stats_list.lock().unwrap().iter() {
            w.merge_into(&mut sts);
        }
        sts.mem_sz = sts.alloc_sz - sts.free_sz;
        sts.mem_sz_index = sts.alloc_sz_index - sts.free_sz_index;

        if let Some(lss) = &self.lss {
            sts.bytes_written = lss.bytes_written() as i64;
            let info = self.lss_info();
            sts.lss_frag = info.frag_percent;
            sts.lss_data_size = info.data_size;
            sts.lss_used_space = info.used_space;
            if sts.bytes_incoming > 0 {
                sts.write_amp = sts.bytes_written as f64 / sts.bytes_incoming as f64;
            }
        }

        let cached = sts.num_record_allocs - sts.num_record_frees;
        let swapped = sts.num_record_swapout - sts.num_record_swapin;
        if cached + swapped > 0 {
            sts.resident_ratio = cached as f64 / (cached + swapped) as f64;
        }
        if sts.cache_hits + sts.cache_misses > 0 {
            sts.cache_hit_ratio =
                sts.cache_hits as f64 / (sts.cache_hits + sts.cache_misses) as f64;
        }
        sts
    }
}

pub(crate) fn page_flush_block_type(num_segments: u32) -> u16 {
    if num_segments > 0 {
        BT_PAGE_UPDATE
    } else {
        BT_PAGE_DATA
    }
}

/// An embedded, persistent, ordered key/value store built on delta-chained
/// pages over a log-structured store.
pub struct Ember {
    pub(crate) core: Arc<Core>,
    scheduler: Option<Scheduler>,
    lock: Option<FileLock>,
}

impl Ember {
    /// Open (or create) a store. With a directory configured this
    /// recovers the page index from the log; without one the store is
    /// memory-only.
    pub fn open(config: Config) -> Result<Ember> {
        let mut lock = None;
        let lss = match &config.dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                lock = Some(FileLock::lock(dir.join(LOCK_FILE))?);
                let log = Log::open(&dir.join(LOG_FILE), config.lss_log_segment_size)?;
                Some(Lss::new(
                    log,
                    config.flush_buffer_size,
                    config.num_flush_buffers,
                    config.sync_interval,
                ))
            }
            None => None,
        };

        let gstats = WStats::new_shared();
        let core = Arc::new(Core {
            config,
            index: SkipMap::new(),
            lss,
            stats_list: Mutex::new(vec![gstats.clone()]),
            gstats,
            curr_sn: AtomicU64::new(0),
            gc_sn: AtomicU64::new(0),
            min_rp_sn: AtomicU64::new(0),
            rp_sns: RwLock::new(Vec::new()),
            mvcc: Mutex::new(MvccState::default()),
            store_lock: RwLock::new(()),
            clock: Mutex::new(ClockHandle::default()),
            mem_pressure: AtomicBool::new(false),
            lss_pressure: AtomicBool::new(false),
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
        });

        instances().insert(core.instance_id, Arc::downgrade(&core));

        let mut gctx = WCtx::with_stats(core.clone(), core.gstats.clone());
        core.do_recovery(&mut gctx)?;

        // Seed page covering the whole key space, unless recovery found
        // one.
        if core.index.is_empty() {
            let guard = epoch::pin();
            let head = seed_chain(&guard);
            core.index.insert(Fence::Lo, PageSlot::new(head));
        }

        mvcc::init_snapshots(&core);

        let scheduler = if core.should_persist() {
            let s = Scheduler::new();
            if core.config.auto_lss_cleaning {
                s.register(Arc::new(cleaner::CleanerTask::new(core.clone())));
            }
            if core.config.auto_swapper {
                for _ in 0..core.config.num_evictor_threads {
                    s.register(Arc::new(swapper::SwapperTask::new(core.clone())));
                }
            }
            s.register(Arc::new(MonitorTask { core: core.clone() }));
            Some(s)
        } else {
            None
        };

        drop(gctx);
        Ok(Ember {
            core,
            scheduler,
            lock,
        })
    }

    /// Flush, stop the daemons and release the directory lock.
    pub fn close(&mut self) -> Result<()> {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if self.core.config.enable_snapshots {
            self.new_snapshot().close();
        }

        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }

        // Drop the store's snapshot reference; user-held snapshots keep
        // the core alive on their own.
        self.core.mvcc.lock().unwrap().curr_snapshot = None;

        if self.core.should_persist() {
            self.persist_all()?;
            self.core.lss.as_ref().unwrap().close()?;
        }

        instances().remove(&self.core.instance_id);
        if let Some(lock) = self.lock.take() {
            let _ = lock.unlock();
        }
        Ok(())
    }

    pub fn new_writer(&self) -> Writer {
        Writer {
            ctx: WCtx::new(self.core.clone()),
        }
    }

    pub fn new_reader(&self) -> mvcc::Reader {
        mvcc::Reader::new(self.core.clone())
    }

    /// Ordered iterator over the latest visible records.
    pub fn iterator(&self) -> EmberIterator {
        EmberIterator::latest(self.core.clone())
    }

    pub fn new_snapshot(&self) -> Arc<Snapshot> {
        mvcc::new_snapshot(&self.core)
    }

    pub fn create_recovery_point(&self, snap: &Arc<Snapshot>, meta: Vec<u8>) -> Result<()> {
        mvcc::create_recovery_point(self, snap, meta)
    }

    pub fn get_recovery_points(&self) -> Vec<RecoveryPoint> {
        self.core.mvcc.lock().unwrap().recovery_points.clone()
    }

    pub fn remove_recovery_point(&self, rp: &RecoveryPoint) {
        mvcc::remove_recovery_point(self, rp);
    }

    /// Roll the store back to a recovery point, discarding newer writes.
    pub fn rollback(&self, rp: &RecoveryPoint) -> Result<Arc<Snapshot>> {
        mvcc::rollback(self, rp)
    }

    /// Persist every dirty page and sync the log.
    pub fn persist_all(&self) -> Result<()> {
        persistor::persist_all(&self.core, false)
    }

    /// Persist and evict every page.
    pub fn evict_all(&self) -> Result<()> {
        persistor::persist_all(&self.core, true)
    }

    /// Consolidate every page.
    pub fn compact_all(&self) -> Result<()> {
        let mut ctx = WCtx::with_stats(self.core.clone(), self.core.gstats.clone());
        let keys: Vec<Fence> = self.core.index.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let guard = epoch::pin();
            let Some(entry) = self.core.index.get(&key) else {
                continue;
            };
            let mut pg = self.core.read_page(&entry, &guard);
            if pg.is_empty() || pg.need_removal() {
                continue;
            }
            let mut filter = self.core.compact_filter();
            let stale = pg.compact(&mut filter, &mut ctx, &guard)?;
            if self.core.update_mapping(&entry, &mut pg, &mut ctx, &guard) {
                ctx.sts.compacts.fetch_add(1, Ordering::Relaxed);
                ctx.sts
                    .flush_data_sz
                    .fetch_sub(stale as i64, Ordering::Relaxed);
            } else {
                ctx.sts.compact_conflicts.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Resident bytes held by this store.
    pub fn memory_in_use(&self) -> i64 {
        self.core.memory_in_use()
    }

    pub fn get_stats(&self) -> Stats {
        self.core.collect_stats()
    }

    pub fn get_lss_info(&self) -> LssInfo {
        self.core.lss_info()
    }
}

impl Drop for Ember {
    fn drop(&mut self) {
        let _ = self.close();

        // Free the page chains only when nothing else can reach them.
        if Arc::strong_count(&self.core) == 1 {
            let guard = unsafe { epoch::unprotected() };
            while let Some(entry) = self.core.index.pop_front() {
                let head = entry.value().head.load(Ordering::Acquire, guard);
                unsafe { destroy_chain(head.as_raw()) };
            }
        }
    }
}

/// Background memory/log pressure monitor.
struct MonitorTask {
    core: Arc<Core>,
}

impl crate::scheduler::BackgroundTask for MonitorTask {
    fn name(&self) -> &'static str {
        "monitor"
    }

    fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(100)
    }

    fn execute(&self, _ctx: crate::scheduler::Context) -> Result<()> {
        let mem = quota_exceeded();
        if mem != self.core.mem_pressure.load(Ordering::Acquire) {
            self.core.mem_pressure.store(mem, Ordering::Release);
        }
        let lss = cleaner::trigger_lss_cleaner(&self.core);
        if lss != self.core.lss_pressure.load(Ordering::Acquire) {
            self.core.lss_pressure.store(lss, Ordering::Release);
        }
        Ok(())
    }
}

/// A concurrent writer handle. Writers may be used from one thread at a
/// time each; any number of writers may run in parallel.
pub struct Writer {
    pub(crate) ctx: WCtx,
}

impl Writer {
    pub(crate) fn core(&self) -> Arc<Core> {
        self.ctx.core.clone()
    }

    /// Prepend an insert delta for the item and run the SMO driver.
    pub(crate) fn insert_item(&mut self, itm: Item) -> Result<()> {
        let core = self.core();
        let _quiesce = core.store_lock.read().unwrap();
        self.ctx.try_throttle_lss();
        self.ctx.try_throttle_memory();

        let size = itm.size() as i64;
        loop {
            let guard = epoch::pin();
            let (entry, mut pg) = core.fetch(itm.key(), &mut self.ctx, &guard)?;
            let reads = self.ctx.sts.num_lss_reads.load(Ordering::Relaxed);
            pg.insert(itm.clone(), &guard);

            if core.try_smo(&entry, &mut pg, &mut self.ctx, true, &guard)? {
                self.ctx.sts.inserts.fetch_add(1, Ordering::Relaxed);
                self.ctx.sts.bytes_incoming.fetch_add(size, Ordering::Relaxed);
                self.note_cache(reads);
                return Ok(());
            }
            self.ctx.sts.insert_conflicts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Prepend a delete delta for the key and run the SMO driver.
    pub(crate) fn delete_item(&mut self, itm: Item) -> Result<()> {
        let core = self.core();
        let _quiesce = core.store_lock.read().unwrap();
        self.ctx.try_throttle_lss();

        let size = itm.size() as i64;
        loop {
            let guard = epoch::pin();
            let (entry, mut pg) = core.fetch(itm.key(), &mut self.ctx, &guard)?;
            let reads = self.ctx.sts.num_lss_reads.load(Ordering::Relaxed);
            pg.delete(itm.clone(), &guard);

            if core.try_smo(&entry, &mut pg, &mut self.ctx, true, &guard)? {
                self.ctx.sts.deletes.fetch_add(1, Ordering::Relaxed);
                self.ctx.sts.bytes_incoming.fetch_add(size, Ordering::Relaxed);
                self.note_cache(reads);
                return Ok(());
            }
            self.ctx.sts.delete_conflicts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Newest visible record for the key, or None.
    pub(crate) fn lookup_item(&mut self, key: &[u8]) -> Result<Option<Item>> {
        let core = self.core();
        let _quiesce = core.store_lock.read().unwrap();

        let guard = epoch::pin();
        let (entry, mut pg) = core.fetch(key, &mut self.ctx, &guard)?;
        let reads = self.ctx.sts.num_lss_reads.load(Ordering::Relaxed);
        let ret = pg.lookup(key, &mut self.ctx, &guard)?;

        // Passive SMO pass keeps the chain tidy without publishing unless
        // a predicate fires.
        core.try_smo(&entry, &mut pg, &mut self.ctx, false, &guard)?;
        self.note_cache(reads);
        Ok(ret)
    }

    fn note_cache(&self, reads_before: i64) {
        if self.ctx.sts.num_lss_reads.load(Ordering::Relaxed) > reads_before {
            self.ctx.sts.cache_misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.ctx.sts.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::tmpfs::TempDir;
    use std::time::Duration;

    fn small_pages(config: Config) -> Config {
        config
            .max_delta_chain_len(40)
            .max_page_items(100)
            .min_page_items(10)
            .sync_interval(Duration::from_secs(0))
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key-{i:08}").into_bytes()
    }

    fn val(i: u32) -> Vec<u8> {
        format!("val-{i}").into_bytes()
    }

    #[test]
    fn test_insert_delete_lookup() {
        let store = Ember::open(Config::in_memory()).unwrap();
        let mut w = store.new_writer();

        w.insert_kv(b"alpha", b"1").unwrap();
        w.insert_kv(b"beta", b"2").unwrap();
        assert_eq!(w.lookup_kv(b"alpha").unwrap(), b"1");
        assert_eq!(w.lookup_kv(b"beta").unwrap(), b"2");
        assert_eq!(w.lookup_kv(b"gamma"), Err(Error::ItemNotFound));

        w.insert_kv(b"alpha", b"updated").unwrap();
        assert_eq!(w.lookup_kv(b"alpha").unwrap(), b"updated");

        w.delete_kv(b"alpha").unwrap();
        assert_eq!(w.lookup_kv(b"alpha"), Err(Error::ItemNotFound));
        assert_eq!(w.lookup_kv(b"beta").unwrap(), b"2");

        let sts = store.get_stats();
        assert_eq!(sts.inserts, 3);
        assert_eq!(sts.deletes, 1);
    }

    #[test]
    fn test_key_too_large() {
        let store = Ember::open(Config::in_memory()).unwrap();
        let mut w = store.new_writer();
        let huge = vec![b'k'; 0x2000_0000];
        assert_eq!(w.insert_kv(&huge, b"v"), Err(Error::KeyTooLarge));
    }

    #[test]
    fn test_splits_cover_all_keys() {
        let store = Ember::open(small_pages(Config::in_memory())).unwrap();
        let mut w = store.new_writer();

        let n = 5_000u32;
        for i in 0..n {
            w.insert_kv(&key(i), &val(i)).unwrap();
        }
        for i in 0..n {
            assert_eq!(w.lookup_kv(&key(i)).unwrap(), val(i), "key {i}");
        }

        let sts = store.get_stats();
        assert!(sts.splits > 0, "expected splits, got {}", sts.splits);
        assert!(
            sts.num_pages > (n as i64) / 400,
            "too few pages: {}",
            sts.num_pages
        );

        // Key coverage: each page's high fence is its successor's low.
        let guard = crossbeam_epoch::pin();
        let mut prev_hi: Option<Fence> = None;
        for entry in store.core.index.iter() {
            let pg = store.core.read_page(&entry, &guard);
            if let Some(hi) = prev_hi {
                assert_eq!(hi, *entry.key());
            } else {
                assert_eq!(*entry.key(), Fence::Lo);
            }
            prev_hi = Some(pg.max_fence());
        }
        assert_eq!(prev_hi, Some(Fence::Hi));
    }

    #[test]
    fn test_deletes_trigger_merges() {
        let store = Ember::open(small_pages(Config::in_memory())).unwrap();
        let mut w = store.new_writer();

        let n = 4_000u32;
        for i in 0..n {
            w.insert_kv(&key(i), &val(i)).unwrap();
        }
        for i in 0..(n - 500) {
            w.delete_kv(&key(i)).unwrap();
        }
        for i in 0..(n - 500) {
            assert_eq!(w.lookup_kv(&key(i)), Err(Error::ItemNotFound), "key {i}");
        }
        for i in (n - 500)..n {
            assert_eq!(w.lookup_kv(&key(i)).unwrap(), val(i), "key {i}");
        }

        let sts = store.get_stats();
        assert!(sts.merges > 0, "expected merges, got {}", sts.merges);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = TempDir::new().unwrap();
        let n = 1_300u32;
        let deleted = 1_000u32;

        {
            let store = Ember::open(small_pages(Config::new(dir.path()))).unwrap();
            let mut w = store.new_writer();
            for i in 0..n {
                w.insert_kv(&key(i), &val(i)).unwrap();
            }
            for i in 0..deleted {
                w.delete_kv(&key(i)).unwrap();
            }
            store.persist_all().unwrap();
        }

        let store = Ember::open(small_pages(Config::new(dir.path()))).unwrap();
        let mut w = store.new_writer();
        for i in 0..deleted {
            assert_eq!(w.lookup_kv(&key(i)), Err(Error::ItemNotFound), "key {i}");
        }
        for i in deleted..n {
            assert_eq!(w.lookup_kv(&key(i)).unwrap(), val(i), "key {i}");
        }
    }

    #[test]
    fn test_eviction_transparency() {
        let dir = TempDir::new().unwrap();
        let store = Ember::open(small_pages(Config::new(dir.path()))).unwrap();
        let mut w = store.new_writer();

        let n = 1_000u32;
        for i in 0..n {
            w.insert_kv(&key(i), &val(i)).unwrap();
        }
        let before = store.memory_in_use();

        store.evict_all().unwrap();
        assert!(
            store.memory_in_use() < before,
            "memory did not drop: {} -> {}",
            before,
            store.memory_in_use()
        );

        for i in 0..n {
            assert_eq!(w.lookup_kv(&key(i)).unwrap(), val(i), "key {i}");
        }

        let sts = store.get_stats();
        assert!(sts.num_pages_swapout > 0);
        assert_eq!(sts.num_pages_swapout, sts.num_pages_swapin);
    }

    #[test]
    fn test_compact_all_preserves_data() {
        let store = Ember::open(small_pages(Config::in_memory())).unwrap();
        let mut w = store.new_writer();
        for i in 0..500u32 {
            w.insert_kv(&key(i), &val(i)).unwrap();
        }
        store.compact_all().unwrap();
        for i in 0..500u32 {
            assert_eq!(w.lookup_kv(&key(i)).unwrap(), val(i));
        }
        assert!(store.get_stats().compacts > 0);
    }

    #[test]
    fn test_iterator_ordered() {
        let store = Ember::open(small_pages(Config::in_memory())).unwrap();
        let mut w = store.new_writer();

        // Insert out of order, with one deletion and one update.
        for i in [7u32, 3, 9, 1, 5, 0, 8, 2, 6, 4] {
            w.insert_kv(&key(i), &val(i)).unwrap();
        }
        w.delete_kv(&key(3)).unwrap();
        w.insert_kv(&key(5), b"five").unwrap();

        let got: Vec<(Vec<u8>, Vec<u8>)> = store
            .iterator()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        let mut expect: Vec<(Vec<u8>, Vec<u8>)> = (0..10u32)
            .filter(|i| *i != 3)
            .map(|i| {
                let v = if i == 5 { b"five".to_vec() } else { val(i) };
                (key(i), v)
            })
            .collect();
        expect.sort();
        assert_eq!(got, expect);
    }

    #[test]
    fn test_iterator_seek() {
        let store = Ember::open(Config::in_memory()).unwrap();
        let mut w = store.new_writer();
        for i in 0..100u32 {
            w.insert_kv(&key(i), &val(i)).unwrap();
        }

        let mut it = store.iterator();
        it.seek(&key(90)).unwrap();
        let rest: Vec<_> = it.collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(rest.len(), 10);
        assert_eq!(rest[0].0, key(90));
    }

    #[test]
    fn test_snapshot_isolation() {
        let store = Ember::open(Config::in_memory().enable_snapshots(true)).unwrap();
        let mut w = store.new_writer();

        w.insert_kv(b"k", b"v1").unwrap();
        let snap1 = store.new_snapshot();
        w.insert_kv(b"k", b"v2").unwrap();
        w.insert_kv(b"other", b"x").unwrap();
        let snap2 = store.new_snapshot();
        w.delete_kv(b"other").unwrap();

        let reader = store.new_reader();

        let view1: Vec<_> = reader
            .new_snapshot_iterator(&snap1)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(view1, vec![(b"k".to_vec(), b"v1".to_vec())]);

        let view2: Vec<_> = reader
            .new_snapshot_iterator(&snap2)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(
            view2,
            vec![
                (b"k".to_vec(), b"v2".to_vec()),
                (b"other".to_vec(), b"x".to_vec()),
            ]
        );

        // Latest view: the delete is visible.
        assert_eq!(w.lookup_kv(b"other"), Err(Error::ItemNotFound));

        snap1.close();
        snap2.close();
    }

    #[test]
    fn test_snapshot_survives_compaction() {
        let store = Ember::open(
            Config::in_memory()
                .enable_snapshots(true)
                .max_delta_chain_len(10),
        )
        .unwrap();
        let mut w = store.new_writer();

        w.insert_kv(b"k", b"old").unwrap();
        let snap = store.new_snapshot();

        // Push enough updates through to force consolidations.
        for i in 0..100u32 {
            w.insert_kv(b"k", format!("v{i}").as_bytes()).unwrap();
        }

        let reader = store.new_reader();
        let view: Vec<_> = reader
            .new_snapshot_iterator(&snap)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(view, vec![(b"k".to_vec(), b"old".to_vec())]);
        snap.close();
    }

    #[test]
    fn test_recovery_point_roundtrip() {
        let dir = TempDir::new().unwrap();
        {
            let store =
                Ember::open(Config::new(dir.path()).enable_snapshots(true)).unwrap();
            let mut w = store.new_writer();
            w.insert_kv(b"a", b"1").unwrap();
            let snap = store.new_snapshot();
            store
                .create_recovery_point(&snap, b"checkpoint-one".to_vec())
                .unwrap();
            snap.close();
        }

        let store = Ember::open(Config::new(dir.path()).enable_snapshots(true)).unwrap();
        let rps = store.get_recovery_points();
        assert_eq!(rps.len(), 1);
        assert_eq!(rps[0].meta(), b"checkpoint-one");

        store.remove_recovery_point(&rps[0]);
        assert!(store.get_recovery_points().is_empty());
    }

    #[test]
    fn test_rollback() {
        let dir = TempDir::new().unwrap();
        let store = Ember::open(Config::new(dir.path()).enable_snapshots(true)).unwrap();
        let mut w = store.new_writer();

        w.insert_kv(b"a", b"1").unwrap();
        let snap = store.new_snapshot();
        store.create_recovery_point(&snap, b"rp".to_vec()).unwrap();
        snap.close();

        w.insert_kv(b"a", b"2").unwrap();
        w.insert_kv(b"b", b"3").unwrap();

        let rps = store.get_recovery_points();
        let new_snap = store.rollback(&rps[0]).unwrap();

        assert_eq!(w.lookup_kv(b"a").unwrap(), b"1");
        assert_eq!(w.lookup_kv(b"b"), Err(Error::ItemNotFound));
        new_snap.close();

        // Recovery points newer than the target would have been trimmed;
        // ours is the target itself.
        assert_eq!(store.get_recovery_points().len(), 1);
    }

    #[test]
    fn test_cleaner_conservativeness() {
        let dir = TempDir::new().unwrap();
        let store = Ember::open(small_pages(Config::new(dir.path()))).unwrap();
        let mut w = store.new_writer();

        let n = 500u32;
        for i in 0..n {
            w.insert_kv(&key(i), &val(i)).unwrap();
        }
        store.persist_all().unwrap();

        // Rewrite everything so the older blocks become garbage.
        for i in 0..n {
            w.delete_kv(&key(i)).unwrap();
            w.insert_kv(&key(i), &val(i + 1)).unwrap();
        }
        store.persist_all().unwrap();

        let head_before = store.core.lss.as_ref().unwrap().head_offset();
        let mut ctx = wctx::WCtx::with_stats(store.core.clone(), store.core.gstats.clone());
        cleaner::run_cleaner_pass(&store.core, &mut ctx, &|| true).unwrap();

        // Everything visible before the pass is visible after it.
        for i in 0..n {
            assert_eq!(w.lookup_kv(&key(i)).unwrap(), val(i + 1), "key {i}");
        }
        assert!(
            store.core.lss.as_ref().unwrap().head_offset() >= head_before,
            "cleaner moved the head backwards"
        );
    }

    #[test]
    fn test_concurrent_writers() {
        let store = std::sync::Arc::new(
            Ember::open(small_pages(Config::in_memory())).unwrap(),
        );

        let threads = 4u32;
        let per_thread = 2_000u32;
        std::thread::scope(|scope| {
            for t in 0..threads {
                let store = store.clone();
                scope.spawn(move || {
                    let mut w = store.new_writer();
                    for i in 0..per_thread {
                        let k = key(t * per_thread + i);
                        w.insert_kv(&k, &val(t)).unwrap();
                    }
                });
            }
        });

        let mut w = store.new_writer();
        for t in 0..threads {
            for i in 0..per_thread {
                let k = key(t * per_thread + i);
                assert_eq!(w.lookup_kv(&k).unwrap(), val(t));
            }
        }

        let sts = store.get_stats();
        assert_eq!(sts.inserts, i64::from(threads * per_thread));
    }

    #[test]
    fn test_lss_monotonicity() {
        let dir = TempDir::new().unwrap();
        let store = Ember::open(small_pages(Config::new(dir.path()))).unwrap();
        let mut w = store.new_writer();

        let lss = store.core.lss.as_ref().unwrap();
        let mut last_tail = lss.tail_offset();
        for i in 0..200u32 {
            w.insert_kv(&key(i), &val(i)).unwrap();
            if i % 50 == 0 {
                store.persist_all().unwrap();
                let tail = lss.tail_offset();
                assert!(tail >= last_tail);
                assert!(lss.head_offset() <= tail);
                last_tail = tail;
            }
        }
    }

    #[test]
    fn test_double_open_locked() {
        let dir = TempDir::new().unwrap();
        let _store = Ember::open(Config::new(dir.path())).unwrap();
        assert!(matches!(
            Ember::open(Config::new(dir.path())),
            Err(Error::Io(_))
        ));
    }
}
