//! MVCC: snapshots, recovery points and rollback.
//!
//! Writers stamp every record with the current snapshot number. A snapshot
//! pins a point in time for iteration; closing snapshots advances the GC
//! horizon through the child chain, letting the compactor discard
//! intermediate versions. Recovery points are named, persisted snapshots
//! that survive restart and support rolling the store back.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};
use crossbeam_epoch as epoch;

use crate::error::{Error, Result};
use crate::item::{Fence, Item};
use crate::page::marshal::{marshal, FULL_MARSHAL};
use crate::page::walker::CompactFilter;
use crate::store::iterator::EmberIterator;
use crate::store::wctx::{maybe_compress, WCtx};
use crate::store::{
    discard_block, write_block, Core, Ember, Writer, BT_MAX_SN, BT_PAGE_DATA, BT_RECOVERY_POINTS,
    LSS_BLOCK_TYPE_SIZE,
};

/// Mutable MVCC state, guarded by one mutex on the store.
#[derive(Default)]
pub struct MvccState {
    pub(crate) curr_snapshot: Option<Arc<Snapshot>>,
    pub(crate) recovery_points: Vec<RecoveryPoint>,
    pub(crate) rp_version: u16,
    pub(crate) num_sn_created: usize,
    pub(crate) last_max_sn: u64,
}

/// A pinned point in time. Closing the snapshot releases its reference;
/// when the last reference of the oldest snapshot goes, the GC horizon
/// advances and the close cascades down the child chain.
pub struct Snapshot {
    sn: u64,
    ref_count: AtomicI64,
    child: Mutex<Option<Arc<Snapshot>>>,
    core: Arc<Core>,
}

impl Snapshot {
    pub fn sn(&self) -> u64 {
        self.sn
    }

    pub(crate) fn open(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one reference. The GC horizon advances once per fully
    /// closed snapshot, in order, cascading down the child chain.
    pub fn close(&self) {
        if self.ref_count.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        self.core.gc_sn.fetch_add(1, Ordering::AcqRel);

        let mut child = self.child.lock().unwrap().take();
        while let Some(c) = child {
            if c.ref_count.fetch_sub(1, Ordering::AcqRel) != 1 {
                break;
            }
            c.core.gc_sn.fetch_add(1, Ordering::AcqRel);
            child = c.child.lock().unwrap().take();
        }
    }
}

/// Iterator bound to a snapshot; yields the newest version with
/// `sn <= snapshot.sn` per key and hides deleted keys.
pub struct SnapshotIterator {
    inner: EmberIterator,
    snap: Arc<Snapshot>,
}

impl SnapshotIterator {
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.inner.seek(key)
    }
}

impl Iterator for SnapshotIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl Drop for SnapshotIterator {
    fn drop(&mut self) {
        self.snap.close();
    }
}

/// A read handle producing snapshot-bound iterators.
pub struct Reader {
    core: Arc<Core>,
}

impl Reader {
    pub(crate) fn new(core: Arc<Core>) -> Reader {
        Reader { core }
    }

    pub fn new_snapshot_iterator(&self, snap: &Arc<Snapshot>) -> Result<SnapshotIterator> {
        if !Arc::ptr_eq(&snap.core, &self.core) {
            return Err(Error::InvalidSnapshot);
        }
        snap.open();
        Ok(SnapshotIterator {
            inner: EmberIterator::snapshot(self.core.clone(), snap.sn),
            snap: snap.clone(),
        })
    }
}

/// A named, persisted snapshot suitable for rollback.
#[derive(Clone, Debug, PartialEq)]
pub struct RecoveryPoint {
    pub(crate) sn: u64,
    pub(crate) meta: Vec<u8>,
}

impl RecoveryPoint {
    pub fn sn(&self) -> u64 {
        self.sn
    }

    pub fn meta(&self) -> &[u8] {
        &self.meta
    }
}

pub(crate) fn init_snapshots(core: &Arc<Core>) {
    if !core.config.enable_snapshots {
        return;
    }
    if core.curr_sn.load(Ordering::Acquire) == 0 {
        core.curr_sn.store(1, Ordering::Release);
    }

    let mut mv = core.mvcc.lock().unwrap();
    mv.curr_snapshot = Some(Arc::new(Snapshot {
        sn: core.curr_sn.load(Ordering::Acquire),
        ref_count: AtomicI64::new(1),
        child: Mutex::new(None),
        core: core.clone(),
    }));

    let sn = core.curr_sn.load(Ordering::Acquire);
    update_max_sn(core, &mut mv, sn, true);

    let sns: Vec<u64> = mv.recovery_points.iter().map(|rp| rp.sn).collect();
    core.min_rp_sn
        .store(sns.first().copied().unwrap_or(0), Ordering::Release);
    *core.rp_sns.write().unwrap() = sns;
}

pub(crate) fn new_snapshot(core: &Arc<Core>) -> Arc<Snapshot> {
    let mut mv = core.mvcc.lock().unwrap();
    new_snapshot_locked(core, &mut mv)
}

/// Publish a new current snapshot and hand back the previous one, which
/// keeps one reference for the caller.
fn new_snapshot_locked(core: &Arc<Core>, mv: &mut MvccState) -> Arc<Snapshot> {
    assert!(
        core.config.enable_snapshots,
        "snapshots are not enabled on this store"
    );

    let snap = mv
        .curr_snapshot
        .clone()
        .expect("snapshot state not initialized");

    let next = Arc::new(Snapshot {
        sn: core.curr_sn.fetch_add(1, Ordering::AcqRel) + 1,
        // One reference held by the store, one by the previous snapshot's
        // close cascade.
        ref_count: AtomicI64::new(2),
        child: Mutex::new(None),
        core: core.clone(),
    });
    *snap.child.lock().unwrap() = Some(next.clone());
    mv.curr_snapshot = Some(next.clone());

    update_max_sn(core, mv, next.sn, false);
    snap
}

/// Persist the snapshot-number high water every `max_sn_sync_frequency`
/// snapshots. The persisted value carries a margin so numbers handed out
/// between writes can never repeat after a crash.
fn update_max_sn(core: &Core, mv: &mut MvccState, sn: u64, force: bool) {
    let freq = core.config.max_sn_sync_frequency.max(1);
    if core.should_persist() && (force || mv.num_sn_created % freq == 0) {
        let lss = core.lss.as_ref().unwrap();
        let max_sn = sn + freq as u64 + 1;
        let mut bs = [0u8; 8];
        BigEndian::write_u64(&mut bs, max_sn);

        let (_, res) = lss.reserve(LSS_BLOCK_TYPE_SIZE + bs.len());
        write_block(lss, &res, 0, BT_MAX_SN, &bs);
        lss.finalize(res);
        lss.sync(false);
        mv.last_max_sn = max_sn;
    }
    mv.num_sn_created += 1;
}

pub(crate) fn marshal_recovery_points(rps: &[RecoveryPoint], version: u16) -> Vec<u8> {
    let body: usize = rps.iter().map(|rp| 4 + 8 + rp.meta.len()).sum();
    let mut bs = vec![0u8; 4 + body];
    BigEndian::write_u16(&mut bs[0..2], version);
    BigEndian::write_u16(&mut bs[2..4], rps.len() as u16);

    let mut offset = 4;
    for rp in rps {
        let l = (4 + 8 + rp.meta.len()) as u32;
        BigEndian::write_u32(&mut bs[offset..offset + 4], l);
        BigEndian::write_u64(&mut bs[offset + 4..offset + 12], rp.sn);
        bs[offset + 12..offset + 12 + rp.meta.len()].copy_from_slice(&rp.meta);
        offset += l as usize;
    }
    bs
}

pub(crate) fn unmarshal_recovery_points(bs: &[u8]) -> (u16, Vec<RecoveryPoint>) {
    let version = BigEndian::read_u16(&bs[0..2]);
    let n = BigEndian::read_u16(&bs[2..4]) as usize;

    let mut rps = Vec::with_capacity(n);
    let mut offset = 4;
    for _ in 0..n {
        let l = BigEndian::read_u32(&bs[offset..offset + 4]) as usize;
        let sn = BigEndian::read_u64(&bs[offset + 4..offset + 12]);
        let meta = bs[offset + 12..offset + l].to_vec();
        rps.push(RecoveryPoint { sn, meta });
        offset += l;
    }
    (version, rps)
}

/// Write the recovery-point set to the log and publish it.
fn update_recovery_points(core: &Core, mv: &mut MvccState, rps: Vec<RecoveryPoint>) {
    let version = mv.rp_version.wrapping_add(1);
    if let Some(lss) = &core.lss {
        let bs = marshal_recovery_points(&rps, version);
        let (_, res) = lss.reserve(LSS_BLOCK_TYPE_SIZE + bs.len());
        write_block(lss, &res, 0, BT_RECOVERY_POINTS, &bs);
        lss.finalize(res);
    }

    mv.rp_version = version;
    core.min_rp_sn
        .store(rps.first().map_or(0, |rp| rp.sn), Ordering::Release);
    *core.rp_sns.write().unwrap() = rps.iter().map(|rp| rp.sn).collect();
    mv.recovery_points = rps;
}

pub(crate) fn create_recovery_point(
    ember: &Ember,
    snap: &Arc<Snapshot>,
    meta: Vec<u8>,
) -> Result<()> {
    let core = &ember.core;
    if !core.should_persist() {
        return Ok(());
    }

    ember.persist_all()?;

    let mut mv = core.mvcc.lock().unwrap();
    let mut rps = mv.recovery_points.clone();
    rps.push(RecoveryPoint { sn: snap.sn, meta });
    rps.sort_by_key(|rp| rp.sn);
    update_recovery_points(core, &mut mv, rps);
    Ok(())
}

pub(crate) fn remove_recovery_point(ember: &Ember, rp: &RecoveryPoint) {
    let core = &ember.core;
    let mut mv = core.mvcc.lock().unwrap();
    let rps: Vec<RecoveryPoint> = mv
        .recovery_points
        .iter()
        .filter(|p| p.sn != rp.sn)
        .cloned()
        .collect();
    update_recovery_points(core, &mut mv, rps);
}

/// Roll the store back to a recovery point. Writers are quiesced through
/// the store lock for the duration; every page gets a rollback delta
/// hiding `[rp.sn + 1, curr_sn]` and is re-persisted.
pub(crate) fn rollback(ember: &Ember, roll_rp: &RecoveryPoint) -> Result<Arc<Snapshot>> {
    let core = &ember.core;
    assert!(
        core.config.enable_snapshots,
        "snapshots are not enabled on this store"
    );

    let _quiesce = core.store_lock.write().unwrap();
    let mut mv = core.mvcc.lock().unwrap();

    let start = roll_rp.sn + 1;
    let end = core.curr_sn.load(Ordering::Acquire);
    let mut ctx = WCtx::with_stats(core.clone(), core.gstats.clone());

    // Settle pending removals first so no closed chain is merged into a
    // parent after the parent already took its rollback delta.
    let keys: Vec<Fence> = core.index.iter().map(|e| e.key().clone()).collect();
    for key in &keys {
        let guard = epoch::pin();
        if let Some(entry) = core.index.get(key) {
            let pg = core.read_page(&entry, &guard);
            if !pg.is_empty() && pg.need_removal() {
                let slot = entry.value() as *const _;
                core.try_page_removal(key, slot, &mut ctx, &guard)?;
            }
        }
    }

    let keys: Vec<Fence> = core.index.iter().map(|e| e.key().clone()).collect();
    for key in keys {
        loop {
            let guard = epoch::pin();
            let Some(entry) = core.index.get(&key) else {
                break;
            };
            let mut pg = core.read_page(&entry, &guard);
            if pg.is_empty() {
                break;
            }
            pg.rollback(start, end, &guard);

            let mut lss_write = None;
            if let Some(lss) = &core.lss {
                let mut pg_buf = std::mem::take(&mut ctx.buf_enc_page);
                let mut comp_buf = std::mem::take(&mut ctx.buf_compress);
                let enc = marshal(&pg, &mut pg_buf, FULL_MARSHAL, &mut ctx, &guard)?;
                let body = maybe_compress(
                    core.config.use_compression,
                    pg_buf.slice(0, enc.len),
                    &mut comp_buf,
                )?;

                let (offset, res) = lss.reserve(LSS_BLOCK_TYPE_SIZE + body.len());
                write_block(lss, &res, 0, BT_PAGE_DATA, body);
                let body_len = body.len() as u64;
                pg.add_flush_record(offset, body_len, 0, &guard);

                ctx.buf_enc_page = pg_buf;
                ctx.buf_compress = comp_buf;
                lss_write = Some((res, body_len, enc.stale_fd));
            }

            if core.update_mapping(&entry, &mut pg, &mut ctx, &guard) {
                if let Some((res, fd, stale)) = lss_write {
                    ctx.sts
                        .flush_data_sz
                        .fetch_add(fd as i64 - stale as i64, Ordering::Relaxed);
                    core.lss.as_ref().unwrap().finalize(res);
                }
                break;
            }
            // A background persistor or the cleaner raced us; retry the
            // page.
            if let Some((res, _, _)) = lss_write {
                let lss = core.lss.as_ref().unwrap();
                discard_block(lss, &res, 0);
                lss.finalize(res);
            }
        }
    }

    if let Some(lss) = &core.lss {
        lss.sync(false);
    }

    let new_snap = new_snapshot_locked(core, &mut mv);

    let rps: Vec<RecoveryPoint> = mv
        .recovery_points
        .iter()
        .filter(|rp| rp.sn <= roll_rp.sn)
        .cloned()
        .collect();
    update_recovery_points(core, &mut mv, rps);
    core.gc_sn.store(new_snap.sn, Ordering::Release);

    if let Some(lss) = &core.lss {
        lss.sync(true);
    }
    Ok(new_snap)
}

impl Core {
    /// Consolidation filter: one survivor per live snapshot interval when
    /// snapshots are on, newest-wins otherwise.
    pub(crate) fn compact_filter(&self) -> CompactFilter {
        if !self.config.enable_snapshots {
            return CompactFilter::simple();
        }
        let gc_sn = self.gc_sn.load(Ordering::Acquire) + 1;
        let rp_sns = self.rp_sns.read().unwrap();
        let mut intervals: Vec<u64> = rp_sns.iter().copied().filter(|sn| *sn < gc_sn).collect();
        intervals.push(gc_sn);
        CompactFilter::gc(intervals)
    }
}

impl Writer {
    /// Insert or replace a record.
    pub fn insert_kv(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let sn = self.ctx.core.curr_sn.load(Ordering::Acquire);
        let itm = Item::new(key, Some(value), sn, true)?;
        self.insert_item(itm)
    }

    /// Delete a record. In snapshot mode this writes a tombstone visible
    /// to newer snapshots only.
    pub fn delete_kv(&mut self, key: &[u8]) -> Result<()> {
        let sn = self.ctx.core.curr_sn.load(Ordering::Acquire);
        let itm = Item::new(key, None, sn, false)?;
        self.delete_item(itm)
    }

    /// Fetch the newest visible value for the key.
    pub fn lookup_kv(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        match self.lookup_item(key)? {
            None => Err(Error::ItemNotFound),
            Some(itm) if !itm.is_insert() => Err(Error::ItemNotFound),
            Some(itm) if itm.has_value() => Ok(itm.value().to_vec()),
            Some(_) => Err(Error::ItemNoValue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_points_roundtrip() {
        let rps = vec![
            RecoveryPoint {
                sn: 5,
                meta: b"checkpoint-5".to_vec(),
            },
            RecoveryPoint {
                sn: 11,
                meta: Vec::new(),
            },
        ];
        let bs = marshal_recovery_points(&rps, 3);
        let (version, back) = unmarshal_recovery_points(&bs);
        assert_eq!(version, 3);
        assert_eq!(back, rps);
    }
}
