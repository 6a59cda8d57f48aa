//! On-disk encoding of a page chain.
//!
//! A page block carries a header and the chain body in head-to-tail order:
//!
//! ```text
//! [state:u16][low fence][chainLen:u16][numItems:u16][hi fence]
//! { [op:u16][payload] }*
//! ```
//!
//! Fences are tagged: `1` low sentinel, `2` high sentinel, `3` a key
//! (`[len:u32][bytes]`). Bases encode `[count:u16]` followed by the items;
//! absorbed sibling chains are inlined as insert deltas bounded by the
//! enclosing high fence; a flush record terminates the block with the
//! previous segment's offset, chaining segments across the log. When the
//! segment count reaches the caller's limit the encoder ignores flush
//! records and emits the whole chain (a full marshal), which starts a new
//! segment chain and a new page version.

use std::sync::atomic::Ordering;

use byteorder::{BigEndian, ByteOrder};
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use crate::buffer::Buffer;
use crate::error::Result;
use crate::item::{Fence, Item};

use super::{destroy_chain, ChainReader, Delta, DeltaOp, Page, PageState};

const OP_BASE: u16 = 1;
const OP_INSERT: u16 = 3;
const OP_DELETE: u16 = 4;
const OP_SPLIT: u16 = 5;
const OP_FLUSH: u16 = 8;
const OP_ROLLBACK: u16 = 10;

const FENCE_LO: u8 = 1;
const FENCE_HI: u8 = 2;
const FENCE_KEY: u8 = 3;

/// Force a full marshal regardless of accumulated segments.
pub const FULL_MARSHAL: usize = 0;

struct Encoder<'b> {
    buf: &'b mut Buffer,
    w: usize,
}

impl Encoder<'_> {
    fn put_u8(&mut self, v: u8) {
        self.buf.get_mut(self.w, 1)[0] = v;
        self.w += 1;
    }

    fn put_u16(&mut self, v: u16) {
        BigEndian::write_u16(self.buf.get_mut(self.w, 2), v);
        self.w += 2;
    }

    fn put_u16_at(&mut self, at: usize, v: u16) {
        BigEndian::write_u16(self.buf.get_mut(at, 2), v);
    }

    fn put_u32(&mut self, v: u32) {
        BigEndian::write_u32(self.buf.get_mut(self.w, 4), v);
        self.w += 4;
    }

    fn put_u64(&mut self, v: u64) {
        BigEndian::write_u64(self.buf.get_mut(self.w, 8), v);
        self.w += 8;
    }

    fn put_bytes(&mut self, bs: &[u8]) {
        self.buf.get_mut(self.w, bs.len()).copy_from_slice(bs);
        self.w += bs.len();
    }

    fn put_fence(&mut self, fence: &Fence) {
        match fence {
            Fence::Lo => self.put_u8(FENCE_LO),
            Fence::Hi => self.put_u8(FENCE_HI),
            Fence::Key(k) => {
                self.put_u8(FENCE_KEY);
                self.put_u32(k.len() as u32);
                self.put_bytes(k);
            }
        }
    }

    fn put_item(&mut self, itm: &Item) {
        self.put_bytes(itm.raw());
    }
}

/// Result of encoding a page block.
pub struct MarshalResult {
    /// Encoded length; also the block's flush-data size.
    pub len: usize,
    /// Previously persisted bytes this block supersedes.
    pub stale_fd: u64,
    /// Number of persisted segments chained behind this block; zero for a
    /// full marshal.
    pub num_segments: u32,
    pub nrec_swapin: usize,
}

/// Encode the page chain into `buf`.
pub fn marshal<'g>(
    page: &Page<'g>,
    buf: &mut Buffer,
    max_segments: usize,
    reader: &mut dyn ChainReader,
    guard: &'g Guard,
) -> Result<MarshalResult> {
    let mut enc = Encoder { buf, w: 0 };
    let head = page.head_ref().expect("marshal of an empty chain");
    let hi = head.hi.clone();

    let state_off = enc.w;
    enc.put_u16(0);
    enc.put_fence(&page.low);
    enc.put_u16(head.chain_len);
    enc.put_u16(head.num_items);
    enc.put_fence(&hi);

    let mut ctx = MarshalCtx {
        enc,
        full: max_segments == FULL_MARSHAL,
        max_segments,
        stale_fd: 0,
        has_reloc: false,
        num_segments: 0,
        nrec_swapin: 0,
        guard,
    };
    ctx.chain(page.head, hi, false, reader)?;

    let mut state = head.state;
    if ctx.num_segments == 0 {
        state.incr_version();
    } else {
        ctx.num_segments += 1;
    }
    let len = ctx.enc.w;
    ctx.enc.put_u16_at(state_off, state.0);

    Ok(MarshalResult {
        len,
        stale_fd: ctx.stale_fd,
        num_segments: ctx.num_segments,
        nrec_swapin: ctx.nrec_swapin,
    })
}

struct MarshalCtx<'b, 'g> {
    enc: Encoder<'b>,
    full: bool,
    max_segments: usize,
    stale_fd: u64,
    has_reloc: bool,
    num_segments: u32,
    nrec_swapin: usize,
    guard: &'g Guard,
}

impl<'g> MarshalCtx<'_, 'g> {
    fn chain(
        &mut self,
        head: Shared<'g, Delta>,
        mut hi: Fence,
        child: bool,
        reader: &mut dyn ChainReader,
    ) -> Result<()> {
        let mut curr = head;
        let mut ephemeral: Vec<*const Delta> = Vec::new();

        let walk = (|ctx: &mut Self| -> Result<()> {
            loop {
                let Some(d) = (unsafe { curr.as_ref() }) else {
                    return Ok(());
                };

                match &d.op {
                    DeltaOp::Insert(itm) => {
                        if hi.covers(itm.key()) {
                            ctx.enc.put_u16(OP_INSERT);
                            ctx.enc.put_item(itm);
                        }
                    }
                    DeltaOp::Delete(itm) => {
                        if hi.covers(itm.key()) {
                            ctx.enc.put_u16(OP_DELETE);
                            ctx.enc.put_item(itm);
                        }
                    }
                    DeltaOp::Split => {
                        if let Some(k) = d.hi.as_key() {
                            if hi.covers(k) {
                                hi = d.hi.clone();
                            }
                        }
                        ctx.enc.put_u16(OP_SPLIT);
                    }
                    DeltaOp::Merge { sibling, .. } => {
                        let sib = sibling.load(Ordering::Acquire, ctx.guard);
                        // The sibling chain encodes with its own reloc
                        // horizon; a relocation above this merge already
                        // covers the sibling's superseded bytes.
                        let before = ctx.stale_fd;
                        let outer_reloc = ctx.has_reloc;
                        ctx.has_reloc = false;
                        ctx.chain(sib, hi.clone(), true, reader)?;
                        ctx.has_reloc = outer_reloc;
                        if outer_reloc {
                            ctx.stale_fd = before;
                        }
                    }
                    DeltaOp::Base(items) => {
                        if child {
                            for itm in items {
                                if hi.covers(itm.key()) {
                                    ctx.enc.put_u16(OP_INSERT);
                                    ctx.enc.put_item(itm);
                                }
                            }
                        } else {
                            ctx.enc.put_u16(OP_BASE);
                            let count_off = ctx.enc.w;
                            ctx.enc.put_u16(0);
                            let mut n = 0u16;
                            for itm in items {
                                if hi.covers(itm.key()) {
                                    ctx.enc.put_item(itm);
                                    n += 1;
                                }
                            }
                            ctx.enc.put_u16_at(count_off, n);
                        }
                        return Ok(());
                    }
                    DeltaOp::Flush(_) | DeltaOp::Reloc(_) | DeltaOp::Swapout { .. } => {
                        let (offset, data_size, segs) = match &d.op {
                            DeltaOp::Flush(fi) | DeltaOp::Reloc(fi) => {
                                (fi.offset, fi.data_size, fi.num_segments)
                            }
                            DeltaOp::Swapout {
                                offset,
                                num_segments,
                            } => (*offset, 0, *num_segments),
                            _ => unreachable!(),
                        };

                        if !child {
                            if segs as usize > ctx.max_segments {
                                ctx.full = true;
                            } else if !ctx.full {
                                ctx.enc.put_u16(OP_FLUSH);
                                ctx.enc.put_u64(offset);
                                ctx.num_segments = segs;
                                return Ok(());
                            }
                        }

                        if !ctx.has_reloc {
                            ctx.stale_fd += u64::from(data_size);
                        }
                        if matches!(d.op, DeltaOp::Reloc(_)) {
                            ctx.has_reloc = true;
                        }

                        if matches!(d.op, DeltaOp::Swapout { .. }) {
                            // Full marshal of evicted content: bring it
                            // back for this walk only.
                            let loaded = reader.read_chain(offset, ctx.guard)?;
                            ctx.nrec_swapin += loaded.num_records;
                            ephemeral.push(loaded.head.as_raw());
                            curr = loaded.head;
                            continue;
                        }
                    }
                    DeltaOp::Rollback { start, end } => {
                        ctx.enc.put_u16(OP_ROLLBACK);
                        ctx.enc.put_u64(*start);
                        ctx.enc.put_u64(*end);
                    }
                    DeltaOp::Swapin { chain } => {
                        curr = chain.load(Ordering::Acquire, ctx.guard);
                        continue;
                    }
                    DeltaOp::Meta | DeltaOp::Remove => {}
                }
                curr = d.next.load(Ordering::Acquire, ctx.guard);
            }
        })(self);

        for head in ephemeral {
            unsafe { destroy_chain(head) };
        }
        walk
    }
}

/// A chain decoded from one page block.
pub struct DecodedChain<'g> {
    pub low: Fence,
    pub hi: Fence,
    pub state: PageState,
    pub chain_len: u16,
    pub num_items: u16,
    pub head: Shared<'g, Delta>,
    pub tail: Shared<'g, Delta>,
    /// Offset of the next-older segment when the block is part of a chain.
    pub prev_offset: Option<u64>,
    pub num_records: usize,
    pub mem: usize,
}

impl<'g> DecodedChain<'g> {
    pub fn into_page(self) -> Page<'g> {
        let mut pg = Page::new(self.low, self.head);
        pg.prev_head = Shared::null();
        pg.tail = self.tail;
        pg.mem_alloc = self.mem;
        pg.nrec_allocs = self.num_records;
        pg
    }
}

struct Decoder<'d> {
    data: &'d [u8],
    r: usize,
}

impl<'d> Decoder<'d> {
    fn u8(&mut self) -> u8 {
        let v = self.data[self.r];
        self.r += 1;
        v
    }

    fn u16(&mut self) -> u16 {
        let v = BigEndian::read_u16(&self.data[self.r..self.r + 2]);
        self.r += 2;
        v
    }

    fn u32(&mut self) -> u32 {
        let v = BigEndian::read_u32(&self.data[self.r..self.r + 4]);
        self.r += 4;
        v
    }

    fn u64(&mut self) -> u64 {
        let v = BigEndian::read_u64(&self.data[self.r..self.r + 8]);
        self.r += 8;
        v
    }

    fn fence(&mut self) -> Fence {
        match self.u8() {
            FENCE_LO => Fence::Lo,
            FENCE_HI => Fence::Hi,
            FENCE_KEY => {
                let len = self.u32() as usize;
                let f = Fence::from_key(&self.data[self.r..self.r + len]);
                self.r += len;
                f
            }
            flag => panic!("invalid fence tag {flag}"),
        }
    }

    fn item(&mut self) -> Item {
        let itm = Item::from_encoded(&self.data[self.r..]);
        self.r += itm.size();
        itm
    }

    fn done(&self) -> bool {
        self.r >= self.data.len()
    }
}

/// Rebuild an in-memory chain from one block. Repeated application over the
/// `prev_offset` chain reconstructs the full page.
pub fn unmarshal_delta<'g>(data: &[u8], guard: &'g Guard) -> DecodedChain<'g> {
    let mut dec = Decoder { data, r: 0 };

    let mut state = PageState(dec.u16());
    state.set_flushed();
    let low = dec.fence();
    let chain_len = dec.u16();
    let num_items = dec.u16();
    let hi = dec.fence();

    let mut num_records = 0usize;
    let mut mem = 0usize;
    let mut prev_offset = None;

    let new_delta = |op: DeltaOp| Delta {
        op,
        chain_len,
        num_items,
        state,
        hi: hi.clone(),
        right: Fence::Hi,
        next: Atomic::null(),
    };

    let head = Owned::new(new_delta(DeltaOp::Meta)).into_shared(guard);
    mem += unsafe { head.deref() }.mem_size();
    let mut tail = head;

    while !dec.done() {
        let op = dec.u16();
        let d = match op {
            OP_INSERT => {
                num_records += 1;
                new_delta(DeltaOp::Insert(dec.item()))
            }
            OP_DELETE => {
                num_records += 1;
                new_delta(DeltaOp::Delete(dec.item()))
            }
            OP_SPLIT => new_delta(DeltaOp::Split),
            OP_BASE => {
                let n = dec.u16() as usize;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(dec.item());
                }
                num_records += n;
                new_delta(DeltaOp::Base(items))
            }
            OP_ROLLBACK => {
                let start = dec.u64();
                let end = dec.u64();
                new_delta(DeltaOp::Rollback { start, end })
            }
            OP_FLUSH => {
                prev_offset = Some(dec.u64());
                break;
            }
            op => panic!("invalid page block op {op}"),
        };

        let node = Owned::new(d).into_shared(guard);
        mem += unsafe { node.deref() }.mem_size();
        unsafe {
            (*(tail.as_raw() as *mut Delta)).next = Atomic::from(node);
        }
        tail = node;
    }

    DecodedChain {
        low,
        hi,
        state,
        chain_len,
        num_items,
        head,
        tail,
        prev_offset,
        num_records,
        mem,
    }
}

/// Meta payload for a page-removal block: the dead page's low key.
pub fn marshal_page_low(low: &Fence, buf: &mut Buffer) -> usize {
    let mut enc = Encoder { buf, w: 0 };
    match low.as_key() {
        Some(k) => {
            enc.put_u16(k.len() as u16);
            enc.put_bytes(k);
        }
        None => enc.put_u16(0),
    }
    enc.w
}

pub fn decode_page_low(data: &[u8]) -> Option<Vec<u8>> {
    let len = BigEndian::read_u16(&data[0..2]) as usize;
    if len == 0 {
        return None;
    }
    Some(data[2..2 + len].to_vec())
}

/// Peek a block's page state and low fence, for the cleaner's liveness
/// check.
pub fn decode_page_state(data: &[u8]) -> (PageState, Fence) {
    let mut dec = Decoder { data, r: 0 };
    let state = PageState(dec.u16());
    let low = dec.fence();
    (state, low)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::walker::{collect_items, CompactFilter};
    use crate::page::{seed_chain, NoChainReader};
    use crossbeam_epoch as epoch;

    fn itm(key: &str, val: &str) -> Item {
        Item::new(key.as_bytes(), Some(val.as_bytes()), 0, true).unwrap()
    }

    #[test]
    fn test_full_marshal_roundtrip() {
        let guard = epoch::pin();
        let mut pg = Page::new(Fence::Lo, seed_chain(&guard));
        for i in 0..6 {
            pg.insert(itm(&format!("key{i}"), &format!("val{i}")), &guard);
        }
        pg.delete(Item::new(b"key3", None, 0, false).unwrap(), &guard);

        let mut buf = Buffer::new();
        let res = marshal(&pg, &mut buf, FULL_MARSHAL, &mut NoChainReader, &guard).unwrap();
        assert_eq!(res.num_segments, 0);
        assert_eq!(res.stale_fd, 0);

        let decoded = unmarshal_delta(buf.slice(0, res.len), &guard);
        assert_eq!(decoded.low, Fence::Lo);
        assert_eq!(decoded.hi, Fence::Hi);
        assert!(decoded.prev_offset.is_none());
        assert_eq!(usize::from(decoded.chain_len), 7);
        // Version bumped by the full marshal.
        assert_eq!(decoded.state.version(), pg.state().version() + 1);

        let mut dpg = decoded.into_page();
        let found = dpg
            .lookup(b"key2", &mut NoChainReader, &guard)
            .unwrap()
            .expect("key2 should round-trip");
        assert_eq!(found.value(), b"val2");
        assert!(dpg.lookup(b"key3", &mut NoChainReader, &guard).unwrap().is_none());

        unsafe { destroy_chain(dpg.head.as_raw()) };
        unsafe { destroy_chain(pg.head.as_raw()) };
    }

    #[test]
    fn test_segmented_marshal_chains_to_prev_offset() {
        let guard = epoch::pin();
        let mut pg = Page::new(Fence::Lo, seed_chain(&guard));
        pg.insert(itm("a", "1"), &guard);
        pg.add_flush_record(777, 64, 0, &guard);
        pg.insert(itm("b", "2"), &guard);

        let mut buf = Buffer::new();
        let res = marshal(&pg, &mut buf, 4, &mut NoChainReader, &guard).unwrap();
        // One segment behind us, plus this block.
        assert_eq!(res.num_segments, 2);

        let decoded = unmarshal_delta(buf.slice(0, res.len), &guard);
        assert_eq!(decoded.prev_offset, Some(777));
        assert_eq!(decoded.num_records, 1);

        unsafe { destroy_chain(decoded.head.as_raw()) };
        unsafe { destroy_chain(pg.head.as_raw()) };
    }

    #[test]
    fn test_segment_limit_forces_full() {
        let guard = epoch::pin();
        let mut pg = Page::new(Fence::Lo, seed_chain(&guard));
        pg.insert(itm("a", "1"), &guard);
        pg.add_flush_record(777, 64, 3, &guard);
        pg.insert(itm("b", "2"), &guard);

        let mut buf = Buffer::new();
        // Limit below the accumulated segment count: everything inlines.
        let res = marshal(&pg, &mut buf, 2, &mut NoChainReader, &guard).unwrap();
        assert_eq!(res.num_segments, 0);
        assert_eq!(res.stale_fd, 64);

        let decoded = unmarshal_delta(buf.slice(0, res.len), &guard);
        assert!(decoded.prev_offset.is_none());
        assert_eq!(decoded.num_records, 2);

        unsafe { destroy_chain(decoded.head.as_raw()) };
        unsafe { destroy_chain(pg.head.as_raw()) };
    }

    #[test]
    fn test_merge_sibling_inlined() {
        let guard = epoch::pin();
        let mut left = Page::new(Fence::Lo, seed_chain(&guard));
        for i in 0..6 {
            left.insert(itm(&format!("key{i}"), "v"), &guard);
        }
        let mut filter = CompactFilter::simple();
        left.compact(&mut filter, &mut NoChainReader, &guard).unwrap();
        let mut right = left
            .split(&mut CompactFilter::simple(), &mut NoChainReader, &guard)
            .unwrap()
            .unwrap();
        right.close(&guard);
        left.merge(&right, &guard);

        let mut buf = Buffer::new();
        let res = marshal(&left, &mut buf, FULL_MARSHAL, &mut NoChainReader, &guard).unwrap();
        let decoded = unmarshal_delta(buf.slice(0, res.len), &guard);

        let mut cf = CompactFilter::simple();
        let collected = collect_items(
            decoded.head,
            decoded.hi.clone(),
            None,
            &mut cf,
            &mut NoChainReader,
            &guard,
        )
        .unwrap();
        let keys: Vec<_> = collected
            .items
            .iter()
            .map(|i| String::from_utf8_lossy(i.key()).into_owned())
            .collect();
        assert_eq!(keys, vec!["key0", "key1", "key2", "key3", "key4", "key5"]);

        unsafe { destroy_chain(decoded.head.as_raw()) };
        for fc in left.free_list.drain(..) {
            unsafe { destroy_chain(fc.head) };
        }
        unsafe { destroy_chain(left.head.as_raw()) };
    }
}
