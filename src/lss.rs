//! Log-structured store: batching layer over the append-only log.
//!
//! Writers reserve space out of a ring of flush buffers. A reservation
//! carves a `[len:u32][payload]` slot out of the tail buffer with a single
//! CAS on the buffer's packed state word, which simultaneously claims the
//! byte range and takes a writer reference on the buffer:
//!
//! ```text
//! state = [32-bit offset][14 bits unused][16-bit writer count][reset][full]
//! ```
//!
//! The first reservation that does not fit marks the buffer full; whoever
//! marked it initializes the successor and swings the tail pointer. When
//! the writer count of a full buffer drains to zero its bytes are appended
//! to the log, a posted trim offset is honoured, and the commit policy is
//! applied. Each buffer is born holding one reference for its predecessor,
//! so flushes always reach the log in ring order.
//!
//! Reads cover both worlds: offsets at or past the log tail are served out
//! of live buffers (revalidating the buffer's base offset after the copy),
//! older offsets read whole blocks from the log and follow the length
//! prefix across a block boundary when needed.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};

use crate::buffer::Buffer;
use crate::error::Result;
use crate::log::{Log, BLOCK_SIZE, EXPIRED_OFFSET};

/// Length-prefix bytes ahead of every reserved payload.
pub const BLOCK_HDR_SIZE: usize = 4;

pub type SafeTrimFn = Box<dyn Fn() -> u64 + Send + Sync>;

// State word accessors. Bit 0: full, bit 1: reset, bits 2..18: writer
// count, bits 32..: offset.
fn decode_state(state: u64) -> (bool, bool, u32, usize) {
    let full = state & 0x1 == 0x1;
    let reset = state & 0x2 == 0x2;
    let nwriters = (state >> 2 & 0xffff) as u32;
    let offset = (state >> 32) as usize;
    (full, reset, nwriters, offset)
}

fn encode_state(full: bool, nwriters: u32, offset: usize) -> u64 {
    let full_bit = u64::from(full);
    let nw_bits = u64::from(nwriters) << 2;
    let offset_bits = (offset as u64) << 32;
    full_bit | nw_bits | offset_bits
}

enum AllocStatus {
    Done {
        offsets: Vec<u64>,
        payload_starts: Vec<usize>,
    },
    Full {
        marked: bool,
    },
}

struct FlushBuffer {
    seqno: AtomicU64,
    base_offset: AtomicU64,
    state: AtomicU64,
    bytes: Box<[UnsafeCell<u8>]>,
    do_commit: AtomicBool,
    trim_offset: AtomicU64,
}

// Writers touch disjoint carved ranges guarded by the state-word protocol;
// readers copy through raw pointers and revalidate the base offset.
unsafe impl Sync for FlushBuffer {}
unsafe impl Send for FlushBuffer {}

impl FlushBuffer {
    fn new(size: usize) -> Self {
        Self {
            seqno: AtomicU64::new(0),
            base_offset: AtomicU64::new(0),
            state: AtomicU64::new(encode_state(false, 1, 0)),
            bytes: (0..size).map(|_| UnsafeCell::new(0)).collect(),
            do_commit: AtomicBool::new(false),
            trim_offset: AtomicU64::new(EXPIRED_OFFSET),
        }
    }

    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn write_raw(&self, at: usize, bs: &[u8]) {
        debug_assert!(at + bs.len() <= self.capacity());
        unsafe {
            std::ptr::copy_nonoverlapping(bs.as_ptr(), self.bytes[at].get(), bs.len());
        }
    }

    fn read_raw(&self, at: usize, out: &mut [u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(self.bytes[at].get() as *const u8, out.as_mut_ptr(), out.len());
        }
    }

    fn start_offset(&self) -> u64 {
        self.base_offset.load(Ordering::Acquire)
    }

    fn end_offset(&self) -> u64 {
        let (_, _, _, offset) = decode_state(self.state.load(Ordering::Acquire));
        self.start_offset() + offset as u64
    }

    fn alloc(&self, sizes: &[usize]) -> AllocStatus {
        loop {
            let state = self.state.load(Ordering::Acquire);
            let (full, reset, nw, offset) = decode_state(state);
            if full || reset {
                return AllocStatus::Full { marked: false };
            }

            let size = alloc_size(sizes);
            assert!(
                size <= self.capacity(),
                "reservation of {size} bytes exceeds flush buffer capacity"
            );

            let new_offset = offset + size;
            if new_offset > self.capacity() {
                let new_state = encode_state(true, nw, offset);
                if self
                    .state
                    .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    std::thread::yield_now();
                    continue;
                }
                return AllocStatus::Full { marked: true };
            }

            let new_state = encode_state(false, nw + 1, new_offset);
            if self
                .state
                .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            let base = self.start_offset();
            let mut offsets = Vec::with_capacity(sizes.len());
            let mut payload_starts = Vec::with_capacity(sizes.len());
            let mut at = offset;
            for &sz in sizes {
                let mut hdr = [0u8; BLOCK_HDR_SIZE];
                BigEndian::write_u32(&mut hdr, sz as u32);
                self.write_raw(at, &hdr);
                offsets.push(base + at as u64);
                payload_starts.push(at + BLOCK_HDR_SIZE);
                at += BLOCK_HDR_SIZE + sz;
            }
            return AllocStatus::Done {
                offsets,
                payload_starts,
            };
        }
    }

    /// Read the payload at a logical offset out of the live buffer.
    /// Returns None if the offset is not covered or the buffer was recycled
    /// mid-copy.
    fn read_into(&self, off: u64, out: &mut Buffer) -> Option<usize> {
        let (_, _, _, offset) = decode_state(self.state.load(Ordering::Acquire));
        let start = self.start_offset();
        let end = start + offset as u64;

        if off < start || off >= end {
            return None;
        }
        let at = (off - start) as usize;
        let mut hdr = [0u8; BLOCK_HDR_SIZE];
        self.read_raw(at, &mut hdr);
        let len = BigEndian::read_u32(&hdr) as usize;
        if at + BLOCK_HDR_SIZE + len > offset {
            return None;
        }
        self.read_raw(at + BLOCK_HDR_SIZE, out.get_mut(0, len));

        if start != self.start_offset() {
            return None;
        }
        Some(len)
    }

    fn try_close(&self) -> Option<u64> {
        let state = self.state.load(Ordering::Acquire);
        let (full, reset, nw, offset) = decode_state(state);
        let new_state = encode_state(true, nw, offset);
        if !full
            && !reset
            && self
                .state
                .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Some(self.end_offset());
        }
        None
    }

    fn set_trim_offset(&self, off: u64) -> bool {
        let state = self.state.load(Ordering::Acquire);
        let (full, reset, nw, offset) = decode_state(state);
        let new_state = encode_state(full, nw + 1, offset);
        if !reset
            && nw > 0
            && self
                .state
                .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.trim_offset.store(off, Ordering::Release);
            return true;
        }
        false
    }

    fn is_reset(&self) -> bool {
        let (_, reset, _, _) = decode_state(self.state.load(Ordering::Acquire));
        reset
    }

    fn reset(&self) {
        self.do_commit.store(false, Ordering::Release);
        self.trim_offset.store(EXPIRED_OFFSET, Ordering::Release);
        let state = self.state.load(Ordering::Acquire);
        self.state.store(state | 0x2, Ordering::Release);
    }
}

fn alloc_size(sizes: &[usize]) -> usize {
    sizes.iter().map(|sz| sz + BLOCK_HDR_SIZE).sum()
}

/// An outstanding reservation. Must be finalized exactly once; the buffer
/// it points into cannot flush until then.
pub struct Reservation {
    buf_idx: usize,
    payload_starts: Vec<usize>,
    sizes: Vec<usize>,
}

/// Payload read out of the LSS: position and length within the caller's
/// scratch buffer plus IO accounting.
pub struct ReadResult {
    pub pos: usize,
    pub len: usize,
    pub io_reads: u64,
    pub io_bytes: u64,
}

/// The log-structured store.
pub struct Lss {
    log: Log,
    bufs: Box<[FlushBuffer]>,
    nbufs: usize,
    tail_idx: AtomicUsize,
    head_idx: AtomicUsize,

    trim_batch_size: u64,
    start_offset: AtomicU64,
    cleaner_trim_offset: AtomicU64,
    trim_offset: AtomicU64,
    bytes_written: AtomicU64,

    commit_interval: Duration,
    last_commit: Mutex<Instant>,
    safe_trim: RwLock<Option<SafeTrimFn>>,
    cleaner_lock: Mutex<()>,
}

impl Lss {
    pub fn new(log: Log, buf_size: usize, nbufs: usize, commit_interval: Duration) -> Lss {
        assert!(nbufs >= 2, "flush buffer ring needs at least two buffers");

        let bufs: Box<[FlushBuffer]> = (0..nbufs).map(|_| FlushBuffer::new(buf_size)).collect();
        for fb in bufs.iter().skip(1) {
            fb.reset();
        }
        bufs[0].base_offset.store(log.tail(), Ordering::Release);

        let start = log.head();
        Lss {
            trim_batch_size: buf_size as u64,
            start_offset: AtomicU64::new(start),
            cleaner_trim_offset: AtomicU64::new(start),
            trim_offset: AtomicU64::new(EXPIRED_OFFSET),
            bytes_written: AtomicU64::new(0),
            log,
            bufs,
            nbufs,
            tail_idx: AtomicUsize::new(0),
            head_idx: AtomicUsize::new(0),
            commit_interval,
            last_commit: Mutex::new(Instant::now()),
            safe_trim: RwLock::new(None),
            cleaner_lock: Mutex::new(()),
        }
    }

    pub fn set_safe_trim_callback(&self, f: SafeTrimFn) {
        *self.safe_trim.write().unwrap() = Some(f);
    }

    fn safe_trim_offset(&self) -> u64 {
        match self.safe_trim.read().unwrap().as_ref() {
            Some(f) => f(),
            None => EXPIRED_OFFSET,
        }
    }

    pub fn head_offset(&self) -> u64 {
        self.cleaner_trim_offset.load(Ordering::Acquire)
    }

    pub fn tail_offset(&self) -> u64 {
        self.log.tail()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    pub fn used_space(&self) -> u64 {
        self.log.size()
    }

    pub fn reserve(&self, size: usize) -> (u64, Reservation) {
        let (offs, res) = self.reserve_multi(&[size]);
        (offs[0], res)
    }

    /// Atomically carve one slot per requested size out of the tail buffer.
    pub fn reserve_multi(&self, sizes: &[usize]) -> (Vec<u64>, Reservation) {
        loop {
            let t = self.tail_idx.load(Ordering::Acquire);
            match self.bufs[t].alloc(sizes) {
                AllocStatus::Done {
                    offsets,
                    payload_starts,
                } => {
                    return (
                        offsets,
                        Reservation {
                            buf_idx: t,
                            payload_starts,
                            sizes: sizes.to_vec(),
                        },
                    );
                }
                AllocStatus::Full { marked: true } => {
                    self.init_next_buffer(t);
                    self.done(t);
                }
                AllocStatus::Full { marked: false } => {
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Copy payload bytes into a reserved slot. `bs` may cover less than
    /// the reservation (the remainder keeps stale bytes; visitors skip by
    /// the reserved size).
    pub fn fill(&self, res: &Reservation, i: usize, bs: &[u8]) {
        self.fill_at(res, i, 0, bs);
    }

    /// Copy payload bytes at an offset within a reserved slot.
    pub fn fill_at(&self, res: &Reservation, i: usize, at: usize, bs: &[u8]) {
        assert!(at + bs.len() <= res.sizes[i], "write outside reservation");
        self.bufs[res.buf_idx].write_raw(res.payload_starts[i] + at, bs);
    }

    /// Release the reservation's writer reference; the last one out flushes
    /// a full buffer.
    pub fn finalize(&self, res: Reservation) {
        self.done(res.buf_idx);
    }

    fn init_next_buffer(&self, curr: usize) {
        let next = (curr + 1) % self.nbufs;
        let nfb = &self.bufs[next];

        while !nfb.is_reset() {
            std::thread::yield_now();
        }

        nfb.base_offset
            .store(self.bufs[curr].end_offset(), Ordering::Release);
        nfb.seqno.store(
            self.bufs[curr].seqno.load(Ordering::Acquire) + 1,
            Ordering::Release,
        );
        // One writer reference for the predecessor to enforce flush
        // ordering, one for whoever closes the buffer.
        nfb.state.store(encode_state(false, 2, 0), Ordering::Release);

        if self
            .tail_idx
            .compare_exchange(curr, next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("flush buffer tail moved while initializing the successor");
        }
    }

    fn done(&self, idx: usize) {
        let fb = &self.bufs[idx];
        loop {
            let state = fb.state.load(Ordering::Acquire);
            let (full, _, nw, offset) = decode_state(state);
            let new_state = encode_state(full, nw - 1, offset);
            if fb
                .state
                .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            if nw == 1 && full {
                self.flush(idx);
                fb.reset();
                self.done((idx + 1) % self.nbufs);
            }
            return;
        }
    }

    fn flush(&self, idx: usize) {
        let fb = &self.bufs[idx];
        let (_, _, _, offset) = decode_state(fb.state.load(Ordering::Acquire));
        // Writer count is zero and the buffer is full: the bytes are frozen.
        let bytes =
            unsafe { std::slice::from_raw_parts(fb.bytes[0].get() as *const u8, offset) };

        loop {
            match self.log.append(bytes) {
                Ok(_) => {
                    self.bytes_written
                        .fetch_add(bytes.len() as u64, Ordering::AcqRel);
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "log append failed, retrying");
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }

        let posted = fb.trim_offset.load(Ordering::Acquire);
        if posted != EXPIRED_OFFSET {
            self.trim_offset.store(posted, Ordering::Release);
        }

        let mut last_commit = self.last_commit.lock().unwrap();
        let do_commit = fb.do_commit.load(Ordering::Acquire)
            || self.commit_interval.is_zero()
            || last_commit.elapsed() >= self.commit_interval;
        if do_commit {
            let posted = self.trim_offset.load(Ordering::Acquire);
            self.log.trim(self.safe_trim_offset().min(posted));
            loop {
                match self.log.commit() {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "log commit failed, retrying");
                        std::thread::sleep(Duration::from_secs(1));
                    }
                }
            }
            *last_commit = Instant::now();
        }
        drop(last_commit);

        self.head_idx.store((idx + 1) % self.nbufs, Ordering::Release);
    }

    /// Post a trim offset; the flush that carries it applies the trim.
    pub fn trim_log(&self, off: u64) {
        loop {
            let t = self.tail_idx.load(Ordering::Acquire);
            if self.bufs[t].set_trim_offset(off) {
                self.done(t);
                return;
            }
            std::thread::yield_now();
        }
    }

    /// Read the payload at `offset` into `buf`.
    pub fn read(&self, offset: u64, buf: &mut Buffer) -> Result<ReadResult> {
        loop {
            let tail = self.log.tail();

            if offset >= tail {
                // Still in the flush buffers.
                let h = self.head_idx.load(Ordering::Acquire);
                for k in 0..self.nbufs {
                    if let Some(len) = self.bufs[(h + k) % self.nbufs].read_into(offset, buf) {
                        return Ok(ReadResult {
                            pos: 0,
                            len,
                            io_reads: 0,
                            io_bytes: 0,
                        });
                    }
                }
                std::thread::yield_now();
                continue;
            }

            let block = BLOCK_SIZE as u64;
            let start_block = offset / block;
            let end_block = (offset + BLOCK_HDR_SIZE as u64 + block - 1) / block;
            let buf_size = ((end_block - start_block) * block) as usize;

            let mut io_reads = 1u64;
            let mut io_bytes = buf_size as u64;
            self.log.read(buf.get_mut(0, buf_size), start_block * block)?;

            let len_off = (offset % block) as usize;
            let l = BigEndian::read_u32(buf.slice(len_off, BLOCK_HDR_SIZE)) as usize;

            let have = buf_size - len_off - BLOCK_HDR_SIZE;
            if l > have {
                let mut remaining = l - have;
                remaining += (block as usize - remaining % block as usize) % block as usize;
                self.log
                    .read(buf.get_mut(buf_size, remaining), end_block * block)?;
                io_reads += 1;
                io_bytes += remaining as u64;
            }

            return Ok(ReadResult {
                pos: len_off + BLOCK_HDR_SIZE,
                len: l,
                io_reads,
                io_bytes,
            });
        }
    }

    /// Sequential scan of `[log head, log tail)` invoking the callback per
    /// block. Stops early when the callback returns false.
    pub fn visitor(
        &self,
        callb: &mut dyn FnMut(u64, &[u8]) -> Result<bool>,
        ra: &mut ReadAheadBuffer,
    ) -> Result<()> {
        self.visit_range(self.log.head(), self.log.tail(), callb, ra)
    }

    fn visit_range(
        &self,
        start: u64,
        end: u64,
        callb: &mut dyn FnMut(u64, &[u8]) -> Result<bool>,
        ra: &mut ReadAheadBuffer,
    ) -> Result<()> {
        let mut curr = start;
        while curr < end {
            let (pos, len) = ra.read(&self.log, curr)?;
            let payload = ra.buf.slice(pos, len);
            if !callb(curr, payload)? {
                break;
            }
            curr += (len + BLOCK_HDR_SIZE) as u64;
        }
        Ok(())
    }

    /// Cleaner scan from the current clean offset toward the tail. The
    /// callback returns `(continue, clean_offset)`; every `trim_batch_size`
    /// bytes of clean-offset advance posts a trim.
    pub fn run_cleaner(
        &self,
        callb: &mut dyn FnMut(u64, u64, &[u8]) -> Result<(bool, u64)>,
        ra: &mut ReadAheadBuffer,
    ) -> Result<()> {
        let _guard = self.cleaner_lock.lock().unwrap();

        let end = self.log.tail();
        let mut curr = self.start_offset.load(Ordering::Acquire);
        while curr < end {
            let (pos, len) = ra.read(&self.log, curr)?;
            let block_end = curr + (len + BLOCK_HDR_SIZE) as u64;
            let payload = ra.buf.slice(pos, len);

            let (cont, clean_off) = callb(curr, block_end, payload)?;

            if clean_off - self.cleaner_trim_offset.load(Ordering::Acquire) >= self.trim_batch_size
            {
                self.trim_log(clean_off);
                self.cleaner_trim_offset.store(clean_off, Ordering::Release);
            }
            self.start_offset.store(clean_off, Ordering::Release);

            if !cont {
                break;
            }
            curr = block_end;
        }
        Ok(())
    }

    /// Close the current buffer and wait for the flush chain to drain past
    /// its end offset.
    pub fn sync(&self, commit: bool) {
        loop {
            let t = self.tail_idx.load(Ordering::Acquire);
            if let Some(end_off) = self.bufs[t].try_close() {
                self.init_next_buffer(t);
                self.bufs[t].do_commit.store(commit, Ordering::Release);
                self.done(t);

                while self.log.tail() < end_off {
                    std::thread::yield_now();
                }
                return;
            }
            std::thread::yield_now();
        }
    }

    pub fn new_ra_buffer(&self, cache_size: usize) -> ReadAheadBuffer {
        ReadAheadBuffer::new(cache_size)
    }

    pub fn close(&self) -> Result<()> {
        self.log.close()
    }
}

/// Block-aligned read-ahead cache used by the cleaner and recovery.
pub struct ReadAheadBuffer {
    max_cache_size: usize,
    start: u64,
    end: u64,
    buf: Buffer,
    pub num_reads: u64,
    pub read_bytes: u64,
}

impl ReadAheadBuffer {
    fn new(max_cache_size: usize) -> Self {
        Self {
            max_cache_size: max_cache_size.max(BLOCK_SIZE),
            start: 0,
            end: 0,
            buf: Buffer::new(),
            num_reads: 0,
            read_bytes: 0,
        }
    }

    /// Position and length of the payload at `offset` within the internal
    /// buffer.
    fn read(&mut self, log: &Log, offset: u64) -> Result<(usize, usize)> {
        let pos = self.refill(log, offset, BLOCK_HDR_SIZE)?;
        let len = BigEndian::read_u32(self.buf.slice(pos, BLOCK_HDR_SIZE)) as usize;
        let pos = self.refill(log, offset + BLOCK_HDR_SIZE as u64, len)?;
        Ok((pos, len))
    }

    fn refill(&mut self, log: &Log, offset: u64, size: usize) -> Result<usize> {
        if !(offset >= self.start && offset + size as u64 <= self.end) {
            let block = BLOCK_SIZE as u64;
            self.start = offset / block * block;
            let mut end = (offset + size as u64 + block - 1) / block * block;
            if end - self.start < self.max_cache_size as u64 {
                end = self.start + self.max_cache_size as u64;
            }
            let buf_size = (end - self.start) as usize;
            self.end = end;

            log.read(self.buf.get_mut(0, buf_size), self.start)?;
            self.num_reads += 1;
            self.read_bytes += buf_size as u64;
        }
        Ok((offset - self.start) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn open_lss(dir: &TempDir, buf_size: usize) -> Lss {
        let log = Log::open(&dir.path().join("log.data"), 1024 * 1024).unwrap();
        Lss::new(log, buf_size, 2, Duration::from_secs(0))
    }

    fn write_block(lss: &Lss, payload: &[u8]) -> u64 {
        let (off, res) = lss.reserve(payload.len());
        lss.fill(&res, 0, payload);
        lss.finalize(res);
        off
    }

    #[test]
    fn test_reserve_fill_read_from_ring() {
        let dir = TempDir::new().unwrap();
        let lss = open_lss(&dir, 64 * 1024);

        let off = write_block(&lss, b"payload-one");
        assert_eq!(off, 0);

        // Not yet flushed: served from the live buffer.
        let mut buf = Buffer::new();
        let rr = lss.read(off, &mut buf).unwrap();
        assert_eq!(buf.slice(rr.pos, rr.len), b"payload-one");
        assert_eq!(rr.io_reads, 0);
    }

    #[test]
    fn test_sync_flushes_and_reads_from_log() {
        let dir = TempDir::new().unwrap();
        let lss = open_lss(&dir, 64 * 1024);

        let off1 = write_block(&lss, b"first");
        let off2 = write_block(&lss, b"second");
        lss.sync(true);

        assert!(lss.tail_offset() >= off2 + 5);

        let mut buf = Buffer::new();
        let rr = lss.read(off1, &mut buf).unwrap();
        assert_eq!(buf.slice(rr.pos, rr.len), b"first");
        assert!(rr.io_reads > 0);

        let rr = lss.read(off2, &mut buf).unwrap();
        assert_eq!(buf.slice(rr.pos, rr.len), b"second");
    }

    #[test]
    fn test_reserve_multi_is_contiguous() {
        let dir = TempDir::new().unwrap();
        let lss = open_lss(&dir, 64 * 1024);

        let (offs, res) = lss.reserve_multi(&[3, 5]);
        lss.fill(&res, 0, b"abc");
        lss.fill(&res, 1, b"defgh");
        lss.finalize(res);

        assert_eq!(offs[1], offs[0] + 3 + BLOCK_HDR_SIZE as u64);

        let mut buf = Buffer::new();
        let rr = lss.read(offs[1], &mut buf).unwrap();
        assert_eq!(buf.slice(rr.pos, rr.len), b"defgh");
    }

    #[test]
    fn test_buffer_rollover() {
        let dir = TempDir::new().unwrap();
        // Small buffers so a handful of writes crosses buffer boundaries.
        let lss = open_lss(&dir, 64);

        let mut offsets = Vec::new();
        for i in 0..32u8 {
            offsets.push(write_block(&lss, &[i; 20]));
        }
        lss.sync(false);

        let mut buf = Buffer::new();
        for (i, off) in offsets.iter().enumerate() {
            let rr = lss.read(*off, &mut buf).unwrap();
            assert_eq!(buf.slice(rr.pos, rr.len), &[i as u8; 20]);
        }
    }

    #[test]
    fn test_visitor_sees_all_blocks_in_order() {
        let dir = TempDir::new().unwrap();
        let lss = open_lss(&dir, 128);

        let mut expect = Vec::new();
        for i in 0..20u8 {
            let payload = vec![i; 1 + i as usize];
            write_block(&lss, &payload);
            expect.push(payload);
        }
        lss.sync(true);

        let mut seen = Vec::new();
        let mut ra = lss.new_ra_buffer(BLOCK_SIZE);
        lss.visitor(
            &mut |_, payload| {
                seen.push(payload.to_vec());
                Ok(true)
            },
            &mut ra,
        )
        .unwrap();

        assert_eq!(seen, expect);
    }

    #[test]
    fn test_concurrent_reservations() {
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let lss = Arc::new(open_lss(&dir, 4096));

        let mut handles = Vec::new();
        for t in 0..4u8 {
            let lss = lss.clone();
            handles.push(std::thread::spawn(move || {
                let mut offs = Vec::new();
                for i in 0..100u8 {
                    offs.push((write_block(&lss, &[t, i]), [t, i]));
                }
                offs
            }));
        }

        let mut all: Vec<(u64, [u8; 2])> = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        lss.sync(true);

        let mut buf = Buffer::new();
        for (off, expect) in all {
            let rr = lss.read(off, &mut buf).unwrap();
            assert_eq!(buf.slice(rr.pos, rr.len), &expect);
        }
    }
}
