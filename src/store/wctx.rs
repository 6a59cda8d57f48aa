//! Per-writer context: scratch buffers, compression, stats and the reader
//! seam that materializes persisted chains.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use crossbeam_epoch::Guard;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::page::marshal::unmarshal_delta;
use crate::page::{ChainReader, LoadedChain, Page};

use super::stats::WStats;
use super::{Core, BT_PAGE_DATA, BT_PAGE_RELOC, BT_PAGE_UPDATE, LSS_BLOCK_TYPE_SIZE};

/// A writer context. One per concurrent writer and one per background
/// worker; scratch buffers amortize encode/decode allocations, stats are
/// shared with the store for aggregation.
pub struct WCtx {
    pub core: Arc<Core>,
    pub sts: Arc<WStats>,

    pub buf_enc_page: Buffer,
    pub buf_enc_meta: Buffer,
    pub buf_fetch: Buffer,
    pub buf_compress: Buffer,
    pub buf_decompress: Buffer,
}

impl WCtx {
    /// A context whose stats are registered with the store.
    pub fn new(core: Arc<Core>) -> WCtx {
        let sts = WStats::new_shared();
        core.stats_list.lock().unwrap().push(sts.clone());
        WCtx::with_stats(core, sts)
    }

    /// A context reusing an already-registered stats block (worker pools).
    pub fn with_stats(core: Arc<Core>, sts: Arc<WStats>) -> WCtx {
        WCtx {
            core,
            sts,
            buf_enc_page: Buffer::new(),
            buf_enc_meta: Buffer::new(),
            buf_fetch: Buffer::new(),
            buf_compress: Buffer::new(),
            buf_decompress: Buffer::new(),
        }
    }

    /// Writers back off while the log is saturated with garbage.
    pub fn try_throttle_lss(&self) {
        if self.core.lss_pressure.load(Ordering::Acquire) {
            while super::cleaner::trigger_lss_cleaner(&self.core) {
                std::thread::yield_now();
            }
        }
    }

    /// Writers back off while the swapper works the store back under the
    /// memory quota.
    pub fn try_throttle_memory(&self) {
        if self.core.config.auto_swapper && self.core.mem_pressure.load(Ordering::Acquire) {
            while super::quota_exceeded() {
                std::thread::sleep(std::time::Duration::from_micros(10));
            }
        }
    }
}

pub fn maybe_compress<'a>(enabled: bool, data: &'a [u8], out: &'a mut Buffer) -> Result<&'a [u8]> {
    if !enabled {
        return Ok(data);
    }
    let max = snap::raw::max_compress_len(data.len());
    let n = snap::raw::Encoder::new()
        .compress(data, out.get_mut(0, max))
        .map_err(|e| Error::Io(e.to_string()))?;
    Ok(out.slice(0, n))
}

pub fn maybe_decompress<'a>(enabled: bool, data: &'a [u8], out: &'a mut Buffer) -> Result<&'a [u8]> {
    if !enabled {
        return Ok(data);
    }
    let n = snap::raw::decompress_len(data).map_err(|e| Error::Io(e.to_string()))?;
    snap::raw::Decoder::new()
        .decompress(data, out.get_mut(0, n))
        .map_err(|e| Error::Io(e.to_string()))?;
    Ok(out.slice(0, n))
}

impl ChainReader for WCtx {
    /// Reassemble a page chain from the LSS, following the prev-offset
    /// chain from the newest segment back to its full block.
    fn read_chain<'g>(&mut self, offset: u64, guard: &'g Guard) -> Result<LoadedChain<'g>> {
        let lss = self
            .core
            .lss
            .as_ref()
            .expect("swapped-out chain in a store without a log");
        let use_comp = self.core.config.use_compression;

        let mut acc: Option<Page<'g>> = None;
        let mut num_segments = 0u32;
        let mut num_records = 0usize;
        let mut off = offset;

        loop {
            let rr = lss.read(off, &mut self.buf_fetch)?;
            self.sts.num_lss_reads.fetch_add(rr.io_reads as i64, Ordering::Relaxed);
            self.sts.lss_read_bytes.fetch_add(rr.io_bytes as i64, Ordering::Relaxed);

            let payload = self.buf_fetch.slice(rr.pos, rr.len);
            let typ = BigEndian::read_u16(&payload[..LSS_BLOCK_TYPE_SIZE]);
            if !matches!(typ, BT_PAGE_DATA | BT_PAGE_RELOC | BT_PAGE_UPDATE) {
                panic!("invalid page block type {typ} at offset {off}");
            }

            let body = &payload[LSS_BLOCK_TYPE_SIZE..];
            let flush_size = body.len() as u64;
            let data = maybe_decompress(use_comp, body, &mut self.buf_decompress)?;
            let decoded = unmarshal_delta(data, guard);
            let prev = decoded.prev_offset;

            let mut seg = decoded.into_page();
            num_records += seg.nrec_allocs;
            seg.add_flush_record(off, flush_size, 1, guard);
            num_segments += 1;

            match acc.as_mut() {
                None => acc = Some(seg),
                Some(pg) => pg.append(seg),
            }

            match prev {
                Some(p) => off = p,
                None => break,
            }
        }

        let mut page = acc.expect("page chain with no segments");
        unsafe { page.set_num_segments(num_segments) };
        self.sts
            .num_record_swapin
            .fetch_add(num_records as i64, Ordering::Relaxed);

        Ok(LoadedChain {
            head: page.head,
            num_segments,
            num_records,
            mem: page.mem_alloc,
        })
    }
}
