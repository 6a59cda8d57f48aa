//! Log cleaner: walks the log from its head, relocates live page blocks to
//! the tail and trims the reclaimed prefix.
//!
//! A `PageData`/`PageReloc` block is live when its low key still resolves
//! and the resolved page's version matches the block's: the block is then
//! the page's current full base, and rewriting the whole chain at the tail
//! (with a version bump) orphans it together with every newer update
//! block of that page. Update blocks themselves are always garbage to the
//! cleaner because their full base lies behind them in the log. Recovery
//! point and snapshot-number blocks are re-appended ahead of the clean
//! offset so a trim never loses them.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_epoch as epoch;

use crate::error::Result;
use crate::page::marshal::{decode_page_state, marshal, FULL_MARSHAL};
use crate::scheduler::{BackgroundTask, Context};

use super::wctx::{maybe_compress, maybe_decompress, WCtx};
use super::{
    block_type, discard_block, write_block, Core, BT_MAX_SN, BT_PAGE_DATA, BT_PAGE_RELOC,
    BT_RECOVERY_POINTS, LSS_BLOCK_TYPE_SIZE,
};

/// Fragmentation trigger shared by the cleaner daemon and the writer
/// throttle.
pub(crate) fn trigger_lss_cleaner(core: &Core) -> bool {
    if !core.should_persist() {
        return false;
    }
    let info = core.lss_info();
    info.frag_percent >= i64::from(core.config.lss_cleaner_max_threshold)
        && info.used_space >= core.config.lss_cleaner_throttle_min_size as i64
}

/// One cleaner pass from the current clean offset toward the tail.
/// `proceed` is polled per block so shutdown and de-triggering stop the
/// pass early.
pub(crate) fn run_cleaner_pass(
    core: &Core,
    ctx: &mut WCtx,
    proceed: &dyn Fn() -> bool,
) -> Result<()> {
    let lss = core.lss.as_ref().expect("cleaner without a log");
    let use_comp = core.config.use_compression;
    let mut ra = lss.new_ra_buffer(crate::log::BLOCK_SIZE * 256);

    let mut decompress_buf = std::mem::take(&mut ctx.buf_decompress);
    let result = lss.run_cleaner(
        &mut |_offset, end_offset, payload| {
            let guard = epoch::pin();
            match block_type(payload) {
                BT_PAGE_DATA | BT_PAGE_RELOC => {
                    let body = &payload[LSS_BLOCK_TYPE_SIZE..];
                    let data = maybe_decompress(use_comp, body, &mut decompress_buf)?;
                    let (state, low) = decode_page_state(data);

                    // The block is live only while the resolved page still
                    // carries its version.
                    loop {
                        let Some(entry) = core.index.get(&low) else {
                            break;
                        };
                        let mut pg = core.read_page(&entry, &guard);
                        if pg.is_empty()
                            || pg.version() != state.version()
                            || !pg.is_flushed()
                        {
                            break;
                        }

                        // Rewrite the whole chain at the tail; the version
                        // bump tells concurrent readers and makes every
                        // older block of this page garbage.
                        let mut pg_buf = std::mem::take(&mut ctx.buf_enc_page);
                        let mut comp_buf = std::mem::take(&mut ctx.buf_compress);
                        let enc = marshal(&pg, &mut pg_buf, FULL_MARSHAL, ctx, &guard)?;
                        let reloc_body = maybe_compress(
                            use_comp,
                            pg_buf.slice(0, enc.len),
                            &mut comp_buf,
                        )?;

                        let (new_offset, res) =
                            lss.reserve(LSS_BLOCK_TYPE_SIZE + reloc_body.len());
                        write_block(lss, &res, 0, BT_PAGE_RELOC, reloc_body);
                        let reloc_len = reloc_body.len() as u64;
                        pg.add_flush_record(new_offset, reloc_len, 0, &guard);

                        ctx.buf_enc_page = pg_buf;
                        ctx.buf_compress = comp_buf;

                        if core.update_mapping(&entry, &mut pg, ctx, &guard) {
                            lss.finalize(res);
                            ctx.sts.flush_data_sz.fetch_add(
                                reloc_len as i64 - enc.stale_fd as i64,
                                Ordering::Relaxed,
                            );
                            break;
                        }
                        discard_block(lss, &res, 0);
                        lss.finalize(res);
                        // Lost the CAS; re-check whether the block is still
                        // live before retrying.
                    }
                }
                BT_RECOVERY_POINTS | BT_MAX_SN => {
                    // Carry the metadata block forward so the coming trim
                    // cannot drop it.
                    let (_, res) = lss.reserve(payload.len());
                    lss.fill(&res, 0, payload);
                    lss.finalize(res);
                }
                // Updates, removals and discards are garbage here.
                _ => {}
            }
            Ok((proceed(), end_offset))
        },
        &mut ra,
    );
    ctx.buf_decompress = decompress_buf;

    ctx.sts
        .num_lss_reads
        .fetch_add(ra.num_reads as i64, Ordering::Relaxed);
    ctx.sts
        .lss_read_bytes
        .fetch_add(ra.read_bytes as i64, Ordering::Relaxed);
    result
}

/// Background cleaner; activates on fragmentation pressure.
pub struct CleanerTask {
    core: Arc<Core>,
    ctx: Mutex<WCtx>,
}

impl CleanerTask {
    pub fn new(core: Arc<Core>) -> CleanerTask {
        let ctx = WCtx::new(core.clone());
        CleanerTask {
            core,
            ctx: Mutex::new(ctx),
        }
    }
}

impl BackgroundTask for CleanerTask {
    fn name(&self) -> &'static str {
        "lss-cleaner"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn execute(&self, ctx: Context) -> Result<()> {
        if !trigger_lss_cleaner(&self.core) {
            return Ok(());
        }
        let core = self.core.clone();
        let mut wctx = self.ctx.lock().unwrap();
        run_cleaner_pass(&self.core, &mut wctx, &move || {
            !ctx.is_shutdown() && trigger_lss_cleaner(&core)
        })
    }
}
