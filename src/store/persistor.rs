//! Page persistence: marshal dirty chains into the LSS, optionally
//! evicting them afterwards.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_epoch as epoch;

use crate::error::Result;
use crate::item::Fence;
use crate::page::marshal::marshal;

use super::wctx::{maybe_compress, WCtx};
use super::{discard_block, page_flush_block_type, write_block, Core, LSS_BLOCK_TYPE_SIZE};

/// Persist one page. With `evict` the chain is replaced by a swapout delta
/// once its bytes are safely reserved in the LSS. Returns whether the page
/// was evicted.
pub(crate) fn persist(core: &Core, key: &Fence, evict: bool, ctx: &mut WCtx) -> Result<bool> {
    let cfg = &core.config;
    loop {
        let guard = epoch::pin();
        let Some(entry) = core.index.get(key) else {
            return Ok(false);
        };
        let mut pg = core.read_page(&entry, &guard);
        if pg.is_empty() {
            return Ok(false);
        }

        if pg.needs_flush() {
            let lss = core.lss.as_ref().expect("persist without a log");

            let mut pg_buf = std::mem::take(&mut ctx.buf_enc_page);
            let mut comp_buf = std::mem::take(&mut ctx.buf_compress);
            let enc = marshal(&pg, &mut pg_buf, cfg.max_page_lss_segments, ctx, &guard)?;
            let body = maybe_compress(cfg.use_compression, pg_buf.slice(0, enc.len), &mut comp_buf)?;

            let (offset, res) = lss.reserve(LSS_BLOCK_TYPE_SIZE + body.len());
            write_block(lss, &res, 0, page_flush_block_type(enc.num_segments), body);
            let body_len = body.len() as u64;

            if evict {
                pg.evict(offset, enc.num_segments, &guard);
            } else {
                pg.add_flush_record(offset, body_len, enc.num_segments, &guard);
            }

            ctx.buf_enc_page = pg_buf;
            ctx.buf_compress = comp_buf;

            if core.update_mapping(&entry, &mut pg, ctx, &guard) {
                lss.finalize(res);
                ctx.sts
                    .flush_data_sz
                    .fetch_add(body_len as i64 - enc.stale_fd as i64, Ordering::Relaxed);
                if evict {
                    ctx.sts.num_pages_swapout.fetch_add(1, Ordering::Relaxed);
                }
                return Ok(evict);
            }
            discard_block(lss, &res, 0);
            lss.finalize(res);
            continue;
        }

        if evict && pg.is_evictable() {
            // Already flushed: the head's offset doubles as the swapout
            // location.
            let fi = pg.flush_info();
            pg.evict(fi.offset, fi.num_segments, &guard);
            if core.update_mapping(&entry, &mut pg, ctx, &guard) {
                ctx.sts.num_pages_swapout.fetch_add(1, Ordering::Relaxed);
                return Ok(true);
            }
            continue;
        }

        return Ok(false);
    }
}

/// Persist (or evict) every page, fanned out across the persistor pool,
/// then sync the log.
pub(crate) fn persist_all(core: &Arc<Core>, evict: bool) -> Result<()> {
    if !core.should_persist() {
        return Ok(());
    }

    let keys: Vec<Fence> = core.index.iter().map(|e| e.key().clone()).collect();
    let threads = core.config.num_persistor_threads.max(1).min(keys.len().max(1));
    let chunk = keys.len().div_ceil(threads);

    let mut first_err = None;
    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for part in keys.chunks(chunk.max(1)) {
            let core = core.clone();
            handles.push(scope.spawn(move || -> Result<()> {
                let mut ctx = WCtx::with_stats(core.clone(), core.gstats.clone());
                for key in part {
                    persist(&core, key, evict, &mut ctx)?;
                }
                Ok(())
            }));
        }
        for h in handles {
            if let Err(e) = h.join().expect("persistor worker panicked") {
                first_err.get_or_insert(e);
            }
        }
    });

    if let Some(e) = first_err {
        return Err(e);
    }
    core.lss.as_ref().unwrap().sync(false);
    Ok(())
}
