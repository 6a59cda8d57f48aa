//! Clock-based page eviction.
//!
//! A persistent clock handle walks the separator index in batches. Reading
//! a page sets its cache bit; the sweep clears it; a page untouched
//! between two sweeps is persisted and evicted. The handle itself is
//! protected by a mutex, never the pages it points at.

use std::ops::Bound;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::item::Fence;
use crate::scheduler::{BackgroundTask, Context};

use super::wctx::WCtx;
use super::{persistor, quota_exceeded, Core};

const SWEEP_BATCH_SIZE: usize = 16;
const EVICTION_TIMEOUT: Duration = Duration::from_secs(300);
const SWAPPER_WAIT_INTERVAL: Duration = Duration::from_micros(10);
const SWAPPER_WAIT_MAX: Duration = Duration::from_secs(1);

/// Saved position of the clock sweep.
#[derive(Default)]
pub struct ClockHandle {
    pos: Option<Fence>,
}

/// Sleep interval that doubles toward a ceiling while the trigger stays
/// inactive and snaps back to the minimum when it fires.
struct DecayInterval {
    curr: Duration,
    min: Duration,
    max: Duration,
}

impl DecayInterval {
    fn new(min: Duration, max: Duration) -> DecayInterval {
        DecayInterval {
            curr: min,
            min,
            max,
        }
    }

    fn current(&self) -> Duration {
        self.curr
    }

    fn grow(&mut self) {
        self.curr = (self.curr * 2).min(self.max);
    }

    fn reset(&mut self) {
        self.curr = self.min;
    }
}

/// Collect the next batch of page keys under the clock lock, remembering
/// where to resume.
fn sweep_clock(core: &Core, batch: usize) -> Vec<Fence> {
    let mut handle = core.clock.lock().unwrap();

    let mut keys = Vec::with_capacity(batch);
    match handle.pos.take() {
        Some(pos) => {
            for e in core.index.range((Bound::Excluded(pos), Bound::Unbounded)) {
                keys.push(e.key().clone());
                if keys.len() == batch {
                    break;
                }
            }
        }
        None => {
            for e in core.index.iter() {
                keys.push(e.key().clone());
                if keys.len() == batch {
                    break;
                }
            }
        }
    }

    // Wrap around once the index is exhausted.
    if keys.len() == batch {
        handle.pos = keys.last().cloned();
    }
    keys
}

/// Evict cold pages until aggregate memory drops below the quota or the
/// eviction deadline passes.
pub(crate) fn try_evict_pages(core: &Core, ctx: &mut WCtx) -> Result<()> {
    let start = Instant::now();
    while quota_exceeded() {
        let _quiesce = core.store_lock.read().unwrap();
        let keys = sweep_clock(core, SWEEP_BATCH_SIZE);
        for key in keys {
            let referenced = match core.index.get(&key) {
                Some(entry) => entry.value().cache.swap(false, Ordering::AcqRel),
                None => continue,
            };
            // Second chance: anything touched since the last sweep is
            // spared this round.
            if !referenced {
                persistor::persist(core, &key, true, ctx)?;
            }
        }

        if start.elapsed() > EVICTION_TIMEOUT {
            tracing::error!(
                memory_in_use = super::memory_in_use(),
                "eviction deadline passed before reaching the memory quota"
            );
            return Err(Error::SwapperTimeout);
        }
    }
    Ok(())
}

/// Background eviction worker; the store registers one per configured
/// evictor thread. While the trigger is inactive the worker sleeps on a
/// decaying interval, snapping back to the minimum as soon as it fires.
pub struct SwapperTask {
    core: Arc<Core>,
    ctx: Mutex<WCtx>,
    decay: Mutex<DecayInterval>,
}

impl SwapperTask {
    pub fn new(core: Arc<Core>) -> SwapperTask {
        let ctx = WCtx::new(core.clone());
        SwapperTask {
            core,
            ctx: Mutex::new(ctx),
            decay: Mutex::new(DecayInterval::new(SWAPPER_WAIT_INTERVAL, SWAPPER_WAIT_MAX)),
        }
    }
}

impl BackgroundTask for SwapperTask {
    fn name(&self) -> &'static str {
        "swapper"
    }

    fn interval(&self) -> Duration {
        self.decay.lock().unwrap().current()
    }

    fn execute(&self, _ctx: Context) -> Result<()> {
        if !quota_exceeded() {
            self.decay.lock().unwrap().grow();
            return Ok(());
        }

        let mut wctx = self.ctx.lock().unwrap();
        let result = try_evict_pages(&self.core, &mut wctx);
        self.decay.lock().unwrap().reset();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::Ember;

    #[test]
    fn test_decay_interval_grows_and_resets() {
        let mut d = DecayInterval::new(Duration::from_micros(10), Duration::from_secs(1));
        assert_eq!(d.current(), Duration::from_micros(10));

        d.grow();
        d.grow();
        assert_eq!(d.current(), Duration::from_micros(40));

        // Bounded by the ceiling.
        for _ in 0..32 {
            d.grow();
        }
        assert_eq!(d.current(), Duration::from_secs(1));

        d.reset();
        assert_eq!(d.current(), Duration::from_micros(10));
    }

    #[test]
    fn test_sweep_clock_wraps() {
        let store = Ember::open(Config::in_memory()).unwrap();
        let mut w = store.new_writer();
        for i in 0..10u32 {
            w.insert_kv(format!("key{i:02}").as_bytes(), b"v").unwrap();
        }

        // A single seed page: each sweep returns it and wraps.
        let first = sweep_clock(&store.core, 4);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0], Fence::Lo);
        let again = sweep_clock(&store.core, 4);
        assert_eq!(again.len(), 1);
    }
}
