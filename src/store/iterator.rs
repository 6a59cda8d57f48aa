//! Ordered iteration over the store.
//!
//! The iterator walks pages left to right via right-sibling fences,
//! materializing one page at a time through the delta walker. Pages can
//! split or merge underneath it; re-fetching by the saved resume key keeps
//! the scan seamless either way.

use std::sync::Arc;

use crossbeam_epoch as epoch;

use crate::error::Result;
use crate::item::{Fence, Item};
use crate::page::walker::{collect_items, CompactFilter};

use super::wctx::WCtx;
use super::Core;

enum IterMode {
    /// Latest visible version per key, tombstones hidden.
    Latest,
    /// Newest version with `sn <= sn` per key; keys whose visible version
    /// is a tombstone are hidden.
    Snapshot { sn: u64 },
}

pub struct EmberIterator {
    core: Arc<Core>,
    ctx: WCtx,
    mode: IterMode,

    items: Vec<Item>,
    pos: usize,
    /// High fence of the page the items came from; the next page's low.
    page_hi: Fence,
    resume_key: Option<Vec<u8>>,
    started: bool,
    done: bool,
}

impl EmberIterator {
    pub(crate) fn latest(core: Arc<Core>) -> EmberIterator {
        Self::with_mode(core, IterMode::Latest)
    }

    pub(crate) fn snapshot(core: Arc<Core>, sn: u64) -> EmberIterator {
        Self::with_mode(core, IterMode::Snapshot { sn })
    }

    fn with_mode(core: Arc<Core>, mode: IterMode) -> EmberIterator {
        let ctx = WCtx::with_stats(core.clone(), core.gstats.clone());
        EmberIterator {
            core,
            ctx,
            mode,
            items: Vec::new(),
            pos: 0,
            page_hi: Fence::Hi,
            resume_key: None,
            started: false,
            done: false,
        }
    }

    /// Position the iterator at the first record with key >= `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.items.clear();
        self.pos = 0;
        self.resume_key = Some(key.to_vec());
        self.started = true;
        self.done = false;
        self.load_page(key)
    }

    fn load_page(&mut self, key: &[u8]) -> Result<()> {
        let mut key = key.to_vec();
        loop {
            let guard = epoch::pin();
            let (_, pg) = self.core.fetch(&key, &mut self.ctx, &guard)?;

            let mut filter = match self.mode {
                IterMode::Latest => CompactFilter::simple(),
                IterMode::Snapshot { .. } => CompactFilter::keep_all(),
            };
            let hi = pg.max_fence();
            let collected = collect_items(
                pg.head,
                hi.clone(),
                self.resume_key.as_deref(),
                &mut filter,
                &mut self.ctx,
                &guard,
            )?;

            self.items = collected.items;
            self.pos = 0;
            self.page_hi = hi;

            if !self.items.is_empty() {
                return Ok(());
            }
            // Empty page (or nothing at/after the resume key): advance.
            match &self.page_hi {
                Fence::Hi => {
                    self.done = true;
                    return Ok(());
                }
                Fence::Key(k) => {
                    key = k.to_vec();
                    self.resume_key = Some(key.clone());
                }
                Fence::Lo => unreachable!("page high fence cannot be the low sentinel"),
            }
        }
    }

    fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.started {
            self.started = true;
            self.resume_key = None;
            self.load_page(b"")?;
        }

        loop {
            if self.done {
                return Ok(None);
            }
            if self.pos >= self.items.len() {
                match self.page_hi.clone() {
                    Fence::Hi => {
                        self.done = true;
                        return Ok(None);
                    }
                    Fence::Key(k) => {
                        let key = k.to_vec();
                        self.resume_key = Some(key.clone());
                        self.load_page(&key)?;
                        continue;
                    }
                    Fence::Lo => unreachable!("page high fence cannot be the low sentinel"),
                }
            }

            match self.mode {
                IterMode::Latest => {
                    let itm = &self.items[self.pos];
                    self.pos += 1;
                    // The simple filter already reduced to one live insert
                    // per key.
                    return Ok(Some((itm.key().to_vec(), itm.value_bytes())));
                }
                IterMode::Snapshot { sn } => {
                    // One group of versions per key, newest first.
                    let start = self.pos;
                    let key = self.items[start].key().to_vec();
                    let mut end = start;
                    while end < self.items.len() && self.items[end].key() == key {
                        end += 1;
                    }
                    self.pos = end;

                    let visible = self.items[start..end].iter().find(|i| i.sn() <= sn);
                    if let Some(itm) = visible {
                        if itm.is_insert() {
                            return Ok(Some((key, itm.value_bytes())));
                        }
                    }
                    // Invisible or deleted at this snapshot: next key.
                }
            }
        }
    }
}

impl Iterator for EmberIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

trait ItemValueExt {
    fn value_bytes(&self) -> Vec<u8>;
}

impl ItemValueExt for Item {
    fn value_bytes(&self) -> Vec<u8> {
        if self.has_value() {
            self.value().to_vec()
        } else {
            Vec::new()
        }
    }
}
