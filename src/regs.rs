//! Register Reconstructor: produces the full register map at any event
//! index, using periodic checkpoints plus an LRU cache and incremental
//! replay.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::store::{apply_reads_then_writes, EventStore};

const DEFAULT_RECONSTRUCTION_CACHE_CAP: usize = 1024;

type RegMap = BTreeMap<String, u64>;

/// Bounded reconstruction cache plus sequential-access acceleration state.
/// One `Reconstructor` is owned per query session — it is never shared
/// across concurrent callers.
pub struct Reconstructor {
    cache: LruCache<usize, RegMap>,
    recent_access_idx: Option<usize>,
}

impl Reconstructor {
    pub fn new(capacity: usize) -> Self {
        Reconstructor {
            cache: LruCache::new(NonZeroUsize::new(capacity.max(1)).expect("capacity is nonzero")),
            recent_access_idx: None,
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_RECONSTRUCTION_CACHE_CAP)
    }

    /// Returns the register map observable *after* `i` executes. Missing
    /// registers are absent, never defaulted to zero.
    pub fn regs_at(&mut self, store: &EventStore, i: usize) -> RegMap {
        if store.is_empty() {
            return RegMap::new();
        }
        let i = i.min(store.len() - 1);

        if let Some(hit) = self.cache.get(&i) {
            let regs = hit.clone();
            self.recent_access_idx = Some(i);
            return regs;
        }

        let sequential = self
            .recent_access_idx
            .map(|r| {
                let dist = if r > i { r - i } else { i - r };
                dist > 0 && dist < 100
            })
            .unwrap_or(false);

        let (mut regs, start_idx) = if sequential {
            let r = self.recent_access_idx.unwrap();
            if r <= i {
                if let Some(cached) = self.cache.get(&r) {
                    (cached.clone(), r + 1)
                } else {
                    self.seed_from_checkpoint(store, i)
                }
            } else {
                self.seed_from_checkpoint(store, i)
            }
        } else if let Some((k, v)) = self.largest_cached_key_at_most(i) {
            (v, k + 1)
        } else {
            self.seed_from_checkpoint(store, i)
        };

        let replay_distance = i.saturating_sub(start_idx) + 1;
        let should_cache_midpoint = replay_distance > 50;
        let midpoint = start_idx + replay_distance / 2;
        let mut midpoint_cached = false;

        for idx in start_idx..=i {
            apply_reads_then_writes(&mut regs, &store.events[idx]);
            if should_cache_midpoint && !midpoint_cached && idx >= midpoint {
                self.cache.put(idx, regs.clone());
                midpoint_cached = true;
            }
        }

        self.recent_access_idx = Some(i);
        self.cache.put(i, regs.clone());
        regs
    }

    fn largest_cached_key_at_most(&mut self, i: usize) -> Option<(usize, RegMap)> {
        let best_key = self
            .cache
            .iter()
            .map(|(k, _)| *k)
            .filter(|&k| k <= i)
            .max()?;
        self.cache.get(&best_key).map(|v| (best_key, v.clone()))
    }

    fn seed_from_checkpoint(&self, store: &EventStore, i: usize) -> (RegMap, usize) {
        let target_line = store.events[i].line_no;
        let checkpoint_line = store
            .checkpoints
            .keys()
            .rev()
            .find(|&&ln| ln <= target_line)
            .copied();

        match checkpoint_line {
            Some(ln) => {
                let regs = store.checkpoints.get(&ln).cloned().unwrap_or_default();
                // Find the first event index whose line_no >= the checkpoint
                // line: replay resumes one event after the checkpoint.
                let start_idx = store
                    .events
                    .partition_point(|ev| ev.line_no < ln);
                (regs, start_idx)
            }
            None => (RegMap::new(), 0),
        }
    }
}
