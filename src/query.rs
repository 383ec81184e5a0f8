//! Query Façade (spec.md §5): the single entry point a UI layer talks to.
//! Bundles a frozen [`EventStore`] with the per-session mutable state
//! (register reconstruction cache, effective-address cache) that the
//! lower layers need, and exposes the read/taint operations as plain
//! methods instead of the underlying engines' free functions.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::addr::{self, EffAddrCache};
use crate::cancel::CancellationToken;
use crate::regs::Reconstructor;
use crate::store::EventStore;
use crate::taint::backward::{self, BackwardOptions, BackwardResult};
use crate::taint::forward::{self, ForwardOptions, ForwardResult};

/// Which side of an event's execution a register value is read from:
/// the state observed immediately before it runs, or immediately after.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainSide {
    Before,
    After,
}

/// One hop in a provenance graph (spec.md §5's `provenance_graph`):
/// either a register-to-register dataflow edge (`Data`) or a
/// store-to-load edge through memory (`Mem`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProvenanceEdge {
    Data { from: usize, to: usize, reg: String },
    Mem { from: usize, to: usize, addr: u64 },
}

/// A query session: one frozen trace plus the owned, non-shared
/// reconstruction state a single caller uses to ask questions of it
/// (spec.md §5 — never shared across concurrent callers).
pub struct QuerySession {
    store: Arc<EventStore>,
    recon: Reconstructor,
    eff: EffAddrCache,
}

impl QuerySession {
    pub fn new(store: Arc<EventStore>) -> Self {
        QuerySession {
            store,
            recon: Reconstructor::with_default_capacity(),
            eff: EffAddrCache::with_default_capacity(),
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// The full register map observable after event `i` executes.
    pub fn regs_at(&mut self, i: usize) -> BTreeMap<String, u64> {
        self.recon.regs_at(&self.store, i)
    }

    /// The effective address of event `i`'s load/store, if any.
    pub fn effective_address(&mut self, i: usize) -> Option<u64> {
        let store = Arc::clone(&self.store);
        let QuerySession { recon, eff, .. } = self;
        eff.resolve(&store, i, || addr::regs_for_address(&store, recon, i))
    }

    /// Every event where `reg` is observed (read or written) holding
    /// `value`, in execution order (grounded on `find_value_candidates`).
    pub fn find_value_candidates(&self, reg: &str, value: u64) -> Vec<usize> {
        let reg = reg.to_lowercase();
        let value = value & 0xFFFF_FFFF;
        let mut hits: Vec<usize> = Vec::new();
        for (idx, ev) in self.store.events.iter().enumerate() {
            let read_hit = ev.reads.get(&reg).map(|v| *v & 0xFFFF_FFFF == value).unwrap_or(false);
            let write_hit = ev.writes.get(&reg).map(|v| *v & 0xFFFF_FFFF == value).unwrap_or(false);
            if read_hit || write_hit {
                hits.push(idx);
            }
        }
        hits
    }

    fn find_prev_write_with_value(&self, reg: &str, idx: usize, value: u64) -> Option<usize> {
        let value = value & 0xFFFF_FFFF;
        let mut j = idx;
        loop {
            j = self.store.prev_write(reg, j)?;
            if let Some(v) = self.store.events[j].writes.get(reg) {
                if *v & 0xFFFF_FFFF == value {
                    return Some(j);
                }
            }
        }
    }

    /// The sequence of events that carry `value` through `reg`: the write
    /// that established it, the write immediately before that (context),
    /// and every subsequent read/non-altering write up to the point the
    /// register's value changes again (grounded on `_build_value_chain`).
    pub fn value_chain(&self, reg: &str, start_idx: usize, value: u64, side: ChainSide) -> Vec<usize> {
        let reg = reg.to_lowercase();
        let n = self.store.len();
        if n == 0 {
            return Vec::new();
        }
        let start_idx = start_idx.min(n - 1);
        let value = value & 0xFFFF_FFFF;

        let writer_idx = if side == ChainSide::After
            && self.store.events[start_idx]
                .writes
                .get(&reg)
                .map(|v| *v & 0xFFFF_FFFF == value)
                .unwrap_or(false)
        {
            start_idx
        } else {
            self.find_prev_write_with_value(&reg, start_idx, value).unwrap_or(start_idx)
        };

        let mut chain = Vec::new();
        if let Some(prev) = self.store.prev_write(&reg, writer_idx) {
            chain.push(prev);
        }
        if !chain.contains(&writer_idx) {
            chain.push(writer_idx);
        }
        for j in (writer_idx + 1)..n {
            let ev = &self.store.events[j];
            if let Some(v) = ev.writes.get(&reg) {
                if *v & 0xFFFF_FFFF != value {
                    break;
                }
                chain.push(j);
                continue;
            }
            if ev.reads.contains_key(&reg) {
                chain.push(j);
            }
        }
        chain
    }

    fn want_value(&mut self, reg: &str, start_idx: usize, side: ChainSide) -> Option<u64> {
        let ev0 = &self.store.events[start_idx];
        match side {
            ChainSide::After => ev0.writes.get(reg).or_else(|| ev0.reads.get(reg)).copied(),
            ChainSide::Before => {
                if let Some(v) = ev0.reads.get(reg) {
                    return Some(*v);
                }
                if start_idx == 0 {
                    return None;
                }
                self.regs_at(start_idx - 1).get(reg).copied()
            }
        }
        .map(|v| v & 0xFFFF_FFFF)
    }

    fn resolve_writer(&self, reg: &str, start_idx: usize, side: ChainSide, want_val: u64) -> usize {
        if side == ChainSide::After {
            if let Some(v) = self.store.events[start_idx].writes.get(reg) {
                if v & 0xFFFF_FFFF == want_val {
                    return start_idx;
                }
            }
        }
        self.find_prev_write_with_value(reg, start_idx, want_val).unwrap_or(start_idx)
    }

    /// Walk the provenance of `reg`'s value at `start_idx` back through
    /// its defining writes, crossing store/load pairs via the store-
    /// address index (grounded on `build_provenance_graph`).
    pub fn provenance_graph(
        &mut self,
        reg: &str,
        start_idx: usize,
        side: ChainSide,
        max_nodes: usize,
    ) -> (Vec<usize>, Vec<ProvenanceEdge>) {
        let reg = reg.to_lowercase();
        let n = self.store.len();
        if n == 0 {
            return (Vec::new(), Vec::new());
        }
        let start_idx = start_idx.min(n - 1);
        let want_val = match self.want_value(&reg, start_idx, side) {
            Some(v) => v,
            None => return (Vec::new(), Vec::new()),
        };
        let writer_idx = self.resolve_writer(&reg, start_idx, side, want_val);

        let mut work = vec![(reg, writer_idx)];
        let mut seen: std::collections::HashSet<(String, usize)> = std::collections::HashSet::new();
        let mut nodes: Vec<usize> = Vec::new();
        let mut edges: Vec<ProvenanceEdge> = Vec::new();
        let mut guard = 0usize;

        while let Some((cur_reg, cur_idx)) = work.pop() {
            guard += 1;
            if guard > max_nodes {
                break;
            }
            let key = (cur_reg.clone(), cur_idx);
            if seen.contains(&key) {
                continue;
            }
            seen.insert(key);
            if !nodes.contains(&cur_idx) {
                nodes.push(cur_idx);
            }

            let ev = self.store.events[cur_idx].clone();
            if crate::classify::is_constant_zero_write(&ev, &cur_reg)
                || crate::classify::is_immediate_write(&ev, &cur_reg)
            {
                continue;
            }

            if crate::classify::is_load(&ev.asm) && ev.writes.contains_key(&cur_reg) {
                let addr = match self.effective_address(cur_idx) {
                    Some(a) => a,
                    None => continue,
                };
                let store_idx = self.find_prev_store_to_address(addr, cur_idx, Some(ev.call_id))
                    .or_else(|| self.find_prev_store_to_address(addr, cur_idx, None));
                if let Some(store_idx) = store_idx {
                    if !nodes.contains(&store_idx) {
                        nodes.push(store_idx);
                    }
                    edges.push(ProvenanceEdge::Mem { from: store_idx, to: cur_idx, addr });
                    if let Some(src) = crate::classify::parse_store_value_reg(&self.store.events[store_idx].asm) {
                        if let Some(prev) = self.store.prev_write(&src, store_idx) {
                            edges.push(ProvenanceEdge::Data { from: prev, to: store_idx, reg: src.clone() });
                            work.push((src, prev));
                        }
                    }
                }
                continue;
            }

            for src in ev.reads.keys() {
                if let Some(prev) = self.store.prev_write(src, cur_idx) {
                    edges.push(ProvenanceEdge::Data { from: prev, to: cur_idx, reg: src.clone() });
                    work.push((src.clone(), prev));
                }
            }
        }

        nodes.sort_unstable();
        (nodes, edges)
    }

    fn find_prev_store_to_address(
        &self,
        addr: u64,
        from_index_exclusive: usize,
        same_call_id: Option<u32>,
    ) -> Option<usize> {
        let list = self.store.store_addr_index.get(&addr)?;
        let pos = list.partition_point(|&x| x < from_index_exclusive);
        for &j in list[..pos].iter().rev() {
            if let Some(call_id) = same_call_id {
                if self.store.events[j].call_id != call_id {
                    continue;
                }
            }
            return Some(j);
        }
        None
    }

    pub fn taint_forward(&mut self, opts: &ForwardOptions, cancel: &CancellationToken) -> ForwardResult {
        let store = Arc::clone(&self.store);
        forward::taint_forward(&store, &mut self.recon, &mut self.eff, opts, cancel)
    }

    pub fn taint_backward(&mut self, opts: &BackwardOptions, cancel: &CancellationToken) -> BackwardResult {
        let store = Arc::clone(&self.store);
        backward::taint_backward(&store, &mut self.recon, &mut self.eff, opts, cancel)
    }

    /// The "advanced" forward taint variant (spec.md §5): a larger step
    /// budget. This crate does not model control-dependent (implicit)
    /// flow — see [`ForwardOptions::enable_implicit_flow`] — so "advanced"
    /// here means "more budget", not "more flow rules".
    pub fn advanced_taint(&mut self, mut opts: ForwardOptions, cancel: &CancellationToken) -> ForwardResult {
        if opts.max_steps == ForwardOptions::default().max_steps {
            opts.max_steps = forward::ADVANCED_MAX_STEPS;
        }
        self.taint_forward(&opts, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn store_from_lines(lines: &[String]) -> Arc<EventStore> {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for l in lines {
            writeln!(f, "{}", l).unwrap();
        }
        f.flush().unwrap();
        Arc::new(EventStore::parse(f.path(), 2000, None).unwrap())
    }

    fn line(pc: u64, asm: &str, reads: &str, writes: &str) -> String {
        let tail = if writes.is_empty() {
            reads.to_string()
        } else if reads.is_empty() {
            format!("=> {}", writes)
        } else {
            format!("{} => {}", reads, writes)
        };
        format!(r#"[ts][mod 0x{:x}][ab12] 0x{:x}: "{}" {}"#, pc, pc, asm, tail)
    }

    #[test]
    fn find_value_candidates_matches_reads_and_writes() {
        let lines = vec![
            line(0x1000, "mov r0, #5", "", "r0=0x5"),
            line(0x1004, "add r1, r0, #0", "r0=0x5", "r1=0x5"),
        ];
        let store = store_from_lines(&lines);
        let session = QuerySession::new(store);
        let hits = session.find_value_candidates("r0", 5);
        assert_eq!(hits, vec![0, 1]);
    }

    #[test]
    fn value_chain_follows_writer_and_subsequent_reads() {
        let lines = vec![
            line(0x1000, "mov r0, #1", "", "r0=0x1"),
            line(0x1004, "mov r0, #5", "", "r0=0x5"),
            line(0x1008, "add r1, r0, #0", "r0=0x5", "r1=0x5"),
            line(0x100c, "mov r0, #9", "", "r0=0x9"),
        ];
        let store = store_from_lines(&lines);
        let session = QuerySession::new(store);
        let chain = session.value_chain("r0", 2, 5, ChainSide::Before);
        assert!(chain.contains(&1));
        assert!(chain.contains(&2));
        assert!(!chain.contains(&3));
    }

    #[test]
    fn provenance_graph_crosses_store_load_pair() {
        let lines = vec![
            line(0x1000, "mov r0, #0x42", "", "r0=0x42"),
            line(0x1004, "str r0, [r2]", "r0=0x42 r2=0x9000", ""),
            line(0x1008, "ldr r1, [r2]", "r2=0x9000", "r1=0x42"),
        ];
        let store = store_from_lines(&lines);
        let mut session = QuerySession::new(store);
        let (nodes, edges) = session.provenance_graph("r1", 2, ChainSide::After, 1000);
        assert!(nodes.contains(&0));
        assert!(nodes.contains(&1));
        assert!(nodes.contains(&2));
        assert!(edges.iter().any(|e| matches!(e, ProvenanceEdge::Mem { from: 1, to: 2, .. })));
        assert!(edges.iter().any(|e| matches!(e, ProvenanceEdge::Data { from: 0, to: 1, .. })));
    }
}
