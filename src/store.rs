//! The append-only Event Store and its inverted indexes, plus the Call
//! Annotator.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::classify;
use crate::error::{Result, TraceError};
use crate::event::{Arch, Event, MemOp};
use crate::lexer;

/// Register-checkpoint snapshot interval, in input lines.
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 2000;

/// A running call-stack annotator: the call event is
/// annotated with the *caller's* context then pushes; the return event is
/// annotated with the *callee's* context then pops.
#[derive(Default)]
pub struct CallAnnotator {
    stack: Vec<u32>,
    next_call_id: u32,
}

impl CallAnnotator {
    pub fn new() -> Self {
        CallAnnotator {
            stack: Vec::new(),
            next_call_id: 1,
        }
    }

    pub fn annotate(&mut self, ev: &mut Event) {
        ev.call_depth = self.stack.len() as u16;
        ev.call_id = self.stack.last().copied().unwrap_or(0);

        if ev.is_call() {
            self.stack.push(self.next_call_id);
            self.next_call_id += 1;
        } else if ev.is_return() {
            self.stack.pop();
        }
    }
}

/// The frozen, append-only event database plus its inverted indexes.
///
/// Immutable after [`EventStore::parse`] returns (aside from the one-shot
/// `effaddr`/`mem_op`/`mem_width` fill-in performed by the address
/// resolver), and therefore freely shareable read-only across any number of
/// concurrent query sessions.
pub struct EventStore {
    pub events: Vec<Event>,
    pub arch: Arch,
    pub checkpoint_interval: u64,

    pub pc_index: BTreeMap<u64, Vec<usize>>,
    pub reg_read_index: BTreeMap<String, Vec<usize>>,
    pub reg_write_index: BTreeMap<String, Vec<usize>>,
    /// byte address -> ascending event indices of every store touching it.
    pub store_addr_index: BTreeMap<u64, Vec<usize>>,

    /// `line_no -> full register map`, taken every `checkpoint_interval`
    /// lines during parsing; never mutated afterwards.
    pub checkpoints: BTreeMap<u64, BTreeMap<String, u64>>,

    /// `sub_<hex>` function candidates discovered from branch targets.
    pub branch_targets: BTreeMap<u64, String>,

    pub malformed_line_count: u64,
}

impl EventStore {
    /// Parse a trace file end to end: lex every line, annotate calls,
    /// maintain the inverted indexes and register checkpoints, then
    /// precompute `effaddr`/`mem_op`/`mem_width` for every load/store.
    ///
    /// `progress_cb`, if given, is called with a percentage in `0..=100`
    /// at coarse intervals.
    pub fn parse(
        path: &Path,
        checkpoint_interval: u64,
        mut progress_cb: Option<&mut dyn FnMut(u8)>,
    ) -> Result<EventStore> {
        let file = File::open(path).map_err(|source| TraceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let total_bytes = file.metadata().map(|m| m.len()).unwrap_or(0).max(1);
        let reader = BufReader::new(file);

        let mut store = EventStore {
            events: Vec::new(),
            arch: Arch::Auto,
            checkpoint_interval,
            pc_index: BTreeMap::new(),
            reg_read_index: BTreeMap::new(),
            reg_write_index: BTreeMap::new(),
            store_addr_index: BTreeMap::new(),
            checkpoints: BTreeMap::new(),
            branch_targets: BTreeMap::new(),
            malformed_line_count: 0,
        };

        let mut current_regs: BTreeMap<String, u64> = BTreeMap::new();
        let mut annotator = CallAnnotator::new();
        let mut bytes_read: u64 = 0;
        let mut last_reported: u8 = 0;

        for (i, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| TraceError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            bytes_read += line.len() as u64 + 1;
            let line_no = (i + 1) as u64;

            match lexer::parse_line(line_no, &line, &mut store.arch) {
                Some(lexed) => {
                    let mut ev = lexed.event;
                    if let Some((addr, name)) = lexed.branch_target {
                        store.branch_targets.entry(addr).or_insert(name);
                    }

                    annotator.annotate(&mut ev);
                    apply_reads_then_writes(&mut current_regs, &ev);

                    if line_no % checkpoint_interval == 0 {
                        store.checkpoints.insert(line_no, current_regs.clone());
                    }

                    store.append(ev);
                }
                None => {
                    log::debug!("skipping malformed trace line {}", line_no);
                    store.malformed_line_count += 1;
                }
            }

            if let Some(cb) = progress_cb.as_deref_mut() {
                let pct = ((bytes_read * 100) / total_bytes).min(100) as u8;
                if pct != last_reported {
                    cb(pct);
                    last_reported = pct;
                }
            }
        }

        store.precompute_effective_addresses();
        Ok(store)
    }

    /// Rebuild a store from an already-lexed event list, e.g. one loaded
    /// from an external [`crate::cache::TraceCache`]: presence bypasses
    /// lexing and indexing, and indexes are rebuilt from the table scan.
    /// Call-id/call-depth are expected to already be set on each event;
    /// `effaddr`/`mem_op`/`mem_width` are recomputed regardless.
    pub fn from_events(events: Vec<Event>, arch: Arch, checkpoint_interval: u64) -> EventStore {
        let mut store = EventStore {
            events: Vec::new(),
            arch,
            checkpoint_interval,
            pc_index: BTreeMap::new(),
            reg_read_index: BTreeMap::new(),
            reg_write_index: BTreeMap::new(),
            store_addr_index: BTreeMap::new(),
            checkpoints: BTreeMap::new(),
            branch_targets: BTreeMap::new(),
            malformed_line_count: 0,
        };

        let mut current_regs: BTreeMap<String, u64> = BTreeMap::new();
        for mut ev in events {
            ev.effaddr = None;
            ev.mem_op = MemOp::None;
            ev.mem_width = 0;

            apply_reads_then_writes(&mut current_regs, &ev);
            if ev.line_no % checkpoint_interval == 0 {
                store.checkpoints.insert(ev.line_no, current_regs.clone());
            }
            store.append(ev);
        }

        store.precompute_effective_addresses();
        store
    }

    fn append(&mut self, ev: Event) {
        let idx = self.events.len();

        self.pc_index.entry(ev.pc).or_default().push(idx);
        for key in ev.reads.keys() {
            for alias in classify::aliases(key) {
                self.reg_read_index.entry(alias).or_default().push(idx);
            }
        }
        for key in ev.writes.keys() {
            for alias in classify::aliases(key) {
                self.reg_write_index.entry(alias).or_default().push(idx);
            }
        }

        self.events.push(ev);
    }

    /// After parsing, resolve and cache `effaddr`/`mem_op`/`mem_width` on
    /// every load/store, and populate `store_addr_index` bytewise (a
    /// 4-byte store at `A` inserts entries for `A, A+1, A+2, A+3`).
    fn precompute_effective_addresses(&mut self) {
        // Register state is reconstructed incrementally, in order, so that
        // we never need a full LRU/checkpoint reconstruction pass just to
        // precompute addresses: at event `i` the register state after
        // `i-1` is exactly the running `regs` map below, merged with `i`'s
        // own `reads` (the exact pre-instruction values the emulator
        // observed) so that the very first appearance of a base/index
        // register still resolves.
        let mut regs: BTreeMap<String, u64> = BTreeMap::new();
        for i in 0..self.events.len() {
            let (is_load, is_store, asm) = {
                let ev = &self.events[i];
                (
                    classify::is_load(&ev.asm),
                    classify::is_store(&ev.asm),
                    ev.asm.clone(),
                )
            };

            if is_load || is_store {
                let width = self.events[i].mem_access_width();
                let mut regs_for_this = regs.clone();
                for (k, v) in &self.events[i].reads {
                    regs_for_this.insert(k.clone(), *v);
                }
                if let Some(addr) = crate::addr::resolve_from_regs(&asm, &regs_for_this) {
                    let ev = &mut self.events[i];
                    ev.effaddr = Some(addr);
                    ev.mem_width = width;
                    ev.mem_op = if is_store { MemOp::Store } else { MemOp::Load };

                    if is_store {
                        for k in 0..width as u64 {
                            let byte = (addr.wrapping_add(k)) & 0xFFFF_FFFF;
                            self.store_addr_index.entry(byte).or_default().push(i);
                        }
                    }
                } else {
                    let ev = &mut self.events[i];
                    ev.mem_width = width;
                    ev.mem_op = if is_store { MemOp::Store } else { MemOp::Load };
                }
            }

            apply_reads_then_writes(&mut regs, &self.events[i]);
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The largest event index `< from_index_exclusive` that writes `reg`.
    pub fn prev_write(&self, reg: &str, from_index_exclusive: usize) -> Option<usize> {
        let list = self.reg_write_index.get(reg)?;
        let pos = list.partition_point(|&x| x < from_index_exclusive);
        if pos == 0 {
            None
        } else {
            Some(list[pos - 1])
        }
    }

    /// The smallest event index `>= from_index_inclusive` that writes `reg`.
    pub fn next_write(&self, reg: &str, from_index_inclusive: usize) -> Option<usize> {
        let list = self.reg_write_index.get(reg)?;
        let pos = list.partition_point(|&x| x < from_index_inclusive);
        list.get(pos).copied()
    }

    /// Indices in `(lo_excl, hi_excl)` that read `reg`.
    pub fn reads_in_range(&self, reg: &str, lo_excl: usize, hi_excl: usize) -> Vec<usize> {
        match self.reg_read_index.get(reg) {
            Some(list) => {
                let lo = list.partition_point(|&x| x <= lo_excl);
                let hi = list.partition_point(|&x| x < hi_excl);
                list[lo..hi].to_vec()
            }
            None => Vec::new(),
        }
    }

    pub fn find_first_event_by_pc(&self, pc: u64) -> Option<usize> {
        self.pc_index.get(&pc).and_then(|v| v.first().copied())
    }

    /// True if event `i` is an `ldr` writing `rd` from what looks like a
    /// constant pool: either the asm mentions `pc` directly, or the
    /// effective address has no store anywhere at or before `i`.
    pub fn is_constant_pool_load(&self, i: usize, rd: &str) -> bool {
        let ev = match self.events.get(i) {
            Some(ev) => ev,
            None => return false,
        };
        if !ev.writes.contains_key(rd) || !ev.asm.starts_with("ldr") {
            return false;
        }
        if ev.asm.contains("pc") {
            return true;
        }
        let addr = match ev.effaddr {
            Some(a) => a,
            None => return false,
        };
        match self.store_addr_index.get(&addr) {
            None => true,
            Some(list) => list.partition_point(|&x| x < i) == 0,
        }
    }
}

/// The fill-in-from-observed rule shared by parse-time bookkeeping and the
/// register reconstructor: for each `(k,v)` in `reads`, set the map entry
/// iff absent; then apply every `(k,v)` in `writes` unconditionally.
pub fn apply_reads_then_writes(regs: &mut BTreeMap<String, u64>, ev: &Event) {
    for (k, v) in &ev.reads {
        regs.entry(k.clone()).or_insert(*v);
    }
    for (k, v) in &ev.writes {
        regs.insert(k.clone(), *v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_trace(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for l in lines {
            writeln!(f, "{}", l).unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn indexes_contain_every_alias() {
        let f = write_trace(&[
            r#"[ts][mod 0x1][e007bea9] 0x1000: "mov x0, x1" x1=0x5 => x0=0x5"#,
        ]);
        let store = EventStore::parse(f.path(), 2000, None).unwrap();
        assert_eq!(store.events.len(), 1);
        assert!(store.reg_write_index.get("x0").unwrap().contains(&0));
        assert!(store.reg_write_index.get("w0").unwrap().contains(&0));
        assert!(store.reg_read_index.get("x1").unwrap().contains(&0));
        assert!(store.reg_read_index.get("w1").unwrap().contains(&0));
        assert!(store.pc_index.get(&0x1000).unwrap().contains(&0));
    }

    #[test]
    fn store_addr_index_byte_span() {
        let f = write_trace(&[
            r#"[ts][mod 0x1][ab12] 0x1000: "str r0, [r2]" r0=0x1234 r2=0x9000"#,
        ]);
        let store = EventStore::parse(f.path(), 2000, None).unwrap();
        for b in 0x9000u64..0x9004 {
            assert!(store.store_addr_index.get(&b).unwrap().contains(&0));
        }
        assert!(store.store_addr_index.get(&0x9004).is_none());
    }

    #[test]
    fn call_ids_monotonic() {
        let f = write_trace(&[
            r#"[ts][mod 0x1][ab12] 0x1000: "bl #0x2000""#,
            r#"[ts][mod 0x1][ab12] 0x2000: "mov r0, r1" r1=0x1 => r0=0x1"#,
            r#"[ts][mod 0x1][ab12] 0x1004: "bl #0x3000""#,
        ]);
        let store = EventStore::parse(f.path(), 2000, None).unwrap();
        assert_eq!(store.events[0].call_id, 0);
        assert_eq!(store.events[0].call_depth, 0);
        assert_eq!(store.events[1].call_id, 1);
        assert_eq!(store.events[1].call_depth, 1);
        assert_eq!(store.events[2].call_id, 1);
    }

    #[test]
    fn malformed_lines_are_counted_not_fatal() {
        let f = write_trace(&["not a trace line", r#"[ts][mod 0x1][ab12] 0x1000: "nop""#]);
        let store = EventStore::parse(f.path(), 2000, None).unwrap();
        assert_eq!(store.malformed_line_count, 1);
        assert_eq!(store.events.len(), 1);
    }
}
