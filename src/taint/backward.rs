//! Backward Taint Engine (spec.md §4.8): reverse dataflow from a
//! (register, value) target back to its provenance, terminating at one
//! of a small vocabulary of source classifications.

use crate::addr::{self, EffAddrCache};
use crate::cancel::CancellationToken;
use crate::classify::{self, RegBitmap};
use crate::event::Event;
use crate::memtaint::MemTaint;
use crate::regs::Reconstructor;
use crate::store::EventStore;

pub const DEFAULT_MAX_STEPS: usize = 100_000;

/// How a register's provenance terminated (spec.md §4.8/GLOSSARY).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationTag {
    Immediate,
    ImmediateZero,
    ConstPool,
    Parameter,
    Syscall,
    StackVar,
}

#[derive(Clone, Debug)]
pub struct BackwardOptions {
    pub start: usize,
    pub target_reg: String,
    /// Candidate-disambiguation value; not consulted by `taint_backward`
    /// itself (see [`find_value_candidates`] in `query` for that), kept
    /// here only so callers can round-trip the original request.
    pub value: Option<u64>,
    pub same_call_only: bool,
    pub max_steps: usize,
    pub enable_memory_taint: bool,
}

impl BackwardOptions {
    pub fn new(start: usize, target_reg: impl Into<String>) -> Self {
        BackwardOptions {
            start,
            target_reg: target_reg.into(),
            value: None,
            same_call_only: false,
            max_steps: DEFAULT_MAX_STEPS,
            enable_memory_taint: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BackwardResult {
    /// Ascending event-index order (earliest provenance first).
    pub hits: Vec<usize>,
    /// The termination tag recorded at the earliest hit, if the walk
    /// reached a source rather than exhausting its budget.
    pub termination: Option<TerminationTag>,
    pub partial: bool,
}

/// Classify whether event `i`'s write to `rd` is a provenance source
/// (spec.md §4.8's termination tags), or `None` to keep walking into
/// `rd`'s own operands.
pub fn classify_backward_source(store: &EventStore, i: usize, rd: &str) -> Option<TerminationTag> {
    let ev = store.events.get(i)?;
    if !ev.writes.contains_key(rd) {
        return None;
    }

    if classify::is_constant_zero_write(ev, rd) {
        return Some(TerminationTag::ImmediateZero);
    }
    // `is_immediate_write` flags any `#`-operand op in a fixed mnemonic set,
    // including ones with a real register operand (`add rd, rn, #imm`).
    // Only a write with no register reads at all (`mov rd, #imm` and
    // friends) is a genuine dead end; anything that also reads a register
    // still has provenance to walk into.
    if classify::is_immediate_write(ev, rd) && ev.reads.is_empty() {
        return Some(TerminationTag::Immediate);
    }
    if store.is_constant_pool_load(i, rd) {
        return Some(TerminationTag::ConstPool);
    }
    if matches!(rd, "r0" | "x0" | "w0") && i > 0 {
        if store.events[i - 1].asm.trim_start().starts_with("svc") {
            return Some(TerminationTag::Syscall);
        }
    }
    if ev.asm.starts_with("ldr") && ev.asm.contains("[sp") {
        return Some(TerminationTag::StackVar);
    }

    None
}

fn is_parameter_register(name: &str) -> bool {
    matches!(
        name,
        "r0" | "r1" | "r2" | "r3"
    ) || matches!(name, n if n.starts_with('x') || n.starts_with('w'))
        && name[1..].parse::<u32>().map(|n| n <= 7).unwrap_or(false)
}

fn event_writes_alias(ev: &Event, reg: &str) -> bool {
    classify::aliases(reg).iter().any(|a| ev.writes.contains_key(a))
}

/// Whether `reg` has a defining write within the 50 events preceding `i`
/// (spec.md §4.8's parameter-register lookback window).
fn has_prior_write(store: &EventStore, i: usize, reg: &str) -> bool {
    (i.saturating_sub(50)..i).rev().any(|j| event_writes_alias(&store.events[j], reg))
}

/// Run the backward taint engine from `opts.start`, descending to 0.
pub fn taint_backward(
    store: &EventStore,
    recon: &mut Reconstructor,
    eff: &mut EffAddrCache,
    opts: &BackwardOptions,
    cancel: &CancellationToken,
) -> BackwardResult {
    let n = store.len();
    if n == 0 {
        return BackwardResult::default();
    }
    let start_idx = opts.start.min(n - 1);
    let target_reg = opts.target_reg.to_lowercase();

    let mut tainted_regs = RegBitmap::empty();
    tainted_regs.add_aliased(&target_reg);
    let mut tainted_mem = MemTaint::new();
    let mut terminated_regs = RegBitmap::empty();

    let base_call = store.events[start_idx].call_id;
    let mut hits = Vec::new();
    let mut steps = 0usize;
    let mut partial = false;
    let mut termination = None;

    let mut i = start_idx as i64;
    while i >= 0 {
        let idx = i as usize;
        if cancel.is_cancelled() {
            partial = true;
            break;
        }
        let ev = &store.events[idx];

        if opts.same_call_only && ev.call_id != base_call {
            i -= 1;
            continue;
        }
        if steps >= opts.max_steps {
            log::warn!(
                "backward taint from event {} exhausted its budget of {} steps",
                start_idx,
                opts.max_steps
            );
            partial = true;
            break;
        }
        steps += 1;

        let asm = ev.asm.as_str();
        let mut used = false;

        // Step 3: written-register check, with termination classification.
        let mut written_tainted_not_terminated: Vec<String> = Vec::new();
        for rd in ev.writes.keys() {
            if tainted_regs.contains_aliased(rd) && !terminated_regs.contains_aliased(rd) {
                written_tainted_not_terminated.push(rd.clone());
            }
        }
        if !written_tainted_not_terminated.is_empty() {
            used = true;
            for rd in &written_tainted_not_terminated {
                tainted_regs.remove_aliased(rd);
                if let Some(tag) = classify_backward_source(store, idx, rd) {
                    terminated_regs.add_aliased(rd);
                    if termination.is_none() {
                        termination = Some(tag);
                    }
                    continue;
                }
                if classify::is_load(asm) {
                    // The value came from memory, not from this load's own
                    // addressing registers — track provenance through
                    // `tainted_mem`, not by tainting the base/index regs.
                    if opts.enable_memory_taint {
                        let width = if ev.mem_width != 0 {
                            ev.mem_width
                        } else {
                            ev.mem_access_width()
                        };
                        let resolved = if let Some(a) = ev.effaddr {
                            Some(a)
                        } else {
                            eff.resolve(store, idx, || addr::regs_for_address(store, recon, idx))
                        };
                        if let Some(a) = resolved {
                            tainted_mem.mark_range(a, width);
                        }
                    }
                } else {
                    for rn in ev.reads.keys() {
                        tainted_regs.add_aliased(rn);
                    }
                }
            }
        }

        // Step 4: read-register check. A tainted register read with no
        // earlier write in the lookback window is a parameter register
        // (spec.md §4.8): it terminates right here rather than propagating
        // further, since there is no defining event left to walk to.
        for rn in ev.reads.keys() {
            if !tainted_regs.contains_aliased(rn) || terminated_regs.contains_aliased(rn) {
                continue;
            }
            used = true;
            if is_parameter_register(rn) && !has_prior_write(store, idx, rn) {
                terminated_regs.add_aliased(rn);
                if termination.is_none() {
                    termination = Some(TerminationTag::Parameter);
                }
            }
        }

        // Step 5: store into tainted memory propagates back to the source.
        if !used && opts.enable_memory_taint && classify::is_store(asm) {
            let width = if ev.mem_width != 0 {
                ev.mem_width
            } else {
                ev.mem_access_width()
            };
            let resolved = if let Some(a) = ev.effaddr {
                Some(a)
            } else {
                eff.resolve(store, idx, || addr::regs_for_address(store, recon, idx))
            };
            if let Some(a) = resolved {
                if tainted_mem.is_any_in_range(a, width) {
                    used = true;
                    // Only the stored value register feeds provenance here;
                    // the base/index registers are addressing, not data.
                    if let Some(src) = classify::parse_store_value_reg(asm) {
                        tainted_regs.add_aliased(&src);
                    }
                }
            }
        }

        if used {
            hits.push(idx);
        }
        i -= 1;
    }

    hits.reverse();
    BackwardResult {
        hits,
        termination,
        partial,
    }
}
