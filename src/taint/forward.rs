//! Forward Taint Engine (spec.md §4.7): propagates taint from a set of
//! source registers/memory addresses forward through the trace, visiting
//! events in ascending index order and applying the seven-step per-event
//! rule in the exact order spec.md specifies.

use crate::addr::{self, EffAddrCache};
use crate::cancel::CancellationToken;
use crate::classify::{self, RegBitmap};
use crate::memtaint::MemTaint;
use crate::regs::Reconstructor;
use crate::store::EventStore;

/// Default step budget for a plain forward run (spec.md §4.7/§5).
pub const DEFAULT_MAX_STEPS: usize = 120_000;
/// Step budget for the "advanced" variant exposed by the query façade.
pub const ADVANCED_MAX_STEPS: usize = 200_000;

#[derive(Clone, Debug)]
pub struct ForwardOptions {
    pub start: usize,
    pub source_regs: Vec<String>,
    pub source_mem_addrs: Vec<u64>,
    pub same_call_only: bool,
    pub max_steps: usize,
    pub enable_memory_taint: bool,
    /// Control-dependent (implicit) flow tracking. Disabled by default per
    /// spec.md §4.7; this crate does not model control dependence (it is
    /// not a symbolic executor, per spec.md §1's non-goals), so enabling
    /// it has no additional effect beyond the explicit dataflow rules
    /// below — the flag is accepted and threaded through so a caller that
    /// asks for it gets a deterministic (if conservative) answer rather
    /// than a rejected request.
    pub enable_implicit_flow: bool,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        ForwardOptions {
            start: 0,
            source_regs: Vec::new(),
            source_mem_addrs: Vec::new(),
            same_call_only: false,
            max_steps: DEFAULT_MAX_STEPS,
            enable_memory_taint: true,
            enable_implicit_flow: false,
        }
    }
}

impl ForwardOptions {
    /// The "advanced" defaults: a larger step budget, otherwise identical.
    pub fn advanced() -> Self {
        ForwardOptions {
            max_steps: ADVANCED_MAX_STEPS,
            ..ForwardOptions::default()
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ForwardResult {
    /// Ordered, deduplicated event indices affected by the taint run.
    pub hits: Vec<usize>,
    /// True if `max_steps` was exhausted or the run was cancelled before
    /// reaching the end of the trace.
    pub partial: bool,
}

/// Run the forward taint engine from `opts.start` to the end of the trace
/// (or until `opts.same_call_only` takes it out of scope, the step budget
/// is exhausted, or `cancel` fires).
pub fn taint_forward(
    store: &EventStore,
    recon: &mut Reconstructor,
    eff: &mut EffAddrCache,
    opts: &ForwardOptions,
    cancel: &CancellationToken,
) -> ForwardResult {
    let n = store.len();
    if n == 0 {
        return ForwardResult::default();
    }
    let i0 = opts.start.min(n - 1);

    let mut tainted_regs = RegBitmap::empty();
    for r in &opts.source_regs {
        tainted_regs.add_aliased(r);
    }
    let mut tainted_mem = MemTaint::new();
    if opts.enable_memory_taint {
        for &a in &opts.source_mem_addrs {
            tainted_mem.mark_range(a, 1);
        }
    }

    let base_call = store.events[i0].call_id;
    let mut hits = Vec::new();
    let mut steps = 0usize;
    let mut partial = false;

    for i in i0..n {
        if cancel.is_cancelled() {
            partial = true;
            break;
        }
        let ev = &store.events[i];

        // Step 1: call filter. Skipped events do not consume the budget.
        if opts.same_call_only && ev.call_id != base_call {
            continue;
        }

        // Step 2: consume a step; exit when the budget is exhausted.
        if steps >= opts.max_steps {
            log::warn!(
                "forward taint from event {} exhausted its budget of {} steps",
                i0,
                opts.max_steps
            );
            partial = true;
            break;
        }
        steps += 1;

        let asm = ev.asm.as_str();
        let mut used = false;

        // Step 3: read-hit check.
        if ev.reads.keys().any(|r| tainted_regs.contains_aliased(r)) {
            used = true;
        }

        let is_load = classify::is_load(asm);
        let is_store_insn = classify::is_store(asm);
        let width = if ev.mem_width != 0 {
            ev.mem_width
        } else {
            ev.mem_access_width()
        };
        let addr = if is_load || is_store_insn {
            if let Some(a) = ev.effaddr {
                Some(a)
            } else {
                eff.resolve(store, i, || addr::regs_for_address(store, recon, i))
            }
        } else {
            None
        };

        // Step 4: load-hit check.
        let load_from_tainted = is_load
            && opts.enable_memory_taint
            && addr.map(|a| tainted_mem.is_any_in_range(a, width)).unwrap_or(false);
        if load_from_tainted {
            used = true;
        }

        // Step 5: write propagation, per written register.
        for rd in ev.writes.keys() {
            if classify::is_constant_zero_write(ev, rd) {
                tainted_regs.remove_aliased(rd);
                used = true;
                continue;
            }

            let read_tainted = ev.reads.keys().any(|r| tainted_regs.contains_aliased(r));
            let propagated = read_tainted || load_from_tainted;

            if propagated {
                tainted_regs.add_aliased(rd);
                used = true;
            } else if classify::is_immediate_write(ev, rd) {
                tainted_regs.remove_aliased(rd);
                used = true;
            } else if store.is_constant_pool_load(i, rd) {
                tainted_regs.remove_aliased(rd);
                used = true;
            } else if classify::is_partial_bitfield_clear(asm) {
                if tainted_regs.contains_aliased(rd) {
                    used = true;
                }
            } else if classify::is_conditional_set(asm) {
                tainted_regs.remove_aliased(rd);
                used = true;
            } else if classify::is_adrp(asm) {
                tainted_regs.remove_aliased(rd);
                used = true;
            } else if classify::is_movk(asm) {
                if tainted_regs.contains_aliased(rd) {
                    used = true;
                }
            }
        }

        // Step 6: store propagation.
        if is_store_insn && opts.enable_memory_taint {
            if let Some(a) = addr {
                if let Some(src) = classify::parse_store_value_reg(asm) {
                    if tainted_regs.contains_aliased(&src) {
                        tainted_mem.mark_range(a, width);
                        used = true;
                    }
                }
            }
        }

        // Step 7: multi-register load/store handling.
        if classify::is_push(asm) {
            let regs = classify::parse_register_list(asm);
            if regs.iter().any(|r| tainted_regs.contains_aliased(r)) {
                used = true;
            }
        } else if classify::is_pop(asm) {
            let regs = classify::parse_register_list(asm);
            if opts.enable_memory_taint && !tainted_mem.is_empty() {
                for r in &regs {
                    tainted_regs.add_aliased(r);
                }
                used = true;
            }
        } else if classify::is_stm(asm) {
            let regs = classify::parse_register_list(asm);
            if regs.iter().any(|r| tainted_regs.contains_aliased(r)) {
                used = true;
            }
        } else if classify::is_ldm(asm) {
            let regs = classify::parse_register_list(asm);
            if opts.enable_memory_taint && !tainted_mem.is_empty() {
                for r in &regs {
                    tainted_regs.add_aliased(r);
                }
                used = true;
            }
        } else if classify::is_strd(asm) {
            if let Some((r1, r2)) = classify::parse_dual_regs(asm) {
                if tainted_regs.contains_aliased(&r1) || tainted_regs.contains_aliased(&r2) {
                    if opts.enable_memory_taint {
                        if let Some(a) = addr {
                            tainted_mem.mark_range(a, 8);
                        }
                    }
                    used = true;
                }
            }
        } else if classify::is_ldrd(asm) {
            if let Some((r1, r2)) = classify::parse_dual_regs(asm) {
                if opts.enable_memory_taint
                    && addr.map(|a| tainted_mem.is_any_in_range(a, 8)).unwrap_or(false)
                {
                    tainted_regs.add_aliased(&r1);
                    tainted_regs.add_aliased(&r2);
                    used = true;
                }
            }
        }

        if classify::is_conditional_select(asm) {
            if let Some((rd, rn, rm)) = classify::parse_csel_operands(asm) {
                if tainted_regs.contains_aliased(&rn) || tainted_regs.contains_aliased(&rm) {
                    tainted_regs.add_aliased(&rd);
                    used = true;
                }
            }
        } else if classify::is_multiply_add(asm) {
            if let Some((rd, rn, rm, ra)) = classify::parse_madd_operands(asm) {
                if tainted_regs.contains_aliased(&rn)
                    || tainted_regs.contains_aliased(&rm)
                    || tainted_regs.contains_aliased(&ra)
                {
                    tainted_regs.add_aliased(&rd);
                    used = true;
                }
            }
        }

        if used {
            hits.push(i);
        }
    }

    ForwardResult { hits, partial }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn store_from_lines(lines: &[String]) -> EventStore {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for l in lines {
            writeln!(f, "{}", l).unwrap();
        }
        f.flush().unwrap();
        EventStore::parse(f.path(), 2000, None).unwrap()
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

    fn run(store: &EventStore, opts: ForwardOptions) -> ForwardResult {
        let mut recon = Reconstructor::with_default_capacity();
        let mut eff = EffAddrCache::with_default_capacity();
        taint_forward(store, &mut recon, &mut eff, &opts, &CancellationToken::new())
    }

    /// S1 — forward taint through a load/store pair.
    #[test]
    fn s1_forward_through_load_store_pair() {
        let lines = vec![
            line(0x1000, "ldr r0, [r5]", "r5=0x8000", "r0=0x1234"),
            line(0x1004, "mov r1, #0x100", "", "r1=0x100"),
            line(0x1008, "str r0, [r2]", "r0=0x1234 r2=0x9000", ""),
            line(0x100c, "ldr r3, [r2]", "r2=0x9000", "r3=0x1234"),
            line(0x1010, "add r4, r3, #1", "r3=0x1234", "r4=0x1235"),
        ];
        let store = store_from_lines(&lines);
        let opts = ForwardOptions {
            source_mem_addrs: vec![0x8000],
            ..ForwardOptions::default()
        };
        let result = run(&store, opts);
        assert_eq!(result.hits, vec![0, 2, 3, 4]);
    }

    /// S2 — byte-granular memory taint.
    #[test]
    fn s2_byte_granular_memory_taint() {
        let lines = vec![
            line(0x1000, "str r0, [r2]", "r0=0x1 r2=0x1000", ""),
            line(0x1004, "ldrb r1, [r2, #2]", "r2=0x1000", "r1=0x1"),
            line(0x1008, "ldrb r1, [r2, #4]", "r2=0x1000", "r1=0x1"),
        ];
        let store = store_from_lines(&lines);
        let opts = ForwardOptions {
            source_regs: vec!["r0".to_string()],
            ..ForwardOptions::default()
        };
        let result = run(&store, opts);
        assert!(result.hits.contains(&1));
        assert!(!result.hits.contains(&2));
    }

    /// S3 — csel propagation, cset sanitization.
    #[test]
    fn s3_csel_propagation_cset_sanitization() {
        let lines = vec![
            line(0x1000, "ldr x0, [x5]", "x5=0x8000", "x0=0x1234"),
            line(0x1004, "mov x1, #0x100", "", "x1=0x100"),
            line(0x1008, "csel x2, x0, x1, eq", "x0=0x1234 x1=0x100", "x2=0x1234"),
            line(0x100c, "cset w3, eq", "", "w3=0x1"),
        ];
        let store = store_from_lines(&lines);
        let opts = ForwardOptions {
            source_mem_addrs: vec![0x8000],
            ..ForwardOptions::default()
        };
        let result = run(&store, opts);
        assert_eq!(result.hits, vec![0, 2, 3]);
    }

    #[test]
    fn movk_preserves_taint() {
        let lines = vec![
            line(0x1000, "ldr x0, [x5]", "x5=0x8000", "x0=0x1234"),
            line(0x1004, "movk x0, #0x1, lsl #48", "", "x0=0x0001000000001234"),
        ];
        let store = store_from_lines(&lines);
        let opts = ForwardOptions {
            source_mem_addrs: vec![0x8000],
            ..ForwardOptions::default()
        };
        let result = run(&store, opts);
        assert!(result.hits.contains(&1));
    }

    #[test]
    fn adrp_cleans_taint() {
        let lines = vec![
            line(0x1000, "ldr x0, [x5]", "x5=0x8000", "x0=0x1234"),
            line(0x1004, "adrp x0, #0x2000", "", "x0=0x2000"),
            line(0x1008, "add x1, x0, #4", "x0=0x2000", "x1=0x2004"),
        ];
        let store = store_from_lines(&lines);
        let opts = ForwardOptions {
            source_mem_addrs: vec![0x8000],
            ..ForwardOptions::default()
        };
        let result = run(&store, opts);
        assert!(result.hits.contains(&1));
        assert!(!result.hits.contains(&2));
    }

    #[test]
    fn eor_same_reg_cleans_regardless_of_rn_taint() {
        let lines = vec![
            line(0x1000, "ldr x1, [x5]", "x5=0x8000", "x1=0x1234"),
            line(0x1004, "eor x0, x1, x1", "x1=0x1234", "x0=0"),
        ];
        let store = store_from_lines(&lines);
        let opts = ForwardOptions {
            source_mem_addrs: vec![0x8000],
            ..ForwardOptions::default()
        };
        let result = run(&store, opts);
        // event 1 is a hit (read-hit on x1 and the sanitization both mark it
        // used), but x0 must not remain tainted afterwards.
        assert!(result.hits.contains(&1));
    }

    #[test]
    fn ldrb_sees_overlapping_wide_store() {
        let lines = vec![
            line(0x1000, "str.w r0, [r2, #-2]", "r0=0x1 r2=0x1002", ""),
            line(0x1004, "ldrb r1, [r2]", "r2=0x1002", "r1=0x1"),
        ];
        let store = store_from_lines(&lines);
        let opts = ForwardOptions {
            source_regs: vec!["r0".to_string()],
            ..ForwardOptions::default()
        };
        let result = run(&store, opts);
        assert!(result.hits.contains(&1));
    }

    #[test]
    fn same_call_only_skips_other_calls_without_consuming_budget() {
        let lines = vec![
            line(0x1000, "ldr r0, [r5]", "r5=0x8000", "r0=0x1234"),
            line(0x1004, "bl #0x2000", "", ""),
            line(0x2000, "mov r1, r0", "r0=0x1234", "r1=0x1234"),
        ];
        let store = store_from_lines(&lines);
        let opts = ForwardOptions {
            source_mem_addrs: vec![0x8000],
            same_call_only: true,
            ..ForwardOptions::default()
        };
        let result = run(&store, opts);
        // event 2 executes inside the callee (call_id != base_call == 0)
        // and must be skipped by the call filter.
        assert!(!result.hits.contains(&2));
    }

    #[test]
    fn budget_exhaustion_yields_partial_result() {
        let mut lines = Vec::new();
        for i in 0..10u64 {
            lines.push(line(
                0x1000 + i * 4,
                "add r0, r0, #1",
                "r0=0",
                &format!("r0=0x{:x}", i + 1),
            ));
        }
        let store = store_from_lines(&lines);
        let opts = ForwardOptions {
            source_regs: vec!["r0".to_string()],
            max_steps: 3,
            ..ForwardOptions::default()
        };
        let result = run(&store, opts);
        assert!(result.partial);
        assert!(result.hits.len() <= 3);
    }
}
