//! End-to-end scenarios from spec.md's seeded test suite, driven through
//! the public `QuerySession`/`taint_forward`/`taint_backward` API rather
//! than through any module-internal type.

use std::io::Write;
use std::sync::Arc;

use armtrace::cancel::CancellationToken;
use armtrace::query::QuerySession;
use armtrace::store::EventStore;
use armtrace::taint::{BackwardOptions, ForwardOptions, TerminationTag};

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
    let mut session = QuerySession::new(store);
    let opts = ForwardOptions {
        source_mem_addrs: vec![0x8000],
        ..ForwardOptions::default()
    };
    let result = session.taint_forward(&opts, &CancellationToken::new());
    assert_eq!(result.hits, vec![0, 2, 3, 4]);
}

/// S2 — byte-granular memory taint: a narrow load 2 bytes into a tainted
/// 4-byte store sees it; a narrow load past the store's span does not.
#[test]
fn s2_byte_granular_memory_taint() {
    let lines = vec![
        line(0x1000, "str r0, [r2]", "r0=0x1 r2=0x1000", ""),
        line(0x1004, "ldrb r1, [r2, #2]", "r2=0x1000", "r1=0x1"),
        line(0x1008, "ldrb r1, [r2, #4]", "r2=0x1000", "r1=0x1"),
    ];
    let store = store_from_lines(&lines);
    let mut session = QuerySession::new(store);
    let opts = ForwardOptions {
        source_regs: vec!["r0".to_string()],
        ..ForwardOptions::default()
    };
    let result = session.taint_forward(&opts, &CancellationToken::new());
    assert!(result.hits.contains(&1));
    assert!(!result.hits.contains(&2));
}

/// S3 — csel propagates taint from a tainted source operand; cset
/// unconditionally sanitizes.
#[test]
fn s3_csel_propagation_cset_sanitization() {
    let lines = vec![
        line(0x1000, "ldr x0, [x5]", "x5=0x8000", "x0=0x1234"),
        line(0x1004, "mov x1, #0x100", "", "x1=0x100"),
        line(0x1008, "csel x2, x0, x1, eq", "x0=0x1234 x1=0x100", "x2=0x1234"),
        line(0x100c, "cset w3, eq", "", "w3=0x1"),
    ];
    let store = store_from_lines(&lines);
    let mut session = QuerySession::new(store);
    let opts = ForwardOptions {
        source_mem_addrs: vec![0x8000],
        ..ForwardOptions::default()
    };
    let result = session.taint_forward(&opts, &CancellationToken::new());
    assert_eq!(result.hits, vec![0, 2, 3]);
}

/// S4 — backward provenance through a store, terminating at a
/// constant-pool load; hits come back ascending with the const-pool load
/// first.
#[test]
fn s4_backward_through_store_to_const_pool() {
    let lines = vec![
        line(0x1000, "ldr r5, [pc, #0x20]", "", "r5=0xdeadbeef"),
        line(0x1004, "eor r5, r5, #0x14", "r5=0xdeadbeef", "r5=0xdeadbefb"),
        line(0x1008, "mvn r5, r5", "r5=0xdeadbefb", "r5=0x21415104"),
        line(0x100c, "str r5, [r0]", "r5=0x21415104 r0=0x9000", ""),
        line(0x1010, "ldr r1, [r0]", "r0=0x9000", "r1=0x21415104"),
    ];
    let store = store_from_lines(&lines);
    let mut session = QuerySession::new(store);
    let opts = BackwardOptions::new(4, "r1");
    let result = session.taint_backward(&opts, &CancellationToken::new());
    assert_eq!(result.hits.first().copied(), Some(0));
    assert_eq!(result.termination, Some(TerminationTag::ConstPool));
    assert!(result.hits.windows(2).all(|w| w[0] < w[1]));
}

/// S5 — backward termination on a parameter register: starting 3 events
/// in with no earlier write to r0 stops after a single hit.
#[test]
fn s5_backward_termination_on_parameter() {
    let lines = vec![
        line(0x1000, "mov r4, #1", "", "r4=0x1"),
        line(0x1004, "add r5, r4, #1", "r4=0x1", "r5=0x2"),
        line(0x1008, "add r6, r0, r5", "r0=0x10 r5=0x2", "r6=0x12"),
    ];
    let store = store_from_lines(&lines);
    let mut session = QuerySession::new(store);
    let opts = BackwardOptions::new(2, "r0");
    let result = session.taint_backward(&opts, &CancellationToken::new());
    assert_eq!(result.hits, vec![2]);
    assert_eq!(result.termination, Some(TerminationTag::Parameter));
}

/// S6 — multi-register pop: a prior store of a tainted register to the
/// stack leaves memory tainted, and a later `pop {r3-r5, pc}` that reads
/// anywhere in tainted memory conservatively taints every listed register
/// (the spec's explicit over-approximation, since SP is not recomputed).
#[test]
fn s6_multi_register_pop_taint() {
    let lines = vec![
        line(0x1000, "ldr r0, [r6]", "r6=0x8000", "r0=0x1234"),
        line(0x1004, "str r0, [sp]", "r0=0x1234 sp=0x7000", ""),
        line(
            0x1008,
            "pop {r3-r5, pc}",
            "sp=0x7000",
            "r3=0x1 r4=0x2 r5=0x3 pc=0x9000",
        ),
    ];
    let store = store_from_lines(&lines);
    let mut session = QuerySession::new(store);
    let opts = ForwardOptions {
        source_mem_addrs: vec![0x8000],
        ..ForwardOptions::default()
    };
    let result = session.taint_forward(&opts, &CancellationToken::new());
    assert!(result.hits.contains(&1));
    assert!(result.hits.contains(&2));
}

/// regs_at reconstructs the full architectural state, including registers
/// only ever observed via `reads` (the fill-in rule), across a checkpoint
/// boundary.
#[test]
fn regs_at_reconstructs_across_checkpoint_boundary() {
    let mut lines = Vec::new();
    for i in 0..50u64 {
        lines.push(line(
            0x1000 + i * 4,
            "add r1, r0, #1",
            "r0=0x5",
            &format!("r1=0x{:x}", 6 + i),
        ));
    }
    let store = store_from_lines(&lines);
    let mut session = QuerySession::new(store);
    let regs = session.regs_at(49);
    assert_eq!(regs.get("r0"), Some(&0x5));
    assert_eq!(regs.get("r1"), Some(&(6 + 49)));
}

/// provenance_graph tags a store/load hop through the same address as a
/// `mem` edge carrying that address.
#[test]
fn provenance_graph_mem_edge_carries_address() {
    let lines = vec![
        line(0x1000, "mov r0, #0x42", "", "r0=0x42"),
        line(0x1004, "str r0, [r2]", "r0=0x42 r2=0x9000", ""),
        line(0x1008, "ldr r1, [r2]", "r2=0x9000", "r1=0x42"),
    ];
    let store = store_from_lines(&lines);
    let mut session = QuerySession::new(store);
    let (_, edges) = session.provenance_graph("r1", 2, armtrace::query::ChainSide::After, 1000);
    let mem_edge = edges.iter().find_map(|e| match e {
        armtrace::query::ProvenanceEdge::Mem { addr, .. } => Some(*addr),
        _ => None,
    });
    assert_eq!(mem_edge, Some(0x9000));
}
