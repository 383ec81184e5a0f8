//! Command-line front end over [`armtrace::query::QuerySession`]: parse a
//! trace, then ask one of a handful of fixed questions about it and print
//! the answer as JSON. Built the same way the original tracer CLI was:
//! one `clap::App` assembled up front, `env_logger::init()` before
//! anything else, `run() -> anyhow::Result<()>` kept separate from
//! `main()`'s exit-code dispatch.

use std::path::Path;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{App, Arg, SubCommand};

use armtrace::cancel::CancellationToken;
use armtrace::query::{ChainSide, ProvenanceEdge, QuerySession};
use armtrace::store::{EventStore, DEFAULT_CHECKPOINT_INTERVAL};
use armtrace::taint::{BackwardOptions, ForwardOptions};

fn app<'a, 'b>() -> App<'a, 'b> {
    let trace_arg = Arg::with_name("trace")
        .help("Path to the trace file to analyze")
        .index(1)
        .required(true);

    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .subcommand(
            SubCommand::with_name("parse")
                .about("Parse a trace and report summary statistics")
                .arg(trace_arg.clone()),
        )
        .subcommand(
            SubCommand::with_name("regs-at")
                .about("Print the reconstructed register state observed after event N")
                .arg(trace_arg.clone())
                .arg(Arg::with_name("index").help("Event index").index(2).required(true)),
        )
        .subcommand(
            SubCommand::with_name("taint-forward")
                .about("Run forward taint propagation from a set of source registers/addresses")
                .arg(trace_arg.clone())
                .arg(Arg::with_name("start").help("Start event index").index(2).required(true))
                .arg(
                    Arg::with_name("reg")
                        .long("reg")
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1)
                        .help("Source register (repeatable)"),
                )
                .arg(
                    Arg::with_name("addr")
                        .long("addr")
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1)
                        .help("Source memory address, hex or decimal (repeatable)"),
                )
                .arg(
                    Arg::with_name("same-call-only")
                        .long("same-call-only")
                        .help("Stay within the starting call frame"),
                )
                .arg(Arg::with_name("advanced").long("advanced").help("Use the larger step budget")),
        )
        .subcommand(
            SubCommand::with_name("taint-backward")
                .about("Run backward taint propagation to a register's provenance")
                .arg(trace_arg.clone())
                .arg(Arg::with_name("start").help("Start event index").index(2).required(true))
                .arg(Arg::with_name("reg").help("Target register").index(3).required(true))
                .arg(
                    Arg::with_name("same-call-only")
                        .long("same-call-only")
                        .help("Stay within the starting call frame"),
                ),
        )
        .subcommand(
            SubCommand::with_name("candidates")
                .about("Find events where a register holds a given value")
                .arg(trace_arg.clone())
                .arg(Arg::with_name("reg").index(2).required(true))
                .arg(Arg::with_name("value").index(3).required(true)),
        )
        .subcommand(
            SubCommand::with_name("chain")
                .about("Trace a value held in a register forward/backward until it changes")
                .arg(trace_arg.clone())
                .arg(Arg::with_name("start").index(2).required(true))
                .arg(Arg::with_name("reg").index(3).required(true))
                .arg(Arg::with_name("value").index(4).required(true))
                .arg(
                    Arg::with_name("side")
                        .long("side")
                        .takes_value(true)
                        .possible_values(&["before", "after"])
                        .default_value("before"),
                ),
        )
        .subcommand(
            SubCommand::with_name("provenance")
                .about("Build a dataflow/memory provenance graph for a register's value")
                .arg(trace_arg)
                .arg(Arg::with_name("start").index(2).required(true))
                .arg(Arg::with_name("reg").index(3).required(true))
                .arg(
                    Arg::with_name("side")
                        .long("side")
                        .takes_value(true)
                        .possible_values(&["before", "after"])
                        .default_value("after"),
                ),
        )
}

fn parse_int(text: &str) -> Result<u64> {
    if let Some(hex) = text.strip_prefix("0x") {
        Ok(u64::from_str_radix(hex, 16)?)
    } else {
        Ok(text.parse()?)
    }
}

fn open_store(path: &str) -> Result<Arc<EventStore>> {
    let store = EventStore::parse(Path::new(path), DEFAULT_CHECKPOINT_INTERVAL, None)
        .with_context(|| format!("parsing trace file {}", path))?;
    Ok(Arc::new(store))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run() -> Result<()> {
    let matches = app().get_matches();

    match matches.subcommand() {
        ("parse", Some(sub)) => {
            let store = open_store(sub.value_of("trace").unwrap())?;
            print_json(&serde_json::json!({
                "events": store.len(),
                "malformed_lines": store.malformed_line_count,
                "arch": format!("{:?}", store.arch),
                "checkpoints": store.checkpoints.len(),
            }))?;
        }
        ("regs-at", Some(sub)) => {
            let store = open_store(sub.value_of("trace").unwrap())?;
            let index: usize = sub.value_of("index").unwrap().parse().context("event index")?;
            let mut session = QuerySession::new(store);
            print_json(&session.regs_at(index))?;
        }
        ("taint-forward", Some(sub)) => {
            let store = open_store(sub.value_of("trace").unwrap())?;
            let start: usize = sub.value_of("start").unwrap().parse().context("start index")?;
            let mut opts = ForwardOptions {
                start,
                same_call_only: sub.is_present("same-call-only"),
                ..ForwardOptions::default()
            };
            if let Some(regs) = sub.values_of("reg") {
                opts.source_regs = regs.map(|s| s.to_lowercase()).collect();
            }
            if let Some(addrs) = sub.values_of("addr") {
                opts.source_mem_addrs = addrs.map(parse_int).collect::<Result<Vec<_>>>()?;
            }
            let mut session = QuerySession::new(store);
            let cancel = CancellationToken::new();
            let result = if sub.is_present("advanced") {
                session.advanced_taint(opts, &cancel)
            } else {
                session.taint_forward(&opts, &cancel)
            };
            print_json(&serde_json::json!({
                "hits": result.hits,
                "partial": result.partial,
            }))?;
        }
        ("taint-backward", Some(sub)) => {
            let store = open_store(sub.value_of("trace").unwrap())?;
            let start: usize = sub.value_of("start").unwrap().parse().context("start index")?;
            let opts = BackwardOptions {
                same_call_only: sub.is_present("same-call-only"),
                ..BackwardOptions::new(start, sub.value_of("reg").unwrap().to_lowercase())
            };
            let mut session = QuerySession::new(store);
            let result = session.taint_backward(&opts, &CancellationToken::new());
            print_json(&serde_json::json!({
                "hits": result.hits,
                "termination": result.termination.map(|t| format!("{:?}", t)),
                "partial": result.partial,
            }))?;
        }
        ("candidates", Some(sub)) => {
            let store = open_store(sub.value_of("trace").unwrap())?;
            let value = parse_int(sub.value_of("value").unwrap())?;
            let session = QuerySession::new(store);
            let hits = session.find_value_candidates(sub.value_of("reg").unwrap(), value);
            print_json(&hits)?;
        }
        ("chain", Some(sub)) => {
            let store = open_store(sub.value_of("trace").unwrap())?;
            let start: usize = sub.value_of("start").unwrap().parse().context("start index")?;
            let value = parse_int(sub.value_of("value").unwrap())?;
            let side = match sub.value_of("side").unwrap() {
                "after" => ChainSide::After,
                _ => ChainSide::Before,
            };
            let session = QuerySession::new(store);
            let chain = session.value_chain(sub.value_of("reg").unwrap(), start, value, side);
            print_json(&chain)?;
        }
        ("provenance", Some(sub)) => {
            let store = open_store(sub.value_of("trace").unwrap())?;
            let start: usize = sub.value_of("start").unwrap().parse().context("start index")?;
            let side = match sub.value_of("side").unwrap() {
                "before" => ChainSide::Before,
                _ => ChainSide::After,
            };
            let mut session = QuerySession::new(store);
            let (nodes, edges) = session.provenance_graph(sub.value_of("reg").unwrap(), start, side, 4000);
            let edges_json: Vec<_> = edges
                .iter()
                .map(|e| match e {
                    ProvenanceEdge::Data { from, to, reg } => {
                        serde_json::json!({"kind": "data", "from": from, "to": to, "reg": reg})
                    }
                    ProvenanceEdge::Mem { from, to, addr } => {
                        serde_json::json!({"kind": "mem", "from": from, "to": to, "addr": format!("0x{:08x}", addr)})
                    }
                })
                .collect();
            print_json(&serde_json::json!({"nodes": nodes, "edges": edges_json}))?;
        }
        _ => {
            app().print_long_help()?;
            println!();
        }
    }

    Ok(())
}

fn main() {
    env_logger::init();

    process::exit(match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Fatal: {:#}", e);
            1
        }
    });
}
