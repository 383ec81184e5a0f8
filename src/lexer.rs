//! Parses one trace line into a typed [`Event`].
//!
//! Accepts both surface formats a trace file may use: the
//! "standard" form, whose second bracket group carries `<module> 0x<offset>`,
//! and the "alt" form, whose second bracket group is just `0x<offset>` (the
//! module is then recorded as `"unknown"`). Which form a line uses is decided
//! by whether the second bracket group begins with `0x`.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::event::{Arch, Event};

static LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?x)
        ^\[(?P<ts>[^\]]*)\]
        \[(?P<g2>[^\]]*)\]
        \s*\[(?P<enc>[0-9a-fA-F]{4}(?:\s{0,4}[0-9a-fA-F]{0,4})?)\]
        \s+0x(?P<pc>[0-9a-fA-F]+):
        \s*"(?P<asm>[^"]*)"
        (?P<tail>.*)$
        "#,
    )
    .expect("static regex is valid")
});

static REG_PAIR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([rxw][0-9]{1,2}|sp|lr|pc|cpsr)=0x([0-9a-fA-F]+)\b").unwrap());

static BRANCH_TARGET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(b|bl|beq|bne|bhi|blo|bge|blt|bpl|bmi)\s+#?0x([0-9a-fA-F]+)\b").unwrap()
});

/// The outcome of lexing a single trace line.
pub struct LexedLine {
    pub event: Event,
    /// `(target_address, synthetic_name)` if this line's instruction is a
    /// recognized branch-with-literal-target; fed to the function-candidate
    /// list but never followed by the parser itself.
    pub branch_target: Option<(u64, String)>,
}

/// Parse one raw trace line. Returns `None` on any malformed line (regex
/// miss or unparseable hex) — malformed lines are silently skipped rather
/// than treated as fatal; callers are expected to bump a malformed-line
/// counter themselves.
pub fn parse_line(line_no: u64, raw: &str, arch_hint: &mut Arch) -> Option<LexedLine> {
    let caps = LINE_RE.captures(raw)?;

    let ts = caps.name("ts")?.as_str().to_string();
    let g2 = caps.name("g2")?.as_str().trim();
    let enc = caps
        .name("enc")?
        .as_str()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let pc = u64::from_str_radix(caps.name("pc")?.as_str(), 16).ok()?;
    let asm = caps.name("asm")?.as_str().to_lowercase();
    let tail = caps.name("tail")?.as_str();

    let (module, module_offset) = if g2.starts_with("0x") {
        ("unknown".to_string(), g2.to_string())
    } else {
        match g2.rsplit_once(' ') {
            Some((name, off)) if off.starts_with("0x") => (name.to_string(), off.to_string()),
            _ => (g2.to_string(), String::new()),
        }
    };

    let (before, after) = match tail.find("=>") {
        Some(pos) => (&tail[..pos], Some(&tail[pos + 2..])),
        None => (tail, None),
    };

    let reads = extract_reg_pairs(before);
    let writes = after.map(extract_reg_pairs).unwrap_or_default();

    if *arch_hint == Arch::Auto
        && (reads.keys().chain(writes.keys())).any(|r| is_x_or_w(r))
    {
        *arch_hint = Arch::Arm64;
    }

    let branch_target = BRANCH_TARGET_RE.captures(&asm).and_then(|c| {
        let target = u64::from_str_radix(c.get(2)?.as_str(), 16).ok()?;
        Some((target, format!("sub_{:x}", target)))
    });

    let event = Event {
        line_no,
        timestamp: ts,
        module,
        module_offset,
        encoding: enc,
        pc,
        asm,
        raw: Some(raw.to_string()),
        reads,
        writes,
        effaddr: None,
        mem_op: crate::event::MemOp::None,
        mem_width: 0,
        call_id: 0,
        call_depth: 0,
    };

    Some(LexedLine {
        event,
        branch_target,
    })
}

fn is_x_or_w(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some('x') | Some('w') => {
            let rest = chars.as_str();
            !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

/// Find every `<reg>=0x<hex>` pair in `text`; duplicate keys take the last
/// occurrence (later matches overwrite earlier ones in the map).
fn extract_reg_pairs(text: &str) -> BTreeMap<String, u64> {
    let mut map = BTreeMap::new();
    for cap in REG_PAIR_RE.captures_iter(text) {
        let name = cap[1].to_lowercase();
        if let Ok(val) = u64::from_str_radix(&cap[2], 16) {
            map.insert(name, val);
        }
    }
    map
}
