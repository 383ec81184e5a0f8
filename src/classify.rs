//! Mnemonic-directed instruction predicates: the vocabulary the taint
//! engines are built on. A flat match on the mnemonic prefix, not a class
//! hierarchy — there is no instruction-kind trait object here, just
//! functions over `&str`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::event::Event;

/// A bitmap over the fixed ARM32+ARM64 register universe.
///
/// Bit layout: `r0..r15` -> bits 0..15 (`sp`=13, `lr`=14, `pc`=15 are the
/// same bits as `r13`/`r14`/`r15`); `cpsr` -> bit 16; `x0..x30`/`w0..w30`
/// share bits 32..62; `sp` (arm64) -> bit 63; `xzr`/`wzr` -> bit 64. A
/// `u128` comfortably covers the 65 distinct slots with single machine
/// words' worth of union/intersection/difference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegBitmap(pub u128);

impl RegBitmap {
    pub fn empty() -> Self {
        RegBitmap(0)
    }

    pub fn add(&mut self, name: &str) {
        if let Some(bit) = reg_bit(name) {
            self.0 |= 1 << bit;
        }
    }

    pub fn remove(&mut self, name: &str) {
        if let Some(bit) = reg_bit(name) {
            self.0 &= !(1 << bit);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        match reg_bit(name) {
            Some(bit) => self.0 & (1 << bit) != 0,
            None => false,
        }
    }

    pub fn union(&self, other: &RegBitmap) -> RegBitmap {
        RegBitmap(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Add every alias of `name` (see [`aliases`]).
    pub fn add_aliased(&mut self, name: &str) {
        for a in aliases(name) {
            self.add(&a);
        }
    }

    pub fn remove_aliased(&mut self, name: &str) {
        for a in aliases(name) {
            self.remove(&a);
        }
    }

    /// True if `name` or any of its aliases is a member.
    pub fn contains_aliased(&self, name: &str) -> bool {
        aliases(name).iter().any(|a| self.contains(a))
    }
}

fn reg_bit(name: &str) -> Option<u32> {
    let n = name.to_lowercase();
    match n.as_str() {
        // `sp` is shared textually between ARM32 and ARM64; like the
        // original register-to-bit table this one name resolves to a
        // single bit (the ARM64 slot) since the classifier never sees an
        // `Arch` value to disambiguate.
        "sp" => return Some(63),
        "lr" => return Some(14),
        "pc" => return Some(15),
        "cpsr" => return Some(16),
        "xzr" | "wzr" => return Some(64),
        _ => {}
    }
    if let Some(rest) = n.strip_prefix('r') {
        if let Ok(i) = rest.parse::<u32>() {
            if i <= 15 {
                return Some(i);
            }
        }
    }
    if let Some(rest) = n.strip_prefix('x') {
        if let Ok(i) = rest.parse::<u32>() {
            if i <= 30 {
                return Some(32 + i);
            }
        }
    }
    if let Some(rest) = n.strip_prefix('w') {
        if let Ok(i) = rest.parse::<u32>() {
            if i <= 30 {
                return Some(32 + i);
            }
        }
    }
    None
}

/// `aliases(r)` returns `{r}` for ARM32 register names and `{xN, wN}` for
/// either half on ARM64; alias-closed sets are what every taint-set
/// membership test and update operates on.
pub fn aliases(name: &str) -> Vec<String> {
    let n = name.to_lowercase();
    if let Some(rest) = n.strip_prefix('x') {
        if rest.chars().all(|c| c.is_ascii_digit()) && !rest.is_empty() {
            return vec![n.clone(), format!("w{}", rest)];
        }
    }
    if let Some(rest) = n.strip_prefix('w') {
        if rest.chars().all(|c| c.is_ascii_digit()) && !rest.is_empty() {
            return vec![n.clone(), format!("x{}", rest)];
        }
    }
    vec![n]
}

fn mnemonic(asm: &str) -> &str {
    asm.split_whitespace().next().unwrap_or("")
}

/// `#`-containing write from one of the immediate-loading mnemonics.
/// `movk` is deliberately excluded (partial 16-bit overwrite).
pub fn is_immediate_write(ev: &Event, rd: &str) -> bool {
    if !ev.writes.contains_key(rd) {
        return false;
    }
    if !ev.asm.contains('#') {
        return false;
    }
    matches!(
        mnemonic(&ev.asm),
        "mov" | "mvn" | "orr" | "eor" | "and" | "add" | "sub" | "movw" | "movt" | "movz" | "movn"
    )
}

static TWO_OP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\w+)\s+(\w+)\s*,\s*([^,]+)$").unwrap());
static THREE_OP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+)\s+(\w+)\s*,\s*([^,]+?)\s*,\s*(.+)$").unwrap());

fn parse_zero_imm(text: &str) -> bool {
    let t = text.trim().trim_start_matches('#');
    if let Some(hex) = t.strip_prefix("0x") {
        u64::from_str_radix(hex, 16) == Ok(0)
    } else {
        t.parse::<i64>() == Ok(0)
    }
}

/// Algebraic identities that force `rd` to zero independent of any input:
/// `mov rd, xzr|wzr`; `and rd, rn, #0`; `mul|mla|mls rd, rn, #0|xzr|wzr`;
/// `eor|sub|rsb|bic rd, rn, rn` (same register on both source operands).
pub fn is_constant_zero_write(ev: &Event, rd: &str) -> bool {
    if !ev.writes.contains_key(rd) {
        return false;
    }
    let asm = ev.asm.trim();

    if let Some(caps) = TWO_OP_RE.captures(asm) {
        if &caps[1] == "mov" && &caps[2] == rd {
            let rn = caps[3].trim();
            if rn == "xzr" || rn == "wzr" {
                return true;
            }
        }
    }

    if let Some(caps) = THREE_OP_RE.captures(asm) {
        let op = &caps[1];
        let dst = &caps[2];
        let rn = caps[3].trim();
        let rm = caps[4].trim();
        if dst == rd {
            match op {
                "and" if parse_zero_imm(rm) => return true,
                "mul" | "mla" | "mls" if parse_zero_imm(rm) || rm == "xzr" || rm == "wzr" => {
                    return true
                }
                "eor" | "sub" | "rsb" | "bic" if rm == rn => return true,
                _ => {}
            }
        }
    }

    false
}

pub fn is_bitfield_op(asm: &str) -> bool {
    let m = mnemonic(asm);
    matches!(m, "ubfx" | "sbfx" | "bfc" | "bfi")
}

/// `bfc` is special: it clears a bit range of `rd` and is a *partial*
/// overwrite that does not clean register taint.
pub fn is_partial_bitfield_clear(asm: &str) -> bool {
    mnemonic(asm) == "bfc"
}

pub fn is_conditional_select(asm: &str) -> bool {
    matches!(mnemonic(asm), "csel" | "csinc" | "csinv" | "csneg")
}

pub fn is_conditional_set(asm: &str) -> bool {
    matches!(mnemonic(asm), "cset" | "csetm")
}

pub fn is_movk(asm: &str) -> bool {
    mnemonic(asm) == "movk"
}

pub fn is_adrp(asm: &str) -> bool {
    mnemonic(asm) == "adrp"
}

pub fn is_multiply_add(asm: &str) -> bool {
    matches!(
        mnemonic(asm),
        "madd" | "msub" | "smaddl" | "umaddl" | "smsubl" | "umsubl"
    )
}

pub fn is_extend(asm: &str) -> bool {
    matches!(
        mnemonic(asm),
        "sxtah" | "sxtab" | "uxtah" | "uxtab" | "sxth" | "sxtb" | "uxth" | "uxtb" | "sxtw" | "uxtw"
    )
}

pub fn is_push(asm: &str) -> bool {
    asm.trim_start().starts_with("push")
}

pub fn is_pop(asm: &str) -> bool {
    asm.trim_start().starts_with("pop")
}

pub fn is_stm(asm: &str) -> bool {
    mnemonic(asm).starts_with("stm")
}

pub fn is_ldm(asm: &str) -> bool {
    mnemonic(asm).starts_with("ldm")
}

pub fn is_strd(asm: &str) -> bool {
    mnemonic(asm) == "strd"
}

pub fn is_ldrd(asm: &str) -> bool {
    mnemonic(asm) == "ldrd"
}

pub fn is_load(asm: &str) -> bool {
    mnemonic(asm).starts_with("ldr")
}

pub fn is_store(asm: &str) -> bool {
    mnemonic(asm).starts_with("str")
}

/// Parse a register list operand, e.g. `push {r4-r7, lr}` or
/// `ldm r0, {r1-r3, pc}`: ranges (`r4-r7`) are expanded; individual names
/// (`lr`, `pc`) pass through.
pub fn parse_register_list(asm: &str) -> Vec<String> {
    let lb = match asm.find('{') {
        Some(v) => v,
        None => return Vec::new(),
    };
    let rb = match asm.find('}') {
        Some(v) if v > lb => v,
        _ => return Vec::new(),
    };
    let body = &asm[lb + 1..rb];
    let mut out = Vec::new();
    for part in body.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Some(lo_n), Some(hi_n)) = (reg_index(lo.trim()), reg_index(hi.trim())) {
                let prefix = reg_prefix(lo.trim());
                for i in lo_n..=hi_n {
                    out.push(format!("{}{}", prefix, i));
                }
                continue;
            }
        }
        out.push(part.to_lowercase());
    }
    out
}

fn reg_prefix(name: &str) -> &'static str {
    let n = name.to_lowercase();
    if n.starts_with('x') {
        "x"
    } else if n.starts_with('w') {
        "w"
    } else {
        "r"
    }
}

fn reg_index(name: &str) -> Option<u32> {
    let n = name.to_lowercase();
    let digits: String = n.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

/// Parse the two source registers of a `strd`/`ldrd r1, r2, [...]`.
pub fn parse_dual_regs(asm: &str) -> Option<(String, String)> {
    let rest = asm.splitn(2, char::is_whitespace).nth(1)?;
    let bracket = rest.find('[').unwrap_or(rest.len());
    let ops = &rest[..bracket];
    let mut it = ops.split(',').map(|s| s.trim().to_lowercase()).filter(|s| !s.is_empty());
    let r1 = it.next()?;
    let r2 = it.next()?;
    Some((r1, r2))
}

/// Parse `csel rd, rn, rm, cond` style operands (`csel`/`csinc`/`csinv`/`csneg`).
pub fn parse_csel_operands(asm: &str) -> Option<(String, String, String)> {
    let rest = asm.splitn(2, char::is_whitespace).nth(1)?;
    let mut parts = rest.split(',').map(|s| s.trim().to_lowercase());
    let rd = parts.next()?;
    let rn = parts.next()?;
    let rm = parts.next()?;
    Some((rd, rn, rm))
}

/// Parse `madd rd, rn, rm, ra` style operands (also `msub`/`s*maddl`/`*msubl`).
pub fn parse_madd_operands(asm: &str) -> Option<(String, String, String, String)> {
    let rest = asm.splitn(2, char::is_whitespace).nth(1)?;
    let mut parts = rest.split(',').map(|s| s.trim().to_lowercase());
    let rd = parts.next()?;
    let rn = parts.next()?;
    let rm = parts.next()?;
    let ra = parts.next()?;
    Some((rd, rn, rm, ra))
}

/// The register whose value a `str`/`strb`/`strh`/`stm...` writes to memory
/// (the first operand).
pub fn parse_store_value_reg(asm: &str) -> Option<String> {
    let rest = asm.splitn(2, char::is_whitespace).nth(1)?;
    let first = rest.split(',').next()?;
    Some(first.trim().to_lowercase())
}

pub fn is_call(asm: &str) -> bool {
    matches!(mnemonic(asm), "bl" | "blx")
}

pub fn is_return(asm: &str) -> bool {
    let asm = asm.trim();
    asm == "bx lr"
        || asm.starts_with("mov pc, lr")
        || (asm.starts_with("pop") && asm.contains("pc"))
        || (asm.starts_with("ldr") && asm.contains("pc"))
        || (asm.starts_with("ldm") && asm.contains("pc"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ev(asm: &str, writes: &[(&str, u64)]) -> Event {
        Event {
            asm: asm.to_string(),
            writes: writes.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            reads: BTreeMap::new(),
            ..Default::default()
        }
    }

    #[test]
    fn aliases_share_bit_on_arm64() {
        let names = aliases("x3");
        assert_eq!(names, vec!["x3", "w3"]);
        let names = aliases("w3");
        assert_eq!(names, vec!["w3", "x3"]);
        assert_eq!(aliases("r3"), vec!["r3"]);
    }

    #[test]
    fn bitmap_aliasing_arm64() {
        let mut bm = RegBitmap::empty();
        bm.add_aliased("x0");
        assert!(bm.contains_aliased("w0"));
        assert!(bm.contains("x0"));
        assert!(bm.contains("w0"));
    }

    #[test]
    fn movk_is_excluded_from_immediate_write() {
        let e = ev("movk x0, #0x1, lsl #48", &[("x0", 1)]);
        assert!(!is_immediate_write(&e, "x0"));
        assert!(is_movk(&e.asm));
    }

    #[test]
    fn eor_same_reg_is_constant_zero() {
        let e = ev("eor x0, x1, x1", &[("x0", 0)]);
        assert!(is_constant_zero_write(&e, "x0"));
    }

    #[test]
    fn mov_xzr_is_constant_zero() {
        let e = ev("mov x0, xzr", &[("x0", 0)]);
        assert!(is_constant_zero_write(&e, "x0"));
    }

    #[test]
    fn register_list_expands_ranges() {
        let list = parse_register_list("pop {r4-r7, lr, pc}");
        assert_eq!(list, vec!["r4", "r5", "r6", "r7", "lr", "pc"]);
    }

    #[test]
    fn parses_dual_regs_for_strd() {
        let (r1, r2) = parse_dual_regs("strd r1, r2, [r3]").unwrap();
        assert_eq!(r1, "r1");
        assert_eq!(r2, "r2");
    }
}
