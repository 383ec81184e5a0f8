//! Effective-Address Resolver: computes the memory address accessed by a
//! load/store event from the operand registers observed *before* that
//! event executes.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::classify;
use crate::regs::Reconstructor;
use crate::store::EventStore;

const DEFAULT_EFFADDR_CACHE_CAP: usize = 8192;

/// The register state used to resolve event `i`'s own effective address:
/// the reconstructed state strictly before `i` (empty when `i == 0`),
/// merged with `i`'s own `reads` — the exact architectural values the
/// emulator observed immediately before `i` executes, including whatever
/// base/index registers `i`'s own addressing expression needs. Without
/// this merge the very first appearance of a register anywhere in the
/// trace could never resolve an address, since `regs_at(i-1)` alone
/// predates that first observation.
pub fn regs_for_address(
    store: &EventStore,
    recon: &mut Reconstructor,
    i: usize,
) -> BTreeMap<String, u64> {
    let mut regs = if i == 0 {
        BTreeMap::new()
    } else {
        recon.regs_at(store, i - 1)
    };
    if let Some(ev) = store.events.get(i) {
        for (k, v) in &ev.reads {
            regs.insert(k.clone(), *v);
        }
    }
    regs
}

/// Parse the bracketed addressing expression of a load/store mnemonic and
/// resolve it against `regs` (the register state observed *before* this
/// event). Address arithmetic is reduced modulo 2^32, even on ARM64, to
/// match the store-address index's address space.
///
/// Grammar handled: `[base]`, `[base, #imm]` (pre/post-index both yield the
/// same access address), `[base, index]`, `[base, index, lsl #n]`,
/// `[base, index, uxtw|sxtw|sxtx #n]` (the extension itself is approximated
/// as "use the value as-is"; only the shift amount is applied).
pub fn resolve_from_regs(asm: &str, regs: &BTreeMap<String, u64>) -> Option<u64> {
    let lb = asm.find('[')?;
    let rb = asm[lb..].find(']').map(|p| p + lb)?;
    let expr = asm[lb + 1..rb].trim();

    let parts: Vec<&str> = expr.split(',').map(|s| s.trim()).collect();
    let base = *parts.first()?;
    let base_val = *regs.get(&base.to_lowercase())?;

    if parts.len() == 1 {
        return Some(base_val & 0xFFFF_FFFF);
    }

    let second = parts[1];
    if let Some(imm_txt) = second.strip_prefix('#') {
        let imm = parse_imm(imm_txt).unwrap_or(0);
        return Some(base_val.wrapping_add(imm as u64) & 0xFFFF_FFFF);
    }

    // [base, index] / [base, index, lsl #n] / [base, index, uxtw|sxtw|sxtx #n]
    let index_val = regs.get(&second.to_lowercase()).copied().unwrap_or(0);
    let mut shift = 0u32;
    if let Some(modifier) = parts.get(2) {
        let m = modifier.to_lowercase();
        if let Some(pos) = m.find('#') {
            shift = parse_imm(&m[pos + 1..]).unwrap_or(0) as u32;
        }
    }
    let addr = base_val.wrapping_add(index_val << shift);
    Some(addr & 0xFFFF_FFFF)
}

fn parse_imm(text: &str) -> Option<i64> {
    let t = text.trim();
    let (neg, t) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t),
    };
    let v = if let Some(hex) = t.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()?
    } else {
        t.parse::<i64>().ok()?
    };
    Some(if neg { -v } else { v })
}

/// A bounded LRU cache over `event_index -> Option<u64>`, the query-time
/// companion to [`resolve_from_regs`]: it additionally needs `regs_at(i-1)`,
/// which only a live [`crate::regs::Reconstructor`] can provide.
pub struct EffAddrCache {
    cache: LruCache<usize, Option<u64>>,
}

impl EffAddrCache {
    pub fn new(capacity: usize) -> Self {
        EffAddrCache {
            cache: LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity is nonzero"),
            ),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_EFFADDR_CACHE_CAP)
    }

    /// Resolve `effaddr(i)`, consulting the cache first. `regs_before`
    /// lazily supplies the pre-`i` register state (see
    /// [`regs_for_address`]; only computed on a cache miss).
    pub fn resolve(
        &mut self,
        store: &EventStore,
        i: usize,
        regs_before: impl FnOnce() -> BTreeMap<String, u64>,
    ) -> Option<u64> {
        if let Some(hit) = self.cache.get(&i) {
            return *hit;
        }
        let ev = store.events.get(i)?;
        if !(classify::is_load(&ev.asm) || classify::is_store(&ev.asm)) {
            return None;
        }
        let result = if let Some(pre) = ev.effaddr {
            Some(pre)
        } else {
            resolve_from_regs(&ev.asm, &regs_before())
        };
        self.cache.put(i, result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn simple_base() {
        let r = regs(&[("r0", 0x1000)]);
        assert_eq!(resolve_from_regs("ldr r1, [r0]", &r), Some(0x1000));
    }

    #[test]
    fn base_plus_imm_offset() {
        let r = regs(&[("r0", 0x1000)]);
        assert_eq!(resolve_from_regs("ldr r1, [r0, #4]", &r), Some(0x1004));
    }

    #[test]
    fn pre_index_adds_imm() {
        let r = regs(&[("x0", 0x1000)]);
        assert_eq!(resolve_from_regs("str x1, [x0, #0x10]!", &r), Some(0x1010));
    }

    #[test]
    fn post_index_uses_old_base() {
        let r = regs(&[("x0", 0x1000)]);
        // post-index form: `[x0], #0x10` — the base offset is outside the
        // brackets, so `expr` is just `x0` and the access address is the
        // unmodified base.
        assert_eq!(resolve_from_regs("str x1, [x0], #0x10", &r), Some(0x1000));
    }

    #[test]
    fn base_plus_shifted_index() {
        let r = regs(&[("x0", 0x1000), ("x2", 0x2)]);
        assert_eq!(
            resolve_from_regs("ldr x1, [x0, x2, lsl #3]", &r),
            Some(0x1010)
        );
    }

    #[test]
    fn missing_base_is_none() {
        let r = regs(&[]);
        assert_eq!(resolve_from_regs("ldr r1, [r0]", &r), None);
    }

    #[test]
    fn reduces_modulo_32_bits() {
        let r = regs(&[("x0", 0x1_0000_0000)]);
        assert_eq!(resolve_from_regs("ldr x1, [x0]", &r), Some(0));
    }
}
