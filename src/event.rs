use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Architecture hint, derived once any `xN`/`wN` register is observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arch {
    Auto,
    Arm32,
    Arm64,
}

impl Default for Arch {
    fn default() -> Self {
        Arch::Auto
    }
}

/// The kind of memory access, if any, a load/store event performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemOp {
    None,
    Load,
    Store,
}

impl Default for MemOp {
    fn default() -> Self {
        MemOp::None
    }
}

/// One parsed trace line: the atomic unit of the [`crate::store::EventStore`].
///
/// `reads`/`writes` hold the architectural register state observed by the
/// emulator immediately before/after this instruction executed. Register
/// names are normalized to lowercase at ingest; ARM64 `xN`/`wN` aliasing is
/// resolved by [`crate::classify::aliases`], not by this struct.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Event {
    pub line_no: u64,
    pub timestamp: String,
    pub module: String,
    pub module_offset: String,
    pub encoding: String,
    pub pc: u64,
    pub asm: String,
    pub raw: Option<String>,

    pub reads: BTreeMap<String, u64>,
    pub writes: BTreeMap<String, u64>,

    pub effaddr: Option<u64>,
    pub mem_op: MemOp,
    pub mem_width: u8,

    pub call_id: u32,
    pub call_depth: u16,
}

impl Event {
    /// Width in bytes of this event's load/store, derived from the mnemonic
    /// suffix (`b`->1, `h`->2, `d`->8, default 4) or the register operand
    /// width (`xN` -> 8, else 4), in that order of precedence.
    pub fn mem_access_width(&self) -> u8 {
        let mnem = self.asm.split_whitespace().next().unwrap_or("");
        if mnem.ends_with('b') {
            1
        } else if mnem.ends_with('h') {
            2
        } else if mnem.ends_with('d') {
            8
        } else if self.asm.contains('x') && self.uses_x_register() {
            8
        } else {
            4
        }
    }

    fn uses_x_register(&self) -> bool {
        self.reads.keys().chain(self.writes.keys()).any(|r| {
            let mut chars = r.chars();
            chars.next() == Some('x') && chars.next().map(|c| c.is_ascii_digit()).unwrap_or(false)
        })
    }

    /// The mnemonic, lowercased, with no operands.
    pub fn mnemonic(&self) -> &str {
        self.asm.split_whitespace().next().unwrap_or("")
    }

    pub fn is_call(&self) -> bool {
        crate::classify::is_call(&self.asm)
    }

    pub fn is_return(&self) -> bool {
        crate::classify::is_return(&self.asm)
    }
}
