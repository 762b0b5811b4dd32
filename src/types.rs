//! Shared enums used by both the memory access layer and the hart — kept in
//! one place so `mmu` does not need to depend on `hart` for them; the
//! dependency runs the other way, since the hart calls into the memory
//! access layer and not vice versa.

/// RV32 vs. RV64, chosen once at machine creation and never changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Xlen {
    Rv32,
    Rv64,
}

impl Xlen {
    pub fn bits(self) -> u32 {
        match self {
            Xlen::Rv32 => 32,
            Xlen::Rv64 => 64,
        }
    }

    /// Mask a raw value to the active XLEN, sign-extending from bit
    /// `bits - 1` the way register writes on RV32 do.
    pub fn sign_extend(self, value: u64) -> u64 {
        match self {
            Xlen::Rv64 => value,
            Xlen::Rv32 => (value as i32) as i64 as u64,
        }
    }
}

/// Privilege level. Encodings match the 2-bit field RISC-V uses in
/// `mstatus.MPP`/`sstatus.SPP`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Privilege {
    User = 0b00,
    Supervisor = 0b01,
    Machine = 0b11,
}

impl Privilege {
    pub fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0b00 => Privilege::User,
            0b01 => Privilege::Supervisor,
            _ => Privilege::Machine,
        }
    }

    pub fn bits(self) -> u64 {
        self as u64
    }
}

/// The kind of access being translated/dispatched — decides which page
/// fault variant a failed translation raises.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessType {
    Instruction,
    Load,
    Store,
}
