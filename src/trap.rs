//! Trap causes, shared between the memory access layer (page/access faults)
//! and the hart's instruction dispatcher (illegal instruction, ECALL, ...).
//!
//! Any fallible step in fetch/translate/execute returns `Err(trap)` and the
//! run loop routes it through [`crate::hart::Hart::deliver_trap`] uniformly,
//! whether the fault came from a page walk or from decoding.

use crate::types::AccessType;

/// A synchronous exception, carrying the architectural `tval` recorded
/// alongside the cause (the faulting virtual address for page/access
/// faults, the raw instruction bits for illegal-instruction).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trap {
    pub cause: TrapCause,
    pub tval: u64,
}

impl Trap {
    pub fn new(cause: TrapCause, tval: u64) -> Self {
        Self { cause, tval }
    }

    /// Maps an access kind and walk/dispatch failure into the matching page
    /// fault or access fault cause.
    pub fn page_fault(access: AccessType, vaddr: u64) -> Self {
        let cause = match access {
            AccessType::Instruction => TrapCause::InstructionPageFault,
            AccessType::Load => TrapCause::LoadPageFault,
            AccessType::Store => TrapCause::StoreAmoPageFault,
        };
        Self::new(cause, vaddr)
    }

    pub fn access_fault(access: AccessType, vaddr: u64) -> Self {
        let cause = match access {
            AccessType::Instruction => TrapCause::InstructionAccessFault,
            AccessType::Load => TrapCause::LoadAccessFault,
            AccessType::Store => TrapCause::StoreAmoAccessFault,
        };
        Self::new(cause, vaddr)
    }

    pub fn misaligned(access: AccessType, vaddr: u64) -> Self {
        let cause = match access {
            AccessType::Instruction => TrapCause::InstructionAddressMisaligned,
            AccessType::Load => TrapCause::LoadAddressMisaligned,
            AccessType::Store => TrapCause::StoreAmoAddressMisaligned,
        };
        Self::new(cause, vaddr)
    }
}

/// Standard RISC-V synchronous exception codes (the low bits of `mcause`/
/// `scause` when the interrupt bit is clear).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum TrapCause {
    InstructionAddressMisaligned = 0,
    InstructionAccessFault = 1,
    IllegalInstruction = 2,
    Breakpoint = 3,
    LoadAddressMisaligned = 4,
    LoadAccessFault = 5,
    StoreAmoAddressMisaligned = 6,
    StoreAmoAccessFault = 7,
    EnvCallFromUMode = 8,
    EnvCallFromSMode = 9,
    EnvCallFromMMode = 11,
    InstructionPageFault = 12,
    LoadPageFault = 13,
    StoreAmoPageFault = 15,
}

impl TrapCause {
    pub fn code(self) -> u64 {
        self as u64
    }

    /// Whether this exception is delegated to S-mode when the corresponding
    /// `medeleg` bit is set; all synchronous causes are delegable.
    pub fn medeleg_bit(self) -> u64 {
        1u64 << self.code()
    }
}

/// Standard RISC-V interrupt codes (the low bits of `mcause`/`scause` when
/// the interrupt bit, bit XLEN-1, is set).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum InterruptCause {
    SupervisorSoftware = 1,
    MachineSoftware = 3,
    SupervisorTimer = 5,
    MachineTimer = 7,
    SupervisorExternal = 9,
    MachineExternal = 11,
}

impl InterruptCause {
    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn mie_bit(self) -> u64 {
        1u64 << self.code()
    }

    /// Priority order the run loop checks pending-enabled interrupts in,
    /// highest first.
    pub const PRIORITY: [InterruptCause; 6] = [
        InterruptCause::MachineExternal,
        InterruptCause::MachineSoftware,
        InterruptCause::MachineTimer,
        InterruptCause::SupervisorExternal,
        InterruptCause::SupervisorSoftware,
        InterruptCause::SupervisorTimer,
    ];
}
