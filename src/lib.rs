//! A hosted RISC-V RV32/RV64 hart execution engine, memory access layer, and
//! machine lifecycle — the core a larger emulator builds peripherals and a
//! frontend on top of, independent of any particular board model, device
//! set, or disassembler.
//!
//! Crates are organized the way a single machine's moving parts are:
//! architectural register/CSR/instruction state and the run loop live under
//! [`hart`]; paged virtual memory and MMIO dispatch live under [`mmu`] and
//! [`device`]; machine-wide concerns (RAM, device tree, boot images, the
//! power state machine) live under [`machine`]; [`runtime`] is the optional
//! background eventloop that services one or many machines.

pub mod device;
pub mod error;
pub mod fdt;
pub mod hart;
pub mod logger;
pub mod machine;
pub mod mmu;
pub mod ram;
pub mod runtime;
pub mod sync;
pub mod trap;
pub mod types;
pub mod vma;

pub use error::{BootError, ConfigError, DeviceAttachError};
pub use hart::Hart;
pub use machine::{Machine, MachineConfig, MmioHandle, PowerState};
pub use ram::Ram;
pub use trap::{Trap, TrapCause};
pub use types::{AccessType, Privilege, Xlen};
