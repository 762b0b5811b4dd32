//! Host-facing error types.
//!
//! Architectural traps never surface here — they are delivered to the guest
//! and consumed entirely inside the hart (see [`crate::trap`]). These
//! types cover the remaining categories from the error design: bad
//! configuration, boot I/O failures, and device attach/detach rejections.
//! Each is returned synchronously from the `Machine` API and logged at
//! `warn`/`error` by the caller; the offending operation is a no-op.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Rejected while constructing a [`crate::machine::Machine`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("hart count {0} is out of range [1, 1024]")]
    HartCountOutOfRange(u32),

    #[error("RAM base {base:#x} is not page-aligned to {page_size:#x}")]
    RamBaseNotAligned { base: u64, page_size: u64 },

    #[error("RAM size {size:#x} is not page-aligned to {page_size:#x}")]
    RamSizeNotAligned { size: u64, page_size: u64 },

    #[error("RAM size {requested:#x} exceeds the RV32 1 GiB limit, clamped to {clamped:#x}")]
    Rv32RamClamped { requested: u64, clamped: u64 },

    #[error("failed to reserve {size:#x} bytes of guest RAM: {source}")]
    RamAllocationFailed {
        size: u64,
        #[source]
        source: io::Error,
    },
}

/// Rejected while attaching or detaching an MMIO region.
#[derive(Debug, Error)]
pub enum DeviceAttachError {
    #[error("MMIO region [{addr:#x}, {end:#x}) overlaps RAM [{ram_base:#x}, {ram_end:#x})")]
    OverlapsRam {
        addr: u64,
        end: u64,
        ram_base: u64,
        ram_end: u64,
    },

    #[error("MMIO region [{addr:#x}, {end:#x}) overlaps existing device {other:?}")]
    OverlapsDevice {
        addr: u64,
        end: u64,
        other: &'static str,
    },

    #[error("device access width bounds [{min}, {max}] are not powers of two in [1, 8]")]
    InvalidWidthBounds { min: u8, max: u8 },

    #[error("no MMIO region is registered at address {0:#x}")]
    NoSuchRegion(u64),
}

/// Rejected while loading a boot image.
#[derive(Debug, Error)]
pub enum BootError {
    #[error("failed to read boot image {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("boot image {path} ({size:#x} bytes) does not fit at offset {offset:#x} in {ram_size:#x} bytes of RAM")]
    DoesNotFit {
        path: PathBuf,
        size: u64,
        offset: u64,
        ram_size: u64,
    },

    #[error("machine must be powered off before loading a new {0}")]
    MachineNotOff(&'static str),
}
