//! The MMIO device contract and the registry record that describes an
//! attached device.
//!
//! Concrete device models (UART, framebuffer, PLIC, ...) live outside this
//! crate; this module defines only the capability set a device must
//! implement and the bookkeeping the machine keeps for it.

use std::sync::Arc;

/// Capabilities an MMIO device exposes. `read`/`write` return `false` on
/// failure, which the memory access layer turns into a guest access fault;
/// `update` is ticked by the eventloop, `reset`/`remove` by the machine
/// lifecycle. Implementations must tolerate `update` and an access running
/// concurrently on different threads, or guard themselves internally — the
/// machine only ever serializes *attach/detach*, not steady-state access.
pub trait MmioDevice: Send + Sync {
    fn read(&self, offset: u64, width: u8, dst: &mut [u8]) -> bool;
    fn write(&self, offset: u64, width: u8, src: &[u8]) -> bool;

    /// Ticked once per eventloop iteration. Default no-op for devices with
    /// no time-driven behavior.
    fn update(&self) {}

    /// Invoked on `reset_machine(reset = true)`. Default no-op.
    fn reset(&self) {}

    /// Invoked on detach, before the region's data is dropped. Default no-op
    /// (plain `Drop` on the device's own data is usually enough).
    fn remove(&self) {}

    /// Stable identifier surfaced in logs and diagnostics.
    fn type_name(&self) -> &'static str;
}

/// A registered MMIO region. Size 0 marks a placeholder left behind by
/// `detach_mmio` so handles remain stable; the memory access layer skips
/// zero-sized records when scanning.
pub struct MmioRegion {
    pub addr: u64,
    pub size: u64,
    pub min_op_size: u8,
    pub max_op_size: u8,
    pub device: Option<Arc<dyn MmioDevice>>,
}

impl MmioRegion {
    pub fn end(&self) -> u64 {
        self.addr + self.size
    }

    pub fn is_placeholder(&self) -> bool {
        self.size == 0
    }

    pub fn contains(&self, addr: u64) -> bool {
        !self.is_placeholder() && addr >= self.addr && addr < self.end()
    }

    pub fn overlaps(&self, addr: u64, size: u64) -> bool {
        if self.is_placeholder() || size == 0 {
            return false;
        }
        addr < self.end() && self.addr < addr + size
    }

    pub fn supports_width(&self, width: u8) -> bool {
        width.is_power_of_two() && width >= self.min_op_size && width <= self.max_op_size
    }

    pub fn type_name(&self) -> &'static str {
        self.device.as_ref().map_or("<removed>", |d| d.type_name())
    }
}

/// Normalize a requested width range to powers of two in `[1, 8]`, per the
/// MMIO device record invariant. Returns `None` if the range can't be
/// normalized (e.g. `min > max`).
pub fn normalize_width_bounds(min: u8, max: u8) -> Option<(u8, u8)> {
    fn next_pow2_clamped(n: u8) -> u8 {
        let n = n.max(1).min(8);
        n.next_power_of_two().min(8)
    }
    let min = next_pow2_clamped(min);
    let max = next_pow2_clamped(max);
    if min > max {
        None
    } else {
        Some((min, max))
    }
}

#[cfg(test)]
pub(crate) mod test_devices {
    use super::MmioDevice;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Echoes the accessed offset back as the read value; used by the
    /// dispatch tests that exercise attach/detach and guest-visible reads.
    pub struct EchoDevice {
        pub last_write_width: AtomicU64,
    }

    impl EchoDevice {
        pub fn new() -> Self {
            Self {
                last_write_width: AtomicU64::new(0),
            }
        }
    }

    impl MmioDevice for EchoDevice {
        fn read(&self, offset: u64, width: u8, dst: &mut [u8]) -> bool {
            let bytes = offset.to_le_bytes();
            dst[..width as usize].copy_from_slice(&bytes[..width as usize]);
            true
        }

        fn write(&self, _offset: u64, width: u8, _src: &[u8]) -> bool {
            self.last_write_width.store(width as u64, Ordering::SeqCst);
            true
        }

        fn type_name(&self) -> &'static str {
            "echo"
        }
    }

    /// Backs reads and writes with a plain byte buffer, so dispatch tests can
    /// assert the exact bytes a device received or should return instead of
    /// just a derived value.
    pub struct RamShadowDevice {
        backing: Mutex<Vec<u8>>,
    }

    impl RamShadowDevice {
        pub fn new(size: usize) -> Self {
            Self {
                backing: Mutex::new(vec![0u8; size]),
            }
        }

        pub fn snapshot(&self) -> Vec<u8> {
            self.backing.lock().unwrap().clone()
        }
    }

    impl MmioDevice for RamShadowDevice {
        fn read(&self, offset: u64, width: u8, dst: &mut [u8]) -> bool {
            let backing = self.backing.lock().unwrap();
            let start = offset as usize;
            let end = start + width as usize;
            match backing.get(start..end) {
                Some(bytes) => {
                    dst[..width as usize].copy_from_slice(bytes);
                    true
                }
                None => false,
            }
        }

        fn write(&self, offset: u64, width: u8, src: &[u8]) -> bool {
            let mut backing = self.backing.lock().unwrap();
            let start = offset as usize;
            let end = start + width as usize;
            match backing.get_mut(start..end) {
                Some(slot) => {
                    slot.copy_from_slice(&src[..width as usize]);
                    true
                }
                None => false,
            }
        }

        fn reset(&self) {
            self.backing.lock().unwrap().iter_mut().for_each(|b| *b = 0);
        }

        fn type_name(&self) -> &'static str {
            "ram_shadow"
        }
    }
}
