//! Per-hart guest timer: a cycle counter plus `mtimecmp`. The
//! machine-timer interrupt is asserted when the cycle counter reaches or
//! exceeds `mtimecmp`.
//!
//! Modeled on elapsed wall-clock time rather than instructions retired —
//! the same choice a hosted emulator's `mtime` conventionally makes, since
//! cycle-exact timing across harts isn't a goal here. Built on atomics
//! rather than a lock: the eventloop thread reads `pending()` every tick
//! while the hart's own thread may concurrently reset it, and neither side
//! should have to block the other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// The conventional RISC-V CLINT timer frequency most guest boot protocols
/// (OpenSBI, Linux's `riscv,timer`) assume for `time`/`mtime`.
const TIMER_FREQ_HZ: u64 = 10_000_000;

/// A process-wide zero point so every hart's `AtomicU64` can store a plain
/// nanosecond offset instead of an `Instant`, which has no atomic form.
fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

pub struct HartTimer {
    start_nanos: AtomicU64,
    mtimecmp: AtomicU64,
}

impl HartTimer {
    pub fn new() -> Self {
        Self {
            start_nanos: AtomicU64::new(epoch().elapsed().as_nanos() as u64),
            mtimecmp: AtomicU64::new(u64::MAX),
        }
    }

    /// Guest-visible `time`/`mtime`: host time elapsed since this timer was
    /// last reset, scaled to [`TIMER_FREQ_HZ`].
    pub fn cycles(&self) -> u64 {
        let now = epoch().elapsed().as_nanos() as u64;
        let elapsed = now.saturating_sub(self.start_nanos.load(Ordering::Relaxed));
        elapsed.saturating_mul(TIMER_FREQ_HZ) / 1_000_000_000
    }

    pub fn mtimecmp(&self) -> u64 {
        self.mtimecmp.load(Ordering::Relaxed)
    }

    /// Set by the (out-of-scope) CLINT device model on a guest write to its
    /// `mtimecmp` register.
    pub fn set_mtimecmp(&self, value: u64) {
        self.mtimecmp.store(value, Ordering::Relaxed);
    }

    /// Whether the machine-timer interrupt condition currently holds.
    pub fn pending(&self) -> bool {
        self.cycles() >= self.mtimecmp.load(Ordering::Relaxed)
    }

    /// Reinitializes the timer on machine reset: cycle count back to zero,
    /// compare back to "never fires" until the guest programs it.
    pub fn reset(&self) {
        self.start_nanos
            .store(epoch().elapsed().as_nanos() as u64, Ordering::Relaxed);
        self.mtimecmp.store(u64::MAX, Ordering::Relaxed);
    }
}

impl Default for HartTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_timer_is_not_pending() {
        let timer = HartTimer::new();
        assert!(!timer.pending());
    }

    #[test]
    fn mtimecmp_at_zero_is_immediately_pending() {
        let timer = HartTimer::new();
        timer.set_mtimecmp(0);
        assert!(timer.pending());
    }

    #[test]
    fn reset_clears_a_fired_compare() {
        let timer = HartTimer::new();
        timer.set_mtimecmp(0);
        assert!(timer.pending());
        timer.reset();
        assert!(!timer.pending());
        assert_eq!(timer.mtimecmp(), u64::MAX);
    }
}
