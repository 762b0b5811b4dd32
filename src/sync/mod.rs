//! Synchronization primitives for the emulator core.
//!
//! Only the MMIO table, the global machine registry, and the userland brk
//! accounting use the spinlock below; the hart run loop and the RAM fast
//! path take no lock at all, and a hart's own TLB is touched only by its
//! owning thread.

pub mod spinlock;

pub use spinlock::Spinlock;
