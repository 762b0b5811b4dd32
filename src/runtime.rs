//! The global eventloop/registry singleton.
//!
//! Offers both an explicit and an implicit way to hold this state:
//! [`Runtime::new`] gives a caller their own instance to thread through
//! [`crate::machine`] APIs explicitly; [`global`] is an `OnceLock`-backed
//! convenience for callers happy with one implicit process-wide instance,
//! brought up lazily on first use.

use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::machine::Machine;
use crate::sync::Spinlock;

/// Eventloop tick period.
const TICK_PERIOD: Duration = Duration::from_millis(10);

struct Registry {
    machines: Vec<Weak<Machine>>,
    thread: Option<JoinHandle<()>>,
}

/// Owns the registry of running machines and the single background
/// eventloop thread that services all of them.
pub struct Runtime {
    registry: Spinlock<Registry>,
    // A plain `Mutex<()>` + `Condvar` pair gives the eventloop a blocking,
    // promptly-wakeable sleep between ticks; the registry itself stays under
    // the lighter-weight spinlock since registry mutation is rare and the
    // sleep is the only place a thread blocks for a long time.
    wake_gate: Mutex<()>,
    wake: Condvar,
}

impl Runtime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Spinlock::new(Registry {
                machines: Vec::new(),
                thread: None,
            }),
            wake_gate: Mutex::new(()),
            wake: Condvar::new(),
        })
    }

    /// Registers `machine` as running, spawning the eventloop thread if it
    /// isn't already alive. When no running machines remain the thread
    /// exits; a future `register` recreates both.
    pub fn register(self: &Arc<Self>, machine: &Arc<Machine>) {
        let mut registry = self.registry.lock();
        registry.machines.retain(|w| w.strong_count() > 0);
        registry.machines.push(Arc::downgrade(machine));
        if registry.thread.is_none() {
            let rt = Arc::clone(self);
            registry.thread = Some(std::thread::spawn(move || rt.eventloop()));
        }
        drop(registry);
        self.notify();
    }

    /// Wakes the eventloop immediately instead of waiting out the rest of
    /// its tick timeout — used by `reset`/`pause` so a power-state change is
    /// observed promptly.
    pub fn notify(&self) {
        self.wake.notify_all();
    }

    fn eventloop(self: Arc<Self>) {
        loop {
            let machines: Vec<Arc<Machine>> = {
                let mut registry = self.registry.lock();
                registry.machines.retain(|w| w.strong_count() > 0);
                if registry.machines.is_empty() {
                    registry.thread = None;
                    return;
                }
                registry.machines.iter().filter_map(Weak::upgrade).collect()
            };

            for machine in &machines {
                machine.eventloop_tick();
            }

            // A machine that just powered off is dropped from the running
            // registry even if the caller still holds its `Arc`.
            {
                let mut registry = self.registry.lock();
                registry
                    .machines
                    .retain(|w| w.upgrade().is_some_and(|m| m.is_running()));
            }

            let guard = self.wake_gate.lock().unwrap();
            let _ = self.wake.wait_timeout(guard, TICK_PERIOD).unwrap();
        }
    }
}

/// A process-wide convenience `Runtime`, brought up lazily on first use.
pub fn global() -> Arc<Runtime> {
    static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();
    Arc::clone(GLOBAL.get_or_init(Runtime::new))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hart::HartRunState;
    use crate::machine::{Machine, MachineConfig};
    use std::time::Duration;

    fn tiny_config() -> MachineConfig {
        MachineConfig {
            ram_base: 0x8000_0000,
            ram_size: 0x10_0000,
            hart_count: 1,
            rv64: true,
            kernel_offset: None,
        }
    }

    #[test]
    fn eventloop_spawns_and_tears_down_with_running_machines() {
        let runtime = Runtime::new();
        let machine = Machine::create(tiny_config(), Arc::clone(&runtime)).unwrap();
        machine.start();
        assert_eq!(machine.harts()[0].state(), HartRunState::Running);

        machine.reset(false);
        // Give the eventloop a couple of ticks to observe the shutdown.
        std::thread::sleep(Duration::from_millis(60));
        assert!(!machine.is_running());
    }
}
