//! The machine lifecycle and eventloop: owns RAM, the hart vector, the MMIO
//! registry, and the FDT; drives the power state machine; and runs the
//! boot/reset sequence.
//!
//! Separates "what gets initialized once" (`Machine::create`) from "what the
//! running system does per tick" (`eventloop_tick`), so a `Machine` can own
//! any number of harts and MMIO devices discovered at construction time
//! instead of a fixed, compiled-in peripheral set.

use std::any::Any;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::device::{self, MmioDevice, MmioRegion};
use crate::error::{BootError, ConfigError, DeviceAttachError};
use crate::fdt::Fdt;
use crate::hart::Hart;
use crate::ram::Ram;
use crate::runtime::Runtime;
use crate::sync::Spinlock;
use crate::types::Xlen;

/// RV64's kernel-load offset; the RV32 default is half this. Kept as a
/// configurable field rather than a hard-coded constant so boot images with
/// a different layout still work.
pub const DEFAULT_KERNEL_OFFSET_RV64: u64 = 0x0020_0000;
pub const DEFAULT_KERNEL_OFFSET_RV32: u64 = 0x0040_0000;

/// Construction parameters for [`Machine::create`]. A plain builder value
/// rather than a parsed config file — nothing here needs a serialized
/// format, and callers already have these values in hand at construction
/// time.
#[derive(Clone, Debug)]
pub struct MachineConfig {
    pub ram_base: u64,
    pub ram_size: u64,
    pub hart_count: u32,
    pub rv64: bool,
    /// Overrides [`DEFAULT_KERNEL_OFFSET_RV64`]/[`DEFAULT_KERNEL_OFFSET_RV32`]
    /// when set.
    pub kernel_offset: Option<u64>,
}

/// The machine's power state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
    Off,
    On,
    Reset,
}

impl PowerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PowerState::On,
            2 => PowerState::Reset,
            _ => PowerState::Off,
        }
    }
}

/// A stable reference to an attached MMIO region, valid for the lifetime of
/// the machine even after the region is detached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmioHandle(usize);

/// Invoked on every reset/shutdown transition with `shutting_down = true`
/// only on the OFF path; returning `false` aborts a `reset(true)`.
pub type ResetCallback = Box<dyn Fn(bool) -> bool + Send + Sync>;

pub struct Machine {
    ram: Ram,
    harts: Vec<Arc<Hart>>,
    mmio: Arc<Spinlock<Vec<MmioRegion>>>,
    rv64: bool,
    kernel_offset: u64,

    power: AtomicU8,
    running: AtomicBool,

    reset_callback: Spinlock<Option<ResetCallback>>,
    bootrom: Spinlock<Option<Vec<u8>>>,
    kernel: Spinlock<Option<Vec<u8>>>,
    dtb_override: Spinlock<Option<Vec<u8>>>,
    dtb_addr: AtomicU64,
    fdt: Spinlock<Fdt>,
    cmdline: Spinlock<Option<String>>,

    // Opaque bus handles for PLIC / PCI / I2C. Concrete bus models live
    // outside this crate; these slots exist only so an external collaborator
    // has somewhere to register itself and for other collaborators to find
    // it.
    plic: Spinlock<Option<Arc<dyn Any + Send + Sync>>>,
    pci: Spinlock<Option<Arc<dyn Any + Send + Sync>>>,
    i2c: Spinlock<Option<Arc<dyn Any + Send + Sync>>>,

    runtime: Arc<Runtime>,
}

fn ranges_overlap(a_addr: u64, a_size: u64, b_addr: u64, b_size: u64) -> bool {
    a_size != 0 && b_size != 0 && a_addr < b_addr + b_size && b_addr < a_addr + a_size
}

impl Machine {
    /// Allocates RAM and harts for a new machine.
    pub fn create(config: MachineConfig, runtime: Arc<Runtime>) -> Result<Arc<Machine>, ConfigError> {
        if config.hart_count == 0 || config.hart_count > 1024 {
            return Err(ConfigError::HartCountOutOfRange(config.hart_count));
        }
        let ram = Ram::new(config.ram_base, config.ram_size, !config.rv64)?;
        let xlen = if config.rv64 { Xlen::Rv64 } else { Xlen::Rv32 };
        let kernel_offset = config.kernel_offset.unwrap_or(if config.rv64 {
            DEFAULT_KERNEL_OFFSET_RV64
        } else {
            DEFAULT_KERNEL_OFFSET_RV32
        });

        let ram_desc = ram.descriptor();
        let mmio = Arc::new(Spinlock::new(Vec::new()));
        let fdt = default_fdt(&ram, config.hart_count);

        let machine = Arc::new_cyclic(|weak| {
            let harts = (0..config.hart_count)
                .map(|id| Hart::new(id as u64, xlen, ram_desc, Arc::clone(&mmio), weak.clone()))
                .collect();
            Machine {
                ram,
                harts,
                mmio,
                rv64: config.rv64,
                kernel_offset,
                power: AtomicU8::new(PowerState::Off as u8),
                running: AtomicBool::new(false),
                reset_callback: Spinlock::new(None),
                bootrom: Spinlock::new(None),
                kernel: Spinlock::new(None),
                dtb_override: Spinlock::new(None),
                dtb_addr: AtomicU64::new(0),
                fdt: Spinlock::new(fdt),
                cmdline: Spinlock::new(None),
                plic: Spinlock::new(None),
                pci: Spinlock::new(None),
                i2c: Spinlock::new(None),
                runtime,
            }
        });
        Ok(machine)
    }

    pub fn harts(&self) -> &[Arc<Hart>] {
        &self.harts
    }

    pub fn hart(&self, id: u64) -> Option<&Arc<Hart>> {
        self.harts.get(id as usize)
    }

    pub fn ram_base(&self) -> u64 {
        self.ram.base()
    }

    pub fn ram_size(&self) -> u64 {
        self.ram.size()
    }

    pub fn is_rv64(&self) -> bool {
        self.rv64
    }

    pub fn power(&self) -> PowerState {
        PowerState::from_u8(self.power.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn dtb_addr(&self) -> u64 {
        self.dtb_addr.load(Ordering::SeqCst)
    }

    pub fn set_reset_callback(&self, callback: ResetCallback) {
        *self.reset_callback.lock() = Some(callback);
    }

    pub fn set_cmdline(&self, cmdline: impl Into<String>) {
        *self.cmdline.lock() = Some(cmdline.into());
    }

    pub fn fdt(&self) -> &Spinlock<Fdt> {
        &self.fdt
    }

    pub fn set_plic_handle(&self, handle: Arc<dyn Any + Send + Sync>) {
        *self.plic.lock() = Some(handle);
    }

    pub fn plic_handle(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.plic.lock().clone()
    }

    pub fn set_pci_handle(&self, handle: Arc<dyn Any + Send + Sync>) {
        *self.pci.lock() = Some(handle);
    }

    pub fn pci_handle(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.pci.lock().clone()
    }

    pub fn set_i2c_handle(&self, handle: Arc<dyn Any + Send + Sync>) {
        *self.i2c.lock() = Some(handle);
    }

    pub fn i2c_handle(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.i2c.lock().clone()
    }

    // ---- MMIO attach/detach -------------------------------------------------

    /// `attach_mmio`: validates non-overlap against RAM and every other
    /// region, and that the width bounds normalize, then appends the
    /// record. Brackets the mutation with pause/resume if the machine is
    /// running.
    pub fn attach_mmio(
        &self,
        addr: u64,
        size: u64,
        min_op_size: u8,
        max_op_size: u8,
        device: Arc<dyn MmioDevice>,
    ) -> Result<MmioHandle, DeviceAttachError> {
        let (min, max) = device::normalize_width_bounds(min_op_size, max_op_size).ok_or(
            DeviceAttachError::InvalidWidthBounds {
                min: min_op_size,
                max: max_op_size,
            },
        )?;

        let was_running = self.pause_for_table_mutation();
        let result = (|| {
            if ranges_overlap(addr, size, self.ram.base(), self.ram.size()) {
                return Err(DeviceAttachError::OverlapsRam {
                    addr,
                    end: addr + size,
                    ram_base: self.ram.base(),
                    ram_end: self.ram.end(),
                });
            }
            let mut regions = self.mmio.lock();
            if let Some(other) = regions.iter().find(|r| r.overlaps(addr, size)) {
                return Err(DeviceAttachError::OverlapsDevice {
                    addr,
                    end: addr + size,
                    other: other.type_name(),
                });
            }
            regions.push(MmioRegion {
                addr,
                size,
                min_op_size: min,
                max_op_size: max,
                device: Some(device),
            });
            Ok(MmioHandle(regions.len() - 1))
        })();
        self.resume_after_table_mutation(was_running);
        result
    }

    /// `detach_mmio`: zero-sizes the record at `addr` (preserving handle
    /// stability) and, if `cleanup` is set, invokes the device's `remove`
    /// hook first.
    pub fn detach_mmio(&self, addr: u64, cleanup: bool) -> Result<(), DeviceAttachError> {
        let was_running = self.pause_for_table_mutation();
        let result = (|| {
            let mut regions = self.mmio.lock();
            let region = regions
                .iter_mut()
                .find(|r| r.contains(addr))
                .ok_or(DeviceAttachError::NoSuchRegion(addr))?;
            if cleanup {
                if let Some(dev) = region.device.as_ref() {
                    dev.remove();
                }
            }
            region.size = 0;
            region.device = None;
            Ok(())
        })();
        self.resume_after_table_mutation(was_running);
        result
    }

    /// `mmio_zone_auto`: the first address ≥ `addr` that overlaps neither
    /// RAM nor an existing region, trying up to 16 relocations (spec
    /// section 9's open question on the bound) before logging a warning and
    /// returning `addr` unchanged as an inert fallback.
    pub fn mmio_zone_auto(&self, addr: u64, size: u64) -> u64 {
        const MAX_ATTEMPTS: u32 = 16;
        let mut candidate = addr;
        for _ in 0..MAX_ATTEMPTS {
            if ranges_overlap(candidate, size, self.ram.base(), self.ram.size()) {
                candidate = self.ram.end();
                continue;
            }
            let regions = self.mmio.lock();
            match regions.iter().find(|r| r.overlaps(candidate, size)) {
                Some(colliding) => candidate = colliding.end(),
                None => return candidate,
            }
        }
        log::warn!(
            "mmio_zone_auto: exhausted {MAX_ATTEMPTS} relocation attempts starting from {addr:#x}; \
             returning the original address unchanged"
        );
        addr
    }

    fn pause_for_table_mutation(&self) -> bool {
        let was_running = self.is_running();
        if was_running {
            for hart in &self.harts {
                hart.pause();
            }
        }
        was_running
    }

    fn resume_after_table_mutation(&self, was_running: bool) {
        if was_running {
            for hart in &self.harts {
                hart.spawn();
            }
        }
    }

    // ---- Power state machine ------------------------------------------------

    /// `start_machine`: OFF → ON, spawning every hart's thread. Idempotent;
    /// a no-op (returns `false`) if the machine isn't OFF.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.power() != PowerState::Off {
            return false;
        }
        self.running.store(true, Ordering::SeqCst);
        self.power.store(PowerState::On as u8, Ordering::SeqCst);
        for hart in &self.harts {
            hart.spawn();
        }
        self.runtime.register(self);
        true
    }

    /// `pause_machine`: pauses every hart. Does not change power state or
    /// `running` — a paused machine is still "on", just not executing.
    pub fn pause(&self) {
        for hart in &self.harts {
            hart.pause();
        }
    }

    /// `reset_machine(reset | poweroff)`: requests a transition the
    /// eventloop carries out on its next tick, waking it immediately rather
    /// than waiting out the rest of the tick period.
    pub fn reset(&self, reset: bool) {
        let target = if reset { PowerState::Reset } else { PowerState::Off };
        self.power.store(target as u8, Ordering::SeqCst);
        self.runtime.notify();
    }

    /// `free_machine`: pauses and joins every hart's thread. Must not be
    /// called while another thread might still call into this machine.
    pub fn free(&self) {
        for hart in &self.harts {
            hart.pause();
        }
        for hart in &self.harts {
            hart.free();
        }
    }

    /// Runs one eventloop tick's worth of work for this machine (spec
    /// section 4.3's per-machine, per-tick steps (a)-(c)). Called only by
    /// [`crate::runtime::Runtime`]'s background thread.
    pub(crate) fn eventloop_tick(&self) {
        match self.power() {
            PowerState::Reset => self.perform_reset_transition(),
            PowerState::Off => {
                if self.is_running() {
                    self.perform_shutdown_transition();
                }
            }
            PowerState::On => {
                for hart in &self.harts {
                    if hart.timer().pending() {
                        hart.check_timer();
                    }
                }
                for region in self.mmio.lock().iter() {
                    if let Some(dev) = region.device.as_ref() {
                        dev.update();
                    }
                }
            }
        }
    }

    fn perform_reset_transition(&self) {
        for hart in &self.harts {
            hart.pause();
        }
        if !self.run_reset_callback(false) {
            // The callback vetoed the reset; go back to ON with harts
            // resuming exactly where they were paused.
            for hart in &self.harts {
                hart.spawn();
            }
            self.power.store(PowerState::On as u8, Ordering::SeqCst);
            return;
        }

        for region in self.mmio.lock().iter() {
            if let Some(dev) = region.device.as_ref() {
                dev.reset();
            }
        }

        self.apply_boot_images();
        let dtb_addr = self.place_dtb();
        self.dtb_addr.store(dtb_addr, Ordering::SeqCst);

        for hart in &self.harts {
            hart.apply_reset(self.ram.base(), dtb_addr);
        }
        for hart in &self.harts {
            hart.spawn();
        }
        self.power.store(PowerState::On as u8, Ordering::SeqCst);
    }

    fn perform_shutdown_transition(&self) {
        for hart in &self.harts {
            hart.pause();
        }
        let _ = self.run_reset_callback(true);
        self.running.store(false, Ordering::SeqCst);
    }

    fn run_reset_callback(&self, shutting_down: bool) -> bool {
        match self.reset_callback.lock().as_ref() {
            Some(cb) => cb(shutting_down),
            None => true,
        }
    }

    fn apply_boot_images(&self) {
        if let Some(data) = self.bootrom.lock().as_deref() {
            self.ram.write(self.ram.base(), data);
        }
        if let Some(data) = self.kernel.lock().as_deref() {
            let dest = self.ram.base() + self.kernel_offset;
            let max_len = self.ram.end().saturating_sub(dest) as usize;
            let len = data.len().min(max_len);
            self.ram.write(dest, &data[..len]);
        }
    }

    fn place_dtb(&self) -> u64 {
        let blob = match self.dtb_override.lock().clone() {
            Some(bytes) => bytes,
            None => self.fdt.lock().serialize(),
        };
        let dest = (self.ram.end().saturating_sub(blob.len() as u64)) & !0x7;
        self.ram.write(dest, &blob);
        dest
    }

    // ---- Bulk RAM access ------------------------------------------------------

    pub fn write_ram(&self, addr: u64, data: &[u8]) -> bool {
        let ok = self.ram.write(addr, data);
        if ok {
            self.mark_dirty(addr, data.len() as u64);
        }
        ok
    }

    pub fn read_ram(&self, addr: u64, out: &mut [u8]) -> bool {
        self.ram.read(addr, out)
    }

    pub fn get_dma_ptr(&self, addr: u64) -> Option<*mut u8> {
        self.ram.dma_ptr(addr)
    }

    /// JIT instruction-cache flush hook. No JIT backend exists yet; a no-op
    /// kept so one can be added without touching callers.
    pub fn flush_icache(&self) {}

    /// JIT dirty-memory tracking hook, called on every bulk host-side RAM
    /// write. No-op until a JIT backend is added.
    fn mark_dirty(&self, _addr: u64, _len: u64) {}

    // ---- Boot image loading ---------------------------------------------------

    fn require_off(&self, what: &'static str) -> Result<(), BootError> {
        if self.power() != PowerState::Off {
            return Err(BootError::MachineNotOff(what));
        }
        Ok(())
    }

    fn read_boot_file(path: &Path) -> Result<Vec<u8>, BootError> {
        std::fs::read(path).map_err(|source| BootError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `load_bootrom`: installs an image at RAM base, validated to fit.
    pub fn load_bootrom(&self, path: &Path) -> Result<(), BootError> {
        self.require_off("bootrom")?;
        let data = Self::read_boot_file(path)?;
        if data.len() as u64 > self.ram.size() {
            return Err(BootError::DoesNotFit {
                path: path.to_path_buf(),
                size: data.len() as u64,
                offset: 0,
                ram_size: self.ram.size(),
            });
        }
        *self.bootrom.lock() = Some(data);
        Ok(())
    }

    /// `load_kernel`: installs an image at `ram_base + kernel_offset`,
    /// truncated to fit rather than rejected.
    pub fn load_kernel(&self, path: &Path) -> Result<(), BootError> {
        self.require_off("kernel")?;
        let data = Self::read_boot_file(path)?;
        *self.kernel.lock() = Some(data);
        Ok(())
    }

    /// `load_dtb`: installs an explicit DTB blob, overriding the
    /// machine-generated one at reset time. Validated to fit at the top of
    /// RAM.
    pub fn load_dtb(&self, path: &Path) -> Result<(), BootError> {
        self.require_off("dtb")?;
        let data = Self::read_boot_file(path)?;
        if data.len() as u64 > self.ram.size() {
            return Err(BootError::DoesNotFit {
                path: path.to_path_buf(),
                size: data.len() as u64,
                offset: self.ram.size() - data.len() as u64,
                ram_size: self.ram.size(),
            });
        }
        *self.dtb_override.lock() = Some(data);
        Ok(())
    }
}

/// Builds the minimal default device tree every machine starts with: a
/// `#address-cells`/`#size-cells` root, a `/cpus` node with one `cpu@N`
/// child per hart, and a `/memory@BASE` node describing the RAM region.
/// Callers extend this (e.g. with `machine.fdt().lock().soc_mut()`) before
/// the machine is first started; regenerating device nodes for attached
/// MMIO peripherals is left to the caller, since concrete device types
/// live outside this crate.
fn default_fdt(ram: &Ram, hart_count: u32) -> Fdt {
    let mut fdt = Fdt::new();
    fdt.set_boot_cpuid_phys(0);
    {
        let root = fdt.root_mut();
        root.set_property_u32("#address-cells", 2);
        root.set_property_u32("#size-cells", 2);
        root.set_property_str("compatible", "riscv-virtio");

        let cpus = root.add_child("cpus");
        cpus.set_property_u32("#address-cells", 1);
        cpus.set_property_u32("#size-cells", 0);
        cpus.set_property_u32("timebase-frequency", 10_000_000);
        for id in 0..hart_count {
            let cpu = cpus.add_child(format!("cpu@{id:x}"));
            cpu.set_property_str("device_type", "cpu");
            cpu.set_property_str("compatible", "riscv");
            cpu.set_property_u32("reg", id);
            cpu.set_property_str("status", "okay");
        }

        let memory = root.add_child(format!("memory@{:x}", ram.base()));
        memory.set_property_str("device_type", "memory");
        let mut reg = Vec::with_capacity(16);
        reg.extend_from_slice(&ram.base().to_be_bytes());
        reg.extend_from_slice(&ram.size().to_be_bytes());
        memory.set_property("reg", reg);
    }
    fdt.soc_mut();
    fdt
}
