//! The hart execution engine: architectural state, the fetch/decode/execute
//! run loop, trap and interrupt delivery, and the pause/resume protocol
//! between a hart's own thread and every other thread in the process.
//!
//! Each hart owns its own CSR bank and trap vector, so N harts run
//! independently with no shared exception-handling state. Pause/resume uses
//! a `Mutex` + `Condvar` rather than a spin-only primitive, since pause
//! legitimately blocks for an unbounded number of guest instructions.

pub mod csr;
pub mod decode;
pub mod exec;
pub mod regs;
pub mod timer;

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::device::MmioRegion;
use crate::machine::Machine;
use crate::mmu::{self, MmuContext, PagingMode, Tlb};
use crate::ram::RamDescriptor;
use crate::sync::Spinlock;
use crate::trap::{InterruptCause, Trap, TrapCause};
use crate::types::{AccessType, Privilege, Xlen};

use csr::CsrBank;
use exec::{Control, MemBus};
use regs::{FpRegFile, RegFile};
use timer::HartTimer;

/// Integer register handle base.
pub const REGID_X0: u32 = 0;
pub const REGID_F0: u32 = 32;
pub const REGID_PC: u32 = 64;
pub const REGID_CAUSE: u32 = 65;
pub const REGID_TVAL: u32 = 66;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HartRunState {
    Constructed,
    Running,
    PauseRequested,
    Paused,
    Freed,
}

/// Everything touched only by the hart's own run-loop thread while
/// `Running`, and safe for any other thread to read/write only once the
/// lifecycle mutex has observed `Paused` (the happens-before edge the pause
/// protocol establishes).
struct CpuState {
    regs: RegFile,
    fpregs: FpRegFile,
    csr: CsrBank,
    tlb: Tlb,
    priv_level: Privilege,
}

pub struct Hart {
    pub id: u64,
    xlen: Xlen,
    ram: RamDescriptor,
    mmio: Arc<Spinlock<Vec<MmioRegion>>>,
    machine: Weak<Machine>,
    cpu: UnsafeCell<CpuState>,
    timer: HartTimer,
    lifecycle: Mutex<HartRunState>,
    lifecycle_cv: Condvar,
    pause_requested: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

// SAFETY: `cpu` is accessed without a lock only by the hart's own run-loop
// thread while `lifecycle == Running`; every other access happens after
// `hart_pause` has observed `Paused` through the lifecycle mutex, which
// supplies the necessary happens-before edge. `Hart` is always held behind
// `Arc`, never moved once spawned.
unsafe impl Send for Hart {}
unsafe impl Sync for Hart {}

impl Hart {
    /// Constructs a fresh hart in M-mode, PC at `ram`'s base, X registers
    /// zero, CSRs at reset values.
    pub fn new(
        id: u64,
        xlen: Xlen,
        ram: RamDescriptor,
        mmio: Arc<Spinlock<Vec<MmioRegion>>>,
        machine: Weak<Machine>,
    ) -> Arc<Self> {
        let cpu = CpuState {
            regs: RegFile::new(ram.base),
            fpregs: FpRegFile::new(),
            csr: CsrBank::reset(id, xlen),
            tlb: Tlb::new(),
            priv_level: Privilege::Machine,
        };
        Arc::new(Self {
            id,
            xlen,
            ram,
            mmio,
            machine,
            cpu: UnsafeCell::new(cpu),
            timer: HartTimer::new(),
            lifecycle: Mutex::new(HartRunState::Constructed),
            lifecycle_cv: Condvar::new(),
            pause_requested: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    pub fn state(&self) -> HartRunState {
        *self.lifecycle.lock().unwrap()
    }

    /// Applies the machine's reset/boot sequence to this hart: `a0 = hartid`,
    /// `a1 = dtb_addr`, `pc = entry`, switch to M-mode, flush the TLB. Only
    /// valid while the hart is not running.
    pub fn apply_reset(&self, entry: u64, dtb_addr: u64) {
        // SAFETY: callers only invoke this while the hart is paused or not
        // yet spawned, per the machine's reset sequence contract.
        let cpu = unsafe { &mut *self.cpu.get() };
        cpu.regs = RegFile::new(entry);
        cpu.regs.write_raw(10, self.id);
        cpu.regs.write_raw(11, dtb_addr);
        cpu.csr = CsrBank::reset(self.id, self.xlen);
        cpu.priv_level = Privilege::Machine;
        cpu.tlb.flush();
        self.timer.reset();
    }

    /// The per-hart guest timer (cycle counter + mtimecmp). Public so a
    /// CLINT-style device, implemented elsewhere, can program `mtimecmp`
    /// from a guest MMIO write.
    pub fn timer(&self) -> &HartTimer {
        &self.timer
    }

    /// `hart_spawn`: idempotent when already running.
    pub fn spawn(self: &Arc<Self>) {
        let mut state = self.lifecycle.lock().unwrap();
        if *state == HartRunState::Running {
            return;
        }
        *state = HartRunState::Running;
        self.pause_requested.store(false, Ordering::SeqCst);
        let mut thread_slot = self.thread.lock().unwrap();
        if thread_slot.is_none() {
            let hart = Arc::clone(self);
            *thread_slot = Some(std::thread::spawn(move || hart.run_loop()));
        } else {
            // Resuming from Paused: just drop the lock and notify the
            // waiting run-loop thread to carry on.
            self.lifecycle_cv.notify_all();
        }
    }

    /// `hart_pause`: blocking, safe from any thread. Returns once the hart
    /// has reached a safe point (an instruction boundary) and its register
    /// state is fully visible to the caller.
    pub fn pause(&self) {
        {
            let mut state = self.lifecycle.lock().unwrap();
            if *state != HartRunState::Running {
                return;
            }
            *state = HartRunState::PauseRequested;
        }
        self.pause_requested.store(true, Ordering::SeqCst);
        self.lifecycle_cv.notify_all();
        let mut state = self.lifecycle.lock().unwrap();
        while *state != HartRunState::Paused {
            state = self.lifecycle_cv.wait(state).unwrap();
        }
    }

    /// `hart_queue_pause`: non-blocking variant for single-hart machines
    /// where the calling thread is the hart itself.
    pub fn queue_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    /// `hart_check_timer`: called by the eventloop when this hart's timer
    /// compare has fired; wakes a hart blocked in WFI.
    pub fn check_timer(&self) {
        self.lifecycle_cv.notify_all();
    }

    /// `hart_free`: releases owned resources. Must be preceded by `pause`.
    pub fn free(&self) {
        {
            let state = self.lifecycle.lock().unwrap();
            assert!(
                matches!(*state, HartRunState::Paused | HartRunState::Constructed),
                "hart_free called without a preceding pause"
            );
        }
        self.pause_requested.store(true, Ordering::SeqCst);
        self.lifecycle_cv.notify_all();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        *self.lifecycle.lock().unwrap() = HartRunState::Freed;
    }

    /// `hart_run_userland`: runs synchronously on the calling thread (not
    /// the hart's own OS thread) until a synchronous user-mode trap, then
    /// returns its cause for syscall emulation. Used only by the
    /// (out-of-scope) userland layer; has no interaction with the pause
    /// protocol because it never spawns a thread of its own.
    pub fn run_userland(&self) -> TrapCause {
        loop {
            match self.step() {
                Ok(()) => continue,
                Err(trap) => {
                    if matches!(
                        trap.cause,
                        TrapCause::EnvCallFromUMode | TrapCause::Breakpoint
                    ) {
                        return trap.cause;
                    }
                    self.deliver_trap(trap);
                }
            }
        }
    }

    fn run_loop(self: Arc<Self>) {
        loop {
            {
                let mut state = self.lifecycle.lock().unwrap();
                if self.pause_requested.load(Ordering::SeqCst) {
                    *state = HartRunState::Paused;
                    self.lifecycle_cv.notify_all();
                    while *state == HartRunState::Paused {
                        state = self.lifecycle_cv.wait(state).unwrap();
                    }
                    if *state == HartRunState::Freed {
                        return;
                    }
                    self.pause_requested.store(false, Ordering::SeqCst);
                }
            }

            if let Some(pc) = self.check_wfi_wake_or_interrupt() {
                // SAFETY: only this thread touches `cpu` while running.
                unsafe { (*self.cpu.get()).regs.pc = pc };
                continue;
            }

            match self.step() {
                Ok(()) => {}
                Err(trap) => self.deliver_trap(trap),
            }
        }
    }

    /// Checks for a pending, enabled interrupt and delivers it if present.
    /// Returns `Some(pc)` when an interrupt (or a WFI wake with nothing
    /// pending) was handled and the run loop should re-poll instead of
    /// fetching; `None` to proceed with a normal fetch.
    fn check_wfi_wake_or_interrupt(&self) -> Option<u64> {
        // SAFETY: run-loop-thread-only access, as documented on `CpuState`.
        let cpu = unsafe { &mut *self.cpu.get() };
        self.sync_timer_interrupt(cpu);
        if let Some(cause) = highest_pending_interrupt(&cpu.csr, cpu.priv_level) {
            let pc = deliver_interrupt(cpu, cause);
            return Some(pc);
        }
        None
    }

    /// Reflects `timer.pending()` into `mip`'s machine-timer bit. Real
    /// silicon wires this bit directly to the CLINT comparator rather than
    /// latching it on CSR writes; sampling it here, right before the
    /// interrupt check, is the software equivalent.
    fn sync_timer_interrupt(&self, cpu: &mut CpuState) {
        let bit = InterruptCause::MachineTimer.mie_bit();
        if self.timer.pending() {
            cpu.csr.mip |= bit;
        } else {
            cpu.csr.mip &= !bit;
        }
    }

    /// Runs exactly one fetch/decode/execute step.
    fn step(&self) -> Result<(), Trap> {
        // SAFETY: run-loop-thread-only access.
        let cpu = unsafe { &mut *self.cpu.get() };
        self.sync_timer_interrupt(cpu);
        let pc = cpu.regs.pc;

        let is_user = cpu.priv_level == Privilege::User;
        let mut mmu_ctx = MmuContext {
            satp: cpu.csr.satp,
            rv64: self.xlen == Xlen::Rv64,
            is_user,
            sum: cpu.csr.sum(),
            mxr: cpu.csr.mxr(),
            tlb: &mut cpu.tlb,
            ram: &self.ram,
            mmio: &self.mmio,
        };
        let (word, is_compressed) = mmu::fetch_instruction(&mut mmu_ctx, pc)?;
        if is_compressed {
            return Err(Trap::new(TrapCause::IllegalInstruction, word as u64));
        }
        let instr = decode::decode(word)?;
        let len = 4u64;

        let priv_level = cpu.priv_level;
        let xlen = self.xlen;
        let mut bus = HartMemBus {
            tlb: &mut cpu.tlb,
            ram: &self.ram,
            mmio: &self.mmio,
            satp: cpu.csr.satp,
            rv64: xlen == Xlen::Rv64,
            is_user,
            sum: cpu.csr.sum(),
            mxr: cpu.csr.mxr(),
        };
        let control = exec::execute(instr, pc, len, &mut cpu.regs, &mut cpu.csr, priv_level, xlen, &mut bus)?;

        match control {
            Control::Next(next_pc) => cpu.regs.pc = next_pc,
            Control::Wfi(next_pc) => {
                cpu.regs.pc = next_pc;
                self.wait_for_wfi_wake();
            }
            Control::Mret => {
                let target = cpu.csr.leave_trap(Privilege::Machine);
                cpu.priv_level = target;
                cpu.regs.pc = cpu.csr.mepc;
            }
            Control::Sret => {
                let target = cpu.csr.leave_trap(Privilege::Supervisor);
                cpu.priv_level = target;
                cpu.regs.pc = cpu.csr.sepc;
            }
        }
        Ok(())
    }

    /// Blocks the run-loop thread until the eventloop calls `check_timer`
    /// or a pause is requested.
    fn wait_for_wfi_wake(&self) {
        let state = self.lifecycle.lock().unwrap();
        let _ = self
            .lifecycle_cv
            .wait_timeout_while(state, Duration::from_millis(10), |_| {
                !self.pause_requested.load(Ordering::SeqCst)
            })
            .unwrap();
    }

    /// Delivers a synchronous trap: writes cause/tval, switches privilege,
    /// jumps to the trap vector, and continues.
    fn deliver_trap(&self, trap: Trap) {
        // SAFETY: run-loop-thread-only access.
        let cpu = unsafe { &mut *self.cpu.get() };
        let to = if cpu.priv_level != Privilege::Machine && cpu.csr.is_delegated(trap.cause) {
            Privilege::Supervisor
        } else {
            Privilege::Machine
        };
        let from = cpu.priv_level;
        let pc = cpu.regs.pc;
        cpu.csr.enter_trap(to, from);
        cpu.priv_level = to;
        match to {
            Privilege::Machine => {
                cpu.csr.mepc = pc;
                cpu.csr.mcause = trap.cause.code();
                cpu.csr.mtval = trap.tval;
                cpu.regs.pc = cpu.csr.mtvec & !0b11;
            }
            Privilege::Supervisor => {
                cpu.csr.sepc = pc;
                cpu.csr.scause = trap.cause.code();
                cpu.csr.stval = trap.tval;
                cpu.regs.pc = cpu.csr.stvec & !0b11;
            }
            Privilege::User => unreachable!("traps never target U-mode"),
        }
    }

    /// Out-of-range handles return 0 and log a warning on write (spec
    /// section 6).
    pub fn read_reg(&self, id: u32) -> u64 {
        // SAFETY: callers only read registers while the hart is paused.
        let cpu = unsafe { &*self.cpu.get() };
        match id {
            REGID_X0..=31 => cpu.regs.read(id as usize),
            32..=63 => cpu.fpregs.read((id - REGID_F0) as usize),
            REGID_PC => cpu.regs.pc,
            REGID_CAUSE => cpu.csr.mcause,
            REGID_TVAL => cpu.csr.mtval,
            _ => {
                log::warn!("read_reg: out-of-range register id {id}");
                0
            }
        }
    }

    pub fn write_reg(&self, id: u32, value: u64) {
        // SAFETY: callers only write registers while the hart is paused.
        let cpu = unsafe { &mut *self.cpu.get() };
        match id {
            REGID_X0..=31 => cpu.regs.write_raw(id as usize, value),
            32..=63 => cpu.fpregs.write((id - REGID_F0) as usize, value),
            REGID_PC => cpu.regs.pc = value,
            REGID_CAUSE => cpu.csr.mcause = value,
            REGID_TVAL => cpu.csr.mtval = value,
            _ => log::warn!("write_reg: out-of-range register id {id}"),
        }
    }

    pub fn machine(&self) -> Option<Arc<Machine>> {
        self.machine.upgrade()
    }
}

fn highest_pending_interrupt(csr: &CsrBank, priv_level: Privilege) -> Option<InterruptCause> {
    let global_m_enabled = priv_level != Privilege::Machine || csr.mstatus & (1 << 3) != 0;
    let global_s_enabled = priv_level == Privilege::User || (priv_level == Privilege::Supervisor && csr.mstatus & (1 << 1) != 0);

    for cause in InterruptCause::PRIORITY {
        let pending_enabled = csr.mip & csr.mie & cause.mie_bit() != 0;
        if !pending_enabled {
            continue;
        }
        let to_supervisor = csr.is_interrupt_delegated(cause);
        let globally_enabled = if to_supervisor { global_s_enabled } else { global_m_enabled };
        if globally_enabled {
            return Some(cause);
        }
    }
    None
}

fn deliver_interrupt(cpu: &mut CpuState, cause: InterruptCause) -> u64 {
    let to = if cpu.priv_level != Privilege::Machine && cpu.csr.is_interrupt_delegated(cause) {
        Privilege::Supervisor
    } else {
        Privilege::Machine
    };
    let from = cpu.priv_level;
    let pc = cpu.regs.pc;
    cpu.csr.enter_trap(to, from);
    cpu.priv_level = to;
    let interrupt_bit = 1u64 << 63;
    match to {
        Privilege::Machine => {
            cpu.csr.mepc = pc;
            cpu.csr.mcause = cause.code() | interrupt_bit;
            cpu.regs.pc = cpu.csr.mtvec & !0b11;
        }
        Privilege::Supervisor => {
            cpu.csr.sepc = pc;
            cpu.csr.scause = cause.code() | interrupt_bit;
            cpu.regs.pc = cpu.csr.stvec & !0b11;
        }
        Privilege::User => unreachable!(),
    }
    cpu.regs.pc
}

/// Bridges `exec::MemBus` to the memory access layer. Holds only what a
/// translation needs (the TLB, the RAM descriptor, the MMIO table, and the
/// CSR bits that affect translation, copied by value) rather than the whole
/// `CpuState`, so `step` can borrow `cpu.regs`/`cpu.csr` mutably for
/// `exec::execute` at the same time it lends `cpu.tlb` to this bus — two
/// disjoint-field borrows of the same `CpuState`, not one borrow aliasing
/// another.
struct HartMemBus<'a> {
    tlb: &'a mut Tlb,
    ram: &'a RamDescriptor,
    mmio: &'a Spinlock<Vec<MmioRegion>>,
    satp: u64,
    rv64: bool,
    is_user: bool,
    sum: bool,
    mxr: bool,
}

impl MemBus for HartMemBus<'_> {
    fn load(&mut self, vaddr: u64, width: u8, signed: bool) -> Result<u64, Trap> {
        let mut out = [0u8; 8];
        let mut ctx = self.ctx();
        mmu::mmu_op(&mut ctx, vaddr, width, AccessType::Load, None, Some(&mut out[..width as usize]))?;
        let raw = u64::from_le_bytes(out);
        Ok(if signed {
            sign_extend_width(raw, width)
        } else {
            raw & width_mask(width)
        })
    }

    fn store(&mut self, vaddr: u64, width: u8, value: u64) -> Result<(), Trap> {
        let bytes = value.to_le_bytes();
        let mut ctx = self.ctx();
        mmu::mmu_op(&mut ctx, vaddr, width, AccessType::Store, Some(&bytes[..width as usize]), None)
    }

    fn fence_i(&mut self) {
        // No JIT-backed instruction cache exists yet; nothing to flush.
    }

    fn sfence_vma(&mut self) {
        self.tlb.flush();
    }
}

impl<'a> HartMemBus<'a> {
    fn ctx(&mut self) -> MmuContext<'_> {
        MmuContext {
            satp: self.satp,
            rv64: self.rv64,
            is_user: self.is_user,
            sum: self.sum,
            mxr: self.mxr,
            tlb: self.tlb,
            ram: self.ram,
            mmio: self.mmio,
        }
    }
}

fn width_mask(width: u8) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width as u32 * 8)) - 1
    }
}

fn sign_extend_width(value: u64, width: u8) -> u64 {
    let bits = width as u32 * 8;
    if bits >= 64 {
        return value;
    }
    let shift = 64 - bits;
    ((value << shift) as i64 >> shift) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ram::Ram;

    fn test_hart(xlen: Xlen) -> (Arc<Hart>, Ram) {
        let ram = Ram::new(0x8000_0000, 0x10_0000, xlen == Xlen::Rv32).unwrap();
        let desc = ram.descriptor();
        let mmio = Arc::new(Spinlock::new(Vec::new()));
        let hart = Hart::new(0, xlen, desc, mmio, Weak::new());
        (hart, ram)
    }

    #[test]
    fn reset_places_pc_at_ram_base_and_a0_a1() {
        let (hart, _ram) = test_hart(Xlen::Rv64);
        hart.apply_reset(0x8000_0000, 0x8010_0000);
        assert_eq!(hart.read_reg(REGID_PC), 0x8000_0000);
        assert_eq!(hart.read_reg(10), 0);
        assert_eq!(hart.read_reg(11), 0x8010_0000);
    }

    #[test]
    fn single_step_executes_addi_and_advances_pc() {
        let (hart, ram) = test_hart(Xlen::Rv64);
        hart.apply_reset(0x8000_0000, 0);
        // addi x1, x0, 5
        let word: u32 = (5 << 20) | (0 << 15) | (0 << 12) | (1 << 7) | 0x13;
        ram.write(0x8000_0000, &word.to_le_bytes());
        hart.step().unwrap();
        assert_eq!(hart.read_reg(1), 5);
        assert_eq!(hart.read_reg(REGID_PC), 0x8000_0004);
    }

    #[test]
    fn out_of_range_register_read_is_zero() {
        let (hart, _ram) = test_hart(Xlen::Rv64);
        assert_eq!(hart.read_reg(9999), 0);
    }

    #[test]
    fn illegal_instruction_delivers_trap_to_mtvec() {
        let (hart, ram) = test_hart(Xlen::Rv64);
        hart.apply_reset(0x8000_0000, 0);
        hart.write_reg(REGID_X0, 0); // no-op, exercises the x0 guard
        // Set mtvec to a handler address.
        {
            let cpu = unsafe { &mut *hart.cpu.get() };
            cpu.csr.mtvec = 0x8000_1000;
        }
        // A reserved/unknown opcode (all zero bits) is illegal.
        ram.write(0x8000_0000, &0u32.to_le_bytes());
        hart.step().unwrap_err();
        // `step` only returns the trap; the run loop normally calls
        // `deliver_trap`. Exercise that directly here.
        let err = crate::trap::Trap::new(crate::trap::TrapCause::IllegalInstruction, 0);
        hart.deliver_trap(err);
        assert_eq!(hart.read_reg(REGID_PC), 0x8000_1000);
        assert_eq!(hart.read_reg(REGID_CAUSE), TrapCause::IllegalInstruction.code());
    }
}
