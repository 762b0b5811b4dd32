//! Executes a decoded instruction against a register/CSR state and a
//! memory bus — the dispatch half of the fetch/decode/execute run loop.
//!
//! `MemBus` decouples the arithmetic/control-flow logic here from the
//! concrete `Hart`/`MmuContext` wiring (src/hart/mod.rs), the same way the
//! memory access layer is itself kept ignorant of `Hart`'s shape.

use crate::hart::csr::CsrBank;
use crate::hart::decode::{AluOp, Branch, CsrOp, Instruction};
use crate::hart::regs::RegFile;
use crate::trap::{Trap, TrapCause};
use crate::types::{Privilege, Xlen};

pub trait MemBus {
    fn load(&mut self, vaddr: u64, width: u8, signed: bool) -> Result<u64, Trap>;
    fn store(&mut self, vaddr: u64, width: u8, value: u64) -> Result<(), Trap>;
    fn fence_i(&mut self);
    fn sfence_vma(&mut self);
}

/// What the run loop should do after a successful step. Traps (including
/// ECALL/EBREAK, which are architecturally traps) are signaled through the
/// `Result::Err` side instead of a variant here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    Next(u64),
    Mret,
    Sret,
    /// Carries the PC to resume at once the hart wakes from the wait;
    /// WFI does not itself redirect control flow.
    Wfi(u64),
}

#[allow(clippy::too_many_arguments)]
pub fn execute(
    instr: Instruction,
    pc: u64,
    len: u64,
    regs: &mut RegFile,
    csr: &mut CsrBank,
    priv_level: Privilege,
    xlen: Xlen,
    bus: &mut dyn MemBus,
) -> Result<Control, Trap> {
    let next = pc + len;
    match instr {
        Instruction::Lui { rd, imm } => {
            regs.write(rd, xlen.sign_extend(imm), xlen);
            Ok(Control::Next(next))
        }
        Instruction::Auipc { rd, imm } => {
            regs.write(rd, xlen.sign_extend(pc.wrapping_add(imm)), xlen);
            Ok(Control::Next(next))
        }
        Instruction::Jal { rd, imm } => {
            regs.write(rd, next, xlen);
            Ok(Control::Next(pc.wrapping_add(imm as u64)))
        }
        Instruction::Jalr { rd, rs1, imm } => {
            let target = regs.read(rs1).wrapping_add(imm as u64) & !1u64;
            regs.write(rd, next, xlen);
            Ok(Control::Next(target))
        }
        Instruction::Branch { kind, rs1, rs2, imm } => {
            let a = regs.read(rs1);
            let b = regs.read(rs2);
            let taken = match kind {
                Branch::Eq => a == b,
                Branch::Ne => a != b,
                Branch::Lt => (a as i64) < (b as i64),
                Branch::Ge => (a as i64) >= (b as i64),
                Branch::LtU => a < b,
                Branch::GeU => a >= b,
            };
            Ok(Control::Next(if taken { pc.wrapping_add(imm as u64) } else { next }))
        }
        Instruction::Load { rd, rs1, imm, width, signed } => {
            let vaddr = regs.read(rs1).wrapping_add(imm as u64);
            let value = bus.load(vaddr, width, signed)?;
            regs.write_raw(rd, xlen.sign_extend(value));
            Ok(Control::Next(next))
        }
        Instruction::Store { rs1, rs2, imm, width } => {
            let vaddr = regs.read(rs1).wrapping_add(imm as u64);
            bus.store(vaddr, width, regs.read(rs2))?;
            Ok(Control::Next(next))
        }
        Instruction::OpImm { op, rd, rs1, imm, word } => {
            let a = regs.read(rs1);
            let result = alu(op, a, imm as u64, word, xlen);
            regs.write(rd, result, if word { Xlen::Rv32 } else { xlen });
            Ok(Control::Next(next))
        }
        Instruction::Op { op, rd, rs1, rs2, word } => {
            let a = regs.read(rs1);
            let b = regs.read(rs2);
            let result = alu(op, a, b, word, xlen);
            regs.write(rd, result, if word { Xlen::Rv32 } else { xlen });
            Ok(Control::Next(next))
        }
        Instruction::Fence => Ok(Control::Next(next)),
        Instruction::FenceI => {
            bus.fence_i();
            Ok(Control::Next(next))
        }
        Instruction::SfenceVma { .. } => {
            bus.sfence_vma();
            Ok(Control::Next(next))
        }
        Instruction::Ecall => {
            let cause = match priv_level {
                Privilege::User => TrapCause::EnvCallFromUMode,
                Privilege::Supervisor => TrapCause::EnvCallFromSMode,
                Privilege::Machine => TrapCause::EnvCallFromMMode,
            };
            Err(Trap::new(cause, 0))
        }
        Instruction::Ebreak => Err(Trap::new(TrapCause::Breakpoint, pc)),
        Instruction::Mret => Ok(Control::Mret),
        Instruction::Sret => Ok(Control::Sret),
        Instruction::Wfi => Ok(Control::Wfi(next)),
        Instruction::Csr { op, rd, addr, rs1_or_imm, uses_imm } => {
            let old = csr.read(addr, priv_level).ok_or_else(|| Trap::new(TrapCause::IllegalInstruction, 0))?;
            let operand = if uses_imm { rs1_or_imm as u64 } else { regs.read(rs1_or_imm as usize) };
            let new = match op {
                CsrOp::ReadWrite => operand,
                CsrOp::ReadSet => old | operand,
                CsrOp::ReadClear => old & !operand,
            };
            // CSRRS/CSRRC with rs1 = x0 (or the _i form with a zero
            // immediate) are pure reads and must not write, so a CSR with
            // no writable bits (e.g. a future read-only extension) isn't
            // spuriously rejected.
            let skip_write = matches!(op, CsrOp::ReadSet | CsrOp::ReadClear) && operand == 0;
            if !skip_write {
                let effect = csr
                    .write(addr, new, priv_level)
                    .ok_or_else(|| Trap::new(TrapCause::IllegalInstruction, 0))?;
                // `satp` writes and translation-affecting `mstatus` writes
                // must flush the TLB — `CsrBank::write` only computes the
                // effect, the run loop is responsible for acting on it.
                if effect.flush_tlb {
                    bus.sfence_vma();
                }
            }
            regs.write_raw(rd, old);
            Ok(Control::Next(next))
        }
    }
}

fn alu(op: AluOp, a: u64, b: u64, word: bool, xlen: Xlen) -> u64 {
    let bits = if word { 32 } else { xlen.bits() };
    let mask_shift = if bits == 32 { 0x1f } else { 0x3f };
    let a = if bits == 32 { (a as u32) as u64 } else { a };
    let b_masked_shift = b & mask_shift;
    let result = match op {
        AluOp::Add => a.wrapping_add(b),
        AluOp::Sub => a.wrapping_sub(b),
        AluOp::Sll => a.wrapping_shl(b_masked_shift as u32),
        AluOp::Slt => ((a as i64) < (b as i64)) as u64,
        AluOp::SltU => (a < b) as u64,
        AluOp::Xor => a ^ b,
        AluOp::Srl => {
            if bits == 32 {
                (a as u32).wrapping_shr(b_masked_shift as u32) as u64
            } else {
                a.wrapping_shr(b_masked_shift as u32)
            }
        }
        AluOp::Sra => {
            if bits == 32 {
                ((a as u32 as i32).wrapping_shr(b_masked_shift as u32)) as u32 as u64
            } else {
                ((a as i64).wrapping_shr(b_masked_shift as u32)) as u64
            }
        }
        AluOp::Or => a | b,
        AluOp::And => a & b,
    };
    if word {
        (result as i32) as i64 as u64
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Xlen;

    #[derive(Default)]
    struct NullBus {
        sfence_count: u32,
    }
    impl MemBus for NullBus {
        fn load(&mut self, _vaddr: u64, _width: u8, _signed: bool) -> Result<u64, Trap> {
            Ok(0)
        }
        fn store(&mut self, _vaddr: u64, _width: u8, _value: u64) -> Result<(), Trap> {
            Ok(())
        }
        fn fence_i(&mut self) {}
        fn sfence_vma(&mut self) {
            self.sfence_count += 1;
        }
    }

    #[test]
    fn addi_adds_immediate() {
        let mut regs = RegFile::new(0x1000);
        regs.write(1, 10, Xlen::Rv64);
        let mut csr = CsrBank::reset(0, Xlen::Rv64);
        let mut bus = NullBus::default();
        let instr = Instruction::OpImm { op: AluOp::Add, rd: 2, rs1: 1, imm: 5, word: false };
        let ctrl = execute(instr, 0x1000, 4, &mut regs, &mut csr, Privilege::Machine, Xlen::Rv64, &mut bus).unwrap();
        assert_eq!(ctrl, Control::Next(0x1004));
        assert_eq!(regs.read(2), 15);
    }

    #[test]
    fn jal_links_and_jumps() {
        let mut regs = RegFile::new(0x1000);
        let mut csr = CsrBank::reset(0, Xlen::Rv64);
        let mut bus = NullBus::default();
        let instr = Instruction::Jal { rd: 1, imm: 0x100 };
        let ctrl = execute(instr, 0x1000, 4, &mut regs, &mut csr, Privilege::Machine, Xlen::Rv64, &mut bus).unwrap();
        assert_eq!(ctrl, Control::Next(0x1100));
        assert_eq!(regs.read(1), 0x1004);
    }

    #[test]
    fn ecall_from_user_mode_traps() {
        let mut regs = RegFile::new(0x1000);
        let mut csr = CsrBank::reset(0, Xlen::Rv64);
        let mut bus = NullBus::default();
        let err = execute(Instruction::Ecall, 0x1000, 4, &mut regs, &mut csr, Privilege::User, Xlen::Rv64, &mut bus)
            .unwrap_err();
        assert_eq!(err.cause, TrapCause::EnvCallFromUMode);
    }

    #[test]
    fn addiw_sign_extends_32_bit_result() {
        let mut regs = RegFile::new(0);
        regs.write(1, 0x7FFF_FFFF, Xlen::Rv64);
        let mut csr = CsrBank::reset(0, Xlen::Rv64);
        let mut bus = NullBus::default();
        let instr = Instruction::OpImm { op: AluOp::Add, rd: 2, rs1: 1, imm: 1, word: true };
        execute(instr, 0, 4, &mut regs, &mut csr, Privilege::Machine, Xlen::Rv64, &mut bus).unwrap();
        assert_eq!(regs.read(2) as i64, -0x8000_0000i64);
    }

    #[test]
    fn satp_csr_write_flushes_the_tlb() {
        use crate::hart::csr::SATP;

        let mut regs = RegFile::new(0);
        let mut csr = CsrBank::reset(0, Xlen::Rv64);
        let mut bus = NullBus::default();
        let instr = Instruction::Csr {
            op: CsrOp::ReadWrite,
            rd: 0,
            addr: SATP,
            rs1_or_imm: 1,
            uses_imm: false,
        };
        regs.write(1, 0x8000_0000_0000_0001, Xlen::Rv64);
        execute(instr, 0, 4, &mut regs, &mut csr, Privilege::Machine, Xlen::Rv64, &mut bus).unwrap();
        assert_eq!(csr.satp, 0x8000_0000_0000_0001);
        assert_eq!(bus.sfence_count, 1);

        // A CSR write that doesn't touch `satp`/translation-affecting
        // `mstatus` bits must not spuriously flush.
        let instr = Instruction::Csr {
            op: CsrOp::ReadWrite,
            rd: 0,
            addr: crate::hart::csr::MSCRATCH,
            rs1_or_imm: 1,
            uses_imm: false,
        };
        execute(instr, 0, 4, &mut regs, &mut csr, Privilege::Machine, Xlen::Rv64, &mut bus).unwrap();
        assert_eq!(bus.sfence_count, 1);
    }
}
