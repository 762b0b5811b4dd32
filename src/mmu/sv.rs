//! SV32/SV39 page table walker.
//!
//! Both modes are expressed through one generic walk parameterized by a
//! small [`PagingMode`] description (PTE width, level count, VPN field
//! widths) rather than two near-duplicate functions.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

use crate::ram::RamDescriptor;
use crate::trap::Trap;
use crate::types::AccessType;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

impl PteFlags {
    pub fn is_leaf(self) -> bool {
        self.intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    Bare,
    Sv32,
    Sv39,
}

struct LevelDesc {
    levels: usize,
    vpn_bits: u32,
    pte_bytes: u32,
}

impl PagingMode {
    fn desc(self) -> Option<LevelDesc> {
        match self {
            PagingMode::Bare => None,
            PagingMode::Sv32 => Some(LevelDesc {
                levels: 2,
                vpn_bits: 10,
                pte_bytes: 4,
            }),
            PagingMode::Sv39 => Some(LevelDesc {
                levels: 3,
                vpn_bits: 9,
                pte_bytes: 8,
            }),
        }
    }

    /// Parses the `satp`/`satp32` MODE field for the active XLEN, returning
    /// the mode and the root page table's PPN.
    pub fn from_satp(satp: u64, rv64: bool) -> (PagingMode, u64) {
        if rv64 {
            let mode = (satp >> 60) & 0xF;
            let ppn = satp & 0x0FFF_FFFF_FFFF; // 44 bits
            match mode {
                8 => (PagingMode::Sv39, ppn),
                _ => (PagingMode::Bare, ppn),
            }
        } else {
            let mode = (satp >> 31) & 0x1;
            let ppn = satp & 0x3F_FFFF; // 22 bits
            match mode {
                1 => (PagingMode::Sv32, ppn),
                _ => (PagingMode::Bare, ppn),
            }
        }
    }
}

fn vpn_at(vaddr: u64, level: usize, vpn_bits: u32) -> u64 {
    (vaddr >> (12 + level as u64 * vpn_bits as u64)) & ((1u64 << vpn_bits) - 1)
}

/// Reads a PTE word, atomically — A/D bit updates by concurrent walkers
/// must appear atomic, so every PTE access here goes through
/// `AtomicU32`/`AtomicU64` rather than a plain load.
fn read_pte(ram: &RamDescriptor, pte_addr: u64, pte_bytes: u32) -> Option<u64> {
    if !ram.contains(pte_addr, pte_bytes as u64) {
        return None;
    }
    let ptr = ram.host_ptr(pte_addr);
    // SAFETY: `ram.contains` established the address range lies within the
    // RAM mapping; alignment is guaranteed because page tables are
    // page-aligned and indices are multiples of `pte_bytes`.
    unsafe {
        Some(if pte_bytes == 4 {
            (*(ptr as *const AtomicU32)).load(Ordering::Acquire) as u64
        } else {
            (*(ptr as *const AtomicU64)).load(Ordering::Acquire)
        })
    }
}

/// Sets the A bit (and D, for writes) on the PTE via a CAS loop, so the
/// update is atomic against concurrent walkers touching the same entry.
fn set_accessed_dirty(ram: &RamDescriptor, pte_addr: u64, pte_bytes: u32, set_dirty: bool) {
    let ptr = ram.host_ptr(pte_addr);
    let want = PteFlags::A.bits() | if set_dirty { PteFlags::D.bits() } else { 0 };
    // SAFETY: see `read_pte`.
    unsafe {
        if pte_bytes == 4 {
            let word = &*(ptr as *const AtomicU32);
            let mut cur = word.load(Ordering::Acquire);
            loop {
                let new = cur | want as u32;
                if new == cur {
                    break;
                }
                match word.compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => break,
                    Err(observed) => cur = observed,
                }
            }
        } else {
            let word = &*(ptr as *const AtomicU64);
            let mut cur = word.load(Ordering::Acquire);
            loop {
                let new = cur | want;
                if new == cur {
                    break;
                }
                match word.compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => break,
                    Err(observed) => cur = observed,
                }
            }
        }
    }
}

fn ppn_from_pte(pte: u64, pte_bytes: u32) -> u64 {
    if pte_bytes == 4 {
        (pte >> 10) & 0x3F_FFFF
    } else {
        (pte >> 10) & 0x0FFF_FFFF_FFFF
    }
}

/// Permission check result for a successful leaf lookup.
pub struct Translation {
    pub paddr: u64,
    pub pte_flags: PteFlags,
}

/// Walks the active page table for `vaddr`. `sum`/`mxr` are the relevant
/// `mstatus` bits for S-mode accesses; `priv_user` indicates whether the
/// access is being made from U-mode.
#[allow(clippy::too_many_arguments)]
pub fn walk(
    ram: &RamDescriptor,
    mode: PagingMode,
    root_ppn: u64,
    vaddr: u64,
    access: AccessType,
    is_user: bool,
    sum: bool,
    mxr: bool,
) -> Result<Translation, Trap> {
    let desc = match mode.desc() {
        None => {
            // Mbare: identity mapping, full permissions.
            return Ok(Translation {
                paddr: vaddr,
                pte_flags: PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U,
            });
        }
        Some(desc) => desc,
    };

    let page_mask = (1u64 << 12) - 1;
    let mut table_ppn = root_ppn;

    for level in (0..desc.levels).rev() {
        let vpn = vpn_at(vaddr, level, desc.vpn_bits);
        let pte_addr = table_ppn * 4096 + vpn * desc.pte_bytes as u64;
        let pte = read_pte(ram, pte_addr, desc.pte_bytes).ok_or_else(|| {
            Trap::access_fault(access, vaddr)
        })?;
        let flags = PteFlags::from_bits_truncate(pte & 0xFF);

        if !flags.contains(PteFlags::V) || (!flags.contains(PteFlags::R) && flags.contains(PteFlags::W)) {
            return Err(Trap::page_fault(access, vaddr));
        }

        if !flags.is_leaf() {
            table_ppn = ppn_from_pte(pte, desc.pte_bytes);
            continue;
        }

        // Leaf PTE: check for a misaligned superpage.
        let ppn = ppn_from_pte(pte, desc.pte_bytes);
        let low_bits_per_level = desc.vpn_bits;
        if level > 0 {
            let low_mask = (1u64 << (low_bits_per_level * level as u32)) - 1;
            if ppn & low_mask != 0 {
                return Err(Trap::page_fault(access, vaddr));
            }
        }

        // Permission checks.
        let readable = flags.contains(PteFlags::R) || (mxr && flags.contains(PteFlags::X));
        let ok = match access {
            AccessType::Instruction => flags.contains(PteFlags::X),
            AccessType::Load => readable,
            AccessType::Store => flags.contains(PteFlags::W),
        };
        let user_ok = if is_user {
            flags.contains(PteFlags::U)
        } else {
            // S-mode accessing a U-page requires SUM, and never for fetches.
            !flags.contains(PteFlags::U) || (sum && access != AccessType::Instruction)
        };
        if !ok || !user_ok {
            return Err(Trap::page_fault(access, vaddr));
        }

        set_accessed_dirty(ram, pte_addr, desc.pte_bytes, access == AccessType::Store);

        let page_size_shift = 12 + low_bits_per_level * level as u32;
        let page_offset_mask = (1u64 << page_size_shift) - 1;
        let paddr = ((ppn << 12) & !page_offset_mask) | (vaddr & page_offset_mask & !page_mask) | (vaddr & page_mask);
        return Ok(Translation {
            paddr,
            pte_flags: flags,
        });
    }

    Err(Trap::page_fault(access, vaddr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ram::Ram;

    fn write_pte(ram: &Ram, addr: u64, ppn: u64, flags: PteFlags, bytes: u32) {
        let word = (ppn << 10) | flags.bits();
        if bytes == 4 {
            ram.write(addr, &(word as u32).to_le_bytes());
        } else {
            ram.write(addr, &word.to_le_bytes());
        }
    }

    #[test]
    fn sv32_two_level_walk_resolves_leaf() {
        let ram = Ram::new(0x8000_0000, 0x10_0000, true).unwrap();
        let root_ppn = 0x8000_0000 / 4096;
        // Root maps VPN[1]=0 -> a second-level table at PPN root_ppn+1.
        let l2_ppn = root_ppn + 1;
        write_pte(&ram, root_ppn * 4096, l2_ppn, PteFlags::V, 4);
        // Second level maps VPN[0]=0 -> physical page root_ppn+2, R|W|X.
        let leaf_ppn = root_ppn + 2;
        write_pte(
            &ram,
            l2_ppn * 4096,
            leaf_ppn,
            PteFlags::V | PteFlags::R | PteFlags::W | PteFlags::X,
            4,
        );

        let desc = ram.descriptor();
        let result = walk(&desc, PagingMode::Sv32, root_ppn, 0x0000_0000, AccessType::Load, false, false, false)
            .expect("walk succeeds");
        assert_eq!(result.paddr, leaf_ppn * 4096);
    }

    #[test]
    fn invalid_pte_faults() {
        let ram = Ram::new(0x8000_0000, 0x10_0000, true).unwrap();
        let root_ppn = 0x8000_0000 / 4096;
        let desc = ram.descriptor();
        let err = walk(&desc, PagingMode::Sv32, root_ppn, 0x0000_0000, AccessType::Load, false, false, false)
            .unwrap_err();
        assert_eq!(err.cause, crate::trap::TrapCause::LoadPageFault);
    }

    #[test]
    fn bare_mode_is_identity() {
        let ram = Ram::new(0x8000_0000, 0x1000, false).unwrap();
        let desc = ram.descriptor();
        let result = walk(&desc, PagingMode::Bare, 0, 0x8000_0100, AccessType::Load, false, false, false).unwrap();
        assert_eq!(result.paddr, 0x8000_0100);
    }
}
