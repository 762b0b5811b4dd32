//! The memory access layer: page-table translation, the per-hart TLB, and
//! physical dispatch to RAM or an MMIO region.
//!
//! The lookup structure (the TLB) is kept separate from the thing it
//! caches (the page-table walk), feeding a single translate-then-dispatch
//! pipeline from a guest virtual address down to either RAM or a device.

pub mod sv;
pub mod tlb;

use std::sync::Arc;

use crate::device::MmioRegion;
use crate::ram::RamDescriptor;
use crate::sync::Spinlock;
use crate::trap::Trap;
use crate::types::AccessType;

pub use sv::PagingMode;
pub use tlb::{Tlb, TlbPerm};

/// Everything a translation or a physical access needs, bundled so `mmu`
/// free functions take one argument instead of threading `Hart` fields
/// through individually — and so this module never needs to know about the
/// concrete `Hart` type (the dependency runs hart -> mmu, not back).
pub struct MmuContext<'a> {
    pub satp: u64,
    pub rv64: bool,
    pub is_user: bool,
    /// `mstatus.SUM`
    pub sum: bool,
    /// `mstatus.MXR`
    pub mxr: bool,
    pub tlb: &'a mut Tlb,
    pub ram: &'a RamDescriptor,
    pub mmio: &'a Spinlock<Vec<MmioRegion>>,
}

/// The outcome of resolving a guest virtual address: either a host pointer
/// into the RAM-backed page (servable with a direct memory copy), or a
/// physical address that fell outside RAM and must go through the MMIO
/// registry instead. Physical dispatch applies to every translated
/// address, not only ones with no paging in effect.
enum Resolved {
    Ram(*mut u8),
    Mmio(u64),
}

/// Resolves `vaddr` to either a RAM host pointer or a raw physical address,
/// consulting the TLB first and falling back to a full page-table walk on a
/// miss. Only RAM-backed pages are ever cached in the TLB — a hit always
/// implies host-backed RAM, so an MMIO-destined translation is walked fresh
/// on every access.
fn resolve(ctx: &mut MmuContext, vaddr: u64, access: AccessType) -> Result<Resolved, Trap> {
    let page_base = vaddr & !(crate::ram::PAGE_SIZE - 1);
    let page_off = vaddr & (crate::ram::PAGE_SIZE - 1);
    let vpn = page_base >> 12;

    if let Some(host_page) = ctx.tlb.lookup(vpn, access) {
        // SAFETY: the page recorded in the TLB was validated by a prior walk
        // and is exactly `PAGE_SIZE` bytes; `page_off` is within bounds.
        return Ok(Resolved::Ram(unsafe { host_page.add(page_off as usize) }));
    }

    let (mode, root_ppn) = PagingMode::from_satp(ctx.satp, ctx.rv64);
    let result = sv::walk(ctx.ram, mode, root_ppn, vaddr, access, ctx.is_user, ctx.sum, ctx.mxr)?;

    let phys_page_base = result.paddr & !(crate::ram::PAGE_SIZE - 1);
    if !ctx.ram.contains(phys_page_base, crate::ram::PAGE_SIZE) {
        return Ok(Resolved::Mmio(result.paddr));
    }
    let host_page_base = ctx.ram.host_ptr(phys_page_base);

    let perm = perm_from_pte(result.pte_flags);
    ctx.tlb.insert(vpn, perm, host_page_base);

    // SAFETY: `host_page_base` points at the start of the translated page.
    Ok(Resolved::Ram(unsafe { host_page_base.add(page_off as usize) }))
}

/// Translates a guest virtual address to a host pointer for `access`. Only
/// valid when the target page is host-backed RAM; used by instruction fetch,
/// which never targets MMIO in this core.
///
/// Returns a host pointer valid for exactly one `PAGE_SIZE`-aligned page;
/// callers that straddle a page boundary must call this twice, once per
/// page, and are responsible for splitting the access themselves.
pub fn translate(ctx: &mut MmuContext, vaddr: u64, access: AccessType) -> Result<*mut u8, Trap> {
    match resolve(ctx, vaddr, access)? {
        Resolved::Ram(ptr) => Ok(ptr),
        Resolved::Mmio(_) => Err(Trap::access_fault(access, vaddr)),
    }
}

/// Dispatches one already-resolved sub-access: a direct copy for RAM, or a
/// call into the MMIO registry for anything else.
fn dispatch_resolved(
    ctx: &MmuContext,
    resolved: Resolved,
    len: usize,
    write: Option<&[u8]>,
    read: Option<&mut [u8]>,
) -> bool {
    match resolved {
        Resolved::Ram(host) => {
            match (write, read) {
                (Some(src), _) => unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), host, len) },
                (None, Some(dst)) => unsafe { std::ptr::copy_nonoverlapping(host, dst.as_mut_ptr(), len) },
                (None, None) => {}
            }
            true
        }
        Resolved::Mmio(paddr) => physical_access(ctx, paddr, len as u8, write, read),
    }
}

fn perm_from_pte(flags: sv::PteFlags) -> TlbPerm {
    let mut perm = TlbPerm::empty();
    if flags.contains(sv::PteFlags::R) {
        perm |= TlbPerm::READ;
    }
    if flags.contains(sv::PteFlags::W) {
        perm |= TlbPerm::WRITE;
    }
    if flags.contains(sv::PteFlags::X) {
        perm |= TlbPerm::EXEC;
    }
    perm
}

/// Invalidates the entire TLB. Called on `satp` write, SFENCE.VMA, and a
/// privilege change that affects translation.
pub fn tlb_flush(ctx: &mut MmuContext) {
    ctx.tlb.flush();
}

/// Dispatches a physical-address access to RAM or the first MMIO region
/// that claims it. `width` must already be a power of two in `[1, 8]`;
/// callers get that from the instruction decoder.
pub fn physical_access(
    ctx: &MmuContext,
    paddr: u64,
    width: u8,
    write: Option<&[u8]>,
    read: Option<&mut [u8]>,
) -> bool {
    if ctx.ram.contains(paddr, width as u64) {
        // SAFETY: bounds checked by `contains`.
        let ptr = ctx.ram.host_ptr(paddr);
        unsafe {
            match (write, read) {
                (Some(src), _) => std::ptr::copy_nonoverlapping(src.as_ptr(), ptr, width as usize),
                (None, Some(dst)) => std::ptr::copy_nonoverlapping(ptr, dst.as_mut_ptr(), width as usize),
                (None, None) => {}
            }
        }
        return true;
    }

    let regions = ctx.mmio.lock();
    for region in regions.iter() {
        if region.contains(paddr) && paddr + width as u64 <= region.end() {
            if !region.supports_width(width) {
                return false;
            }
            let offset = paddr - region.addr;
            let Some(device) = region.device.as_ref() else {
                return false;
            };
            return match (write, read) {
                (Some(src), _) => device.write(offset, width, src),
                (None, Some(dst)) => device.read(offset, width, dst),
                (None, None) => true,
            };
        }
    }
    false
}

/// The full access path for a load/store of `width` bytes at `vaddr`:
/// translate (possibly twice, if the access straddles a page boundary), then
/// dispatch each physical range.
pub fn mmu_op(
    ctx: &mut MmuContext,
    vaddr: u64,
    width: u8,
    access: AccessType,
    write: Option<&[u8]>,
    mut read: Option<&mut [u8]>,
) -> Result<(), Trap> {
    if vaddr % width as u64 != 0 {
        // Misaligned accesses are legal in the base ISA's memory model only
        // through the AMO/compressed-load-store exceptions the decoder
        // already filters; by the time a raw `mmu_op` call reaches here a
        // misaligned request is the guest's problem to fault on.
        return Err(Trap::misaligned(access, vaddr));
    }

    let page_base = vaddr & !(crate::ram::PAGE_SIZE - 1);
    let crosses_page = page_base != (vaddr + width as u64 - 1) & !(crate::ram::PAGE_SIZE - 1);

    if !crosses_page {
        let resolved = resolve(ctx, vaddr, access)?;
        let ok = dispatch_resolved(ctx, resolved, width as usize, write, read.as_deref_mut());
        return if ok { Ok(()) } else { Err(Trap::access_fault(access, vaddr)) };
    }

    // Cross-page split: both halves are resolved (and so any page/access
    // fault raised) before either is dispatched, so a fault on the second
    // half leaves the first half's memory untouched.
    let first_len = (crate::ram::PAGE_SIZE - (vaddr % crate::ram::PAGE_SIZE)) as usize;
    let second_len = width as usize - first_len;

    let first = resolve(ctx, vaddr, access)?;
    let second = resolve(ctx, vaddr + first_len as u64, access)?;

    let (ok1, ok2) = match (write, read) {
        (Some(src), _) => (
            dispatch_resolved(ctx, first, first_len, Some(&src[..first_len]), None),
            dispatch_resolved(ctx, second, second_len, Some(&src[first_len..]), None),
        ),
        (None, Some(dst)) => {
            let (dst_first, dst_second) = dst.split_at_mut(first_len);
            (
                dispatch_resolved(ctx, first, first_len, None, Some(dst_first)),
                dispatch_resolved(ctx, second, second_len, None, Some(dst_second)),
            )
        }
        (None, None) => (true, true),
    };
    if !ok1 || !ok2 {
        return Err(Trap::access_fault(access, vaddr));
    }
    Ok(())
}

/// Fetches up to 4 bytes at `vaddr` for instruction decode, returning
/// separately whether the low halfword alone decodes as a compressed
/// instruction so the caller need not fetch past a page boundary for an
/// instruction that turns out to be 16 bits wide.
pub fn fetch_instruction_halfword(ctx: &mut MmuContext, vaddr: u64) -> Result<u16, Trap> {
    let host = translate(ctx, vaddr, AccessType::Instruction)?;
    // SAFETY: `translate` returned a pointer into a page-sized host mapping;
    // a halfword at a 2-byte-aligned `vaddr` cannot cross that page.
    let bytes = unsafe { std::slice::from_raw_parts(host, 2) };
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn is_compressed(low_halfword: u16) -> bool {
    low_halfword & 0b11 != 0b11
}

/// Fetches a full instruction word, reading only the second halfword when
/// the first indicates a 32-bit encoding — so a compressed instruction
/// sitting in the last halfword of a page never triggers a translation of
/// the (possibly unmapped) following page.
pub fn fetch_instruction(ctx: &mut MmuContext, vaddr: u64) -> Result<(u32, bool), Trap> {
    let low = fetch_instruction_halfword(ctx, vaddr)?;
    if is_compressed(low) {
        return Ok((low as u32, true));
    }
    let high = fetch_instruction_halfword(ctx, vaddr + 2)?;
    Ok((low as u32 | ((high as u32) << 16), false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_devices::EchoDevice;
    use crate::device::MmioRegion;
    use crate::ram::Ram;

    fn fresh_ctx<'a>(
        ram: &'a RamDescriptor,
        tlb: &'a mut Tlb,
        mmio: &'a Spinlock<Vec<MmioRegion>>,
    ) -> MmuContext<'a> {
        MmuContext {
            satp: 0,
            rv64: true,
            is_user: false,
            sum: false,
            mxr: false,
            tlb,
            ram,
            mmio,
        }
    }

    #[test]
    fn bare_mode_round_trips_through_mmu_op() {
        let ram = Ram::new(0x8000_0000, 0x10_0000, false).unwrap();
        let desc = ram.descriptor();
        let mut tlb = Tlb::new();
        let mmio = Spinlock::new(Vec::new());
        let mut ctx = fresh_ctx(&desc, &mut tlb, &mmio);

        let value = 0xCAFEu16.to_le_bytes();
        mmu_op(&mut ctx, 0x8000_0100, 2, AccessType::Store, Some(&value), None).unwrap();
        let mut out = [0u8; 2];
        mmu_op(&mut ctx, 0x8000_0100, 2, AccessType::Load, None, Some(&mut out)).unwrap();
        assert_eq!(out, value);
    }

    #[test]
    fn physical_dispatch_prefers_ram_then_falls_back_to_mmio() {
        let ram = Ram::new(0x8000_0000, 0x1000, false).unwrap();
        let desc = ram.descriptor();
        let tlb = Tlb::new();
        let device = Arc::new(EchoDevice::new());
        let region = MmioRegion {
            addr: 0x1000_0000,
            size: 0x1000,
            min_op_size: 1,
            max_op_size: 8,
            device: Some(device),
        };
        let mmio = Spinlock::new(vec![region]);
        let mut tlb = tlb;
        let ctx = fresh_ctx(&desc, &mut tlb, &mmio);

        let mut out = [0u8; 4];
        assert!(physical_access(&ctx, 0x1000_0010, 4, None, Some(&mut out)));
        assert_eq!(u32::from_le_bytes(out), 0x10);

        assert!(!physical_access(&ctx, 0x2000_0000, 4, None, Some(&mut out)));
    }

    #[test]
    fn mmu_op_dispatches_a_bare_mode_load_to_an_attached_mmio_device() {
        // A byte load from a virtual address that falls inside an attached
        // MMIO region must reach the device, not fault, even though the
        // address never touches RAM — exercised here through `mmu_op` (not
        // `physical_access` directly) so the vaddr -> walk -> dispatch path
        // is what's under test.
        let ram = Ram::new(0x8000_0000, 0x1000, false).unwrap();
        let desc = ram.descriptor();
        let mut tlb = Tlb::new();
        let device = Arc::new(EchoDevice::new());
        let region = MmioRegion {
            addr: 0x1000_0000,
            size: 0x1000,
            min_op_size: 1,
            max_op_size: 8,
            device: Some(device),
        };
        let mmio = Spinlock::new(vec![region]);
        let mut ctx = fresh_ctx(&desc, &mut tlb, &mmio);

        let mut out = [0u8; 1];
        mmu_op(&mut ctx, 0x1000_00AB, 1, AccessType::Load, None, Some(&mut out)).unwrap();
        assert_eq!(out[0], 0xAB);

        // An address with no RAM and no covering MMIO region is an access
        // fault, not a silent no-op.
        let err = mmu_op(&mut ctx, 0x2000_0000, 1, AccessType::Load, None, Some(&mut [0u8])).unwrap_err();
        assert_eq!(err.cause, crate::trap::TrapCause::LoadAccessFault);
    }

    #[test]
    fn mmu_op_store_then_load_round_trips_through_a_stateful_device() {
        use crate::device::test_devices::RamShadowDevice;

        let ram = Ram::new(0x8000_0000, 0x1000, false).unwrap();
        let desc = ram.descriptor();
        let mut tlb = Tlb::new();
        let device = Arc::new(RamShadowDevice::new(0x1000));
        let region = MmioRegion {
            addr: 0x1000_0000,
            size: 0x1000,
            min_op_size: 1,
            max_op_size: 8,
            device: Some(device),
        };
        let mmio = Spinlock::new(vec![region]);
        let mut ctx = fresh_ctx(&desc, &mut tlb, &mmio);

        let value = 0x1122_3344u32.to_le_bytes();
        mmu_op(&mut ctx, 0x1000_0040, 4, AccessType::Store, Some(&value), None).unwrap();
        let mut out = [0u8; 4];
        mmu_op(&mut ctx, 0x1000_0040, 4, AccessType::Load, None, Some(&mut out)).unwrap();
        assert_eq!(out, value);
    }

    #[test]
    fn misaligned_access_faults() {
        let ram = Ram::new(0x8000_0000, 0x1000, false).unwrap();
        let desc = ram.descriptor();
        let mut tlb = Tlb::new();
        let mmio = Spinlock::new(Vec::new());
        let mut ctx = fresh_ctx(&desc, &mut tlb, &mmio);

        let err = mmu_op(&mut ctx, 0x8000_0001, 4, AccessType::Load, None, Some(&mut [0u8; 4])).unwrap_err();
        assert_eq!(err.cause, crate::trap::TrapCause::LoadAddressMisaligned);
    }

    #[test]
    fn sv32_walk_populates_tlb_with_matching_host_pointer() {
        use crate::mmu::sv::PteFlags;

        let ram = Ram::new(0x8000_0000, 0x10_0000, true).unwrap();
        let root_ppn = 0x8000_0000 / 4096;
        // Root maps VPN[1]=0 to a second-level table, which in turn maps
        // VPN[0]=0 to the leaf page — the same two-level shape
        // `sv32_two_level_walk_resolves_leaf` in `sv.rs` exercises directly,
        // here driven through `translate`'s TLB-insertion path instead.
        let l2_ppn = root_ppn + 1;
        let root_word = (l2_ppn << 10) | PteFlags::V.bits();
        ram.write(root_ppn * 4096, &(root_word as u32).to_le_bytes());
        let leaf_ppn = root_ppn + 2;
        let leaf_word = (leaf_ppn << 10) | (PteFlags::V | PteFlags::R | PteFlags::W | PteFlags::X).bits();
        ram.write(l2_ppn * 4096, &(leaf_word as u32).to_le_bytes());

        let desc = ram.descriptor();
        let mut tlb = Tlb::new();
        let mmio = Spinlock::new(Vec::new());
        let mut ctx = MmuContext {
            satp: root_ppn | (1 << 31),
            rv64: false,
            is_user: false,
            sum: false,
            mxr: false,
            tlb: &mut tlb,
            ram: &desc,
            mmio: &mmio,
        };

        let host = translate(&mut ctx, 0x0000_0000, AccessType::Load).unwrap();
        assert_eq!(host as u64, desc.host_ptr(leaf_ppn * 4096) as u64);

        // A second translate of the same page must hit the TLB and return
        // the identical host pointer rather than re-walking.
        let host_again = translate(&mut ctx, 0x0000_0004, AccessType::Load).unwrap();
        assert_eq!(host_again as u64 - 4, host as u64);
    }

    #[test]
    fn cross_page_store_leaves_first_half_unwritten_when_second_page_unmapped() {
        // RAM backs exactly one page; a 2-byte store straddling the last
        // byte of that page reaches into an address with no backing at all
        // on its second half.
        let ram = Ram::new(0x8000_0000, 0x1000, false).unwrap();
        let desc = ram.descriptor();
        let mut tlb = Tlb::new();
        let mmio = Spinlock::new(Vec::new());
        let mut ctx = fresh_ctx(&desc, &mut tlb, &mmio);

        let straddle_addr = 0x8000_0000 + 0x1000 - 1;
        let value = 0xBEEFu16.to_le_bytes();
        let err = mmu_op(&mut ctx, straddle_addr, 2, AccessType::Store, Some(&value), None).unwrap_err();
        assert_eq!(err.cause, crate::trap::TrapCause::StoreAmoAccessFault);

        // The in-range byte at `straddle_addr` (the first half of the would-be
        // store) must be untouched — no partial write leaked out before the
        // second half's translation failed.
        let mut check = [0xFFu8; 1];
        mmu_op(&mut ctx, straddle_addr, 1, AccessType::Load, None, Some(&mut check)).unwrap();
        assert_eq!(check[0], 0);
    }
}
