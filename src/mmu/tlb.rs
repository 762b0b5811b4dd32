//! Direct-mapped TLB, 256 entries by default. Owned exclusively by one
//! hart; there is no cross-thread access, so no internal locking.

use bitflags::bitflags;

use crate::types::AccessType;

pub const TLB_ENTRIES: usize = 256;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TlbPerm: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl TlbPerm {
    pub fn for_access(access: AccessType) -> Self {
        match access {
            AccessType::Instruction => TlbPerm::EXEC,
            AccessType::Load => TlbPerm::READ,
            AccessType::Store => TlbPerm::WRITE,
        }
    }

    pub fn allows(self, access: AccessType) -> bool {
        self.contains(Self::for_access(access))
    }
}

#[derive(Clone, Copy)]
struct TlbEntry {
    vpn: u64,
    perm: TlbPerm,
    host_page: *mut u8,
}

pub struct Tlb {
    entries: Box<[Option<TlbEntry>; TLB_ENTRIES]>,
}

// SAFETY: a `Tlb` is created by and lives inside exactly one `Hart`, and is
// only ever touched by that hart's own run-loop thread; this impl exists
// only so `Hart` itself can be held behind `Arc` alongside fields that
// genuinely are shared.
unsafe impl Send for Tlb {}
unsafe impl Sync for Tlb {}

fn index_for(vpn: u64) -> usize {
    // A simple multiplicative hash spreads sequential page numbers (the
    // overwhelmingly common access pattern) across the table instead of
    // colliding in the low bits.
    ((vpn.wrapping_mul(0x9E37_79B9_7F4A_7C15)) >> 48) as usize & (TLB_ENTRIES - 1)
}

impl Tlb {
    pub fn new() -> Self {
        Self {
            entries: Box::new([None; TLB_ENTRIES]),
        }
    }

    pub fn lookup(&self, vpn: u64, access: AccessType) -> Option<*mut u8> {
        let idx = index_for(vpn);
        match self.entries[idx] {
            Some(e) if e.vpn == vpn && e.perm.allows(access) => Some(e.host_page),
            _ => None,
        }
    }

    /// Insert a freshly walked translation. If a matching tag is already
    /// resident, the new access permission is OR-ed in rather than
    /// replacing the entry outright: a later access with additional
    /// permissions can upgrade the cached entry without a re-walk, valid
    /// only because the walk for *this* access just succeeded. A mismatched
    /// tag replaces the slot.
    pub fn insert(&mut self, vpn: u64, perm: TlbPerm, host_page: *mut u8) {
        let idx = index_for(vpn);
        match &mut self.entries[idx] {
            Some(e) if e.vpn == vpn => {
                e.perm |= perm;
                e.host_page = host_page;
            }
            slot => {
                *slot = Some(TlbEntry {
                    vpn,
                    perm,
                    host_page,
                });
            }
        }
    }

    /// Drops all entries. Called on `satp` write, SFENCE.VMA, a
    /// privilege-mode change affecting translation, and reset.
    pub fn flush(&mut self) {
        for slot in self.entries.iter_mut() {
            *slot = None;
        }
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_returns_inserted_pointer() {
        let mut tlb = Tlb::new();
        let ptr = 0x1000 as *mut u8;
        tlb.insert(7, TlbPerm::READ, ptr);
        assert_eq!(tlb.lookup(7, AccessType::Load), Some(ptr));
        assert_eq!(tlb.lookup(7, AccessType::Store), None);
    }

    #[test]
    fn flush_clears_all_entries() {
        let mut tlb = Tlb::new();
        tlb.insert(1, TlbPerm::READ, 0x1 as *mut u8);
        tlb.flush();
        assert_eq!(tlb.lookup(1, AccessType::Load), None);
    }

    #[test]
    fn or_in_permission_upgrades_without_replacing_pointer() {
        let mut tlb = Tlb::new();
        let ptr = 0x2000 as *mut u8;
        tlb.insert(3, TlbPerm::READ, ptr);
        tlb.insert(3, TlbPerm::WRITE, ptr);
        assert_eq!(tlb.lookup(3, AccessType::Load), Some(ptr));
        assert_eq!(tlb.lookup(3, AccessType::Store), Some(ptr));
    }

    #[test]
    fn mismatched_tag_replaces_slot() {
        let mut tlb = Tlb::new();
        let idx = index_for(0);
        // find a vpn that collides with vpn 0's slot
        let mut other = 1u64;
        while index_for(other) != idx {
            other += 1;
        }
        tlb.insert(0, TlbPerm::READ, 0x10 as *mut u8);
        tlb.insert(other, TlbPerm::WRITE, 0x20 as *mut u8);
        assert_eq!(tlb.lookup(0, AccessType::Load), None);
        assert_eq!(tlb.lookup(other, AccessType::Store), Some(0x20 as *mut u8));
    }
}
