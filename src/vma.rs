//! Host virtual-memory-area shim.
//!
//! Backs every guest RAM allocation and the W^X dual mapping a future JIT
//! would use. Implemented with `libc` `mmap`/`mprotect`/`munmap` on Unix;
//! the platform split is `#[cfg(unix)]` vs. everything else, since that's
//! the axis this shim cares about.

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VmaProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// A single host page-aligned mapping.
#[derive(Debug)]
pub struct Vma {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is exclusively owned by this `Vma`; callers are
// responsible for not racing writes the way any raw memory region requires.
unsafe impl Send for Vma {}
unsafe impl Sync for Vma {}

impl Vma {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(unix)]
impl Drop for Vma {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        // SAFETY: this `Vma` owns its mapping exclusively; dropping it is
        // the one point at which unmapping is valid.
        unsafe {
            libc::munmap(self.ptr as *mut _, self.len);
        }
    }
}

/// A shared R/W + R/X pair over the same physical pages, for a future JIT's
/// W^X code cache. Not used by the interpreter core, but kept here so a JIT
/// can be added later without redesigning the memory layer underneath it.
#[derive(Debug)]
pub struct JitDualMapping {
    pub write_view: Vma,
    pub exec_view: Vma,
}

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::io;
    use std::ptr;

    fn to_mmap_prot(prot: VmaProt) -> i32 {
        let mut p = 0;
        if prot.contains(VmaProt::READ) {
            p |= libc::PROT_READ;
        }
        if prot.contains(VmaProt::WRITE) {
            p |= libc::PROT_WRITE;
        }
        if prot.contains(VmaProt::EXEC) {
            p |= libc::PROT_EXEC;
        }
        p
    }

    pub fn page_size() -> usize {
        // SAFETY: `sysconf` with `_SC_PAGESIZE` has no side effects.
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    pub fn allocate(len: usize, prot: VmaProt) -> io::Result<Vma> {
        if len == 0 {
            return Ok(Vma {
                ptr: ptr::null_mut(),
                len: 0,
            });
        }
        // SAFETY: a fresh anonymous mapping; the returned pointer and length
        // are only ever used through `Vma`'s bounds-respecting accessors.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                to_mmap_prot(prot),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Vma {
            ptr: ptr as *mut u8,
            len,
        })
    }

    pub fn protect(vma: &Vma, prot: VmaProt) -> io::Result<()> {
        if vma.is_empty() {
            return Ok(());
        }
        // SAFETY: `vma` owns a live mapping of at least `vma.len` bytes.
        let rc = unsafe { libc::mprotect(vma.ptr as *mut _, vma.len, to_mmap_prot(prot)) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn resize(vma: Vma, new_len: usize, prot: VmaProt) -> io::Result<Vma> {
        // No portable `mremap` on all Unix targets worth depending on here;
        // reallocate and copy the overlap, matching the shim's contract
        // that a resize may relocate the mapping.
        let new_vma = allocate(new_len, prot)?;
        if !vma.is_empty() && !new_vma.is_empty() {
            let copy_len = vma.len.min(new_vma.len);
            // SAFETY: both regions are live and at least `copy_len` bytes.
            unsafe {
                ptr::copy_nonoverlapping(vma.ptr, new_vma.ptr, copy_len);
            }
        }
        free(vma)?;
        Ok(new_vma)
    }

    /// Hint that the pages backing `vma` can be discarded without
    /// invalidating the mapping (`MADV_DONTNEED`).
    pub fn clean(vma: &Vma) -> io::Result<()> {
        if vma.is_empty() {
            return Ok(());
        }
        // SAFETY: advisory only; does not change the validity of `vma.ptr`.
        let rc = unsafe { libc::madvise(vma.ptr as *mut _, vma.len, libc::MADV_DONTNEED) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn free(vma: Vma) -> io::Result<()> {
        if vma.is_empty() {
            return Ok(());
        }
        // SAFETY: `vma` is consumed, so this is the mapping's only unmap.
        let rc = unsafe { libc::munmap(vma.ptr as *mut _, vma.len) };
        // `Drop` would otherwise unmap the same range again once this
        // local goes out of scope.
        std::mem::forget(vma);
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn dual_mapping(len: usize) -> Option<JitDualMapping> {
        // A true shared W + X dual mapping needs `memfd_create` + two
        // `mmap`s of the same fd; on platforms where exec mappings are
        // unavailable (or this path is simply not wired up), the core must
        // keep working with JIT disabled, per the shim's contract.
        let _ = len;
        None
    }
}

#[cfg(unix)]
pub use unix_impl::*;

#[cfg(not(unix))]
mod fallback_impl {
    use super::*;
    use std::io;

    pub fn page_size() -> usize {
        4096
    }

    pub fn allocate(_len: usize, _prot: VmaProt) -> io::Result<Vma> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "host VMA shim has no backend for this platform",
        ))
    }

    pub fn protect(_vma: &Vma, _prot: VmaProt) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "unsupported platform"))
    }

    pub fn resize(_vma: Vma, _new_len: usize, _prot: VmaProt) -> io::Result<Vma> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "unsupported platform"))
    }

    pub fn clean(_vma: &Vma) -> io::Result<()> {
        Ok(())
    }

    pub fn free(_vma: Vma) -> io::Result<()> {
        Ok(())
    }

    pub fn dual_mapping(_len: usize) -> Option<JitDualMapping> {
        None
    }
}

#[cfg(not(unix))]
pub use fallback_impl::*;

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_write() {
        let vma = allocate(4096, VmaProt::READ | VmaProt::WRITE).unwrap();
        assert_eq!(vma.len(), 4096);
        // SAFETY: freshly allocated RW mapping of 4096 bytes.
        unsafe {
            *vma.as_ptr() = 0x42;
            assert_eq!(*vma.as_ptr(), 0x42);
        }
        free(vma).unwrap();
    }

    #[test]
    fn page_size_is_sane() {
        assert!(page_size() >= 4096);
    }
}
