//! Virtual memory lifecycle for the collector's heap.
//!
//! Ranges move through reserve -> commit <-> decommit -> release. The caller
//! owns every `(address, size)` pair and must only hand back sub-ranges of a
//! previous reservation; nothing here tracks ranges.

use std::io;
use std::ptr::{self, NonNull};

use libc::c_void;
use nix::sys::mman::{madvise, mprotect, munlock, MmapAdvise, ProtFlags};
use thiserror::Error;

use crate::platform::numa::NumaTopology;

#[cfg(any(target_os = "linux", target_os = "android"))]
const HUGE_PAGE_FLAG: libc::c_int = libc::MAP_HUGETLB;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const HUGE_PAGE_FLAG: libc::c_int = 0;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Failed to map {size} bytes: {source}")]
    MapFailed { size: usize, source: io::Error },
    #[error("Failed to unmap {size} bytes at {addr:#x}: {source}")]
    UnmapFailed { addr: usize, size: usize, source: io::Error },
    #[error("Failed to change protection of {size} bytes at {addr:#x}: {source}")]
    ProtectFailed { addr: usize, size: usize, source: nix::Error },
    #[error("Failed to advise the kernel about {size} bytes at {addr:#x}: {source}")]
    AdviseFailed { addr: usize, size: usize, source: nix::Error },
    #[error("Write watching is not supported on this platform")]
    WriteWatchUnsupported,
}

/// Result of aligning an over-sized raw mapping.
///
/// `head` bytes before `base` and `tail` bytes after `base + len` are handed
/// back to the OS; either may be zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignedTrim {
    pub base: usize,
    pub head: usize,
    pub tail: usize,
}

/// Carves an `alignment`-aligned window of `len` bytes out of a raw mapping.
///
/// `raw_len` must be at least `len + alignment - page_size` for a
/// page-aligned `raw_base`, which is what `reserve` maps.
pub fn trim_for_alignment(raw_base: usize, raw_len: usize, alignment: usize, len: usize) -> AlignedTrim {
    let base = raw_base.next_multiple_of(alignment);
    let head = base - raw_base;
    debug_assert!(head + len <= raw_len, "raw mapping too small for aligned window");
    let tail = raw_len - head - len;
    AlignedTrim { base, head, tail }
}

/// Reserve/commit/decommit/release over anonymous mappings.
///
/// # Thread Safety
/// Every operation is a direct kernel call on the caller's range, so disjoint
/// ranges can be used from any thread. Ordering operations on the same range
/// is the caller's job.
#[derive(Debug, Clone)]
pub struct VirtualMemory {
    page_size: usize,
    numa: NumaTopology,
}

impl VirtualMemory {
    pub fn new(page_size: usize, numa: NumaTopology) -> Self {
        Self { page_size, numa }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Reserves `size` bytes of inaccessible address space aligned to
    /// `alignment`.
    ///
    /// # Logic
    /// Maps `size + alignment - page_size` bytes, then unmaps the unaligned
    /// head and tail slivers separately. An `alignment` below the page size
    /// (including zero) means page alignment. `_node` is accepted for
    /// interface parity; placement is applied on commit.
    ///
    /// `huge_pages` only asks for transparent huge pages on the aligned
    /// window. The mapping itself uses normal pages, since slivers of a
    /// `MAP_HUGETLB` mapping cannot be unmapped at normal page granularity.
    /// Explicit huge pages go through [`Self::reserve_and_commit_large_pages`].
    ///
    /// # Errors
    /// Returns `MemoryError::MapFailed` when the kernel refuses the mapping
    /// or the over-allocation does not fit in the address space. There is no
    /// retry.
    pub fn reserve(&self, size: usize, alignment: usize, _node: Option<u16>, huge_pages: bool) -> Result<NonNull<u8>, MemoryError> {
        let addr = self.reserve_inner(size, alignment, false, false)?;
        if huge_pages {
            advise_huge_pages(addr.as_ptr(), size);
        }
        Ok(addr)
    }

    fn reserve_inner(&self, size: usize, alignment: usize, hugetlb: bool, committing: bool) -> Result<NonNull<u8>, MemoryError> {
        let alignment = alignment.max(self.page_size);
        debug_assert_eq!(alignment % self.page_size, 0, "alignment must be a multiple of the page size");
        debug_assert!(!hugetlb || alignment == self.page_size, "hugetlb mappings cannot be trimmed");

        let raw_len = size
            .checked_add(alignment - self.page_size)
            .ok_or_else(|| MemoryError::MapFailed { size, source: io::ErrorKind::OutOfMemory.into() })?;
        let mut flags = libc::MAP_ANON | libc::MAP_PRIVATE;
        if hugetlb {
            flags |= HUGE_PAGE_FLAG;
        }

        // SAFETY: a fresh anonymous mapping at a kernel-chosen address cannot
        // alias existing memory.
        let raw = unsafe { libc::mmap(ptr::null_mut(), raw_len, libc::PROT_NONE, flags, -1, 0) };
        if raw == libc::MAP_FAILED {
            return Err(MemoryError::MapFailed { size: raw_len, source: io::Error::last_os_error() });
        }

        let trim = trim_for_alignment(raw as usize, raw_len, alignment, size);
        // SAFETY: both slivers lie inside the mapping created above and are
        // disjoint from the window handed to the caller.
        unsafe {
            if trim.head != 0 {
                let ret = libc::munmap(raw, trim.head);
                debug_assert_eq!(ret, 0, "munmap of alignment head failed");
            }
            if trim.tail != 0 {
                let ret = libc::munmap((trim.base + size) as *mut c_void, trim.tail);
                debug_assert_eq!(ret, 0, "munmap of alignment tail failed");
            }
        }

        let base = trim.base as *mut u8;
        if !committing {
            // Reserved but uncommitted memory stays out of core dumps.
            exclude_from_dump(base, size);
        }

        NonNull::new(base).ok_or_else(|| MemoryError::MapFailed { size, source: io::ErrorKind::AddrNotAvailable.into() })
    }

    /// Makes a reserved sub-range readable and writable.
    ///
    /// Freshly reserved and previously decommitted memory reads as zeros.
    /// When `node` names a valid NUMA node a preferred-node policy is applied
    /// as a hint; its failure does not fail the commit.
    ///
    /// # Safety
    /// `[addr, addr + size)` must lie inside a live reservation owned by the
    /// caller.
    pub unsafe fn commit(&self, addr: NonNull<u8>, size: usize, node: Option<u16>) -> Result<(), MemoryError> {
        self.commit_inner(addr, size, node, false)
    }

    unsafe fn commit_inner(&self, addr: NonNull<u8>, size: usize, node: Option<u16>, new_memory: bool) -> Result<(), MemoryError> {
        mprotect(addr.as_ptr().cast(), size, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE).map_err(|source| {
            MemoryError::ProtectFailed { addr: addr.as_ptr() as usize, size, source }
        })?;

        if !new_memory {
            include_in_dump(addr.as_ptr(), size);
        }

        if let Some(node) = node {
            self.numa.bind_preferred(addr.as_ptr(), size, node);
        }

        Ok(())
    }

    /// Reserves and commits `size` bytes backed by huge pages.
    ///
    /// # Errors
    /// Any failure is returned as-is and nothing stays mapped; falling back
    /// to normal pages is the caller's decision.
    pub fn reserve_and_commit_large_pages(&self, size: usize, node: Option<u16>) -> Result<NonNull<u8>, MemoryError> {
        let addr = self.reserve_inner(size, self.page_size, true, true)?;

        // SAFETY: `addr` is the reservation made just above.
        if let Err(err) = unsafe { self.commit_inner(addr, size, node, true) } {
            // SAFETY: the reservation is still exclusively ours.
            let _ = unsafe { self.release(addr, size) };
            return Err(err);
        }

        Ok(addr)
    }

    /// Returns the backing pages of a committed range to the OS.
    ///
    /// # Logic
    /// Maps a fresh inaccessible anonymous mapping over the range with
    /// `MAP_FIXED` rather than only revoking access, so resident memory
    /// actually drops and a later commit reads zeros.
    ///
    /// # Safety
    /// `[addr, addr + size)` must lie inside a live reservation owned by the
    /// caller, and nothing may still reference its contents.
    pub unsafe fn decommit(&self, addr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
        let ret = libc::mmap(
            addr.as_ptr().cast(),
            size,
            libc::PROT_NONE,
            libc::MAP_FIXED | libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        );
        if ret == libc::MAP_FAILED {
            return Err(MemoryError::MapFailed { size, source: io::Error::last_os_error() });
        }

        exclude_from_dump(addr.as_ptr(), size);
        Ok(())
    }

    /// Gives a reservation back to the OS. The range is invalid afterwards.
    ///
    /// # Safety
    /// `[addr, addr + size)` must be a reservation (or part of one) owned by
    /// the caller with no outstanding references.
    pub unsafe fn release(&self, addr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
        if libc::munmap(addr.as_ptr().cast(), size) != 0 {
            return Err(MemoryError::UnmapFailed { addr: addr.as_ptr() as usize, size, source: io::Error::last_os_error() });
        }
        Ok(())
    }

    /// Tells the OS the range's contents are no longer needed.
    ///
    /// Pages are reclaimed lazily under memory pressure; the range stays
    /// committed and usable. With `unlock` the range is also unlocked.
    ///
    /// # Safety
    /// `[addr, addr + size)` must be committed memory owned by the caller
    /// whose contents may be discarded.
    pub unsafe fn reset(&self, addr: NonNull<u8>, size: usize, unlock: bool) -> Result<(), MemoryError> {
        exclude_from_dump(addr.as_ptr(), size);

        advise_free(addr.as_ptr(), size).map_err(|source| MemoryError::AdviseFailed {
            addr: addr.as_ptr() as usize,
            size,
            source,
        })?;

        if unlock {
            // Ranges that were never locked report ENOMEM; that is fine.
            let _ = munlock(addr.as_ptr() as *const c_void, size);
        }

        Ok(())
    }

    /// Write watching needs kernel dirty-page tracking this layer does not
    /// use.
    pub fn supports_write_watch(&self) -> bool {
        false
    }

    pub fn reset_write_watch(&self, _addr: NonNull<u8>, _size: usize) -> Result<(), MemoryError> {
        Err(MemoryError::WriteWatchUnsupported)
    }

    pub fn get_write_watch(&self, _reset: bool, _addr: NonNull<u8>, _size: usize) -> Result<Vec<NonNull<u8>>, MemoryError> {
        Err(MemoryError::WriteWatchUnsupported)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn advise_free(addr: *mut u8, size: usize) -> nix::Result<()> {
    match madvise(addr.cast(), size, MmapAdvise::MADV_FREE) {
        // Kernels before 4.5 lack MADV_FREE.
        Err(nix::Error::EINVAL) => madvise(addr.cast(), size, MmapAdvise::MADV_DONTNEED),
        other => other,
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn advise_free(addr: *mut u8, size: usize) -> nix::Result<()> {
    madvise(addr.cast(), size, MmapAdvise::MADV_DONTNEED)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn advise_huge_pages(addr: *mut u8, size: usize) {
    // Kernels without transparent huge pages reject the advice; normal pages
    // still back the range.
    // SAFETY: the advice does not touch page contents.
    let _ = unsafe { madvise(addr.cast(), size, MmapAdvise::MADV_HUGEPAGE) };
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn advise_huge_pages(_addr: *mut u8, _size: usize) {}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn exclude_from_dump(addr: *mut u8, size: usize) {
    // SAFETY: dump advice does not touch page contents.
    let _ = unsafe { madvise(addr.cast(), size, MmapAdvise::MADV_DONTDUMP) };
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn include_in_dump(addr: *mut u8, size: usize) {
    // SAFETY: dump advice does not touch page contents.
    let _ = unsafe { madvise(addr.cast(), size, MmapAdvise::MADV_DODUMP) };
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn exclude_from_dump(_addr: *mut u8, _size: usize) {}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn include_in_dump(_addr: *mut u8, _size: usize) {}

/// Usable user-mode address space: the `RLIMIT_AS` soft limit when one is
/// set, otherwise [`virtual_memory_max_address`].
pub fn virtual_memory_limit() -> u64 {
    address_space_limit().unwrap_or_else(virtual_memory_max_address)
}

/// The `RLIMIT_AS` soft limit, if finite.
pub(crate) fn address_space_limit() -> Option<u64> {
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    // SAFETY: `limit` is a valid out-parameter.
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_AS, &mut limit) };
    (ret == 0 && limit.rlim_cur != libc::RLIM_INFINITY).then_some(limit.rlim_cur as u64)
}

/// Approximate top of the user address space.
///
/// There is no portable query, so this is the common user-space size:
/// 128 TiB on 64-bit targets, 256 GiB on riscv64 (Sv39).
pub fn virtual_memory_max_address() -> u64 {
    if cfg!(target_arch = "riscv64") {
        1 << 38
    } else if cfg!(target_pointer_width = "64") {
        1 << 47
    } else {
        usize::MAX as u64
    }
}
