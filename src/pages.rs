//! [`PageProvider`] trait and structures that implement it.
//!
//! The [`PageProvider`] trait is the only place where the pool talks to the
//! operating system. Which commit and decommit strategy a provider follows is
//! described once by its [`PageCapabilities`], so the allocator core never has
//! to know what platform it is running on.

use core::ptr::NonNull;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::{PageError, PageOp};

/// How physical pages get attached to the usable region.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitPolicy {
    /// The usable region is made accessible once when the pool is created and
    /// the OS backs pages on first touch. Per-page commit requests are no-ops.
    OnFirstTouch,
    /// Each page has to be committed before it is handed out.
    Explicit,
}

/// How physical pages get detached once no allocation uses them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecommitPolicy {
    /// Hint the OS that the contents are no longer needed, keep the mapping accessible.
    Advise,
    /// Drop the backing and make the page inaccessible again.
    Explicit,
}

/// Page strategy of a provider, fixed for the lifetime of a pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCapabilities {
    pub commit: CommitPolicy,
    pub decommit: DecommitPolicy,
}

impl PageCapabilities {
    pub const EXPLICIT: PageCapabilities = PageCapabilities {
        commit: CommitPolicy::Explicit,
        decommit: DecommitPolicy::Explicit,
    };

    pub const LAZY: PageCapabilities = PageCapabilities {
        commit: CommitPolicy::OnFirstTouch,
        decommit: DecommitPolicy::Advise,
    };

    /// The strategy the host platform handles best.
    pub const fn native() -> PageCapabilities {
        if cfg!(any(target_os = "linux", target_os = "android", target_os = "macos")) {
            PageCapabilities::LAZY
        } else {
            PageCapabilities::EXPLICIT
        }
    }
}

/// A source of page-granular virtual memory.
///
/// # Safety
/// * `reserve` must return a range of at least `len` bytes, aligned to
///   [`page_size`](PageProvider::page_size), that nothing else uses until it
///   is handed back through `release`.
/// * After `commit` succeeds the range must be readable and writable
///   (and executable, if the provider hands out code memory).
/// * None of the operations may move or unmap a range other than `release`.
pub unsafe trait PageProvider: Send {
    /// Granularity of every operation below.
    fn page_size(&self) -> usize;

    fn capabilities(&self) -> PageCapabilities;

    /// Reserves `len` bytes of address space without access rights.
    ///
    /// # Safety
    /// `len` must be a nonzero multiple of the page size.
    unsafe fn reserve(&self, len: usize) -> Result<NonNull<u8>, PageError>;

    /// Makes `[ptr, ptr + len)` accessible and backed by memory.
    ///
    /// # Safety
    /// The range must lie within a live reservation and be page aligned.
    unsafe fn commit(&self, ptr: NonNull<u8>, len: usize) -> Result<(), PageError>;

    /// Tells the OS the contents of the range are no longer needed.
    /// The range stays mapped and accessible.
    ///
    /// # Safety
    /// The range must lie within a live reservation and be page aligned.
    unsafe fn advise_free(&self, ptr: NonNull<u8>, len: usize) -> Result<(), PageError>;

    /// Drops the backing of the range and removes access to it.
    ///
    /// # Safety
    /// The range must lie within a live reservation and be page aligned.
    unsafe fn decommit(&self, ptr: NonNull<u8>, len: usize) -> Result<(), PageError>;

    /// Gives the whole reservation back to the OS.
    ///
    /// # Safety
    /// `ptr` and `len` must be exactly what an earlier `reserve` returned and
    /// took, and no pointer into the range may be used afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, len: usize) -> Result<(), PageError>;
}

/// Protection applied to committed pages.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protection {
    ReadWriteExecute,
    /// For hosts that forbid writable executable mappings; the embedder remaps
    /// code itself.
    ReadWrite,
}

impl Protection {
    fn prot(self) -> libc::c_int {
        match self {
            Protection::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// A provider that internally uses `mmap`, `mprotect` and `madvise`.
#[derive(Debug, Clone)]
pub struct MmapPages {
    capabilities: PageCapabilities,
    protection: Protection,
}

impl MmapPages {
    pub const fn new(capabilities: PageCapabilities, protection: Protection) -> Self {
        MmapPages { capabilities, protection }
    }

    /// Native capabilities with read/write/execute pages.
    pub const fn native() -> Self {
        MmapPages::new(PageCapabilities::native(), Protection::ReadWriteExecute)
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }
}

impl Default for MmapPages {
    fn default() -> Self {
        MmapPages::native()
    }
}

/// The OS page size, queried once.
pub fn system_page_size() -> usize {
    static CACHED: OnceLock<usize> = OnceLock::new();
    *CACHED.get_or_init(|| {
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        debug_assert!(raw > 0, "sysconf(_SC_PAGESIZE) should never fail.");
        if raw > 0 {
            raw as usize
        } else {
            4096
        }
    })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

// Linux reclaims eagerly with DONTNEED; elsewhere FREE is the cheap lazy hint.
#[cfg(any(target_os = "linux", target_os = "android"))]
const ADVICE: libc::c_int = libc::MADV_DONTNEED;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const ADVICE: libc::c_int = libc::MADV_FREE;

unsafe impl PageProvider for MmapPages {
    fn page_size(&self) -> usize {
        system_page_size()
    }

    fn capabilities(&self) -> PageCapabilities {
        self.capabilities
    }

    unsafe fn reserve(&self, len: usize) -> Result<NonNull<u8>, PageError> {
        let ptr = libc::mmap(core::ptr::null_mut(), len, libc::PROT_NONE, RESERVE_FLAGS, -1, 0);
        if ptr == libc::MAP_FAILED {
            return Err(PageError::last_os_error(PageOp::Reserve, 0, len));
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
            PageError::new(
                PageOp::Reserve,
                0,
                len,
                std::io::Error::other("mmap returned null"),
            )
        })
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, len: usize) -> Result<(), PageError> {
        if libc::mprotect(ptr.as_ptr().cast(), len, self.protection.prot()) != 0 {
            return Err(PageError::last_os_error(PageOp::Commit, ptr.as_ptr() as usize, len));
        }
        Ok(())
    }

    unsafe fn advise_free(&self, ptr: NonNull<u8>, len: usize) -> Result<(), PageError> {
        if libc::madvise(ptr.as_ptr().cast(), len, ADVICE) != 0 {
            return Err(PageError::last_os_error(PageOp::AdviseFree, ptr.as_ptr() as usize, len));
        }
        Ok(())
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, len: usize) -> Result<(), PageError> {
        if libc::madvise(ptr.as_ptr().cast(), len, ADVICE) != 0 {
            return Err(PageError::last_os_error(PageOp::Decommit, ptr.as_ptr() as usize, len));
        }
        if libc::mprotect(ptr.as_ptr().cast(), len, libc::PROT_NONE) != 0 {
            return Err(PageError::last_os_error(PageOp::Decommit, ptr.as_ptr() as usize, len));
        }
        Ok(())
    }

    unsafe fn release(&self, ptr: NonNull<u8>, len: usize) -> Result<(), PageError> {
        if libc::munmap(ptr.as_ptr().cast(), len) != 0 {
            return Err(PageError::last_os_error(PageOp::Release, ptr.as_ptr() as usize, len));
        }
        Ok(())
    }
}

unsafe impl<T: PageProvider + Sync + ?Sized> PageProvider for &T {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn capabilities(&self) -> PageCapabilities {
        (**self).capabilities()
    }

    unsafe fn reserve(&self, len: usize) -> Result<NonNull<u8>, PageError> {
        (**self).reserve(len)
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, len: usize) -> Result<(), PageError> {
        (**self).commit(ptr, len)
    }

    unsafe fn advise_free(&self, ptr: NonNull<u8>, len: usize) -> Result<(), PageError> {
        (**self).advise_free(ptr, len)
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, len: usize) -> Result<(), PageError> {
        (**self).decommit(ptr, len)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, len: usize) -> Result<(), PageError> {
        (**self).release(ptr, len)
    }
}
