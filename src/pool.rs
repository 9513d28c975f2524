//! The [`MemoryPool`] reservation and its serializable [`PoolDescriptor`].
//!
//! A pool is one contiguous range of address space reserved at startup. When
//! guard pages are requested the reservation is one page larger on each side
//! and those two pages never become accessible, so running off either end of
//! the usable region faults instead of corrupting a neighbour.
//!
//! ```text
//!  reservation
//!  ┌────────┬──────────────────────────────────────────┬────────┐
//!  │ guard  │ usable region (size bytes)               │ guard  │
//!  └────────┴──────────────────────────────────────────┴────────┘
//!           ^ base
//! ```

use core::fmt::Debug;
use core::ptr::NonNull;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn, Level};

use crate::error::{PageError, ReservationError};
use crate::pages::{CommitPolicy, DecommitPolicy, PageCapabilities, PageProvider};
use crate::util::{round_down, round_up};

/// How many times a transiently failing page release is retried.
pub const PAGE_OP_RETRIES: usize = 64;

/// Outcome of [`MemoryPool::release_page`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageRelease {
    Released,
    /// The OS refused; the page keeps its backing. Only reachable in release builds.
    Leaked,
}

/// A fixed-size reservation of executable memory.
pub struct MemoryPool<P: PageProvider> {
    reservation: NonNull<u8>,
    reservation_len: usize,
    base: NonNull<u8>,
    size: usize,
    guard_pages: bool,
    provider: P,
}

// The pool only hands out addresses, it never dereferences them.
unsafe impl<P: PageProvider> Send for MemoryPool<P> {}

impl<P: PageProvider> Debug for MemoryPool<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("guard_pages", &self.guard_pages)
            .field("capabilities", &self.provider.capabilities())
            .finish()
    }
}

impl<P: PageProvider> MemoryPool<P> {
    /// Reserves `size` bytes (rounded up to whole pages) from `provider`.
    #[instrument(level = "info", skip(provider), err(Debug, level = Level::ERROR))]
    pub fn create(size: usize, provider: P, guard_pages: bool) -> Result<Self, ReservationError> {
        if size == 0 {
            return Err(ReservationError::EmptyPool);
        }
        let page_size = provider.page_size();
        debug_assert!(page_size.is_power_of_two());

        let size = round_up(size, page_size).ok_or(ReservationError::SizeOverflow { size })?;
        let guard_len = if guard_pages { page_size } else { 0 };
        let reservation_len = size
            .checked_add(2 * guard_len)
            .ok_or(ReservationError::SizeOverflow { size })?;

        let reservation = unsafe { provider.reserve(reservation_len) }
            .map_err(|source| ReservationError::Os { size, source })?;
        let base = unsafe { NonNull::new_unchecked(reservation.as_ptr().add(guard_len)) };

        if provider.capabilities().commit == CommitPolicy::OnFirstTouch {
            // The guards stay inaccessible, everything in between is backed lazily by the OS.
            if let Err(source) = unsafe { provider.commit(base, size) } {
                if let Err(e) = unsafe { provider.release(reservation, reservation_len) } {
                    error!(%e, "Couldn't hand back a half-initialized reservation.");
                }
                return Err(ReservationError::Os { size, source });
            }
        }

        info!(base = ?base.as_ptr(), size, guard_pages, "Reserved executable pool.");
        Ok(MemoryPool {
            reservation,
            reservation_len,
            base,
            size,
            guard_pages,
            provider,
        })
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Usable size in bytes, excluding guard pages.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.provider.page_size()
    }

    #[inline]
    pub fn has_guard_pages(&self) -> bool {
        self.guard_pages
    }

    #[inline]
    pub fn capabilities(&self) -> PageCapabilities {
        self.provider.capabilities()
    }

    #[inline]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Whether `addr` lies within the usable region.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        addr >= base && addr - base < self.size
    }

    /// The address `offset` bytes into the usable region.
    ///
    /// # Panics
    /// Panics in debug builds if `offset` is out of bounds.
    #[inline]
    pub fn address_of(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.size, "Offset {offset} is outside the pool.");
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Commits the page containing `addr`.
    /// Does nothing for providers that back pages on first touch.
    #[instrument(level = "debug", skip(self), err(Debug, level = Level::ERROR))]
    pub fn request_page(&self, addr: usize) -> Result<(), PageError> {
        debug_assert!(self.contains(addr));
        if self.capabilities().commit == CommitPolicy::OnFirstTouch {
            return Ok(());
        }
        let page = self.page_containing(addr);
        unsafe { self.provider.commit(page, self.page_size()) }
    }

    /// Returns the backing of the page containing `addr` to the OS while keeping
    /// the address reserved.
    ///
    /// Transient failures are retried up to [`PAGE_OP_RETRIES`] times. Any other
    /// failure panics in debug builds and is reported as [`PageRelease::Leaked`]
    /// in release builds: the page stays committed, which wastes memory but is
    /// never incorrect.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG))]
    pub fn release_page(&self, addr: usize) -> PageRelease {
        debug_assert!(self.contains(addr));
        let page = self.page_containing(addr);
        let len = self.page_size();

        let mut attempt = 0;
        let outcome = loop {
            let result = unsafe {
                match self.capabilities().decommit {
                    DecommitPolicy::Advise => self.provider.advise_free(page, len),
                    DecommitPolicy::Explicit => self.provider.decommit(page, len),
                }
            };
            match result {
                Ok(()) => break Ok(()),
                Err(e) if e.is_transient() && attempt < PAGE_OP_RETRIES => {
                    attempt += 1;
                    debug!(attempt, "Transient page release failure, retrying.");
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(()) => PageRelease::Released,
            Err(e) => {
                if cfg!(debug_assertions) {
                    panic!("Couldn't release executable page: {e}");
                }
                warn!(%e, "Couldn't release executable page, leaving it committed.");
                PageRelease::Leaked
            }
        }
    }

    /// Describes this pool for another process.
    pub fn descriptor(&self) -> PoolDescriptor {
        PoolDescriptor {
            base: self.base.as_ptr() as usize,
            size: self.size,
            page_size: self.page_size(),
            guard_pages: self.guard_pages,
            capabilities: self.capabilities(),
        }
    }

    #[inline]
    fn page_containing(&self, addr: usize) -> NonNull<u8> {
        let page = round_down(addr, self.page_size());
        unsafe { NonNull::new_unchecked(page as *mut u8) }
    }
}

impl<P: PageProvider> Drop for MemoryPool<P> {
    fn drop(&mut self) {
        debug!(base = ?self.base.as_ptr(), "Releasing executable pool.");
        if let Err(e) = unsafe { self.provider.release(self.reservation, self.reservation_len) } {
            error!(%e, "Couldn't release executable pool.");
        }
    }
}

/// Everything another process needs to address a pool it did not reserve.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDescriptor {
    pub base: usize,
    pub size: usize,
    pub page_size: usize,
    pub guard_pages: bool,
    pub capabilities: PageCapabilities,
}

/// A non-owning view of a pool reserved elsewhere.
///
/// A view never reserves, commits or releases anything.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PoolView {
    descriptor: PoolDescriptor,
}

impl PoolView {
    /// # Safety
    /// The descriptor must describe a reservation that stays mapped in this
    /// address space for as long as the view, or any address derived from it, is used.
    pub unsafe fn from_descriptor(descriptor: PoolDescriptor) -> Self {
        debug_assert!(descriptor.base != 0);
        debug_assert!(descriptor.page_size.is_power_of_two());
        debug_assert_eq!(descriptor.base % descriptor.page_size, 0);
        PoolView { descriptor }
    }

    pub fn descriptor(&self) -> &PoolDescriptor {
        &self.descriptor
    }

    pub fn base(&self) -> usize {
        self.descriptor.base
    }

    pub fn size(&self) -> usize {
        self.descriptor.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.descriptor.base && addr - self.descriptor.base < self.descriptor.size
    }

    pub fn address_of(&self, offset: usize) -> Option<usize> {
        (offset < self.descriptor.size).then(|| self.descriptor.base + offset)
    }

    pub fn offset_of(&self, addr: usize) -> Option<usize> {
        self.contains(addr).then(|| addr - self.descriptor.base)
    }
}
