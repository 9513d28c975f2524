//! A multithreaded executable memory allocator.

use core::fmt::{self, Debug};
use core::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, instrument, Level};

use crate::admission::{executable_memory_exhausted, AdmissionController, Effort, PressureState};
use crate::allocators::free_space::{round_to_granule, FreeSpaceAllocator, OwnerTag, Span, Statistics};
use crate::error::AllocError;
use crate::pages::{MmapPages, PageProvider};
use crate::pool::{MemoryPool, PoolDescriptor};

struct Shared<P: PageProvider> {
    inner: Mutex<FreeSpaceAllocator<P>>,
    admission: AdmissionController,
    base: usize,
    size: usize,
}

impl<P: PageProvider> Shared<P> {
    #[inline]
    fn lock(&self) -> MutexGuard<'_, FreeSpaceAllocator<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A multithreaded executable memory allocator.
///
/// This allocator is a `Mutex` wrapper over [`FreeSpaceAllocator`] with an
/// [`AdmissionController`] in front of it. The ceiling check and the allocation
/// itself run under the same lock, so concurrent requests can't jointly
/// overshoot the ceiling.
///
/// Cloning is cheap and yields another reference to the same pool.
pub struct ExecutableAllocator<P: PageProvider = MmapPages> {
    shared: Arc<Shared<P>>,
}

impl<P: PageProvider> Clone for ExecutableAllocator<P> {
    fn clone(&self) -> Self {
        ExecutableAllocator {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: PageProvider> Debug for ExecutableAllocator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableAllocator")
            .field("inner", &*self.shared.lock())
            .field("admission", &self.shared.admission)
            .finish()
    }
}

impl<P: PageProvider> ExecutableAllocator<P> {
    pub fn new(pool: MemoryPool<P>, admission: AdmissionController) -> Self {
        let base = pool.base().as_ptr() as usize;
        let size = pool.size();
        ExecutableAllocator {
            shared: Arc::new(Shared {
                inner: Mutex::new(FreeSpaceAllocator::new(pool)),
                admission,
                base,
                size,
            }),
        }
    }

    /// Allocates at least `size` bytes of executable memory for `owner`.
    ///
    /// [`Effort::CanFail`] requests return an error when fuzzed, over the ceiling or
    /// out of space. [`Effort::MustSucceed`] requests either succeed or abort the process.
    #[instrument(level = "info", skip(self), err(Debug, level = Level::DEBUG))]
    pub fn allocate(
        &self,
        size: usize,
        owner: OwnerTag,
        effort: Effort,
    ) -> Result<ExecutableMemoryHandle<P>, AllocError> {
        self.shared.admission.screen(size, owner, effort)?;

        let mut inner = self.shared.lock();
        let result = round_to_granule(size).and_then(|_| {
            self.shared.admission.check_ceiling(size, &inner.statistics(), effort)?;
            inner.allocate(size, owner)
        });

        match result {
            Ok(span) => {
                let start = inner.address_of(span);
                drop(inner);
                debug!(?start, size = span.size, "Allocated executable memory.");
                Ok(ExecutableMemoryHandle {
                    span,
                    start,
                    owner,
                    shared: Arc::clone(&self.shared),
                })
            }
            Err(e) if effort == Effort::CanFail => Err(e),
            Err(e) => {
                let stats = inner.statistics();
                let breakdown = inner.owner_breakdown();
                drop(inner);
                executable_memory_exhausted(size, owner, &stats, &breakdown, &e)
            }
        }
    }

    /// Returns a snapshot of the ledger.
    pub fn statistics(&self) -> Statistics {
        self.shared.lock().statistics()
    }

    pub fn under_memory_pressure(&self) -> bool {
        self.statistics().under_memory_pressure()
    }

    /// How close to the ceiling the pool would be after `added` more bytes, see
    /// [`Statistics::pressure_multiplier`].
    pub fn pressure_multiplier(&self, added: usize) -> f64 {
        self.statistics()
            .pressure_multiplier(added, self.shared.admission.reservation_fraction())
    }

    pub fn pressure(&self) -> PressureState {
        self.statistics()
            .pressure(self.shared.admission.reservation_fraction())
    }

    pub fn owner_bytes(&self, owner: OwnerTag) -> usize {
        self.shared.lock().owner_bytes(owner)
    }

    pub fn owner_breakdown(&self) -> Vec<(OwnerTag, usize)> {
        self.shared.lock().owner_breakdown()
    }

    pub fn free_bytes(&self) -> usize {
        self.shared.lock().free_bytes()
    }

    pub fn largest_free_span(&self) -> usize {
        self.shared.lock().largest_free_span()
    }

    pub fn descriptor(&self) -> PoolDescriptor {
        self.shared.lock().pool().descriptor()
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.shared.admission
    }

    /// Whether `addr` lies within the pool.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.shared.base && addr - self.shared.base < self.shared.size
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.shared.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.shared.size
    }
}

/// One live allocation of executable memory.
///
/// The span goes back to the pool when the handle is dropped, so each
/// allocation is released exactly once. Outstanding handles keep the pool alive.
pub struct ExecutableMemoryHandle<P: PageProvider = MmapPages> {
    span: Span,
    start: NonNull<u8>,
    owner: OwnerTag,
    shared: Arc<Shared<P>>,
}

// The span is exclusively owned by the handle, the ledger is behind a mutex.
unsafe impl<P: PageProvider> Send for ExecutableMemoryHandle<P> {}
unsafe impl<P: PageProvider> Sync for ExecutableMemoryHandle<P> {}

impl<P: PageProvider> ExecutableMemoryHandle<P> {
    #[inline]
    pub fn start(&self) -> NonNull<u8> {
        self.start
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.start.as_ptr()
    }

    /// Address one past the last byte.
    #[inline]
    pub fn end(&self) -> usize {
        self.start.as_ptr() as usize + self.span.size
    }

    /// Size rounded up to the allocation granule.
    #[inline]
    pub fn size(&self) -> usize {
        self.span.size
    }

    /// Offset from the pool base.
    #[inline]
    pub fn offset(&self) -> usize {
        self.span.offset
    }

    #[inline]
    pub fn span(&self) -> Span {
        self.span
    }

    #[inline]
    pub fn owner(&self) -> OwnerTag {
        self.owner
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start.as_ptr() as usize && addr < self.end()
    }

    /// Returns the span to the pool. Same as dropping the handle.
    pub fn release(self) {
        drop(self)
    }
}

impl<P: PageProvider> Debug for ExecutableMemoryHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableMemoryHandle")
            .field("start", &self.start)
            .field("size", &self.span.size)
            .field("owner", &self.owner)
            .finish()
    }
}

impl<P: PageProvider> Drop for ExecutableMemoryHandle<P> {
    fn drop(&mut self) {
        self.shared.lock().release(self.span);
    }
}
