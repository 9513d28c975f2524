//! A singlethreaded free-space allocator over a [`MemoryPool`].
//!
// For a general view of how the pieces fit together see the [`crate`] level documentation.
//
// # Additional implementation notes
// ## Granule
// Every span handed out is a multiple of [`ALLOCATION_GRANULE`] bytes and starts
// on a granule boundary. Requests are rounded up, never down.
//
// ## Page bookkeeping
// Each page of the pool carries a count of the live spans touching it and
// whether it is currently committed. A page is committed when its first user
// arrives and released when its last user leaves, so the committed bytes always
// cover every live span. A release the OS refused leaves the page committed with
// no users; the next span landing there simply reuses it.

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::ptr::NonNull;

use static_assertions::const_assert;
use tracing::{debug, error, instrument, Level};

use crate::error::{AllocError, PageError};
use crate::freelist::Freelist;
use crate::pages::PageProvider;
use crate::pool::{MemoryPool, PageRelease};
use crate::util::{page_span, round_up};

/// Allocation granularity in bytes.
pub const ALLOCATION_GRANULE: usize = 32;

const_assert!(ALLOCATION_GRANULE.is_power_of_two());
// Pages must split into whole granules.
const_assert!(4096 % ALLOCATION_GRANULE == 0);

/// Rounds `size` up to the allocation granule, treating 0 as one granule.
#[inline]
pub fn round_to_granule(size: usize) -> Result<usize, AllocError> {
    match round_up(size.max(1), ALLOCATION_GRANULE) {
        // Size of objects should not exceed isize::MAX.
        Some(rounded) if rounded as isize > 0 => Ok(rounded),
        _ => Err(AllocError::TooLarge { requested: size }),
    }
}

/// An opaque label naming who asked for a span, kept for diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerTag(&'static str);

impl OwnerTag {
    pub const UNKNOWN: OwnerTag = OwnerTag("unknown");

    pub const fn new(name: &'static str) -> Self {
        OwnerTag(name)
    }

    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl Default for OwnerTag {
    fn default() -> Self {
        OwnerTag::UNKNOWN
    }
}

impl fmt::Display for OwnerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A byte range `[offset, offset + size)` inside the pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Span {
    pub offset: usize,
    pub size: usize,
}

impl Span {
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    #[inline]
    pub fn overlaps(&self, other: &Span) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// A snapshot of the allocator's counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Sum of the sizes of all live spans.
    pub bytes_allocated: usize,
    /// Usable size of the pool.
    pub bytes_reserved: usize,
    /// Bytes of pages with physical backing.
    pub bytes_committed: usize,
    pub live_allocations: usize,
}

#[derive(Copy, Clone, Debug, Default)]
struct PageState {
    users: u32,
    committed: bool,
}

/// A single threaded free-space allocator.
///
/// The pool is closed: when no free span fits, allocation fails instead of
/// asking the OS for more address space.
pub struct FreeSpaceAllocator<P: PageProvider> {
    pool: MemoryPool<P>,
    freelist: Freelist,
    pages: Vec<PageState>,
    /// offset -> (size, owner) of every live span.
    live: BTreeMap<usize, (usize, OwnerTag)>,
    bytes_allocated: usize,
    bytes_committed: usize,
}

impl<P: PageProvider> Debug for FreeSpaceAllocator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeSpaceAllocator")
            .field("pool", &self.pool)
            .field("statistics", &self.statistics())
            .field("free_spans", &self.freelist.len())
            .finish()
    }
}

impl<P: PageProvider> FreeSpaceAllocator<P> {
    /// Creates an allocator handing out the whole of `pool`.
    pub fn new(pool: MemoryPool<P>) -> Self {
        debug_assert_eq!(pool.page_size() % ALLOCATION_GRANULE, 0);
        let page_count = pool.size() / pool.page_size();
        FreeSpaceAllocator {
            freelist: Freelist::with_capacity(pool.size()),
            pages: vec![PageState::default(); page_count],
            live: BTreeMap::new(),
            bytes_allocated: 0,
            bytes_committed: 0,
            pool,
        }
    }

    /// Carves a span of at least `size` bytes out of the pool and commits the
    /// pages it touches.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG), err(Debug, level = Level::DEBUG))]
    pub fn allocate(&mut self, size: usize, owner: OwnerTag) -> Result<Span, AllocError> {
        let rounded = round_to_granule(size)?;
        debug!(rounded, "Size rounded to granule.");

        let Some(offset) = self.freelist.take_first_fit(rounded) else {
            debug!(free = self.freelist.free_bytes(), "Couldn't find free span to accommodate allocation.");
            return Err(AllocError::OutOfSpace { rounded });
        };
        let span = Span { offset, size: rounded };

        if let Err(e) = self.commit_span(span) {
            error!(%e, "Couldn't commit pages, returning span to the freelist.");
            self.freelist.insert(offset, rounded);
            return Err(AllocError::Commit(e));
        }

        self.bytes_allocated += rounded;
        self.live.insert(offset, (rounded, owner));
        Ok(span)
    }

    /// Gives `span` back to the pool, merging it with neighbouring free spans
    /// and releasing every page no live span touches anymore.
    ///
    /// # Panics
    /// Panics in debug builds if `span` is not live.
    #[instrument(level = "debug", skip(self))]
    pub fn release(&mut self, span: Span) {
        let entry = self.live.remove(&span.offset);
        debug_assert!(
            matches!(entry, Some((size, _)) if size == span.size),
            "Releasing a span that isn't live: {span:?}"
        );
        let Some((size, owner)) = entry else {
            error!(?span, "Ignoring release of a span that isn't live.");
            return;
        };
        debug!(%owner, size, "Releasing span.");

        self.freelist.insert(span.offset, size);
        self.bytes_allocated -= size;

        for idx in page_span(span.offset, size, self.pool.page_size()) {
            let state = &mut self.pages[idx];
            debug_assert!(state.users > 0 && state.committed);
            state.users -= 1;
            if state.users == 0 {
                self.release_page(idx);
            }
        }
    }

    /// Returns a snapshot of the counters.
    pub fn statistics(&self) -> Statistics {
        Statistics {
            bytes_allocated: self.bytes_allocated,
            bytes_reserved: self.pool.size(),
            bytes_committed: self.bytes_committed,
            live_allocations: self.live.len(),
        }
    }

    /// Bytes held by live spans tagged with `owner`.
    pub fn owner_bytes(&self, owner: OwnerTag) -> usize {
        self.live
            .values()
            .filter(|(_, o)| *o == owner)
            .map(|(size, _)| size)
            .sum()
    }

    /// Live bytes per owner, sorted by owner.
    pub fn owner_breakdown(&self) -> Vec<(OwnerTag, usize)> {
        let mut totals: BTreeMap<OwnerTag, usize> = BTreeMap::new();
        for &(size, owner) in self.live.values() {
            *totals.entry(owner).or_default() += size;
        }
        totals.into_iter().collect()
    }

    pub fn free_bytes(&self) -> usize {
        self.freelist.free_bytes()
    }

    pub fn largest_free_span(&self) -> usize {
        self.freelist.largest()
    }

    pub fn pool(&self) -> &MemoryPool<P> {
        &self.pool
    }

    /// Start address of `span`.
    #[inline]
    pub fn address_of(&self, span: Span) -> NonNull<u8> {
        self.pool.address_of(span.offset)
    }

    /// Commits the pages of `span` that have no backing yet and registers
    /// `span` as a user of all of its pages. On failure nothing is registered
    /// and pages committed by this call are released again.
    fn commit_span(&mut self, span: Span) -> Result<(), PageError> {
        let page_size = self.pool.page_size();
        let range = page_span(span.offset, span.size, page_size);

        for idx in range.clone() {
            if self.pages[idx].committed {
                continue;
            }
            if let Err(e) = self.pool.request_page(idx * page_size + self.base()) {
                for undo in range.start..idx {
                    if self.pages[undo].users == 0 && self.pages[undo].committed {
                        self.release_page(undo);
                    }
                }
                return Err(e);
            }
            self.pages[idx].committed = true;
            self.bytes_committed += page_size;
            debug!(page = idx, "Committed page.");
        }

        for idx in range {
            self.pages[idx].users += 1;
        }
        Ok(())
    }

    fn release_page(&mut self, idx: usize) {
        let page_size = self.pool.page_size();
        match self.pool.release_page(idx * page_size + self.base()) {
            PageRelease::Released => {
                self.pages[idx].committed = false;
                self.bytes_committed -= page_size;
                debug!(page = idx, "Released page.");
            }
            PageRelease::Leaked => {
                debug!(page = idx, "Page stays committed.");
            }
        }
    }

    #[inline(always)]
    fn base(&self) -> usize {
        self.pool.base().as_ptr() as usize
    }
}

#[cfg(test)]
mod tests;
