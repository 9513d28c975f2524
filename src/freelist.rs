//! Defines the [`Freelist`] of free spans within a pool.
//!
//! Unlike a general purpose heap the executable pool can't keep its metadata
//! inline, free pages may be decommitted and committed ones are code. Spans
//! are therefore tracked out of line, keyed by their offset.

use std::collections::BTreeMap;

/// A set of disjoint, non-adjacent free byte ranges.
///
/// Adjacent ranges are always merged on insertion, so two entries never touch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Freelist {
    /// offset -> length
    spans: BTreeMap<usize, usize>,
    free_bytes: usize,
}

impl Freelist {
    /// Creates an empty Freelist.
    #[inline]
    pub const fn new() -> Self {
        Freelist {
            spans: BTreeMap::new(),
            free_bytes: 0,
        }
    }

    /// Creates a Freelist holding the single span `[0, size)`.
    pub fn with_capacity(size: usize) -> Self {
        let mut list = Freelist::new();
        if size > 0 {
            list.insert(0, size);
        }
        list
    }

    /// Removes `size` bytes from the lowest-addressed span that can hold them
    /// and returns their offset, or `None` if no span is large enough.
    /// The search is greedy, the chosen span is the first found and might not be the best fit.
    pub fn take_first_fit(&mut self, size: usize) -> Option<usize> {
        debug_assert!(size > 0);
        let (&offset, &len) = self.spans.iter().find(|&(_, &len)| len >= size)?;
        self.spans.remove(&offset);
        if len > size {
            self.spans.insert(offset + size, len - size);
        }
        self.free_bytes -= size;
        Some(offset)
    }

    /// Returns `[offset, offset + size)` to the list, merging it with the spans
    /// that end at `offset` or start at `offset + size`.
    ///
    /// # Panics
    /// Panics in debug builds if the range overlaps a span that's already free.
    pub fn insert(&mut self, offset: usize, size: usize) {
        debug_assert!(size > 0);
        let mut start = offset;
        let mut len = size;

        if let Some((&prev, &prev_len)) = self.spans.range(..offset).next_back() {
            debug_assert!(prev + prev_len <= offset, "Span at {offset} is already free.");
            if prev + prev_len == offset {
                self.spans.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }

        let end = offset + size;
        if let Some((&next, _)) = self.spans.range(offset..).next() {
            debug_assert!(next >= end, "Span at {offset} is already free.");
        }
        if let Some(next_len) = self.spans.remove(&end) {
            len += next_len;
        }

        self.spans.insert(start, len);
        self.free_bytes += size;
    }

    /// Total number of free bytes.
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Length of the largest span, 0 if the list is empty.
    pub fn largest(&self) -> usize {
        self.spans.values().copied().max().unwrap_or(0)
    }

    /// Number of disjoint spans.
    #[inline]
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// `(offset, length)` pairs in address order.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.spans.iter().map(|(&o, &l)| (o, l))
    }
}
