//! Utility functions.

use core::ops::Range;

/// Returns the smallest integer `z` such that `z ≥ x` and `z = y.k` for some integer `k`
/// or `None` if that integer can not be contained in a `usize`.
///
/// # Panics
/// Panics if `y` is 0.
#[inline]
pub(crate) fn round_up(x: usize, y: usize) -> Option<usize> {
    if x % y == 0 {
        Some(x)
    } else {
        ((x / y) * y).checked_add(y)
    }
}

/// Rounds `x` down to a multiple of the power-of-two `align`.
#[inline(always)]
pub(crate) fn round_down(x: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// Indices of the pages of size `page_size` touched by the byte range
/// `[offset, offset + size)`. An empty range touches no pages.
#[inline]
pub(crate) fn page_span(offset: usize, size: usize, page_size: usize) -> Range<usize> {
    if size == 0 {
        return 0..0;
    }
    let first = offset / page_size;
    let last = (offset + size - 1) / page_size;
    first..last + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up_1() {
        assert_eq!(round_up(5, 5).unwrap(), 5);
        assert_eq!(round_up(5, 10).unwrap(), 10);
        assert_eq!(round_up(0, 100).unwrap(), 0);
        assert_eq!(round_up(33, 32).unwrap(), 64);
    }

    #[test]
    #[should_panic]
    fn test_round_up_2() {
        let _ = round_up(5, 0);
    }

    #[test]
    fn test_round_up_3() {
        assert!(round_up(usize::MAX, 2).is_none());
        assert_eq!(round_up(usize::MAX - 7, 8), Some(usize::MAX - 7));
    }

    #[test]
    fn test_round_down() {
        for i in 0..1000 {
            assert_eq!(round_down(i, 64), (i / 64) * 64);
        }
    }

    #[test]
    fn test_page_span() {
        assert_eq!(page_span(0, 0, 4096), 0..0);
        assert_eq!(page_span(0, 1, 4096), 0..1);
        assert_eq!(page_span(0, 4096, 4096), 0..1);
        assert_eq!(page_span(4064, 64, 4096), 0..2);
        assert_eq!(page_span(4096, 4097, 4096), 1..3);
    }
}
