//! Refill-range computation
//!
//! Given the data extents inside a block-aligned window, find the part of the
//! window that is still missing. Cached extents touching either edge of the
//! window are peeled off; whatever lies between is the hole, widened to
//! refill-unit boundaries so origin fetches are never smaller than a unit.
//! Cached fragments strictly inside the hole are fetched again.

use serde::Serialize;

use crate::file::Extent;

/// Block size the query window is aligned to
pub const REFILL_BLOCK_SIZE: u64 = 4096;

/// Round `value` down to a multiple of `unit` (a power of two).
pub fn align_down(value: u64, unit: u64) -> u64 {
    value & !(unit - 1)
}

/// Round `value` up to a multiple of `unit` (a power of two).
pub fn align_up(value: u64, unit: u64) -> u64 {
    align_down(value.saturating_add(unit - 1), unit)
}

/// Range that must be fetched from origin; empty when already cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefillRange {
    pub offset: u64,
    pub len: u64,
}

impl RefillRange {
    /// Nothing to fetch.
    pub const CACHED: RefillRange = RefillRange { offset: 0, len: 0 };

    pub fn is_cached(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Compute the refill range of `[window_start, window_end)`.
///
/// `extents` must be ascending by offset. Placeholder extents carry no data
/// and are skipped.
pub fn refill_range(
    window_start: u64,
    window_end: u64,
    extents: &[Extent],
    refill_unit: u64,
) -> RefillRange {
    let mut hole_start = window_start;
    let mut hole_end = window_end;

    for extent in extents.iter().rev() {
        if extent.flags.is_placeholder() {
            continue;
        }
        if extent.logical < hole_end {
            if extent.end() >= hole_end {
                hole_end = extent.logical;
            } else {
                break;
            }
        }
    }

    for extent in extents {
        if extent.flags.is_placeholder() {
            continue;
        }
        if extent.end() > hole_start {
            if extent.logical <= hole_start {
                hole_start = extent.end();
            } else {
                break;
            }
        }
    }

    if hole_start >= hole_end {
        return RefillRange::CACHED;
    }
    let left = align_down(hole_start, refill_unit);
    let right = align_up(hole_end, refill_unit);
    RefillRange {
        offset: left,
        len: right - left,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::ExtentFlags;

    const KB: u64 = 1024;
    const UNIT: u64 = 256 * KB;

    #[test]
    fn test_align() {
        assert_eq!(align_down(5000, 4096), 4096);
        assert_eq!(align_up(5000, 4096), 8192);
        assert_eq!(align_up(8192, 4096), 8192);
        assert_eq!(align_down(0, 4096), 0);
    }

    #[test]
    fn test_no_extents_returns_whole_window() {
        let range = refill_range(0, 64 * KB, &[], UNIT);
        assert_eq!(range, RefillRange { offset: 0, len: UNIT });

        let range = refill_range(UNIT, UNIT + 4 * KB, &[], UNIT);
        assert_eq!(range, RefillRange { offset: UNIT, len: UNIT });
    }

    #[test]
    fn test_fully_covered_window_is_cached() {
        let extents = [Extent::new(0, 2 * UNIT)];
        assert!(refill_range(UNIT, UNIT + 64 * KB, &extents, UNIT).is_cached());
    }

    #[test]
    fn test_adjacent_extents_cover_window() {
        let extents = [Extent::new(0, 8 * KB), Extent::new(8 * KB, 8 * KB)];
        assert!(refill_range(0, 16 * KB, &extents, 4 * KB).is_cached());
    }

    #[test]
    fn test_single_hole_in_middle() {
        let extents = [
            Extent::new(0, UNIT),
            Extent::new(2 * UNIT, UNIT),
        ];
        let range = refill_range(0, 3 * UNIT, &extents, UNIT);
        assert_eq!(range, RefillRange { offset: UNIT, len: UNIT });
    }

    #[test]
    fn test_hole_expands_to_refill_unit() {
        let extents = [
            Extent::new(0, 12 * KB),
            Extent::new(20 * KB, 12 * KB),
        ];
        let range = refill_range(0, 32 * KB, &extents, 16 * KB);
        assert_eq!(range, RefillRange { offset: 0, len: 32 * KB });

        let range = refill_range(0, 32 * KB, &extents, 4 * KB);
        assert_eq!(range, RefillRange { offset: 12 * KB, len: 8 * KB });
    }

    #[test]
    fn test_inner_fragment_is_refetched() {
        let extents = [
            Extent::new(0, 4 * KB),
            Extent::new(12 * KB, 4 * KB),
            Extent::new(28 * KB, 4 * KB),
        ];
        let range = refill_range(0, 32 * KB, &extents, 4 * KB);
        assert_eq!(range, RefillRange { offset: 4 * KB, len: 24 * KB });
    }

    #[test]
    fn test_extent_at_right_edge_only() {
        let extents = [Extent::new(16 * KB, 16 * KB)];
        let range = refill_range(0, 32 * KB, &extents, 4 * KB);
        assert_eq!(range, RefillRange { offset: 0, len: 16 * KB });
    }

    #[test]
    fn test_placeholder_extents_ignored() {
        let extents = [
            Extent::new(0, 16 * KB).with_flags(ExtentFlags::UNWRITTEN),
            Extent::new(16 * KB, 16 * KB).with_flags(ExtentFlags::UNKNOWN | ExtentFlags::LAST),
        ];
        let range = refill_range(0, 32 * KB, &extents, 4 * KB);
        assert_eq!(range, RefillRange { offset: 0, len: 32 * KB });
    }

    #[test]
    fn test_extents_outside_window_do_not_shrink() {
        let extents = [Extent::new(64 * KB, 4 * KB)];
        let range = refill_range(0, 32 * KB, &extents, 4 * KB);
        assert_eq!(range, RefillRange { offset: 0, len: 32 * KB });
    }
}
