//! Allocation thresholds and power-of-two size-class arithmetic.
//!
//! Every block handed out by the small tier has a size of `MINSZ << class`
//! for some class in `0..CLASS_COUNT`. The largest class holds blocks of
//! exactly [`BIGSZ`] bytes, which is also the smallest request served by the
//! big tier.

/// Minimum block size and allocation granularity in bytes.
pub const MINSZ: usize = 8;

/// Boundary between the small and the big tier in bytes.
pub const BIGSZ: usize = 4096;

/// Number of same-size blocks harvested per system-heap request in the small
/// tier.
pub const NUMS: usize = 16;

/// Smallest trailing fragment that is worth returning to a free list.
pub const MINFSZ: usize = 8;

/// Index of the largest size class (the class of [`BIGSZ`] blocks).
pub const MAX_CLASS: usize = (BIGSZ / MINSZ).trailing_zeros() as usize;

/// Number of size classes managed by the small tier.
pub const CLASS_COUNT: usize = MAX_CLASS + 1;

const MINSZ_SHIFT: u32 = MINSZ.trailing_zeros();
pub(crate) const NUMS_SHIFT: usize = NUMS.trailing_zeros() as usize;

const _: () = assert!(MINSZ.is_power_of_two());
const _: () = assert!(BIGSZ.is_power_of_two() && BIGSZ > MINSZ);
const _: () = assert!(NUMS.is_power_of_two() && NUMS > 1);
const _: () = assert!(MINFSZ >= MINSZ && MINFSZ.is_multiple_of(MINSZ));
const _: () = assert!(MINSZ >= size_of::<*mut u8>());

/// Rounds a request up to the allocation granularity.
///
/// Zero-sized requests are treated as one byte so that every allocation owns
/// at least one [`MINSZ`] block. Returns `None` if the rounded size does not
/// fit in `usize`.
#[must_use]
pub const fn round_to_granule(size: usize) -> Option<usize> {
    let size = if size == 0 { 1 } else { size };
    size.checked_next_multiple_of(MINSZ)
}

/// Returns the block size the small tier uses for a request of `size` bytes:
/// the smallest power of two that is at least `max(size, MINSZ)`.
///
/// # Panics
///
/// Panics if `size` exceeds [`BIGSZ`].
#[must_use]
pub const fn block_size(size: usize) -> usize {
    assert!(size <= BIGSZ, "small blocks are at most BIGSZ bytes");
    if size <= MINSZ {
        MINSZ
    } else {
        size.next_power_of_two()
    }
}

/// Returns the size class holding blocks of `size` bytes, that is
/// `floor(log2(size)) - log2(MINSZ)`.
///
/// # Panics
///
/// Panics if `size` is smaller than [`MINSZ`].
#[must_use]
pub const fn class_of(size: usize) -> usize {
    assert!(size >= MINSZ, "size classes start at MINSZ");
    (size.ilog2() - MINSZ_SHIFT) as usize
}

/// Returns the block size of `class`.
#[must_use]
pub const fn class_size(class: usize) -> usize {
    MINSZ << class
}

/// Extra bytes requested on top of every system-heap growth.
///
/// The margin is `heap_size / BIGSZ` rounded down to the granularity, so it
/// grows with the footprint of the owning tier.
#[must_use]
pub const fn growth_margin(heap_size: usize) -> usize {
    (heap_size / BIGSZ) & !(MINSZ - 1)
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(MAX_CLASS, 9);
        assert_eq!(CLASS_COUNT, 10);
        assert_eq!(class_size(MAX_CLASS), BIGSZ);
        assert_eq!(class_size(0), MINSZ);
    }

    #[test]
    fn test_round_to_granule() {
        assert_eq!(round_to_granule(0), Some(8));
        assert_eq!(round_to_granule(1), Some(8));
        assert_eq!(round_to_granule(8), Some(8));
        assert_eq!(round_to_granule(9), Some(16));
        assert_eq!(round_to_granule(4095), Some(4096));
        assert_eq!(round_to_granule(4097), Some(4104));
        assert_eq!(round_to_granule(usize::MAX), None);
    }

    #[test]
    fn test_block_size() {
        assert_eq!(block_size(1), 8);
        assert_eq!(block_size(8), 8);
        assert_eq!(block_size(9), 16);
        assert_eq!(block_size(24), 32);
        assert_eq!(block_size(4095), 4096);
        assert_eq!(block_size(4096), 4096);
    }

    #[test]
    fn test_class_of() {
        assert_eq!(class_of(8), 0);
        assert_eq!(class_of(15), 0);
        assert_eq!(class_of(16), 1);
        assert_eq!(class_of(32), 2);
        assert_eq!(class_of(2048), 8);
        assert_eq!(class_of(4096), 9);
    }

    #[test]
    fn test_class_round_trip() {
        for size in 1..=BIGSZ {
            let class = class_of(block_size(size));
            assert_eq!(class_of(class_size(class)), class);

            let block = class_size(class);
            assert!(block >= size.max(MINSZ));
            assert!(block.is_power_of_two());
            assert!(block == MINSZ || block / 2 < size);
        }
    }

    #[test]
    fn test_growth_margin() {
        assert_eq!(growth_margin(0), 0);
        assert_eq!(growth_margin(BIGSZ * 7), 0);
        assert_eq!(growth_margin(BIGSZ * 8), 8);
        assert_eq!(growth_margin(BIGSZ * 4096), 4096);
        assert_eq!(growth_margin(BIGSZ * 4100), 4096);
    }
}
