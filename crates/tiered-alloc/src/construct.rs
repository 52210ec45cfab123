//! Placement construction and destruction over raw allocator blocks.
//!
//! ```
//! use tiered_alloc::{TieredAllocator, construct};
//!
//! let mut allocator = TieredAllocator::new();
//! let ptr = allocator.allocate(size_of::<[u64; 4]>()).unwrap().cast::<[u64; 4]>();
//! unsafe {
//!     construct::construct(ptr, [1, 2, 3, 4]);
//!     assert_eq!((*ptr)[2], 3);
//!     construct::destroy(ptr);
//!     allocator.deallocate(ptr.cast(), size_of::<[u64; 4]>());
//! }
//! ```

use core::{mem, ptr};

/// Moves `value` into the uninitialized memory at `ptr` and returns `ptr`.
///
/// # Safety
///
/// `ptr` must be valid for writes and properly aligned for `T`. Any value
/// already stored there is overwritten without being dropped.
pub unsafe fn construct<T>(ptr: *mut T, value: T) -> *mut T {
    unsafe {
        ptr.write(value);
    }
    ptr
}

/// Drops the value at `ptr` in place, leaving the memory uninitialized.
///
/// # Safety
///
/// `ptr` must point to an initialized `T` that is not used afterwards.
pub unsafe fn destroy<T>(ptr: *mut T) {
    unsafe {
        ptr::drop_in_place(ptr);
    }
}

/// Drops every value in `first..last` in place.
///
/// Does nothing when `T` needs no drop. Zero-sized values have no distinct
/// addresses, so a range of them is always empty.
///
/// # Safety
///
/// `first` and `last` must belong to the same allocation with
/// `first <= last`, and every `T` in between must be initialized and not used
/// afterwards.
pub unsafe fn destroy_range<T>(first: *mut T, last: *mut T) {
    if !mem::needs_drop::<T>() || size_of::<T>() == 0 {
        return;
    }
    unsafe {
        let len = last.offset_from_unsigned(first);
        ptr::drop_in_place(ptr::slice_from_raw_parts_mut(first, len));
    }
}
