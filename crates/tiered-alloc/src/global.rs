//! A spin-locked [`GlobalAlloc`] adapter.
//!
//! ```rust,ignore
//! use tiered_alloc::{LockedTieredAllocator, RegionHeap, TieredAllocator};
//!
//! #[global_allocator]
//! static ALLOCATOR: LockedTieredAllocator =
//!     LockedTieredAllocator::new(TieredAllocator::with_heap(RegionHeap::new()));
//!
//! // during early initialization
//! unsafe {
//!     ALLOCATOR.lock().heap_mut().add_region(heap_start, heap_size)?;
//! }
//! ```

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr,
};

use spin::{Mutex, MutexGuard};

use crate::{
    heap::{RegionHeap, SystemHeap},
    log::{Logger, NoopLogger},
    size_class::MINSZ,
    tiered::TieredAllocator,
};

/// Largest alignment [`LockedTieredAllocator`] can honor.
pub const MIN_ALIGN: usize = MINSZ;

/// A [`TieredAllocator`] behind a spin lock.
///
/// Requests whose alignment exceeds [`MIN_ALIGN`] fail with a null pointer.
pub struct LockedTieredAllocator<H = RegionHeap, L = NoopLogger> {
    allocator: Mutex<TieredAllocator<H, L>>,
}

impl<H, L> LockedTieredAllocator<H, L> {
    #[must_use]
    pub const fn new(allocator: TieredAllocator<H, L>) -> Self {
        Self {
            allocator: Mutex::new(allocator),
        }
    }

    /// Locks the allocator, spinning until it is available.
    pub fn lock(&self) -> MutexGuard<'_, TieredAllocator<H, L>> {
        self.allocator.lock()
    }
}

unsafe impl<H, L> GlobalAlloc for LockedTieredAllocator<H, L>
where
    H: SystemHeap,
    L: Logger,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MIN_ALIGN {
            return ptr::null_mut();
        }
        self.allocator
            .lock()
            .allocate(layout.size())
            .unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.allocator.lock().deallocate(ptr, layout.size()) }
    }
}
