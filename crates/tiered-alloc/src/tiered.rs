//! The two-tier allocator facade.
//!
//! Requests below [`BIGSZ`] bytes are served by the [`SmallAllocator`], all
//! others by the [`BigAllocator`]. Both tiers grow from the same
//! [`SystemHeap`] and report through the same [`Logger`].

use snafu::OptionExt as _;

use crate::{
    big::BigAllocator,
    error::{AllocError, InvariantError, Report, TooLargeSnafu},
    heap::{GlobalHeap, SystemHeap},
    log::{Logger, NoopLogger},
    size_class::{BIGSZ, MINSZ, round_to_granule},
    small::SmallAllocator,
};

/// A general-purpose allocator combining a segregated small tier with a
/// coalescing big tier.
///
/// Callers pass the size of a block back when deallocating it; the allocator
/// does not record it.
///
/// # Examples
///
/// ```
/// use tiered_alloc::TieredAllocator;
///
/// let mut allocator = TieredAllocator::new();
/// let ptr = allocator.allocate(100).unwrap();
/// unsafe {
///     ptr.write_bytes(0xa5, 100);
///     allocator.deallocate(ptr, 100);
/// }
/// ```
pub struct TieredAllocator<H = GlobalHeap, L = NoopLogger> {
    small: SmallAllocator,
    big: BigAllocator,
    heap: H,
    logger: L,
}

impl Default for TieredAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TieredAllocator {
    /// Creates an allocator growing from the global allocator, with logging
    /// disabled.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_heap(GlobalHeap::new())
    }
}

impl<H> TieredAllocator<H> {
    #[must_use]
    pub const fn with_heap(heap: H) -> Self {
        Self::with_heap_and_logger(heap, NoopLogger)
    }
}

impl<H, L> TieredAllocator<H, L> {
    #[must_use]
    pub const fn with_heap_and_logger(heap: H, logger: L) -> Self {
        Self {
            small: SmallAllocator::new(),
            big: BigAllocator::new(),
            heap,
            logger,
        }
    }

    /// Bytes the small tier has obtained from the system heap.
    #[must_use]
    pub fn small_heap_size(&self) -> usize {
        self.small.heap_size()
    }

    /// Bytes the big tier has obtained from the system heap.
    #[must_use]
    pub fn big_heap_size(&self) -> usize {
        self.big.heap_size()
    }

    #[must_use]
    pub fn heap(&self) -> &H {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut H {
        &mut self.heap
    }

    #[must_use]
    pub fn logger(&self) -> &L {
        &self.logger
    }

    #[must_use]
    pub fn small(&self) -> &SmallAllocator {
        &self.small
    }

    #[must_use]
    pub fn big(&self) -> &BigAllocator {
        &self.big
    }

    /// Checks the free-list invariants of both tiers.
    pub fn validate(&self) -> Result<(), InvariantError> {
        self.small.validate()?;
        self.big.validate()
    }
}

impl<H, L> TieredAllocator<H, L>
where
    H: SystemHeap,
    L: Logger,
{
    /// Allocates at least `size` bytes aligned to [`MINSZ`].
    ///
    /// A zero-sized request is served as a one-byte request. Returns `None`
    /// when the system heap is exhausted; the reason is logged at debug level.
    pub fn allocate(&mut self, size: usize) -> Option<*mut u8> {
        match self.try_allocate(size) {
            Ok(ptr) => Some(ptr),
            Err(err) => {
                debug!(self.logger, "allocation failed: {}", Report::new(&err));
                None
            }
        }
    }

    /// Like [`allocate`](Self::allocate), but returns the reason of a failure.
    pub fn try_allocate(&mut self, size: usize) -> Result<*mut u8, AllocError> {
        let rounded = round_to_granule(size).context(TooLargeSnafu { size })?;
        if size < BIGSZ {
            debug!(self.logger, "{size} bytes go to the small tier");
            self.small.allocate(size, &mut self.heap, &self.logger)
        } else {
            debug!(self.logger, "{size} bytes ({rounded} rounded) go to the big tier");
            self.big
                .allocate(rounded, &mut self.small, &mut self.heap, &self.logger)
        }
    }

    /// Returns a block to the tier that served it.
    ///
    /// Null pointers are ignored.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` was returned by [`allocate`](Self::allocate) or
    ///   [`try_allocate`](Self::try_allocate) on this allocator
    /// - `size` is the exact size passed to that call
    /// - `ptr` has not been deallocated before
    pub unsafe fn deallocate(&mut self, ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }
        if size < BIGSZ {
            unsafe {
                self.small.deallocate(ptr, size, &self.logger);
            }
        } else {
            let rounded = size.next_multiple_of(MINSZ);
            unsafe {
                self.big.deallocate(ptr, rounded, &self.logger);
            }
        }
    }
}
