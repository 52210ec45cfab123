//! Segregated power-of-two allocator for requests below [`BIGSZ`].
//!
//! The allocator keeps one address-ordered free list per size class. A
//! request is rounded up to a power of two and served, in order, from:
//!
//! 1. the free list of its own class,
//! 2. a larger free block that is split into a run of blocks of the wanted
//!    size,
//! 3. a fresh chunk of [`NUMS`] blocks from the [`SystemHeap`].
//!
//! Rounding up wastes the tail of the block, so the tail is cut into
//! power-of-two fragments and put back on the free lists right away. The
//! caller therefore owns exactly the request rounded up to [`MINSZ`], and
//! deallocation hands back that range in the same way.

use core::ptr;

use snafu::{IntoError as _, ensure};

use crate::{
    error::{
        AllocError, ExhaustedSnafu, FreeList, InvariantError, OverlapSnafu, Tier, UnsortedSnafu,
    },
    heap::SystemHeap,
    log::Logger,
    node::FreeNode,
    size_class::{
        BIGSZ, CLASS_COUNT, MAX_CLASS, MINFSZ, MINSZ, NUMS, NUMS_SHIFT, block_size, class_of,
        class_size, growth_margin,
    },
};

/// The small-object tier.
///
/// Every block on list `class` is exactly [`class_size(class)`] bytes long.
///
/// # Thread Safety
///
/// This allocator is `Send` but not `Sync`. It can be moved between threads but
/// requires external synchronization for concurrent access.
///
/// [`class_size(class)`]: crate::size_class::class_size
pub struct SmallAllocator {
    free_lists: [*mut FreeNode; CLASS_COUNT],
    heap_size: usize,
}

unsafe impl Send for SmallAllocator {}

impl Default for SmallAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SmallAllocator {
    /// Creates an allocator with empty free lists.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            free_lists: [ptr::null_mut(); CLASS_COUNT],
            heap_size: 0,
        }
    }

    /// Total bytes this tier has obtained from its system heap.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    /// Iterates over the free blocks of `class` in address order.
    ///
    /// # Panics
    ///
    /// Panics if `class` is not below [`CLASS_COUNT`].
    pub fn free_blocks(&self, class: usize) -> impl Iterator<Item = *mut u8> {
        unsafe { FreeNode::iter(self.free_lists[class]) }
    }

    /// Allocates a block of at least `size` bytes.
    ///
    /// Bytes between `size` rounded up to [`MINSZ`] and the power-of-two block
    /// size are returned to the free lists before this method returns.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds [`BIGSZ`].
    pub fn allocate<H, L>(&mut self, size: usize, heap: &mut H, log: &L) -> Result<*mut u8, AllocError>
    where
        H: SystemHeap + ?Sized,
        L: Logger + ?Sized,
    {
        assert!(size <= BIGSZ, "small tier serves at most BIGSZ bytes");
        let tsz = block_size(size);
        let class = class_of(tsz);
        debug!(log, "small: {size} bytes rounded to {tsz}, class {class}");

        let block = if let Some(block) = self.pop(class) {
            trace!(log, "small: reuse {block:p} from class {class}");
            block
        } else if let Some(block) = self.split_larger(class, log) {
            block
        } else {
            self.grow(tsz, heap, log)?
        };

        let used = size.max(1).next_multiple_of(MINSZ);
        unsafe {
            self.release(block.add(used), tsz - used, log);
        }
        Ok(block)
    }

    /// Returns the block at `ptr` to the free lists.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` was returned by [`allocate`](Self::allocate) on this allocator
    ///   (or carved by a tier that donates into it) with the same `size`
    /// - `ptr` has not been deallocated before
    /// - The memory block is not accessed after this call
    pub unsafe fn deallocate<L>(&mut self, ptr: *mut u8, size: usize, log: &L)
    where
        L: Logger + ?Sized,
    {
        let used = size.max(1).next_multiple_of(MINSZ);
        debug!(log, "small: free {ptr:p}, {used} bytes");
        unsafe {
            self.release(ptr, used, log);
        }
    }

    /// Puts the range `start..start + len` on the free lists.
    ///
    /// Whole [`BIGSZ`] blocks go to the largest class; the rest is split
    /// most-significant bit first into power-of-two pieces, each on its
    /// own class. Ranges shorter than [`MINFSZ`] are dropped.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `start` is aligned to [`MINSZ`] and `len` is a multiple of [`MINSZ`]
    /// - The range is valid, unused, and owned by the caller
    pub unsafe fn release<L>(&mut self, start: *mut u8, len: usize, log: &L)
    where
        L: Logger + ?Sized,
    {
        if len < MINFSZ {
            return;
        }
        assert!(len.is_multiple_of(MINSZ), "released ranges are MINSZ multiples");
        trace!(log, "small: release {start:p}, {len} bytes");

        let whole = len / BIGSZ;
        unsafe {
            self.insert_run(MAX_CLASS, start, whole);
        }

        let rest = len % BIGSZ;
        let mut cursor = start.wrapping_add(whole * BIGSZ);
        for class in (0..MAX_CLASS).rev() {
            let size = class_size(class);
            if rest & size != 0 {
                unsafe {
                    self.insert_run(class, cursor, 1);
                }
                cursor = cursor.wrapping_add(size);
            }
        }
    }

    /// Checks that every list is strictly address-ordered and that no two
    /// blocks on the same list overlap.
    pub fn validate(&self) -> Result<(), InvariantError> {
        for class in 0..CLASS_COUNT {
            let list = FreeList::Small(class);
            let size = class_size(class);
            let mut prev: Option<usize> = None;
            for block in self.free_blocks(class) {
                let addr = block.addr();
                if let Some(prev) = prev {
                    ensure!(prev < addr, UnsortedSnafu { list, addr, prev });
                    ensure!(
                        prev + size <= addr,
                        OverlapSnafu {
                            list,
                            addr,
                            prev_end: prev + size
                        }
                    );
                }
                prev = Some(addr);
            }
        }
        Ok(())
    }

    fn pop(&mut self, class: usize) -> Option<*mut u8> {
        let head = self.free_lists[class];
        if head.is_null() {
            return None;
        }
        self.free_lists[class] = unsafe { (*head).next };
        Some(head.cast())
    }

    /// Splits the first free block found among the larger classes.
    ///
    /// Classes up to `NUMS` times the wanted size are searched downward first,
    /// then the ones above that upward. The first block of the split is
    /// returned and the remaining ones are linked into list `class`.
    fn split_larger<L>(&mut self, class: usize, log: &L) -> Option<*mut u8>
    where
        L: Logger + ?Sized,
    {
        let upper = (class + NUMS_SHIFT).min(MAX_CLASS);
        let donor = ((class + 1)..=upper)
            .rev()
            .chain((upper + 1)..=MAX_CLASS)
            .find(|&donor| !self.free_lists[donor].is_null())?;
        let block = self.pop(donor)?;

        let size = class_size(class);
        let count = 1 << (donor - class);
        debug!(
            log,
            "small: split {} byte block {block:p} into {count} x {size}",
            class_size(donor)
        );
        unsafe {
            self.insert_run(class, block.add(size), count - 1);
        }
        Some(block)
    }

    /// Obtains a chunk of `NUMS` blocks of `tsz` bytes plus the growth margin.
    fn grow<H, L>(&mut self, tsz: usize, heap: &mut H, log: &L) -> Result<*mut u8, AllocError>
    where
        H: SystemHeap + ?Sized,
        L: Logger + ?Sized,
    {
        let class = class_of(tsz);
        let margin = growth_margin(self.heap_size);
        let chunk_size = tsz * NUMS + margin;
        debug!(
            log,
            "small: grow {chunk_size} bytes ({NUMS} x {tsz} + {margin} margin)"
        );

        let chunk = match heap.grow(chunk_size) {
            Ok(chunk) => chunk,
            Err(source) => {
                warn!(log, "small: system heap refused {chunk_size} bytes");
                let Some(block) = heap.on_exhausted(tsz) else {
                    return Err(ExhaustedSnafu {
                        tier: Tier::Small,
                        size: tsz,
                    }
                    .into_error(source));
                };
                self.heap_size += tsz;
                return Ok(block);
            }
        };
        self.heap_size += chunk_size;

        unsafe {
            self.insert_run(class, chunk.add(tsz), NUMS - 1);
            self.release(chunk.add(tsz * NUMS), margin, log);
        }
        Ok(chunk)
    }

    /// Links `count` consecutive blocks of list `class` starting at `start`.
    ///
    /// # Safety
    ///
    /// The range `start..start + count * class_size(class)` must be valid,
    /// unused, and contain no block that is already on any free list.
    unsafe fn insert_run(&mut self, class: usize, start: *mut u8, count: usize) {
        if count == 0 {
            return;
        }
        let size = class_size(class);

        unsafe {
            let mut link: *mut *mut FreeNode = &raw mut self.free_lists[class];
            while !(*link).is_null() && (*link).cast::<u8>() < start {
                link = &raw mut (**link).next;
            }
            assert!(
                (*link).is_null() || start.add(size * count) <= (*link).cast::<u8>(),
                "run overlaps a free block"
            );

            let mut next = *link;
            for index in (0..count).rev() {
                next = FreeNode::new(start.add(size * index), next);
            }
            *link = next;
        }
    }
}
