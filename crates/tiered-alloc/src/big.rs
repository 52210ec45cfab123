//! Address-ordered, coalescing allocator for requests of [`BIGSZ`] bytes or
//! more.
//!
//! # Algorithm
//!
//! The allocator uses a **first-fit** strategy over an **address-ordered free
//! list**:
//!
//! - **Free List**: Free blocks are kept in a singly-linked list sorted by
//!   address. Each block starts with a [`SizedNode`] header recording its size.
//! - **Allocation**: The list is searched from the beginning for the first
//!   block that is large enough. The front of that block is returned; a tail
//!   of at least [`BIGSZ`] bytes stays on the list, a shorter one is handed to
//!   the [`SmallAllocator`].
//! - **Growth**: When no block fits, the allocator asks the [`SystemHeap`] for
//!   twice the request plus a margin that grows with the tier's footprint, and
//!   keeps the unused half on the list.
//! - **Coalescing**: Inserting a block merges it with its successor and its
//!   predecessor whenever they touch, so no two list entries are adjacent.
//!
//! # Memory Layout
//!
//! ```text
//! Free Block Layout:
//! ┌──────────────────────────────────┬───────────────────────┐
//! │ SizedNode Header                 │ Available Space       │
//! │ ┌─────────────────┬─────────────┐│                       │
//! │ │ next: *mut Node │ size: usize ││                       │
//! │ └─────────────────┴─────────────┘│                       │
//! └──────────────────────────────────┴───────────────────────┘
//! ```

use core::ptr;

use snafu::{IntoError as _, ensure};

use crate::{
    error::{
        AllocError, ExhaustedSnafu, FreeList, InvariantError, OverlapSnafu, Tier, TooLargeSnafu,
        UndersizedSnafu, UnmergedSnafu, UnsortedSnafu,
    },
    heap::SystemHeap,
    log::Logger,
    node::SizedNode,
    size_class::{BIGSZ, MINSZ, growth_margin},
    small::SmallAllocator,
};

/// The large-object tier.
///
/// # Thread Safety
///
/// This allocator is `Send` but not `Sync`. It can be moved between threads but
/// requires external synchronization for concurrent access.
pub struct BigAllocator {
    free_list_head: *mut SizedNode,
    heap_size: usize,
}

unsafe impl Send for BigAllocator {}

impl Default for BigAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BigAllocator {
    /// Creates an allocator with an empty free list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            free_list_head: ptr::null_mut(),
            heap_size: 0,
        }
    }

    /// Total bytes this tier has obtained from its system heap.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    /// Iterates over `(start, size)` of every free block in address order.
    pub fn free_blocks(&self) -> impl Iterator<Item = (*mut u8, usize)> {
        unsafe { SizedNode::iter(self.free_list_head) }
    }

    /// Allocates a block of exactly `size` bytes.
    ///
    /// Remainders shorter than [`BIGSZ`] produced by splitting a free block
    /// are donated to `small`.
    ///
    /// # Panics
    ///
    /// Panics if `size` is below [`BIGSZ`] or not a multiple of [`MINSZ`].
    pub fn allocate<H, L>(
        &mut self,
        size: usize,
        small: &mut SmallAllocator,
        heap: &mut H,
        log: &L,
    ) -> Result<*mut u8, AllocError>
    where
        H: SystemHeap + ?Sized,
        L: Logger + ?Sized,
    {
        assert!(size >= BIGSZ, "big tier serves at least BIGSZ bytes");
        assert!(size.is_multiple_of(MINSZ), "big requests are MINSZ multiples");
        debug!(log, "big: allocate {size} bytes");

        if let Some(block) = self.take_first_fit(size, small, log) {
            return Ok(block);
        }
        self.grow(size, heap, log)
    }

    /// Returns the block at `ptr` to the free list, merging it with adjacent
    /// free blocks.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` was allocated by this allocator with the exact same `size`
    /// - `ptr` has not been deallocated before
    /// - The memory block is not currently in use
    pub unsafe fn deallocate<L>(&mut self, ptr: *mut u8, size: usize, log: &L)
    where
        L: Logger + ?Sized,
    {
        debug!(log, "big: free {ptr:p}, {size} bytes");
        unsafe {
            let free_node = SizedNode::new(ptr, size);
            self.insert_free_node(free_node, log);
        }
    }

    /// Checks ordering, disjointness, coalescing and minimum size of every
    /// free block.
    pub fn validate(&self) -> Result<(), InvariantError> {
        let list = FreeList::Big;
        let mut prev: Option<(usize, usize)> = None;
        for (block, size) in self.free_blocks() {
            let addr = block.addr();
            ensure!(size >= BIGSZ, UndersizedSnafu { addr, size });
            if let Some((prev, prev_end)) = prev {
                ensure!(prev < addr, UnsortedSnafu { list, addr, prev });
                ensure!(prev_end <= addr, OverlapSnafu { list, addr, prev_end });
                ensure!(prev_end != addr, UnmergedSnafu { addr });
            }
            prev = Some((addr, addr + size));
        }
        Ok(())
    }

    /// Carves `size` bytes out of the first free block that is large enough.
    fn take_first_fit<L>(
        &mut self,
        size: usize,
        small: &mut SmallAllocator,
        log: &L,
    ) -> Option<*mut u8>
    where
        L: Logger + ?Sized,
    {
        unsafe {
            let mut prev_node: *mut SizedNode = ptr::null_mut();
            let mut current_node = self.free_list_head;
            while !current_node.is_null() {
                let node_size = (*current_node).size;
                if node_size < size {
                    prev_node = current_node;
                    current_node = (*current_node).next;
                    continue;
                }

                let alloc_start = SizedNode::start(current_node);
                let next_node = (*current_node).next;
                let remaining_size = node_size - size;
                let replacement = if remaining_size == 0 {
                    trace!(log, "big: exact fit at {alloc_start:p}");
                    next_node
                } else if remaining_size < BIGSZ {
                    trace!(
                        log,
                        "big: {remaining_size} byte tail of {alloc_start:p} goes to the small tier"
                    );
                    small.release(alloc_start.add(size), remaining_size, log);
                    next_node
                } else {
                    trace!(log, "big: split {alloc_start:p}, keep {remaining_size} bytes");
                    let remaining_node = SizedNode::new(alloc_start.add(size), remaining_size);
                    (*remaining_node).next = next_node;
                    remaining_node
                };

                if prev_node.is_null() {
                    self.free_list_head = replacement;
                } else {
                    (*prev_node).next = replacement;
                }
                return Some(alloc_start);
            }
        }
        None
    }

    /// Obtains `2 * size` bytes plus the growth margin and keeps everything
    /// past the first `size` bytes on the free list.
    fn grow<H, L>(&mut self, size: usize, heap: &mut H, log: &L) -> Result<*mut u8, AllocError>
    where
        H: SystemHeap + ?Sized,
        L: Logger + ?Sized,
    {
        let margin = growth_margin(self.heap_size);
        let Some(chunk_size) = size.checked_mul(2).and_then(|s| s.checked_add(margin)) else {
            return TooLargeSnafu { size }.fail();
        };
        debug!(log, "big: grow {chunk_size} bytes (2 x {size} + {margin} margin)");

        let chunk = match heap.grow(chunk_size) {
            Ok(chunk) => chunk,
            Err(source) => {
                warn!(log, "big: system heap refused {chunk_size} bytes");
                let Some(block) = heap.on_exhausted(size) else {
                    return Err(ExhaustedSnafu {
                        tier: Tier::Big,
                        size,
                    }
                    .into_error(source));
                };
                self.heap_size += size;
                return Ok(block);
            }
        };
        self.heap_size += chunk_size;

        unsafe {
            let spare = SizedNode::new(chunk.add(size), chunk_size - size);
            self.insert_free_node(spare, log);
        }
        Ok(chunk)
    }

    /// Inserts a free node into the sorted free list and merges it with its
    /// neighbours.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `free_node` is not null and points to a valid `SizedNode`
    /// - The node is not already in the free list
    /// - The memory region represented by the node is actually free
    unsafe fn insert_free_node<L>(&mut self, free_node: *mut SizedNode, log: &L)
    where
        L: Logger + ?Sized,
    {
        unsafe {
            assert!(!free_node.is_null(), "Free node must not be null");
            assert!(
                (*free_node).next.is_null(),
                "Free node must not be already linked"
            );

            if self.free_list_head.is_null() {
                self.free_list_head = free_node;
                return;
            }

            if free_node < self.free_list_head {
                assert!(
                    SizedNode::end(free_node) <= SizedNode::start(self.free_list_head),
                    "Free node overlaps the free list"
                );
                if SizedNode::is_adjacent(free_node, self.free_list_head) {
                    trace!(log, "big: merge {free_node:p} with {:p}", self.free_list_head);
                }
                self.free_list_head = SizedNode::concat(free_node, self.free_list_head);
                return;
            }

            // Find the last node below `free_node` (keeping list sorted by address)
            let mut current_node = self.free_list_head;
            loop {
                assert!(current_node < free_node);
                let next_node = (*current_node).next;
                if next_node.is_null() || free_node < next_node {
                    break;
                }
                current_node = next_node;
            }
            assert!(
                SizedNode::end(current_node) <= SizedNode::start(free_node),
                "Free node overlaps the free list"
            );

            let next_node = (*current_node).next;
            if SizedNode::is_adjacent(free_node, next_node) {
                trace!(log, "big: merge {free_node:p} with {next_node:p}");
            }
            let free_node = SizedNode::concat(free_node, next_node);
            if SizedNode::is_adjacent(current_node, free_node) {
                trace!(log, "big: merge {current_node:p} with {free_node:p}");
            }
            SizedNode::concat(current_node, free_node);
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        heap::{CountingHeap, GlobalHeap},
        log::NoopLogger,
        size_class::{CLASS_COUNT, class_size},
    };

    struct TestAllocator {
        allocator: BigAllocator,
        small: SmallAllocator,
        heap: CountingHeap<GlobalHeap>,
    }

    impl TestAllocator {
        fn new() -> Self {
            Self {
                allocator: BigAllocator::new(),
                small: SmallAllocator::new(),
                heap: CountingHeap::new(GlobalHeap::new()),
            }
        }

        fn allocate(&mut self, size: usize) -> Option<*mut u8> {
            let ptr = self
                .allocator
                .allocate(size, &mut self.small, &mut self.heap, &NoopLogger)
                .ok()?;
            unsafe {
                ptr.write_bytes(0x33, size);
            }
            Some(ptr)
        }

        unsafe fn deallocate(&mut self, ptr: *mut u8, size: usize) {
            unsafe {
                for i in 0..size {
                    assert_eq!(ptr.add(i).read(), 0x33);
                }
                ptr.write_bytes(0x55, size);
                self.allocator.deallocate(ptr, size, &NoopLogger);
            }
            self.allocator.validate().unwrap();
        }

        fn free_blocks(&self) -> Vec<(usize, usize)> {
            self.allocator
                .free_blocks()
                .map(|(block, size)| (block.addr(), size))
                .collect()
        }
    }

    #[test]
    fn test_grow_keeps_second_half() {
        let mut allocator = TestAllocator::new();
        let ptr = allocator.allocate(8192).unwrap();
        assert_eq!(allocator.heap.grow_calls(), 1);
        assert_eq!(allocator.allocator.heap_size(), 16384);
        assert_eq!(allocator.free_blocks(), [(ptr.addr() + 8192, 8192)]);
    }

    #[test]
    fn test_exact_fit_from_free_list() {
        let mut allocator = TestAllocator::new();
        let a = allocator.allocate(8192).unwrap();
        let b = allocator.allocate(8192).unwrap();
        assert_eq!(b.addr(), a.addr() + 8192);
        assert_eq!(allocator.heap.grow_calls(), 1);
        assert!(allocator.free_blocks().is_empty());
    }

    #[test]
    fn test_split_keeps_large_tail() {
        let mut allocator = TestAllocator::new();
        let a = allocator.allocate(16384).unwrap();
        let b = allocator.allocate(4096).unwrap();
        assert_eq!(b.addr(), a.addr() + 16384);
        assert_eq!(allocator.free_blocks(), [(b.addr() + 4096, 12288)]);
        allocator.allocator.validate().unwrap();
    }

    #[test]
    fn test_split_donates_small_tail() {
        let mut allocator = TestAllocator::new();
        let a = allocator.allocate(8192).unwrap();
        let b = allocator.allocate(4096 + 2048 + 64).unwrap();
        assert_eq!(b.addr(), a.addr() + 8192);
        assert!(allocator.free_blocks().is_empty());

        let tail = b.wrapping_add(4096 + 2048 + 64);
        assert_eq!(
            allocator.small.free_blocks(7).collect::<Vec<_>>(),
            [tail]
        );
        let donated: usize = (0..CLASS_COUNT)
            .map(|class| allocator.small.free_blocks(class).count() * class_size(class))
            .sum();
        assert_eq!(donated, 8192 - 4096 - 2048 - 64);
        allocator.small.validate().unwrap();
    }

    #[test]
    fn test_first_fit_is_address_ordered() {
        let mut allocator = TestAllocator::new();
        let a = allocator.allocate(4096).unwrap();
        let b = allocator.allocate(4096).unwrap();
        let c = allocator.allocate(16384).unwrap();
        let d = allocator.allocate(4096).unwrap();
        unsafe {
            allocator.deallocate(c, 16384);
            allocator.deallocate(a, 4096);
        }
        let (lowest, _) = allocator.free_blocks()[0];
        let e = allocator.allocate(4096).unwrap();
        assert_eq!(e.addr(), lowest);
        unsafe {
            allocator.deallocate(b, 4096);
            allocator.deallocate(d, 4096);
            allocator.deallocate(e, 4096);
        }
    }

    #[test]
    fn test_coalescing_forward_and_backward() {
        let mut allocator = TestAllocator::new();
        let a = allocator.allocate(8192).unwrap();
        let b = allocator.allocate(8192).unwrap();
        let c = allocator.allocate(8192).unwrap();
        let d = allocator.allocate(8192).unwrap();
        assert_eq!(b.addr(), a.addr() + 8192);
        assert_eq!(d.addr(), c.addr() + 8192);
        let calls = allocator.heap.grow_calls();

        unsafe {
            allocator.deallocate(b, 8192);
            // merges forward with `b`
            allocator.deallocate(a, 8192);
        }
        assert_eq!(allocator.free_blocks(), [(a.addr(), 16384)]);

        unsafe {
            allocator.deallocate(c, 8192);
            // merges backward with `c`
            allocator.deallocate(d, 8192);
        }
        assert!(allocator.free_blocks().contains(&(c.addr(), 16384)));
        assert_eq!(allocator.free_blocks().len(), 2);

        let merged = allocator.allocate(16384).unwrap();
        assert!(merged == a || merged == c);
        assert_eq!(allocator.heap.grow_calls(), calls);
    }

    #[test]
    fn test_coalescing_both_sides() {
        let mut allocator = TestAllocator::new();
        let base = allocator.allocate(4 * 8192).unwrap();
        let a = allocator.allocate(8192).unwrap();
        let b = allocator.allocate(8192).unwrap();
        let c = allocator.allocate(8192).unwrap();
        let d = allocator.allocate(8192).unwrap();
        assert_eq!(a.addr(), base.addr() + 4 * 8192);
        assert_eq!(d.addr(), a.addr() + 3 * 8192);
        assert!(allocator.free_blocks().is_empty());

        unsafe {
            allocator.deallocate(a, 8192);
            allocator.deallocate(c, 8192);
        }
        assert_eq!(allocator.free_blocks(), [(a.addr(), 8192), (c.addr(), 8192)]);
        unsafe {
            allocator.deallocate(b, 8192);
        }
        assert_eq!(allocator.free_blocks(), [(a.addr(), 3 * 8192)]);
        unsafe {
            allocator.deallocate(d, 8192);
            allocator.deallocate(base, 4 * 8192);
        }
        assert_eq!(allocator.free_blocks(), [(base.addr(), 8 * 8192)]);
        assert_eq!(allocator.allocator.heap_size(), 8 * 8192);
    }

    #[test]
    fn test_growth_margin() {
        let mut allocator = TestAllocator::new();
        allocator.allocator.heap_size = BIGSZ * BIGSZ;
        let ptr = allocator.allocate(4096).unwrap();
        assert_eq!(allocator.heap.granted_bytes(), 2 * 4096 + BIGSZ);
        assert_eq!(allocator.free_blocks(), [(ptr.addr() + 4096, 4096 + BIGSZ)]);
    }

    #[test]
    fn test_exhaustion() {
        let mut allocator = BigAllocator::new();
        let mut small = SmallAllocator::new();
        let mut heap = CountingHeap::failing(GlobalHeap::new());
        let err = allocator
            .allocate(8192, &mut small, &mut heap, &NoopLogger)
            .unwrap_err();
        assert!(matches!(
            err,
            AllocError::Exhausted {
                tier: Tier::Big,
                size: 8192,
                ..
            }
        ));
        assert_eq!(allocator.heap_size(), 0);
        assert_eq!(allocator.free_blocks().count(), 0);
        allocator.validate().unwrap();
    }

    #[test]
    fn test_size_overflow() {
        let mut allocator = BigAllocator::new();
        let mut small = SmallAllocator::new();
        let mut heap = CountingHeap::new(GlobalHeap::new());
        let size = usize::MAX / 2 + 1;
        let err = allocator
            .allocate(size, &mut small, &mut heap, &NoopLogger)
            .unwrap_err();
        assert!(matches!(err, AllocError::TooLarge { .. }));
        assert_eq!(heap.grow_calls(), 0);
    }

    #[test]
    fn test_validate_detects_unmerged() {
        #[repr(C, align(16))]
        struct Arena([u8; 3 * BIGSZ]);

        let mut arena = Arena([0; 3 * BIGSZ]);
        let base = arena.0.as_mut_ptr();
        let mut allocator = BigAllocator::new();
        unsafe {
            let first = SizedNode::new(base, BIGSZ);
            let second = SizedNode::new(base.add(BIGSZ), BIGSZ);
            (*first).next = second;
            allocator.free_list_head = first;
        }
        assert!(matches!(
            allocator.validate(),
            Err(InvariantError::Unmerged { .. })
        ));

        unsafe {
            allocator.free_list_head = SizedNode::new(base, 2 * MINSZ);
        }
        assert!(matches!(
            allocator.validate(),
            Err(InvariantError::Undersized { .. })
        ));
    }

    #[test]
    fn test_full_deallocation_restores_chunks() {
        let mut allocator = TestAllocator::new();
        let mut ptrs = Vec::new();
        for i in 1..=8 {
            ptrs.push((allocator.allocate(4096 * i).unwrap(), 4096 * i));
        }
        assert_eq!(allocator.heap.grow_calls(), 8);
        for (ptr, size) in ptrs.into_iter().rev() {
            unsafe {
                allocator.deallocate(ptr, size);
            }
        }

        // one block per chunk, nothing handed to the small tier
        let blocks = allocator.free_blocks();
        assert_eq!(blocks.len(), 8);
        let total: usize = blocks.iter().map(|&(_, size)| size).sum();
        assert_eq!(total, allocator.allocator.heap_size());
        assert_eq!(total, allocator.heap.granted_bytes());
        assert_eq!(allocator.small.heap_size(), 0);
    }
}
