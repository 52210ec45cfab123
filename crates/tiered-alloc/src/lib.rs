//! A two-tier free-list memory allocator.
//!
//! This crate provides an `allocate(size)` / `deallocate(ptr, size)` heap for
//! a single process. Callers pass the size of a block back when they free it,
//! so blocks carry no header. The allocator is `no_std` and grows from a
//! pluggable [`SystemHeap`].
//!
//! # Tiers
//!
//! ## [`SmallAllocator`]
//!
//! Serves requests below [`BIGSZ`] bytes from [`CLASS_COUNT`] segregated free
//! lists of power-of-two blocks (8 to 4096 bytes). An empty list is refilled
//! by splitting a larger free block or by harvesting [`NUMS`] blocks from one
//! system-heap request. Unused tails of rounded-up blocks are returned to the
//! smaller lists immediately.
//!
//! ## [`BigAllocator`]
//!
//! Serves requests of [`BIGSZ`] bytes or more from a single address-ordered
//! list with first-fit search. Freed blocks are merged with both neighbours,
//! and remainders too small for this tier are handed to the small tier.
//!
//! ## [`TieredAllocator`]
//!
//! Routes each request to one of the tiers by size and owns the system heap
//! and the [`Logger`].
//!
//! # Usage Examples
//!
//! ```rust
//! use tiered_alloc::TieredAllocator;
//!
//! let mut allocator = TieredAllocator::new();
//!
//! // served by the small tier
//! let small = allocator.allocate(24).unwrap();
//! // served by the big tier
//! let big = allocator.allocate(10_000).unwrap();
//!
//! unsafe {
//!     allocator.deallocate(small, 24);
//!     allocator.deallocate(big, 10_000);
//! }
//! assert!(allocator.validate().is_ok());
//! ```
//!
//! ## Logging
//!
//! ```rust
//! use tiered_alloc::{GlobalHeap, TieredAllocator, log::{LogLevel, new_logger}};
//!
//! let logger = new_logger("heap", 0, LogLevel::Debug, |line| eprintln!("{line}"));
//! let mut allocator = TieredAllocator::with_heap_and_logger(GlobalHeap::new(), logger);
//! let ptr = allocator.allocate(4096).unwrap();
//! unsafe {
//!     allocator.deallocate(ptr, 4096);
//! }
//! ```
//!
//! # Design Considerations
//!
//! ## Memory Safety
//!
//! Deallocation is `unsafe`. Users must ensure:
//!
//! - The size passed to `deallocate` is the size passed to `allocate`
//! - No use-after-free or double-free bugs
//! - Memory from a [`GlobalHeap`] is not used after the allocator is dropped
//!
//! ## Thread Safety
//!
//! The allocators are `Send` but not `Sync`. [`LockedTieredAllocator`] wraps
//! one in a spin lock and implements `GlobalAlloc`.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

#[macro_use]
pub mod log;

pub mod big;
pub mod construct;
pub mod error;
pub mod global;
pub mod heap;
mod node;
pub mod size_class;
pub mod small;
pub mod tiered;

pub use self::{
    big::BigAllocator,
    error::{AllocError, InvariantError, Report, Tier},
    global::{LockedTieredAllocator, MIN_ALIGN},
    heap::{CountingHeap, GlobalHeap, HeapError, RegionHeap, SystemHeap},
    log::{Logger, NoopLogger},
    size_class::{BIGSZ, CLASS_COUNT, MINFSZ, MINSZ, NUMS},
    small::SmallAllocator,
    tiered::TieredAllocator,
};
