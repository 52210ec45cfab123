//! Sources of fresh memory for the allocator tiers.
//!
//! A tier only calls into its [`SystemHeap`] when its free lists cannot serve
//! a request. Memory obtained this way is never handed back while the tier is
//! alive; implementations decide what happens when they are dropped.
//!
//! Two implementations are provided:
//!
//! - [`GlobalHeap`] requests chunks from the global allocator and releases all
//!   of them when dropped.
//! - [`RegionHeap`] carves chunks out of caller-supplied memory regions, which
//!   makes it usable underneath a `#[global_allocator]`.
//!
//! [`CountingHeap`] wraps either of them to count requests and to simulate
//! exhaustion.

use core::{
    alloc::{Layout, LayoutError},
    ops::Range,
    ptr,
};

use arrayvec::ArrayVec;
use snafu::{OptionExt as _, ResultExt as _, Snafu, ensure};

use crate::error::Location;

/// Alignment of every chunk returned by the provided heaps.
pub const CHUNK_ALIGN: usize = 16;

/// Maximum number of regions a [`RegionHeap`] can hold.
pub const MAX_REGIONS: usize = 16;

/// Errors produced when a [`SystemHeap`] cannot supply a chunk.
#[derive(Debug, Snafu)]
pub enum HeapError {
    #[snafu(display("chunk of {size} bytes overflows the address space"))]
    SizeOverflow {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid chunk layout for {size} bytes"))]
    InvalidLayout {
        size: usize,
        #[snafu(source)]
        source: LayoutError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("system allocator refused a chunk of {size} bytes"))]
    OutOfMemory {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no region can hold {size} bytes, {remaining} bytes left"))]
    RegionExhausted {
        size: usize,
        remaining: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("region table is full ({capacity} regions)"))]
    TooManyRegions {
        capacity: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl HeapError {
    /// Creates an [`HeapError::OutOfMemory`] for custom heap implementations.
    #[track_caller]
    #[must_use]
    pub fn out_of_memory(size: usize) -> Self {
        OutOfMemorySnafu { size }.build()
    }
}

/// The underlying allocator the tiers grow from.
pub trait SystemHeap {
    /// Returns a chunk of at least `size` bytes aligned to [`CHUNK_ALIGN`].
    ///
    /// The chunk must stay valid and unused by anyone else for as long as the
    /// heap is alive.
    fn grow(&mut self, size: usize) -> Result<*mut u8, HeapError>;

    /// Last chance to supply `size` bytes after [`grow`](Self::grow) failed.
    ///
    /// The default gives up.
    fn on_exhausted(&mut self, size: usize) -> Option<*mut u8> {
        let _ = size;
        None
    }
}

impl<H> SystemHeap for &mut H
where
    H: SystemHeap + ?Sized,
{
    fn grow(&mut self, size: usize) -> Result<*mut u8, HeapError> {
        (**self).grow(size)
    }

    fn on_exhausted(&mut self, size: usize) -> Option<*mut u8> {
        (**self).on_exhausted(size)
    }
}

/// Header placed in front of every chunk obtained by [`GlobalHeap`].
#[repr(C, align(16))]
struct ChunkHeader {
    next: *mut Self,
    layout_size: usize,
}
const _: () = assert!(size_of::<ChunkHeader>() == CHUNK_ALIGN);

/// A [`SystemHeap`] backed by the global allocator.
///
/// Chunks are threaded into a list through a small header and all of them are
/// returned to the global allocator when the heap is dropped, which
/// invalidates every pointer handed out from them.
pub struct GlobalHeap {
    chunks: *mut ChunkHeader,
    chunk_count: usize,
    total_bytes: usize,
}

unsafe impl Send for GlobalHeap {}

impl Default for GlobalHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalHeap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            chunks: ptr::null_mut(),
            chunk_count: 0,
            total_bytes: 0,
        }
    }

    /// Number of chunks obtained so far.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Usable bytes obtained so far, excluding chunk headers.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}

impl SystemHeap for GlobalHeap {
    fn grow(&mut self, size: usize) -> Result<*mut u8, HeapError> {
        let layout_size = size
            .checked_add(size_of::<ChunkHeader>())
            .context(SizeOverflowSnafu { size })?;
        let layout =
            Layout::from_size_align(layout_size, CHUNK_ALIGN).context(InvalidLayoutSnafu { size })?;

        #[expect(clippy::cast_ptr_alignment)]
        let header = unsafe { alloc::alloc::alloc(layout) }.cast::<ChunkHeader>();
        ensure!(!header.is_null(), OutOfMemorySnafu { size });

        unsafe {
            header.write(ChunkHeader {
                next: self.chunks,
                layout_size,
            });
        }
        self.chunks = header;
        self.chunk_count += 1;
        self.total_bytes += size;

        Ok(unsafe { header.add(1) }.cast())
    }
}

impl Drop for GlobalHeap {
    fn drop(&mut self) {
        let mut chunk = self.chunks;
        while !chunk.is_null() {
            unsafe {
                let next = (*chunk).next;
                let layout = Layout::from_size_align_unchecked((*chunk).layout_size, CHUNK_ALIGN);
                alloc::alloc::dealloc(chunk.cast(), layout);
                chunk = next;
            }
        }
    }
}

/// A [`SystemHeap`] that bump-allocates from caller-supplied regions.
///
/// Regions are tried in the order they were added; the first one with enough
/// room serves the chunk.
#[derive(Debug)]
pub struct RegionHeap {
    regions: ArrayVec<Range<usize>, MAX_REGIONS>,
}

impl Default for RegionHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionHeap {
    /// Creates an empty [`RegionHeap`]. Every request fails until
    /// [`add_region`](Self::add_region) is called.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regions: ArrayVec::new_const(),
        }
    }

    /// Adds a memory region.
    ///
    /// The region is aligned to [`CHUNK_ALIGN`]; if nothing usable is left
    /// after alignment it is ignored.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - The range `start..start + size` is valid for reads and writes
    /// - The memory is not used by any other allocator or code
    /// - The memory stays valid for the lifetime of this heap and of every
    ///   allocator growing from it
    pub unsafe fn add_region(&mut self, start: *mut u8, size: usize) -> Result<(), HeapError> {
        let align_offset = start.align_offset(CHUNK_ALIGN);
        let aligned_size = size.saturating_sub(align_offset) / CHUNK_ALIGN * CHUNK_ALIGN;
        if aligned_size == 0 {
            return Ok(());
        }

        ensure!(
            !self.regions.is_full(),
            TooManyRegionsSnafu {
                capacity: MAX_REGIONS
            }
        );
        let aligned_start = start.expose_provenance() + align_offset;
        self.regions.push(aligned_start..aligned_start + aligned_size);
        Ok(())
    }

    /// Bytes still available across all regions.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.regions.iter().map(ExactSizeIterator::len).sum()
    }
}

impl SystemHeap for RegionHeap {
    fn grow(&mut self, size: usize) -> Result<*mut u8, HeapError> {
        let needed = size
            .checked_next_multiple_of(CHUNK_ALIGN)
            .context(SizeOverflowSnafu { size })?;
        let remaining = self.remaining();
        let region = self
            .regions
            .iter_mut()
            .find(|region| region.len() >= needed)
            .context(RegionExhaustedSnafu { size, remaining })?;

        let addr = region.start;
        region.start += needed;
        Ok(ptr::with_exposed_provenance_mut(addr))
    }
}

/// Wraps a [`SystemHeap`] to count growth requests and inject failures.
#[derive(Debug, Default)]
pub struct CountingHeap<H> {
    inner: H,
    grow_calls: usize,
    granted_bytes: usize,
    failing: bool,
}

impl<H> CountingHeap<H> {
    pub const fn new(inner: H) -> Self {
        Self {
            inner,
            grow_calls: 0,
            granted_bytes: 0,
            failing: false,
        }
    }

    /// Creates a wrapper that refuses every request.
    pub const fn failing(inner: H) -> Self {
        Self {
            inner,
            grow_calls: 0,
            granted_bytes: 0,
            failing: true,
        }
    }

    /// Makes subsequent requests fail (`true`) or reach the inner heap.
    pub fn set_failing(&mut self, failing: bool) {
        self.failing = failing;
    }

    /// Number of [`SystemHeap::grow`] calls seen, including refused ones.
    #[must_use]
    pub fn grow_calls(&self) -> usize {
        self.grow_calls
    }

    /// Total bytes granted by the inner heap.
    #[must_use]
    pub fn granted_bytes(&self) -> usize {
        self.granted_bytes
    }

    #[must_use]
    pub fn inner(&self) -> &H {
        &self.inner
    }
}

impl<H> SystemHeap for CountingHeap<H>
where
    H: SystemHeap,
{
    fn grow(&mut self, size: usize) -> Result<*mut u8, HeapError> {
        self.grow_calls += 1;
        ensure!(!self.failing, OutOfMemorySnafu { size });
        let chunk = self.inner.grow(size)?;
        self.granted_bytes += size;
        Ok(chunk)
    }

    fn on_exhausted(&mut self, size: usize) -> Option<*mut u8> {
        if self.failing {
            return None;
        }
        self.inner.on_exhausted(size)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(16))]
    struct Arena<const N: usize>([u8; N]);

    #[test]
    fn test_global_heap_chunks() {
        let mut heap = GlobalHeap::new();
        let a = heap.grow(64).unwrap();
        let b = heap.grow(4096).unwrap();
        assert!(a.addr().is_multiple_of(CHUNK_ALIGN));
        assert!(b.addr().is_multiple_of(CHUNK_ALIGN));
        unsafe {
            a.write_bytes(0xaa, 64);
            b.write_bytes(0xbb, 4096);
            assert_eq!(a.add(63).read(), 0xaa);
            assert_eq!(b.read(), 0xbb);
        }
        assert_eq!(heap.chunk_count(), 2);
        assert_eq!(heap.total_bytes(), 64 + 4096);
    }

    #[test]
    fn test_global_heap_overflow() {
        let mut heap = GlobalHeap::new();
        let err = heap.grow(usize::MAX).unwrap_err();
        assert!(matches!(err, HeapError::SizeOverflow { .. }));
        let err = heap.grow(isize::MAX.unsigned_abs()).unwrap_err();
        assert!(matches!(err, HeapError::InvalidLayout { .. }));
        assert_eq!(heap.chunk_count(), 0);
    }

    #[test]
    fn test_region_heap_bump() {
        let mut arena = Arena([0; 1024]);
        let mut heap = RegionHeap::new();
        unsafe {
            heap.add_region(arena.0.as_mut_ptr(), 1024).unwrap();
        }
        let a = heap.grow(100).unwrap();
        let b = heap.grow(16).unwrap();
        assert_eq!(a, arena.0.as_mut_ptr());
        assert_eq!(b.addr(), a.addr() + 112);
        assert_eq!(heap.remaining(), 1024 - 128);

        let err = heap.grow(1024).unwrap_err();
        assert!(matches!(
            err,
            HeapError::RegionExhausted {
                size: 1024,
                remaining: 896,
                ..
            }
        ));
    }

    #[test]
    fn test_region_heap_skips_small_regions() {
        let mut small = Arena([0; 64]);
        let mut large = Arena([0; 512]);
        let mut tiny = Arena([0; 16]);
        let mut heap = RegionHeap::new();
        unsafe {
            heap.add_region(small.0.as_mut_ptr(), 64).unwrap();
            heap.add_region(large.0.as_mut_ptr(), 512).unwrap();
            heap.add_region(tiny.0.as_mut_ptr().add(1), 15).unwrap();
        }
        assert_eq!(heap.remaining(), 576);
        assert_eq!(heap.grow(256).unwrap(), large.0.as_mut_ptr());
        assert_eq!(heap.grow(64).unwrap(), small.0.as_mut_ptr());
    }

    #[test]
    fn test_region_heap_capacity() {
        let mut arena = Arena([0; 16 * (MAX_REGIONS + 1)]);
        let base = arena.0.as_mut_ptr();
        let mut heap = RegionHeap::new();
        for i in 0..MAX_REGIONS {
            unsafe { heap.add_region(base.add(16 * i), 16).unwrap() };
        }
        let err = unsafe { heap.add_region(base.add(16 * MAX_REGIONS), 16) }.unwrap_err();
        assert!(matches!(err, HeapError::TooManyRegions { capacity: MAX_REGIONS, .. }));
    }

    #[test]
    fn test_counting_heap() {
        let mut heap = CountingHeap::new(GlobalHeap::new());
        heap.grow(32).unwrap();
        heap.set_failing(true);
        assert!(matches!(heap.grow(32), Err(HeapError::OutOfMemory { size: 32, .. })));
        assert!(heap.on_exhausted(32).is_none());
        assert_eq!(heap.grow_calls(), 2);
        assert_eq!(heap.granted_bytes(), 32);
        assert_eq!(heap.inner().chunk_count(), 1);
    }
}
