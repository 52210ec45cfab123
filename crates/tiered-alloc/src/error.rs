//! Error types shared by the allocator tiers.

use core::{error::Error, fmt};

use derive_more::{Display, IsVariant};
use snafu::{GenerateImplicitData, Snafu};

pub use crate::heap::HeapError;

/// Source location captured when an error is constructed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The allocator tier that served or failed a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IsVariant)]
pub enum Tier {
    #[display("small")]
    Small,
    #[display("big")]
    Big,
}

/// Identifies one free list in an [`InvariantError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FreeList {
    #[display("small class {_0}")]
    Small(usize),
    #[display("big")]
    Big,
}

/// Errors returned by [`TieredAllocator::try_allocate`].
///
/// [`TieredAllocator::try_allocate`]: crate::TieredAllocator::try_allocate
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    #[snafu(display("request of {size} bytes does not fit in the address space"))]
    TooLarge {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{tier} tier exhausted while serving {size} bytes"))]
    Exhausted {
        tier: Tier,
        size: usize,
        #[snafu(source)]
        source: HeapError,
        #[snafu(implicit)]
        location: Location,
    },
}

impl AllocError {
    /// Returns the tier that ran out of memory, if any.
    #[must_use]
    pub fn tier(&self) -> Option<Tier> {
        match self {
            Self::TooLarge { .. } => None,
            Self::Exhausted { tier, .. } => Some(*tier),
        }
    }

    /// Returns where the error was raised.
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::TooLarge { location, .. } | Self::Exhausted { location, .. } => *location,
        }
    }
}

/// A broken free-list invariant reported by `validate`.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InvariantError {
    #[snafu(display("{list} free list is not address-ordered: {addr:#x} follows {prev:#x}"))]
    Unsorted {
        list: FreeList,
        addr: usize,
        prev: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{list} free list overlaps itself: {addr:#x} starts before {prev_end:#x}"))]
    Overlap {
        list: FreeList,
        addr: usize,
        prev_end: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("big free list holds unmerged neighbours ending at {addr:#x}"))]
    Unmerged {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("big free list node at {addr:#x} holds only {size} bytes"))]
    Undersized {
        addr: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Renders an error followed by its chain of sources on one line.
pub struct Report<'a, E: ?Sized> {
    error: &'a E,
}

impl<E> fmt::Debug for Report<'_, E>
where
    E: Error + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<'_, E>
where
    E: Error + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        let mut source = self.error.source();
        while let Some(s) = source {
            write!(f, ": {s}")?;
            source = s.source();
        }
        Ok(())
    }
}

impl<'a, E: ?Sized> Report<'a, E> {
    pub fn new(error: &'a E) -> Self {
        Self { error }
    }
}
