//! Intrusive free-list nodes.
//!
//! Nodes live inside the free memory they describe and are overwritten by
//! user data as soon as the block is handed out. Only the allocator tiers
//! create or follow them.
//!
//! ```text
//! FreeNode (small tier)        SizedNode (big tier)
//! ┌─────────────────┐          ┌─────────────────┬─────────────┐
//! │ next: *mut Node │          │ next: *mut Node │ size: usize │
//! └─────────────────┘          └─────────────────┴─────────────┘
//! ```

use core::{iter, ptr};

use crate::size_class::MINSZ;

/// A free block whose size is implied by the list it belongs to.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct FreeNode {
    pub(crate) next: *mut Self,
}

impl FreeNode {
    /// Writes a node at `node_ptr` linked to `next`.
    ///
    /// # Safety
    ///
    /// `node_ptr` must be valid for writes of `MINSZ` bytes, aligned for
    /// `FreeNode`, and not in use by anyone else.
    pub(crate) unsafe fn new(node_ptr: *mut u8, next: *mut Self) -> *mut Self {
        #[expect(clippy::cast_ptr_alignment)]
        let node = node_ptr.cast::<Self>();
        assert!(!node.is_null(), "Node pointer must not be null");
        assert!(node.is_aligned(), "Node pointer must be properly aligned");
        unsafe {
            node.write(Self { next });
        }
        node
    }

    /// Iterates over the node addresses of the list starting at `head`.
    ///
    /// # Safety
    ///
    /// Every node reachable from `head` must stay valid while the iterator is
    /// alive.
    pub(crate) unsafe fn iter(head: *mut Self) -> impl Iterator<Item = *mut u8> {
        iter::successors((!head.is_null()).then_some(head), |&node| {
            let next = unsafe { (*node).next };
            (!next.is_null()).then_some(next)
        })
        .map(<*mut Self>::cast::<u8>)
    }
}

/// A free block that records its own size.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct SizedNode {
    pub(crate) next: *mut Self,
    pub(crate) size: usize,
}

impl SizedNode {
    /// Writes an unlinked node describing `node_ptr..node_ptr + node_size`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `node_ptr` is aligned for `SizedNode`
    /// - the range `node_ptr..node_ptr + node_size` is valid and unused
    pub(crate) unsafe fn new(node_ptr: *mut u8, node_size: usize) -> *mut Self {
        #[expect(clippy::cast_ptr_alignment)]
        let node = node_ptr.cast::<Self>();
        assert!(!node.is_null(), "Node pointer must not be null");
        assert!(node.is_aligned(), "Node pointer must be properly aligned");
        assert!(
            node_size >= size_of::<Self>(),
            "Node size must be at least size of SizedNode"
        );
        assert!(
            node_size.is_multiple_of(MINSZ),
            "Node size must be multiple of MINSZ"
        );

        unsafe {
            node.write(Self {
                next: ptr::null_mut(),
                size: node_size,
            });
        }
        node
    }

    /// Returns the first byte of the block.
    pub(crate) fn start(node: *mut Self) -> *mut u8 {
        node.cast()
    }

    /// Returns one byte past the end of the block.
    ///
    /// # Safety
    ///
    /// `node` must point to a valid `SizedNode`.
    pub(crate) unsafe fn end(node: *mut Self) -> *mut u8 {
        unsafe { Self::start(node).map_addr(|addr| addr + (*node).size) }
    }

    /// Returns `true` if `prev_node` ends exactly where `next_node` starts.
    ///
    /// # Safety
    ///
    /// Both pointers must be null or point to valid `SizedNode`s.
    pub(crate) unsafe fn is_adjacent(prev_node: *mut Self, next_node: *mut Self) -> bool {
        !prev_node.is_null()
            && !next_node.is_null()
            && ptr::eq(unsafe { Self::end(prev_node) }, Self::start(next_node))
    }

    /// Links `next_node` after `prev_node`, merging the two when adjacent.
    ///
    /// Returns the node that now covers `prev_node`'s start, or `next_node`
    /// if `prev_node` is null.
    ///
    /// # Safety
    ///
    /// Both pointers must be null or point to valid `SizedNode`s, and
    /// `prev_node` must precede `next_node` in address order.
    pub(crate) unsafe fn concat(prev_node: *mut Self, next_node: *mut Self) -> *mut Self {
        if prev_node.is_null() {
            return next_node;
        }
        if next_node.is_null() {
            return prev_node;
        }

        unsafe {
            if Self::is_adjacent(prev_node, next_node) {
                (*prev_node).size += (*next_node).size;
                (*prev_node).next = (*next_node).next;
            } else {
                (*prev_node).next = next_node;
            }
        }

        prev_node
    }

    /// Iterates over `(start, size)` of the list starting at `head`.
    ///
    /// # Safety
    ///
    /// Every node reachable from `head` must stay valid while the iterator is
    /// alive.
    pub(crate) unsafe fn iter(head: *mut Self) -> impl Iterator<Item = (*mut u8, usize)> {
        iter::successors((!head.is_null()).then_some(head), |&node| {
            let next = unsafe { (*node).next };
            (!next.is_null()).then_some(next)
        })
        .map(|node| (Self::start(node), unsafe { (*node).size }))
    }
}
