//! Persistent typed offset pointers.
//!
//! A [`PersistPtr<T>`] stores a single signed byte offset from the start
//! of the managed buffer, never an absolute address, so a handle written
//! *into* an allocated block keeps meaning something after the image has
//! been saved, the process restarted and the image loaded at a different
//! base. Chains of handles stored inside blocks form persistent data
//! structures (linked lists, trees) that survive the round trip wholesale,
//! with no fix-up pass.
//!
//! ```text
//!  buffer before save                      buffer after load (new base)
//!  +-------+---------+---------+          +-------+---------+---------+
//!  | mgr   | node A  | node B  |          | mgr   | node A  | node B  |
//!  +-------+---------+---------+          +-------+---------+---------+
//!            next: 0x150 ^                          next: 0x150 ^
//!            (offset, still correct wherever the buffer lands)
//! ```
//!
//! Resolution goes through the process-wide manager on *every* access;
//! caching the resolved address across calls would defeat the point,
//! because growth replaces the buffer.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use crate::align::MIN_ALIGNMENT;
use crate::manager::{with_read, with_write};

/// A pointer-sized typed handle holding a byte offset into the managed
/// buffer. Zero is the null handle. Copyable by value, no destructor
/// semantics; equality compares offsets only.
#[repr(transparent)]
pub struct PersistPtr<T> {
    offset: isize,
    _marker: PhantomData<*mut T>,
}

// Handles must stay interchangeable with native pointers size-wise.
const _: () = assert!(mem::size_of::<PersistPtr<u64>>() == mem::size_of::<*mut u64>());

impl<T> PersistPtr<T> {
    /// The null handle.
    pub const fn null() -> Self {
        Self {
            offset: 0,
            _marker: PhantomData,
        }
    }

    /// Rebuilds a handle from a stored offset, e.g. one read back out of
    /// a reloaded image.
    pub const fn from_offset(offset: isize) -> Self {
        Self {
            offset,
            _marker: PhantomData,
        }
    }

    /// The stored offset. Zero for the null handle.
    pub fn offset(self) -> isize {
        self.offset
    }

    pub fn is_null(self) -> bool {
        self.offset == 0
    }

    /// Resolves the handle against the current manager:
    /// `manager_base + offset`. Returns `None` for the null handle or
    /// when no manager is installed.
    ///
    /// The result is only meaningful until the next operation that may
    /// grow the heap; resolve again rather than caching.
    pub fn get(self) -> Option<NonNull<T>> {
        if self.is_null() {
            return None;
        }
        with_read(|heap| unsafe {
            NonNull::new_unchecked(heap.base.as_ptr().offset(self.offset)).cast()
        })
    }
}

impl<T> Clone for PersistPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PersistPtr<T> {}

impl<T> PartialEq for PersistPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl<T> Eq for PersistPtr<T> {}

impl<T> Default for PersistPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for PersistPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PersistPtr").field(&self.offset).finish()
    }
}

/// Allocates room for one `T` and returns a handle to it. The memory is
/// not initialized and no constructor runs; write through
/// [`PersistPtr::get`]. Returns the null handle for zero-sized types, on
/// unsupported alignments and when allocation fails.
pub fn allocate_typed<T>() -> PersistPtr<T> {
    let size = mem::size_of::<T>();
    if size == 0 {
        return PersistPtr::null();
    }
    let alignment = mem::align_of::<T>().max(MIN_ALIGNMENT);

    with_write(|heap| unsafe {
        let ptr = heap.allocate_inner(size, alignment)?;
        Some(ptr.as_ptr().offset_from(heap.base.as_ptr()))
    })
    .flatten()
    .map(PersistPtr::from_offset)
    .unwrap_or_else(PersistPtr::null)
}

/// Frees the block a typed handle points at. The allocator is
/// value-agnostic: no drop glue runs for `T`, the caller destroys the
/// value first if it needs to. Null and unresolvable handles are
/// ignored.
///
/// # Safety
///
/// The handle must not be resolved again afterwards.
pub unsafe fn deallocate_typed<T>(handle: PersistPtr<T>) {
    if handle.is_null() {
        return;
    }
    with_write(|heap| {
        let ptr = NonNull::new_unchecked(heap.base.as_ptr().offset(handle.offset()));
        heap.deallocate_inner(ptr);
    });
}
