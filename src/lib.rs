//! Persistent heap allocator.
//!
//! This crate manages a caller-supplied (or internally mapped) buffer and
//! stores **all** of its metadata inside that buffer. Block headers link to
//! each other through byte offsets from the start of the buffer, never
//! through absolute addresses, so the whole heap image can be written to a
//! file, the process torn down, the image loaded into a fresh buffer at a
//! completely different base address, and allocation resumed. Intra-heap
//! references survive the trip through [`PersistPtr<T>`], a pointer-sized
//! typed handle that stores an offset and resolves against whatever buffer
//! is live right now.
//!
//! The process hosts a single active manager behind a readers-writer lock.
//! `create`/`load` install it, `destroy` tears it down, and every public
//! operation locks, works, unlocks. When the free list cannot satisfy a
//! request the manager grows: it maps a larger buffer, byte-copies the old
//! image into it and keeps the old buffer alive for one more generation so
//! that pointers handed out before the growth can still be translated.
//!
//! ```no_run
//! let created = pmalloc::create_owned(64 * 1024);
//! assert!(created.is_ok());
//!
//! let ptr = pmalloc::allocate(256).unwrap();
//! unsafe {
//!     ptr.as_ptr().write_bytes(0xAB, 256);
//!     pmalloc::deallocate(Some(ptr));
//!     pmalloc::destroy();
//! }
//! ```

use std::ptr::NonNull;

mod align;
mod block;
mod freelist;
mod handle;
mod header;
mod io;
mod manager;
mod platform;
mod stats;

/// Non-null pointer to `T`. We use this in most places instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the
/// `None` case, and because "null" is exactly what the public surface
/// returns on failure.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

/// Everything that can go wrong outside the hot path. Allocation itself
/// reports failure as a null result (see [`allocate`]); install-style and
/// file operations return one of these.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The host refused to hand us a buffer, or the image cannot grow.
    #[error("out of memory")]
    OutOfMemory,
    /// Null buffer, undersized buffer, misaligned buffer.
    #[error("invalid argument")]
    InvalidArgument,
    /// The image's magic, size or block list failed validation.
    #[error("corrupted metadata")]
    CorruptedMetadata,
    /// No manager is currently installed.
    #[error("no manager installed")]
    NoManager,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub use align::{DEFAULT_ALIGNMENT, MAX_ALIGNMENT, MIN_ALIGNMENT};
pub use handle::{allocate_typed, deallocate_typed, PersistPtr};
pub use io::{load_from_file, save};
pub use manager::{
    allocate, allocate_aligned, create, create_owned, deallocate, destroy, fragmentation,
    free_size, load, reallocate, total_size, used_size, validate, MIN_MEMORY_SIZE,
};
pub use stats::{
    for_each_block, get_info, get_stats, manager_header_size, manager_info, AllocationInfo,
    BlockView, ManagerInfo, MemoryStats,
};
