//! The manager: the process-wide heap slot and the allocation engine.
//!
//! The process hosts at most one live heap at a time. Growth has to swap
//! the backing buffer out from under every caller at once, so the current
//! buffer base lives in a single global slot behind a readers-writer
//! lock. Every public operation re-reads the slot under the lock; nobody
//! gets to cache the base across calls.
//!
//! ```text
//!                 CURRENT: RwLock<Slot>
//!                          |
//!                          v            managed buffer
//!              +-----------------------------------------------+
//!              | ManagerHeader | Block | Block | Block | Block |
//!              +-----------------------------------------------+
//!                 offsets only ----^~~~~~~^~~~~~~^~~~~~~^
//! ```
//!
//! Lock discipline: `allocate`, `deallocate`, `reallocate`, `create`,
//! `load` and `destroy` take the exclusive side; `validate`, the metric
//! readers, block iteration, handle resolution and `save` take the
//! shared side. Growth runs inside the exclusive section of the
//! allocation it serves, so no caller ever observes two buffers.

use std::cmp;
use std::ptr::{self, NonNull};

use parking_lot::RwLock;

use crate::align::{align_up, is_valid_alignment, DEFAULT_ALIGNMENT, MIN_ALIGNMENT};
use crate::block::{
    block_at, offset_of, recover_header, required_block_size, user_ptr, BlockHeader,
    BLOCK_HEADER_SIZE, BLOCK_MAGIC, MIN_BLOCK_SIZE, NO_BLOCK,
};
use crate::freelist;
use crate::header::{ManagerHeader, MANAGER_MAGIC, MANAGER_PREFIX_SIZE};
use crate::{platform, Error, Pointer};

/// Smallest buffer `create` and `load` accept.
pub const MIN_MEMORY_SIZE: usize = 4096;

/// The heap grows by a quarter of its current size (or more, if a single
/// request needs it).
pub(crate) const GROW_NUMERATOR: usize = 5;
pub(crate) const GROW_DENOMINATOR: usize = 4;

/// A live heap: nothing but the base address of the managed buffer. All
/// state lives inside the buffer itself.
#[derive(Clone, Copy)]
pub(crate) struct Heap {
    pub(crate) base: NonNull<u8>,
}

/// The process-wide manager slot. `NonNull` isn't `Send`/`Sync`, but the
/// buffer it points at is only ever touched under [`CURRENT`]'s lock.
pub(crate) struct Slot(Option<Heap>);

unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

static CURRENT: RwLock<Slot> = RwLock::new(Slot(None));

/// Runs `f` against the current heap under the shared lock, or returns
/// `None` if no manager is installed.
pub(crate) fn with_read<R>(f: impl FnOnce(&Heap) -> R) -> Option<R> {
    CURRENT.read().0.as_ref().map(f)
}

/// Runs `f` against the current heap under the exclusive lock, or returns
/// `None` if no manager is installed.
pub(crate) fn with_write<R>(f: impl FnOnce(&mut Heap) -> R) -> Option<R> {
    CURRENT.write().0.as_mut().map(f)
}

/// Creates a new heap in the caller's buffer and installs it as the
/// process-wide manager. The buffer stays owned by the caller; `destroy`
/// will not release it.
///
/// A previously installed manager is torn down first, exactly as by
/// [`destroy`].
///
/// # Safety
///
/// `memory` must be valid for reads and writes of `size` bytes for as
/// long as the manager is installed, and must not be touched behind the
/// manager's back.
pub unsafe fn create(memory: NonNull<u8>, size: usize) -> Result<(), Error> {
    let usable = vet_new_buffer(memory, size)?;

    // Tear the old manager down before touching the new buffer: the
    // caller may be re-creating over the very same memory.
    let mut guard = CURRENT.write();
    if let Some(old) = guard.0.take() {
        release(old);
    }
    guard.0 = Some(write_image(memory, usable, false));
    Ok(())
}

/// Creates a new heap in a buffer requested from the host and installs
/// it. `destroy` releases the buffer.
pub fn create_owned(size: usize) -> Result<(), Error> {
    if size < MIN_MEMORY_SIZE {
        return Err(Error::InvalidArgument);
    }
    unsafe {
        let memory = platform::request_memory(size).ok_or(Error::OutOfMemory)?;
        let usable = match vet_new_buffer(memory, size) {
            Ok(usable) => usable,
            Err(error) => {
                platform::return_memory(memory, size);
                return Err(error);
            }
        };

        let mut guard = CURRENT.write();
        if let Some(old) = guard.0.take() {
            release(old);
        }
        guard.0 = Some(write_image(memory, usable, true));
        Ok(())
    }
}

/// Validates a previously saved heap image in the caller's buffer,
/// rebuilds the free list from the persisted `used` flags and installs
/// the manager. The buffer stays owned by the caller.
///
/// The image is rejected unless its magic matches, its recorded
/// `total_size` equals `size`, and its block list is well formed.
///
/// # Safety
///
/// Same contract as [`create`]: `memory` must stay valid and untouched
/// for as long as the manager is installed.
pub unsafe fn load(memory: NonNull<u8>, size: usize) -> Result<(), Error> {
    if memory.as_ptr() as usize % DEFAULT_ALIGNMENT != 0 || size < MIN_MEMORY_SIZE {
        return Err(Error::InvalidArgument);
    }

    let mut header = ManagerHeader::at(memory);
    if header.as_ref().magic != MANAGER_MAGIC || header.as_ref().total_size != size {
        return Err(Error::CorruptedMetadata);
    }

    let walk = check_block_list(memory, size).ok_or(Error::CorruptedMetadata)?;

    // The buffer is a fresh copy in a fresh process: no growth history,
    // not ours to release. Counters and the free list are rebuilt from
    // the walk rather than trusted.
    header.as_mut().prev_base = ptr::null_mut();
    header.as_mut().prev_total_size = 0;
    header.as_mut().prev_owns = false;
    header.as_mut().owns_memory = false;
    header.as_mut().block_count = walk.blocks;
    header.as_mut().alloc_count = walk.used;
    header.as_mut().free_count = walk.free;
    header.as_mut().used_size = MANAGER_PREFIX_SIZE + walk.live_bytes;
    freelist::rebuild(memory);

    let mut guard = CURRENT.write();
    if let Some(old) = guard.0.take() {
        release(old);
    }
    guard.0 = Some(Heap { base: memory });
    Ok(())
}

/// Tears down the current manager: zeroes its magic, releases the backing
/// buffer if the manager owns it (including one retained generation of
/// growth history) and clears the process-wide slot. Does nothing if no
/// manager is installed.
///
/// # Safety
///
/// No other thread may be inside a manager operation, and every pointer
/// previously handed out becomes invalid.
pub unsafe fn destroy() {
    let mut guard = CURRENT.write();
    if let Some(heap) = guard.0.take() {
        release(heap);
    }
}

/// Allocates `user_size` bytes at [`DEFAULT_ALIGNMENT`]. Returns `None`
/// if `user_size` is zero, no manager is installed, or the heap could not
/// grow.
pub fn allocate(user_size: usize) -> Option<NonNull<u8>> {
    allocate_aligned(user_size, DEFAULT_ALIGNMENT)
}

/// Allocates `user_size` bytes whose address is a multiple of
/// `alignment` (a power of two in `[MIN_ALIGNMENT, MAX_ALIGNMENT]`).
///
/// If no free block fits, the heap grows by at least a quarter of its
/// size and the search restarts; the returned pointer always points into
/// the buffer that is current when the call returns.
pub fn allocate_aligned(user_size: usize, alignment: usize) -> Option<NonNull<u8>> {
    with_write(|heap| unsafe { heap.allocate_inner(user_size, alignment) }).flatten()
}

/// Releases a block previously returned by [`allocate`]. `None` and
/// pointers that don't resolve to a live block are ignored. The freed
/// block is merged with free spatial neighbors on both sides.
///
/// A pointer obtained before the most recent growth is translated into
/// the current buffer first; see the crate docs for the one-generation
/// contract.
///
/// # Safety
///
/// If `ptr` is a live allocation, the caller must not use it afterwards.
pub unsafe fn deallocate(ptr: Option<NonNull<u8>>) {
    let Some(ptr) = ptr else { return };
    with_write(|heap| heap.deallocate_inner(ptr));
}

/// Resizes an allocation. `None` behaves like [`allocate`]; a zero
/// `new_size` behaves like [`deallocate`] and returns `None`. Shrinking
/// keeps the block; growing allocates a new block at the same alignment,
/// copies the old contents and frees the old block. On failure the old
/// block is left untouched and `None` is returned.
///
/// # Safety
///
/// Same contract as [`deallocate`] for the old pointer when the block
/// moves or is freed.
pub unsafe fn reallocate(ptr: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
    with_write(|heap| heap.reallocate_inner(ptr, new_size)).flatten()
}

/// Checks every structural invariant of the heap: magic numbers, list
/// well-formedness, contiguity, counters, coalesce discipline, free-list
/// consistency and the `used_size` accounting. Returns `false` if no
/// manager is installed.
pub fn validate() -> bool {
    with_read(|heap| unsafe { heap.validate_inner() }).unwrap_or(false)
}

/// Current size of the managed buffer, or 0 if no manager is installed.
pub fn total_size() -> usize {
    with_read(|heap| unsafe { heap.header().as_ref().total_size }).unwrap_or(0)
}

/// Bytes accounted as occupied: the manager prefix plus every live
/// block's user size.
pub fn used_size() -> usize {
    with_read(|heap| unsafe { heap.header().as_ref().used_size }).unwrap_or(0)
}

/// `total_size - used_size`.
pub fn free_size() -> usize {
    with_read(|heap| unsafe {
        let header = heap.header();
        header
            .as_ref()
            .total_size
            .saturating_sub(header.as_ref().used_size)
    })
    .unwrap_or(0)
}

/// Number of free segments beyond the first. Zero means the free space
/// is one contiguous run.
pub fn fragmentation() -> usize {
    with_read(|heap| unsafe { heap.header().as_ref().free_count.saturating_sub(1) }).unwrap_or(0)
}

/// Checks a buffer offered to `create`: aligned base, enough room for
/// the header plus one minimum block. Returns the usable size, trimmed
/// so every block total stays on the MIN_ALIGNMENT grid.
fn vet_new_buffer(memory: NonNull<u8>, size: usize) -> Result<usize, Error> {
    if memory.as_ptr() as usize % DEFAULT_ALIGNMENT != 0 || size < MIN_MEMORY_SIZE {
        return Err(Error::InvalidArgument);
    }
    let usable = size & !(MIN_ALIGNMENT - 1);
    if MANAGER_PREFIX_SIZE + BLOCK_HEADER_SIZE + MIN_BLOCK_SIZE > usable {
        return Err(Error::InvalidArgument);
    }
    Ok(usable)
}

/// Writes a fresh manager header and a single all-covering free block
/// into a buffer vetted by [`vet_new_buffer`].
unsafe fn write_image(memory: NonNull<u8>, usable: usize, owns: bool) -> Heap {
    // Every byte of the image may end up in a file; start from a known
    // state.
    ptr::write_bytes(memory.as_ptr(), 0, usable);

    let first_offset = MANAGER_PREFIX_SIZE;
    ManagerHeader::at(memory).as_ptr().write(ManagerHeader {
        magic: MANAGER_MAGIC,
        total_size: usable,
        used_size: first_offset,
        block_count: 1,
        free_count: 1,
        alloc_count: 0,
        first_block_offset: first_offset as isize,
        first_free_offset: NO_BLOCK,
        owns_memory: owns,
        prev_base: ptr::null_mut(),
        prev_total_size: 0,
        prev_owns: false,
    });

    let block = block_at(memory, first_offset as isize);
    BlockHeader::init_free(block, NO_BLOCK, NO_BLOCK, usable - first_offset);
    freelist::push(memory, block);

    Heap { base: memory }
}

/// Destroy semantics: zero the magic, release the owned buffer chain.
unsafe fn release(heap: Heap) {
    let mut header = heap.header();
    header.as_mut().magic = 0;

    let prev_base = header.as_ref().prev_base;
    let prev_total_size = header.as_ref().prev_total_size;
    let prev_owns = header.as_ref().prev_owns;
    let owns = header.as_ref().owns_memory;
    let total_size = header.as_ref().total_size;

    if prev_owns {
        if let Some(prev) = NonNull::new(prev_base) {
            platform::return_memory(prev, prev_total_size);
        }
    }
    if owns {
        platform::return_memory(heap.base, total_size);
    }
}

/// What a structural walk over a candidate image found.
struct BlockListSummary {
    blocks: usize,
    used: usize,
    free: usize,
    live_bytes: usize,
}

/// Walks the all-blocks list of a not-yet-trusted image, checking offsets,
/// magic numbers, back links and contiguity. Returns `None` on the first
/// violation. Contiguity forces offsets to strictly increase, so the walk
/// always terminates.
unsafe fn check_block_list(base: NonNull<u8>, total_size: usize) -> Option<BlockListSummary> {
    let header = ManagerHeader::at(base);
    if header.as_ref().first_block_offset != MANAGER_PREFIX_SIZE as isize {
        return None;
    }

    let mut summary = BlockListSummary {
        blocks: 0,
        used: 0,
        free: 0,
        live_bytes: 0,
    };
    let mut expected_prev = NO_BLOCK;
    let mut offset = header.as_ref().first_block_offset;

    while offset != NO_BLOCK {
        if offset < 0 || offset as usize + BLOCK_HEADER_SIZE > total_size {
            return None;
        }
        let block = block_at(base, offset).as_ref();
        if block.magic != BLOCK_MAGIC || block.prev_offset != expected_prev {
            return None;
        }
        if block.total_size < MIN_BLOCK_SIZE
            || block.total_size % MIN_ALIGNMENT != 0
            || offset as usize + block.total_size > total_size
        {
            return None;
        }
        if block.used {
            if !is_valid_alignment(block.alignment) {
                return None;
            }
            summary.used += 1;
            summary.live_bytes += block.user_size;
        } else {
            summary.free += 1;
        }
        summary.blocks += 1;

        let end = offset as usize + block.total_size;
        if block.next_offset == NO_BLOCK {
            if end != total_size {
                return None;
            }
        } else if block.next_offset != end as isize {
            return None;
        }

        expected_prev = offset;
        offset = block.next_offset;
    }

    (summary.blocks > 0).then_some(summary)
}

impl Heap {
    #[inline]
    pub(crate) unsafe fn header(&self) -> NonNull<ManagerHeader> {
        ManagerHeader::at(self.base)
    }

    /// First-fit walk over the free list.
    unsafe fn find_free(&self, needed: usize) -> Pointer<BlockHeader> {
        let mut offset = self.header().as_ref().first_free_offset;
        while offset != NO_BLOCK {
            let block = block_at(self.base, offset);
            if block.as_ref().total_size >= needed {
                return Some(block);
            }
            offset = block.as_ref().free_next_offset;
        }
        None
    }

    /// Last block in buffer order. There is always at least one.
    unsafe fn last_block(&self) -> NonNull<BlockHeader> {
        let mut block = block_at(self.base, self.header().as_ref().first_block_offset);
        while block.as_ref().next_offset != NO_BLOCK {
            block = block_at(self.base, block.as_ref().next_offset);
        }
        block
    }

    pub(crate) unsafe fn allocate_inner(
        &mut self,
        user_size: usize,
        alignment: usize,
    ) -> Pointer<u8> {
        if user_size == 0 || !is_valid_alignment(alignment) {
            return None;
        }

        let needed = required_block_size(user_size, alignment);

        let block = match self.find_free(needed) {
            Some(block) => block,
            None => {
                if !self.grow(needed) {
                    return None;
                }
                self.find_free(needed)?
            }
        };

        freelist::unlink(self.base, block);
        self.split_if_possible(block, needed);

        let mut block = block;
        block.as_mut().used = true;
        block.as_mut().user_size = user_size;
        block.as_mut().alignment = alignment;

        let mut header = self.header();
        header.as_mut().alloc_count += 1;
        header.as_mut().free_count -= 1;
        header.as_mut().used_size += user_size;

        Some(user_ptr(block))
    }

    pub(crate) unsafe fn deallocate_inner(&mut self, ptr: NonNull<u8>) {
        let ptr = self.translate(ptr);
        let total_size = self.header().as_ref().total_size;
        let Some(mut block) = recover_header(self.base, total_size, ptr) else {
            // Not something we handed out; stale pointers to an already
            // released buffer end up here too.
            return;
        };

        let freed = block.as_ref().user_size;
        block.as_mut().used = false;
        block.as_mut().user_size = 0;
        block.as_mut().alignment = DEFAULT_ALIGNMENT;

        let mut header = self.header();
        header.as_mut().alloc_count -= 1;
        header.as_mut().free_count += 1;
        header.as_mut().used_size = header.as_ref().used_size.saturating_sub(freed);

        freelist::push(self.base, block);
        self.coalesce(block);
    }

    pub(crate) unsafe fn reallocate_inner(
        &mut self,
        ptr: Pointer<u8>,
        new_size: usize,
    ) -> Pointer<u8> {
        let Some(ptr) = ptr else {
            return self.allocate_inner(new_size, DEFAULT_ALIGNMENT);
        };
        if new_size == 0 {
            self.deallocate_inner(ptr);
            return None;
        }

        let ptr = self.translate(ptr);
        let total_size = self.header().as_ref().total_size;
        let block = recover_header(self.base, total_size, ptr)?;

        if new_size <= block.as_ref().user_size {
            return Some(ptr);
        }

        // Allocation may grow the heap and replace the buffer, which
        // invalidates `ptr` and `block`; remember offsets, not addresses.
        let old_user_size = block.as_ref().user_size;
        let alignment = block.as_ref().alignment;
        let old_ptr_offset = ptr.as_ptr().offset_from(self.base.as_ptr());

        let new_ptr = self.allocate_inner(new_size, alignment)?;

        let old_ptr = NonNull::new_unchecked(self.base.as_ptr().offset(old_ptr_offset));
        ptr::copy_nonoverlapping(old_ptr.as_ptr(), new_ptr.as_ptr(), old_user_size);
        self.deallocate_inner(old_ptr);

        Some(new_ptr)
    }

    /// Maps a pointer into the immediately prior buffer onto the same
    /// offset in the current one. Pointers outside the retained window
    /// pass through unchanged. Address arithmetic only; the prior buffer
    /// is never dereferenced.
    pub(crate) unsafe fn translate(&self, ptr: NonNull<u8>) -> NonNull<u8> {
        let header = self.header().as_ref();
        if !header.prev_base.is_null() {
            let start = header.prev_base as usize;
            let end = start + header.prev_total_size;
            let addr = ptr.as_ptr() as usize;
            if (start..end).contains(&addr) {
                return NonNull::new_unchecked(self.base.as_ptr().add(addr - start));
            }
        }
        ptr
    }

    /// Carves the tail of `block` into a new free block if what remains
    /// after `needed` bytes can still hold a header plus a minimum block.
    unsafe fn split_if_possible(&mut self, mut block: NonNull<BlockHeader>, needed: usize) {
        if block.as_ref().total_size < needed + BLOCK_HEADER_SIZE + MIN_BLOCK_SIZE {
            return;
        }

        let block_offset = offset_of(self.base, block);
        let remainder_offset = block_offset + needed as isize;
        let remainder = block_at(self.base, remainder_offset);

        BlockHeader::init_free(
            remainder,
            block_offset,
            block.as_ref().next_offset,
            block.as_ref().total_size - needed,
        );

        if block.as_ref().next_offset != NO_BLOCK {
            block_at(self.base, block.as_ref().next_offset)
                .as_mut()
                .prev_offset = remainder_offset;
        }
        block.as_mut().next_offset = remainder_offset;
        block.as_mut().total_size = needed;

        freelist::push(self.base, remainder);

        let mut header = self.header();
        header.as_mut().block_count += 1;
        header.as_mut().free_count += 1;
    }

    /// Merges `block` with free spatial neighbors: forward first (absorb
    /// the next block), then backward (be absorbed by the previous one).
    /// Returns the surviving block.
    unsafe fn coalesce(&mut self, mut block: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
        let next_offset = block.as_ref().next_offset;
        if next_offset != NO_BLOCK && !block_at(self.base, next_offset).as_ref().used {
            self.merge_next(block);
        }

        let prev_offset = block.as_ref().prev_offset;
        if prev_offset != NO_BLOCK {
            let prev = block_at(self.base, prev_offset);
            if !prev.as_ref().used {
                self.merge_next(prev);
                block = prev;
            }
        }

        block
    }

    /// Absorbs the block after `block` into it. Both must be free.
    unsafe fn merge_next(&mut self, mut block: NonNull<BlockHeader>) {
        let mut next = block_at(self.base, block.as_ref().next_offset);

        freelist::unlink(self.base, next);
        freelist::unlink(self.base, block);

        block.as_mut().total_size += next.as_ref().total_size;
        block.as_mut().next_offset = next.as_ref().next_offset;
        if next.as_ref().next_offset != NO_BLOCK {
            block_at(self.base, next.as_ref().next_offset)
                .as_mut()
                .prev_offset = offset_of(self.base, block);
        }

        // The absorbed header is dead; make sure it can't be recovered.
        next.as_mut().magic = 0;

        let mut header = self.header();
        header.as_mut().block_count -= 1;
        header.as_mut().free_count -= 1;

        freelist::push(self.base, block);
    }

    /// Replaces the backing buffer with a larger one: request, byte-copy,
    /// extend the tail with the new bytes, retain the old buffer as the
    /// one-generation translation window, swap the base.
    unsafe fn grow(&mut self, needed: usize) -> bool {
        let old_base = self.base;
        let old_size = self.header().as_ref().total_size;
        let old_owns = self.header().as_ref().owns_memory;

        let grown = (old_size * GROW_NUMERATOR).div_ceil(GROW_DENOMINATOR);
        let new_size = align_up(
            cmp::max(grown, old_size + needed + BLOCK_HEADER_SIZE),
            MIN_ALIGNMENT,
        );

        let Some(new_base) = platform::request_memory(new_size) else {
            return false;
        };
        ptr::copy_nonoverlapping(old_base.as_ptr(), new_base.as_ptr(), old_size);

        let grown_heap = Heap { base: new_base };
        let mut header = grown_heap.header();

        // The grand-prior buffer retires now; anyone still holding a
        // pointer into it missed their one translation window.
        let grand_prior = header.as_ref().prev_base;
        let grand_prior_size = header.as_ref().prev_total_size;
        if header.as_ref().prev_owns {
            if let Some(grand_prior) = NonNull::new(grand_prior) {
                platform::return_memory(grand_prior, grand_prior_size);
            }
        }

        header.as_mut().prev_base = old_base.as_ptr();
        header.as_mut().prev_total_size = old_size;
        header.as_mut().prev_owns = old_owns;
        header.as_mut().owns_memory = true;
        header.as_mut().total_size = new_size;

        // Hand the new bytes to the tail: widen a trailing free block, or
        // append a fresh one after a trailing used block.
        let added = new_size - old_size;
        let mut last = grown_heap.last_block();
        if !last.as_ref().used {
            freelist::unlink(new_base, last);
            last.as_mut().total_size += added;
            freelist::push(new_base, last);
        } else {
            let last_offset = offset_of(new_base, last);
            let fresh = block_at(new_base, old_size as isize);
            BlockHeader::init_free(fresh, last_offset, NO_BLOCK, added);
            last.as_mut().next_offset = old_size as isize;
            freelist::push(new_base, fresh);
            header.as_mut().block_count += 1;
            header.as_mut().free_count += 1;
        }

        self.base = new_base;
        true
    }

    /// Full structural check; see [`validate`].
    pub(crate) unsafe fn validate_inner(&self) -> bool {
        let header = self.header().as_ref();
        if header.magic != MANAGER_MAGIC {
            return false;
        }
        let total_size = header.total_size;
        if header.first_block_offset != MANAGER_PREFIX_SIZE as isize {
            return false;
        }

        let mut blocks = 0;
        let mut used = 0;
        let mut free = 0;
        let mut live_bytes = MANAGER_PREFIX_SIZE;
        let mut expected_prev = NO_BLOCK;
        let mut previous_free = false;
        let mut offset = header.first_block_offset;

        while offset != NO_BLOCK {
            if offset < 0 || offset as usize + BLOCK_HEADER_SIZE > total_size {
                return false;
            }
            let block = block_at(self.base, offset);
            let block_ref = block.as_ref();
            if block_ref.magic != BLOCK_MAGIC || block_ref.prev_offset != expected_prev {
                return false;
            }
            if block_ref.total_size < MIN_BLOCK_SIZE
                || block_ref.total_size % MIN_ALIGNMENT != 0
                || offset as usize + block_ref.total_size > total_size
            {
                return false;
            }

            if block_ref.used {
                if !is_valid_alignment(block_ref.alignment) || block_ref.user_size == 0 {
                    return false;
                }
                let user = user_ptr(block).as_ptr() as usize;
                let block_end = self.base.as_ptr() as usize + offset as usize + block_ref.total_size;
                if user % block_ref.alignment != 0 || user + block_ref.user_size > block_end {
                    return false;
                }
                used += 1;
                live_bytes += block_ref.user_size;
                previous_free = false;
            } else {
                if previous_free || block_ref.user_size != 0 {
                    // Two free neighbors means a missed coalesce.
                    return false;
                }
                free += 1;
                previous_free = true;
            }

            blocks += 1;
            if blocks > header.block_count {
                return false;
            }

            let end = offset as usize + block_ref.total_size;
            if block_ref.next_offset == NO_BLOCK {
                if end != total_size {
                    return false;
                }
            } else if block_ref.next_offset != end as isize {
                return false;
            }

            expected_prev = offset;
            offset = block_ref.next_offset;
        }

        if blocks != header.block_count
            || used != header.alloc_count
            || free != header.free_count
            || header.block_count != header.alloc_count + header.free_count
            || live_bytes != header.used_size
        {
            return false;
        }

        // The free list must contain exactly the free blocks.
        let mut list_len = 0;
        let mut expected_prev = NO_BLOCK;
        let mut offset = header.first_free_offset;
        while offset != NO_BLOCK {
            if offset < 0 || offset as usize + BLOCK_HEADER_SIZE > total_size {
                return false;
            }
            let block = block_at(self.base, offset).as_ref();
            if block.magic != BLOCK_MAGIC || block.used || block.free_prev_offset != expected_prev {
                return false;
            }
            list_len += 1;
            if list_len > header.free_count {
                return false;
            }
            expected_prev = offset;
            offset = block.free_next_offset;
        }

        list_len == header.free_count
    }
}
