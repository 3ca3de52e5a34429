//! The free list: a doubly-linked list threaded through the free blocks.
//!
//! The all-blocks list (`prev_offset`/`next_offset`) describes buffer
//! order and is what coalescing and byte-map reporting walk. Searching it
//! for a free block would cost O(all blocks), used ones included, so free
//! blocks carry a second pair of links (`free_prev_offset`/
//! `free_next_offset`) forming a list of *only* the free blocks.
//! Allocation walks that list first-fit; everything else maintains it
//! with O(1) head inserts and unlinks.
//!
//! Head insertion gives the list a LIFO bias: the block freed most
//! recently is the first candidate for reuse, which tends to keep the
//! working set hot.
//!
//! The list is rebuilt from scratch when an image is loaded (one walk
//! over the all-blocks list, re-inserting every block whose `used` flag
//! is clear), so a saved image with stale `free_*` fields loads fine.

use std::ptr::NonNull;

use crate::block::{block_at, offset_of, BlockHeader, NO_BLOCK};
use crate::header::ManagerHeader;

/// Inserts `block` at the head of the free list.
///
/// Touches links only; the caller owns the `free_count` bookkeeping and
/// the `used` flag.
///
/// # Safety
///
/// `base` must be the live buffer base and `block` a block header inside
/// it that is not currently linked into the free list.
pub(crate) unsafe fn push(base: NonNull<u8>, mut block: NonNull<BlockHeader>) {
    let mut header = ManagerHeader::at(base);
    let block_offset = offset_of(base, block);
    let old_head = header.as_ref().first_free_offset;

    block.as_mut().free_prev_offset = NO_BLOCK;
    block.as_mut().free_next_offset = old_head;

    if old_head != NO_BLOCK {
        block_at(base, old_head).as_mut().free_prev_offset = block_offset;
    }

    header.as_mut().first_free_offset = block_offset;
}

/// Removes `block` from the free list and clears its free links.
///
/// # Safety
///
/// `base` must be the live buffer base and `block` a block header that is
/// currently linked into the free list.
pub(crate) unsafe fn unlink(base: NonNull<u8>, mut block: NonNull<BlockHeader>) {
    let prev = block.as_ref().free_prev_offset;
    let next = block.as_ref().free_next_offset;

    if prev != NO_BLOCK {
        block_at(base, prev).as_mut().free_next_offset = next;
    } else {
        ManagerHeader::at(base).as_mut().first_free_offset = next;
    }

    if next != NO_BLOCK {
        block_at(base, next).as_mut().free_prev_offset = prev;
    }

    block.as_mut().free_prev_offset = NO_BLOCK;
    block.as_mut().free_next_offset = NO_BLOCK;
}

/// Rebuilds the free list by walking the all-blocks list once, linking in
/// every block whose `used` flag is clear. Returns how many were linked.
///
/// # Safety
///
/// The all-blocks list reachable from the manager header must be
/// well-formed (offsets in range, contiguous, terminated).
pub(crate) unsafe fn rebuild(base: NonNull<u8>) -> usize {
    ManagerHeader::at(base).as_mut().first_free_offset = NO_BLOCK;

    let mut linked = 0;
    let mut offset = ManagerHeader::at(base).as_ref().first_block_offset;
    while offset != NO_BLOCK {
        let block = block_at(base, offset);
        if !block.as_ref().used {
            push(base, block);
            linked += 1;
        }
        offset = block.as_ref().next_offset;
    }

    linked
}

/// Length of the free list by walking it. Diagnostic cost, used by
/// `validate` to cross-check `free_count`.
///
/// # Safety
///
/// The free list reachable from the manager header must be well-formed.
pub(crate) unsafe fn len(base: NonNull<u8>) -> usize {
    let mut count = 0;
    let mut offset = ManagerHeader::at(base).as_ref().first_free_offset;
    while offset != NO_BLOCK {
        count += 1;
        offset = block_at(base, offset).as_ref().free_next_offset;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BLOCK_HEADER_SIZE;
    use crate::header::{MANAGER_MAGIC, MANAGER_PREFIX_SIZE};
    use crate::testing::TestBuf;

    /// Lays down a manager header plus `count` contiguous free blocks of
    /// `block_size` bytes each, with the all-blocks list wired up but the
    /// free list empty. Returns their offsets.
    unsafe fn synthetic_heap(base: NonNull<u8>, count: usize, block_size: usize) -> Vec<isize> {
        let header = ManagerHeader::at(base);
        header.as_ptr().write(ManagerHeader {
            magic: MANAGER_MAGIC,
            total_size: MANAGER_PREFIX_SIZE + count * block_size,
            used_size: MANAGER_PREFIX_SIZE,
            block_count: count,
            free_count: 0,
            alloc_count: 0,
            first_block_offset: MANAGER_PREFIX_SIZE as isize,
            first_free_offset: NO_BLOCK,
            owns_memory: false,
            prev_base: std::ptr::null_mut(),
            prev_total_size: 0,
            prev_owns: false,
        });

        let offsets: Vec<isize> = (0..count)
            .map(|i| (MANAGER_PREFIX_SIZE + i * block_size) as isize)
            .collect();

        for (i, &offset) in offsets.iter().enumerate() {
            let prev = if i == 0 { NO_BLOCK } else { offsets[i - 1] };
            let next = if i + 1 == count { NO_BLOCK } else { offsets[i + 1] };
            BlockHeader::init_free(block_at(base, offset), prev, next, block_size);
        }

        offsets
    }

    #[test]
    fn push_is_head_insert() {
        let buf = TestBuf::new(4096);
        unsafe {
            let offsets = synthetic_heap(buf.ptr(), 3, BLOCK_HEADER_SIZE + 64);

            for &offset in &offsets {
                push(buf.ptr(), block_at(buf.ptr(), offset));
            }

            // Last pushed is the head; walking the list visits in reverse.
            let header = ManagerHeader::at(buf.ptr());
            assert_eq!(header.as_ref().first_free_offset, offsets[2]);

            let mut walked = Vec::new();
            let mut offset = header.as_ref().first_free_offset;
            while offset != NO_BLOCK {
                walked.push(offset);
                offset = block_at(buf.ptr(), offset).as_ref().free_next_offset;
            }
            assert_eq!(walked, vec![offsets[2], offsets[1], offsets[0]]);
            assert_eq!(len(buf.ptr()), 3);
        }
    }

    #[test]
    fn unlink_head_middle_tail() {
        let buf = TestBuf::new(4096);
        unsafe {
            let offsets = synthetic_heap(buf.ptr(), 3, BLOCK_HEADER_SIZE + 64);
            for &offset in &offsets {
                push(buf.ptr(), block_at(buf.ptr(), offset));
            }

            // Middle of the list (offsets[1] sits between head and tail).
            unlink(buf.ptr(), block_at(buf.ptr(), offsets[1]));
            assert_eq!(len(buf.ptr()), 2);

            // Head.
            unlink(buf.ptr(), block_at(buf.ptr(), offsets[2]));
            assert_eq!(len(buf.ptr()), 1);
            assert_eq!(
                ManagerHeader::at(buf.ptr()).as_ref().first_free_offset,
                offsets[0]
            );

            // Last one standing.
            unlink(buf.ptr(), block_at(buf.ptr(), offsets[0]));
            assert_eq!(len(buf.ptr()), 0);
            assert_eq!(
                ManagerHeader::at(buf.ptr()).as_ref().first_free_offset,
                NO_BLOCK
            );
        }
    }

    #[test]
    fn rebuild_links_exactly_the_free_blocks() {
        let buf = TestBuf::new(4096);
        unsafe {
            let offsets = synthetic_heap(buf.ptr(), 4, BLOCK_HEADER_SIZE + 32);

            // Mark two of the four as used; rebuild must skip them.
            block_at(buf.ptr(), offsets[1]).as_mut().used = true;
            block_at(buf.ptr(), offsets[3]).as_mut().used = true;

            let linked = rebuild(buf.ptr());
            assert_eq!(linked, 2);
            assert_eq!(len(buf.ptr()), 2);

            let mut offset = ManagerHeader::at(buf.ptr()).as_ref().first_free_offset;
            while offset != NO_BLOCK {
                let block = block_at(buf.ptr(), offset);
                assert!(!block.as_ref().used);
                offset = block.as_ref().free_next_offset;
            }
        }
    }
}
