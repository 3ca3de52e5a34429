//! Read-only inspection: counters, per-pointer info, per-block views and
//! a snapshot of the manager header. Demonstrators and tests feed on
//! these; none of them mutate the heap and all of them run under the
//! shared lock.

use std::ptr::NonNull;

use crate::block::{block_at, recover_header, BLOCK_HEADER_SIZE, NO_BLOCK};
use crate::header::MANAGER_HEADER_SIZE;
use crate::manager::with_read;

/// Counters and free-block size extrema. All zeros when no manager is
/// installed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub allocated_blocks: usize,
    /// Size of the largest free block, header included.
    pub largest_free: usize,
    /// Size of the smallest free block, header included.
    pub smallest_free: usize,
    /// Free bytes held outside the largest free block: what
    /// fragmentation makes unusable for a single biggest allocation.
    pub total_fragmentation: usize,
}

/// What the heap knows about one user pointer.
#[derive(Clone, Copy, Debug)]
pub struct AllocationInfo {
    pub ptr: Option<NonNull<u8>>,
    /// User size the block was allocated with. Zero if invalid.
    pub size: usize,
    /// Alignment the block was allocated with. Zero if invalid.
    pub alignment: usize,
    /// Whether `ptr` resolved to a live block.
    pub is_valid: bool,
}

/// One block of the heap as seen by the block iterator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockView {
    /// Position in the all-blocks list, starting at 0.
    pub index: usize,
    /// Byte offset of the block header from the buffer start.
    pub offset: usize,
    pub header_size: usize,
    pub total_size: usize,
    pub user_size: usize,
    pub alignment: usize,
    pub used: bool,
}

/// Snapshot of the full manager header.
#[derive(Clone, Copy, Debug)]
pub struct ManagerInfo {
    pub magic: u64,
    pub total_size: usize,
    pub used_size: usize,
    pub block_count: usize,
    pub free_count: usize,
    pub alloc_count: usize,
    pub first_block_offset: isize,
    pub first_free_offset: isize,
    pub owns_memory: bool,
    pub prev_base: *const u8,
    pub prev_total_size: usize,
    pub prev_owns: bool,
}

/// Size of the manager header struct in bytes. The first block starts at
/// this rounded up to the default alignment.
pub const fn manager_header_size() -> usize {
    MANAGER_HEADER_SIZE
}

/// Walks the all-blocks list and aggregates counters plus free-block
/// size extrema.
pub fn get_stats() -> MemoryStats {
    with_read(|heap| unsafe {
        let header = heap.header().as_ref();
        let mut stats = MemoryStats {
            total_blocks: header.block_count,
            free_blocks: header.free_count,
            allocated_blocks: header.alloc_count,
            ..MemoryStats::default()
        };

        let mut free_bytes = 0;
        let mut offset = header.first_block_offset;
        while offset != NO_BLOCK {
            let block = block_at(heap.base, offset).as_ref();
            if !block.used {
                free_bytes += block.total_size;
                stats.largest_free = stats.largest_free.max(block.total_size);
                stats.smallest_free = if stats.smallest_free == 0 {
                    block.total_size
                } else {
                    stats.smallest_free.min(block.total_size)
                };
            }
            offset = block.next_offset;
        }
        stats.total_fragmentation = free_bytes - stats.largest_free;

        stats
    })
    .unwrap_or_default()
}

/// Looks up the block behind a user pointer. Pointers that don't resolve
/// to a live block (and `None`) yield `is_valid == false`.
pub fn get_info(ptr: Option<NonNull<u8>>) -> AllocationInfo {
    let mut info = AllocationInfo {
        ptr,
        size: 0,
        alignment: 0,
        is_valid: false,
    };
    let Some(ptr) = ptr else { return info };

    with_read(|heap| unsafe {
        let resolved = heap.translate(ptr);
        let total_size = heap.header().as_ref().total_size;
        if let Some(block) = recover_header(heap.base, total_size, resolved) {
            info.size = block.as_ref().user_size;
            info.alignment = block.as_ref().alignment;
            info.is_valid = true;
        }
        info
    })
    .unwrap_or(info)
}

/// Snapshot of the manager header, or `None` when no manager is
/// installed.
pub fn manager_info() -> Option<ManagerInfo> {
    with_read(|heap| unsafe {
        let header = heap.header().as_ref();
        ManagerInfo {
            magic: header.magic,
            total_size: header.total_size,
            used_size: header.used_size,
            block_count: header.block_count,
            free_count: header.free_count,
            alloc_count: header.alloc_count,
            first_block_offset: header.first_block_offset,
            first_free_offset: header.first_free_offset,
            owns_memory: header.owns_memory,
            prev_base: header.prev_base,
            prev_total_size: header.prev_total_size,
            prev_owns: header.prev_owns,
        }
    })
}

/// Calls `f` once per block in buffer order. Does nothing when no
/// manager is installed. `f` runs under the shared lock, so it must not
/// call back into write operations.
pub fn for_each_block(mut f: impl FnMut(&BlockView)) {
    with_read(|heap| unsafe {
        let mut index = 0;
        let mut offset = heap.header().as_ref().first_block_offset;
        while offset != NO_BLOCK {
            let block = block_at(heap.base, offset);
            let block_ref = block.as_ref();
            let view = BlockView {
                index,
                offset: offset as usize,
                header_size: BLOCK_HEADER_SIZE,
                total_size: block_ref.total_size,
                user_size: block_ref.user_size,
                alignment: block_ref.alignment,
                used: block_ref.used,
            };
            f(&view);
            index += 1;
            offset = block_ref.next_offset;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::MANAGER_PREFIX_SIZE;
    use crate::testing::{serial, TestBuf};
    use crate::{allocate, allocate_aligned, create, deallocate, destroy, validate};

    #[test]
    fn header_size_constant_matches_layout() {
        assert!(manager_header_size() > 0);
        assert!(MANAGER_PREFIX_SIZE >= manager_header_size());
    }

    #[test]
    fn stats_track_free_extrema() {
        let _guard = serial();
        let buf = TestBuf::new(128 * 1024);
        unsafe {
            create(buf.ptr(), 128 * 1024).unwrap();

            // One all-covering free block: no fragmentation at all.
            let stats = get_stats();
            assert_eq!(stats.total_blocks, 1);
            assert_eq!(stats.free_blocks, 1);
            assert_eq!(stats.largest_free, stats.smallest_free);
            assert_eq!(stats.total_fragmentation, 0);

            // Punch a hole: a small free block pinned between two used
            // ones, plus the big tail.
            let a = allocate(256).unwrap();
            let b = allocate(256).unwrap();
            let _c = allocate(256).unwrap();
            deallocate(Some(b));

            let stats = get_stats();
            assert_eq!(stats.free_blocks, 2);
            assert!(stats.largest_free > stats.smallest_free);
            assert_eq!(stats.total_fragmentation, stats.smallest_free);
            assert!(validate());

            deallocate(Some(a));
            destroy();
        }
    }

    #[test]
    fn info_reports_live_blocks_only() {
        let _guard = serial();
        let buf = TestBuf::new(64 * 1024);
        unsafe {
            create(buf.ptr(), 64 * 1024).unwrap();

            let ptr = allocate_aligned(200, 32).unwrap();
            ptr.as_ptr().write_bytes(0x22, 200);

            let info = get_info(Some(ptr));
            assert!(info.is_valid);
            assert_eq!(info.size, 200);
            assert_eq!(info.alignment, 32);

            assert!(!get_info(None).is_valid);

            deallocate(Some(ptr));
            assert!(!get_info(Some(ptr)).is_valid);

            destroy();
        }
    }

    #[test]
    fn block_views_tile_the_buffer() {
        let _guard = serial();
        let total = 64 * 1024;
        let buf = TestBuf::new(total);
        unsafe {
            create(buf.ptr(), total).unwrap();
            let _a = allocate(512).unwrap();
            let _b = allocate_aligned(1024, 64).unwrap();

            let mut views: Vec<BlockView> = Vec::new();
            for_each_block(|view| views.push(*view));

            assert_eq!(views.len(), 3); // two used blocks plus the tail
            assert_eq!(views[0].offset, MANAGER_PREFIX_SIZE);
            for (index, view) in views.iter().enumerate() {
                assert_eq!(view.index, index);
                assert_eq!(view.header_size, BLOCK_HEADER_SIZE);
            }
            for pair in views.windows(2) {
                assert_eq!(pair[0].offset + pair[0].total_size, pair[1].offset);
            }
            assert!(views[0].used && views[1].used && !views[2].used);
            assert_eq!(views[1].alignment, 64);

            let span: usize = views.iter().map(|view| view.total_size).sum();
            assert_eq!(MANAGER_PREFIX_SIZE + span, total);

            destroy();
        }
    }
}
