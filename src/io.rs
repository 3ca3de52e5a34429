//! File round trips for heap images.
//!
//! A heap image on disk is exactly the `total_size` bytes of the managed
//! buffer, nothing more: no version field, no endianness negotiation, no
//! container format. Compatibility is the manager magic, the recorded
//! size matching the file size, and a block list that survives
//! validation. An image saved on one host loads on another only if the
//! two agree on header layout and endianness.

use std::fs;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::slice;

use crate::manager::{self, with_read, MIN_MEMORY_SIZE};
use crate::Error;

/// Writes the current heap image to `path` verbatim. Shared-lock reader:
/// concurrent readers proceed, writers wait.
pub fn save<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    match with_read(|heap| unsafe {
        let total_size = heap.header().as_ref().total_size;
        let image = slice::from_raw_parts(heap.base.as_ptr(), total_size);
        fs::write(path, image).map_err(Error::from)
    }) {
        Some(result) => result,
        None => Err(Error::NoManager),
    }
}

/// Reads a heap image from `path` into the caller's buffer and installs
/// it via [`crate::load`]. The buffer must be at least as large as the
/// file; the image's own recorded size must match the file size exactly.
///
/// # Safety
///
/// Same contract as [`crate::load`]: `memory` must be valid for `size`
/// bytes and stay untouched for as long as the manager is installed.
pub unsafe fn load_from_file<P: AsRef<Path>>(
    path: P,
    memory: NonNull<u8>,
    size: usize,
) -> Result<(), Error> {
    if size < MIN_MEMORY_SIZE {
        return Err(Error::InvalidArgument);
    }

    let image = fs::read(path)?;
    if image.len() < MIN_MEMORY_SIZE || image.len() > size {
        return Err(Error::InvalidArgument);
    }

    ptr::copy_nonoverlapping(image.as_ptr(), memory.as_ptr(), image.len());
    manager::load(memory, image.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{serial, TestBuf};
    use crate::{
        allocate, create, deallocate, destroy, for_each_block, manager_info, validate, BlockView,
    };

    #[test]
    fn save_without_manager_fails() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            save(dir.path().join("nothing.heap")),
            Err(Error::NoManager)
        ));
    }

    #[test]
    fn round_trip_reproduces_snapshot() {
        let _guard = serial();
        let total = 64 * 1024;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.heap");

        let buf = TestBuf::new(total);
        let mut views_before: Vec<BlockView> = Vec::new();
        let info_before;
        unsafe {
            create(buf.ptr(), total).unwrap();

            // Some traffic so the image has texture: three blocks, a
            // hole in the middle.
            let a = allocate(300).unwrap();
            a.as_ptr().write_bytes(0xA1, 300);
            let b = allocate(800).unwrap();
            b.as_ptr().write_bytes(0xB2, 800);
            let c = allocate(100).unwrap();
            c.as_ptr().write_bytes(0xC3, 100);
            deallocate(Some(b));

            for_each_block(|view| views_before.push(*view));
            info_before = manager_info().unwrap();

            save(&path).unwrap();
            destroy();
        }

        let reloaded = TestBuf::new(total);
        unsafe {
            load_from_file(&path, reloaded.ptr(), total).unwrap();
            assert!(validate());

            let mut views_after: Vec<BlockView> = Vec::new();
            for_each_block(|view| views_after.push(*view));
            assert_eq!(views_before, views_after);

            let info_after = manager_info().unwrap();
            assert_eq!(info_before.total_size, info_after.total_size);
            assert_eq!(info_before.used_size, info_after.used_size);
            assert_eq!(info_before.block_count, info_after.block_count);
            assert_eq!(info_before.free_count, info_after.free_count);
            assert_eq!(info_before.alloc_count, info_after.alloc_count);

            // The loaded image is not ours and carries no history.
            assert!(!info_after.owns_memory);
            assert!(info_after.prev_base.is_null());

            // Allocation resumes: the freed middle block is reusable.
            let reused = allocate(800).unwrap();
            assert!(validate());
            deallocate(Some(reused));

            destroy();
        }
    }

    #[test]
    fn load_rejects_bad_images() {
        let _guard = serial();
        let total = 16 * 1024;
        let dir = tempfile::tempdir().unwrap();
        let buf = TestBuf::new(total);

        unsafe {
            // Not an image at all.
            let garbage = dir.path().join("garbage.heap");
            fs::write(&garbage, vec![0x5Au8; total]).unwrap();
            assert!(matches!(
                load_from_file(&garbage, buf.ptr(), total),
                Err(Error::CorruptedMetadata)
            ));

            // A real image with a flipped magic byte.
            create(buf.ptr(), total).unwrap();
            let tampered = dir.path().join("tampered.heap");
            save(&tampered).unwrap();
            destroy();

            let mut bytes = fs::read(&tampered).unwrap();
            bytes[0] ^= 0xFF;
            fs::write(&tampered, &bytes).unwrap();
            assert!(matches!(
                load_from_file(&tampered, buf.ptr(), total),
                Err(Error::CorruptedMetadata)
            ));

            // A file larger than the destination buffer.
            let oversized = dir.path().join("oversized.heap");
            fs::write(&oversized, vec![0u8; total * 2]).unwrap();
            assert!(matches!(
                load_from_file(&oversized, buf.ptr(), total),
                Err(Error::InvalidArgument)
            ));

            // Nothing got installed along the way.
            assert!(!validate());
        }
    }
}
