//! Host buffer acquisition. The manager needs whole buffers from the host
//! when the caller asks us to own the memory (`create_owned`) and every
//! time the heap grows; it doesn't care which API the underlying kernel
//! offers for that.

use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction over the platform-specific way of obtaining raw memory.
trait HostMemory {
    /// Requests a buffer where `length` bytes can be written safely. The
    /// result is at least page-aligned on every supported platform.
    unsafe fn request_memory(length: usize) -> Pointer<u8>;

    /// Returns a buffer previously obtained from [`Self::request_memory`]
    /// with the same `length`.
    unsafe fn return_memory(address: NonNull<u8>, length: usize);
}

/// Zero sized type that implements [`HostMemory`] for each OS.
struct Platform;

/// Convenience wrapper for [`HostMemory::request_memory`].
#[inline]
pub(crate) unsafe fn request_memory(length: usize) -> Pointer<u8> {
    Platform::request_memory(length)
}

/// Convenience wrapper for [`HostMemory::return_memory`].
#[inline]
pub(crate) unsafe fn return_memory(address: NonNull<u8>, length: usize) {
    Platform::return_memory(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{HostMemory, Platform};
    use crate::Pointer;

    impl HostMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Read-write, private, not backed by any file. See
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // The region is still mapped; nothing sensible to do
                // without a way to report it.
            }
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::ptr::NonNull;

    use windows::Win32::System::Memory;

    use super::{HostMemory, Platform};
    use crate::Pointer;

    impl HostMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Reserve and commit in one call. See
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc
            let protection = Memory::PAGE_READWRITE;
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn return_memory(address: NonNull<u8>, _length: usize) {
            // MEM_RELEASE requires a length of zero and frees the whole
            // reservation. See
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree
            let address = address.cast().as_ptr();
            if !Memory::VirtualFree(address, 0, Memory::MEM_RELEASE).as_bool() {
                // Same situation as munmap above.
            }
        }
    }
}

#[cfg(miri)]
mod miri {
    //! Miri has no FFI, so the global allocator stands in for the kernel.
    //! This also lets Miri catch buffers we forget to return.

    use std::alloc;
    use std::ptr::NonNull;

    use super::{HostMemory, Platform};
    use crate::align::DEFAULT_ALIGNMENT;
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, DEFAULT_ALIGNMENT).unwrap()
    }

    impl HostMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Mapped pages arrive zeroed; keep the mock faithful.
            NonNull::new(alloc::alloc_zeroed(to_layout(length)))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }
    }
}
