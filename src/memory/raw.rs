use super::config::RAW_ALIGN;
use super::error::MemoryError;
use std::ptr::NonNull;

/// Source of slab memory for pools and of oversized allocations.
///
/// Every pointer returned by `allocate` is aligned to at least
/// [`RAW_ALIGN`] and stays valid until handed back through `deallocate`.
pub trait RawAllocator: Send + Sync {
    /// Obtain `size` bytes (`size > 0`) from the underlying heap.
    ///
    /// # Errors
    ///
    /// Returns `MemoryError::OutOfMemory` when the heap cannot satisfy the request.
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, MemoryError>;

    /// Return memory obtained from `allocate`.
    ///
    /// # Safety
    /// - `ptr` must have been returned by `allocate` on this allocator (or a
    ///   clone of it) and not freed since.
    /// - `size` must equal the size passed to `allocate`.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize);
}

/// The platform heap.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAllocator;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{MemoryError, NonNull, RAW_ALIGN, RawAllocator, SystemAllocator};

    impl RawAllocator for SystemAllocator {
        fn allocate(&self, size: usize) -> Result<NonNull<u8>, MemoryError> {
            debug_assert!(size > 0, "raw allocation of zero bytes");
            let mut out: *mut libc::c_void = std::ptr::null_mut();
            // Safety: FFI call to posix_memalign; RAW_ALIGN is a power of two
            // and a multiple of size_of::<*mut c_void>().
            let rc = unsafe { libc::posix_memalign(&raw mut out, RAW_ALIGN, size) };
            if rc != 0 {
                tracing::warn!(size, rc, "posix_memalign failed");
                return Err(MemoryError::OutOfMemory { size });
            }
            NonNull::new(out.cast::<u8>()).ok_or(MemoryError::OutOfMemory { size })
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, _size: usize) {
            // Safety: ptr came from posix_memalign (caller contract).
            unsafe { libc::free(ptr.as_ptr().cast::<libc::c_void>()) };
        }
    }
}

// ---------------------------------------------------------------------------
// Portable fallback: std::alloc with a fixed RAW_ALIGN layout.
//
// Used under loom (which runs everything in one process under its own
// scheduler), under Miri (no FFI), and on non-unix targets.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(unix)))]
impl RawAllocator for SystemAllocator {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, MemoryError> {
        debug_assert!(size > 0, "raw allocation of zero bytes");
        let layout = std::alloc::Layout::from_size_align(size, RAW_ALIGN)
            .map_err(|_| MemoryError::OutOfMemory { size })?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            tracing::warn!(size, "system allocator returned null");
            MemoryError::OutOfMemory { size }
        })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        // Safety: the same layout was accepted by `allocate`.
        let layout = unsafe { std::alloc::Layout::from_size_align_unchecked(size, RAW_ALIGN) };
        // Safety: ptr was allocated with the same layout via `allocate`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

// ---------------------------------------------------------------------------
// Test-only allocation tracker.
//
// Wraps SystemAllocator, records every live raw allocation, and panics on a
// free of an unknown pointer or with a mismatched size. An optional byte
// limit makes `allocate` fail with OutOfMemory once exceeded.
// ---------------------------------------------------------------------------
#[cfg(test)]
pub(crate) use tracking::TrackingAllocator;
