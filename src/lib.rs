//! Size-class slab allocator and the shared handle built on top of it.
//!
//! Small requests (up to [`MAX_POOLED_SIZE`] bytes) are served by one
//! [`Pool`] per size class; larger ones go straight to the
//! [`RawAllocator`]. [`SharedHandle`] is the sanctioned way to put objects
//! into pooled memory and share them between threads.

pub(crate) mod sync;

// submodules stay pub(crate); the public surface is re-exported below
pub mod memory;

// allocators
pub use memory::pool::Pool;
pub use memory::pool_set::PoolSet;
pub use memory::raw::{RawAllocator, SystemAllocator};
pub use memory::router::{GlobalMemoryRouter, MemoryResource, MemoryRouter};

// handles/adapters
pub use memory::adapter::PoolAllocator;
pub use memory::shared::SharedHandle;

// config
pub use memory::config::{
    MAX_POOLED_SIZE, NODES_PER_BLOCK, POOL_ALIGN, POOL_COUNT, PoolSetConfig, RAW_ALIGN, SIZE_STEP,
};

// mgmt/stats
pub use memory::manager::MemoryStats;

// errors
pub use memory::error::MemoryError;

use std::ptr::NonNull;

/// Allocate `size` bytes from the process-wide router.
///
/// # Errors
///
/// `InvalidSize` for `size == 0`, `OutOfMemory` if the system heap is exhausted.
pub fn allocate(size: usize) -> Result<NonNull<u8>, MemoryError> {
    GlobalMemoryRouter::allocate(size)
}

/// Return memory obtained from [`allocate`].
///
/// # Safety
/// - `ptr` must come from [`allocate`] and must not have been freed already.
/// - `size` must be the exact size passed to [`allocate`].
pub unsafe fn deallocate(ptr: NonNull<u8>, size: usize) {
    // Safety: forwarded caller contract.
    unsafe { GlobalMemoryRouter::deallocate(ptr, size) }
}

/// Bytes the pool serving `size` has handed back to the system heap so far.
pub fn recycled_bytes(size: usize) -> usize {
    GlobalMemoryRouter::recycled_bytes(size)
}
