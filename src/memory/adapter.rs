use super::config::POOL_ALIGN;
use super::error::MemoryError;
use super::router::{GlobalMemoryRouter, MemoryResource};
use allocator_api2::alloc::{AllocError, Allocator, Layout};
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

/// Typed allocator for containers that manage their own element storage.
///
/// `allocate(n)` hands out uninitialized room for `n` elements from the
/// router; construction and destruction are separate steps. Copies are
/// cheap, and any two adapters over the same resource are interchangeable:
/// memory from one may be freed through the other, whatever their element
/// types, as long as the byte sizes match.
///
/// It also implements [`Allocator`], so containers such as
/// `allocator_api2::vec::Vec` or `hashbrown::HashMap` can keep their storage
/// in pooled memory. Requests are routed by `layout.size()`; alignments above
/// [`POOL_ALIGN`] are refused.
pub struct PoolAllocator<T> {
    resource: &'static dyn MemoryResource,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PoolAllocator<T> {
    /// Adapter over the process-wide router.
    pub fn new() -> Self {
        Self::with_resource(GlobalMemoryRouter::resource())
    }

    pub fn with_resource(resource: &'static dyn MemoryResource) -> Self {
        Self {
            resource,
            _marker: PhantomData,
        }
    }

    pub fn resource(&self) -> &'static dyn MemoryResource {
        self.resource
    }

    /// Same resource, different element type.
    pub fn rebind<U>(&self) -> PoolAllocator<U> {
        PoolAllocator::with_resource(self.resource)
    }

    /// Largest `n` whose byte count is representable.
    pub fn max_size(&self) -> usize {
        isize::MAX.cast_unsigned() / size_of::<T>().max(1)
    }

    fn bytes_for(n: usize) -> Result<usize, MemoryError> {
        if align_of::<T>() > POOL_ALIGN {
            return Err(MemoryError::UnsupportedAlignment {
                align: align_of::<T>(),
                max: POOL_ALIGN,
            });
        }
        if n == 0 {
            return Err(MemoryError::InvalidSize);
        }
        match n.checked_mul(size_of::<T>()) {
            // Zero-sized elements still get a real, distinct address.
            Some(0) => Ok(1),
            Some(bytes) if bytes <= isize::MAX.cast_unsigned() => Ok(bytes),
            _ => Err(MemoryError::OutOfMemory { size: usize::MAX }),
        }
    }

    /// Uninitialized room for `n` elements.
    ///
    /// # Errors
    ///
    /// - `InvalidSize` for `n == 0`.
    /// - `OutOfMemory` if the byte count overflows or the heap is exhausted.
    /// - `UnsupportedAlignment` if `T` needs more than `POOL_ALIGN`.
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>, MemoryError> {
        let bytes = Self::bytes_for(n)?;
        self.resource.allocate(bytes).map(NonNull::cast)
    }

    /// # Safety
    /// - `ptr` must come from `allocate(n)` on an adapter over the same resource.
    /// - Any elements still constructed in it must already be destroyed.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize) {
        let bytes = Self::bytes_for(n);
        debug_assert!(bytes.is_ok(), "deallocate with a count allocate rejects: {n}");
        let Ok(bytes) = bytes else {
            return;
        };
        // Safety: same byte count as the allocation (caller contract).
        unsafe { self.resource.deallocate(ptr.cast(), bytes) };
    }

    /// Move `value` into uninitialized storage.
    ///
    /// # Safety
    /// `ptr` must be valid for writes and must not hold a live element.
    pub unsafe fn construct(&self, ptr: NonNull<T>, value: T) {
        // Safety: upheld by caller.
        unsafe { ptr.write(value) };
    }

    /// Run the destructor in place, leaving the storage uninitialized.
    ///
    /// # Safety
    /// `ptr` must hold a live element that is not used afterwards.
    pub unsafe fn destroy(&self, ptr: NonNull<T>) {
        // Safety: upheld by caller.
        unsafe { ptr::drop_in_place(ptr.as_ptr()) };
    }

    /// Allocate room for one element and construct `value` in it.
    ///
    /// # Errors
    ///
    /// See [`allocate`](Self::allocate).
    pub fn create(&self, value: T) -> Result<NonNull<T>, MemoryError> {
        let ptr = self.allocate(1)?;
        // Safety: fresh storage for one element.
        unsafe { self.construct(ptr, value) };
        Ok(ptr)
    }

    /// Destroy and free an element from [`create`](Self::create).
    ///
    /// # Safety
    /// `ptr` must come from `create` on an adapter over the same resource and
    /// must not be used afterwards.
    pub unsafe fn dispose(&self, ptr: NonNull<T>) {
        // Safety: upheld by caller.
        unsafe {
            self.destroy(ptr);
            self.deallocate(ptr, 1);
        }
    }
}

// Safety: every non-empty block comes from the resource and stays valid until
// it is deallocated with the same size; copies share the resource, so memory
// from one may be freed through any other.
unsafe impl<T> Allocator for PoolAllocator<T> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > POOL_ALIGN {
            return Err(AllocError);
        }
        if layout.size() == 0 {
            // Aligned, never dereferenced, never handed to the resource.
            let dangling = ptr::without_provenance_mut::<u8>(layout.align());
            let dangling = NonNull::new(dangling).ok_or(AllocError)?;
            return Ok(NonNull::slice_from_raw_parts(dangling, 0));
        }
        let ptr = self.resource.allocate(layout.size()).map_err(|_| AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        // Safety: `ptr` came from `allocate` with this layout (caller contract).
        unsafe { self.resource.deallocate(ptr, layout.size()) };
    }
}

impl<T> Default for PoolAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for PoolAllocator<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PoolAllocator<T> {}

impl<T, U> PartialEq<PoolAllocator<U>> for PoolAllocator<T> {
    fn eq(&self, other: &PoolAllocator<U>) -> bool {
        ptr::addr_eq(self.resource, other.resource)
    }
}

impl<T> Eq for PoolAllocator<T> {}

impl<T> std::fmt::Debug for PoolAllocator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("elem", &std::any::type_name::<T>())
            .field("resource", &ptr::from_ref(self.resource).cast::<()>())
            .finish()
    }
}
