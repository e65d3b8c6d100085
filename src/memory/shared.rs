use super::config::POOL_ALIGN;
use super::error::MemoryError;
use super::router::{GlobalMemoryRouter, MemoryResource};
use crate::sync::atomic::{AtomicUsize, Ordering, fence};
use std::any::TypeId;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::{cmp, fmt, hash, mem, ops};

/// Above this, a clone aborts instead of risking counter overflow.
const MAX_STRONG: usize = isize::MAX as usize;

/// Shared bookkeeping for every handle over one object, itself allocated
/// from the same resource as the object.
struct ControlCell {
    strong: AtomicUsize,
    /// Start of the object storage.
    base: NonNull<u8>,
    /// Exact byte size requested for the object storage.
    size: usize,
    /// Constructed elements at `base`.
    len: usize,
    drop_elems: unsafe fn(NonNull<u8>, usize),
    type_id: fn() -> TypeId,
    resource: &'static dyn MemoryResource,
}

const CELL_SIZE: usize = size_of::<ControlCell>();
const _: () = assert!(align_of::<ControlCell>() <= POOL_ALIGN);

/// # Safety
/// `base` must hold `len` initialized `T`s that are not used afterwards.
unsafe fn drop_elems<T>(base: NonNull<u8>, len: usize) {
    // Safety: upheld by caller.
    unsafe {
        ptr::drop_in_place(ptr::slice_from_raw_parts_mut(
            base.as_ptr().cast::<T>(),
            len,
        ));
    }
}

/// # Safety
/// `cell` must be live and the caller must already hold one reference.
unsafe fn retain(cell: NonNull<ControlCell>) {
    // Safety: upheld by caller.
    let old = unsafe { cell.as_ref() }.strong.fetch_add(1, Ordering::Relaxed);
    if old > MAX_STRONG {
        std::process::abort();
    }
}

/// Drop one reference. The thread that takes the count from 1 to 0 runs the
/// element destructors, then returns the object storage and the cell.
///
/// # Safety
/// `cell` must be live and the caller must give up one reference it holds.
unsafe fn release(cell: NonNull<ControlCell>) {
    // Safety: upheld by caller.
    let c = unsafe { cell.as_ref() };
    if c.strong.fetch_sub(1, Ordering::Release) != 1 {
        return;
    }
    // Pairs with the Release above on every other handle's drop, so their
    // writes to the object happen before the destructors run.
    fence(Ordering::Acquire);

    let (base, size, len, drop_elems, resource) =
        (c.base, c.size, c.len, c.drop_elems, c.resource);
    // Safety: we were the last reference. Nothing else can reach the object
    // or the cell, and both came from `resource` with the recorded sizes.
    unsafe {
        drop_elems(base, len);
        resource.deallocate(base, size);
        ptr::drop_in_place(cell.as_ptr());
        resource.deallocate(cell.cast::<u8>(), CELL_SIZE);
    }
}

/// Cleans up a half-built object if construction bails out.
struct InitGuard<T> {
    resource: &'static dyn MemoryResource,
    base: NonNull<u8>,
    size: usize,
    written: usize,
    _marker: PhantomData<T>,
}

impl<T> Drop for InitGuard<T> {
    fn drop(&mut self) {
        // Safety: exactly `written` elements were constructed at `base`, which
        // came from `resource` with `size` bytes.
        unsafe {
            drop_elems::<T>(self.base, self.written);
            self.resource.deallocate(self.base, self.size);
        }
    }
}

struct HandleInner<T: ?Sized> {
    cell: NonNull<ControlCell>,
    ptr: NonNull<T>,
    len: usize,
}

impl<T: ?Sized> Clone for HandleInner<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for HandleInner<T> {}

/// Atomically reference-counted handle to an object (or a run of `T`s)
/// living in router-managed memory.
///
/// Both the object storage and the reference count come from a
/// [`MemoryResource`]; the last handle to go away runs the destructors and
/// returns both allocations with their exact sizes.
///
/// A handle is either empty or holds a counter and an object together.
/// Equality, ordering and hashing use the object address; an empty handle's
/// address is null.
///
/// A handle can be re-typed in two ways:
/// - [`map`](Self::map) / [`try_map`](Self::try_map) project to a view of the
///   same object, typically a trait object;
/// - [`cast`](Self::cast) recovers the concrete element type recorded at
///   construction, or yields an empty handle if it does not match.
///
/// All views share one count.
///
/// # Thread safety
///
/// Every constructor requires `T: Send + Sync`. A projected view can be sent
/// to another thread, cast back there and released last there, so the
/// object itself must be safe to share and to drop anywhere:
///
/// ```compile_fail
/// use std::rc::Rc;
///
/// let _ = poolmem::SharedHandle::new(Rc::new(7u32));
/// ```
pub struct SharedHandle<T: ?Sized> {
    inner: Option<HandleInner<T>>,
    _marker: PhantomData<T>,
}

// Safety: constructors only accept `Send + Sync` objects, so whatever a view
// projects to, the object behind it may be shared and dropped on any thread.
// The viewed `T` is bounded the same way `Arc<T>` bounds it.
unsafe impl<T: ?Sized + Send + Sync> Send for SharedHandle<T> {}
// Safety: see above.
unsafe impl<T: ?Sized + Send + Sync> Sync for SharedHandle<T> {}

impl<T: Send + Sync + 'static> SharedHandle<T> {
    /// Place one `value` in memory from the process-wide router.
    ///
    /// # Errors
    ///
    /// `UnsupportedAlignment` if `T` needs more than
    /// [`POOL_ALIGN`](super::config::POOL_ALIGN), `OutOfMemory` on heap exhaustion.
    pub fn new(value: T) -> Result<Self, MemoryError> {
        Self::new_in(GlobalMemoryRouter::resource(), value)
    }

    /// [`new`](Self::new) against a specific resource.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn new_in(resource: &'static dyn MemoryResource, value: T) -> Result<Self, MemoryError> {
        let size = size_of::<T>().max(1);
        let len = Self::slots_for(size)?;
        Self::build(resource, size, len, std::iter::once(value))
    }

    /// Request `size` bytes and fill every whole `T` slot in them with a
    /// clone of `value`.
    ///
    /// # Errors
    ///
    /// - `InvalidSize` if `size` is zero or smaller than one `T`.
    /// - `UnsupportedAlignment` if `T` needs more than `POOL_ALIGN`.
    /// - `OutOfMemory` on heap exhaustion.
    pub fn create(size: usize, value: T) -> Result<Self, MemoryError>
    where
        T: Clone,
    {
        Self::create_in(GlobalMemoryRouter::resource(), size, value)
    }

    /// [`create`](Self::create) against a specific resource.
    ///
    /// # Errors
    ///
    /// See [`create`](Self::create).
    pub fn create_in(
        resource: &'static dyn MemoryResource,
        size: usize,
        value: T,
    ) -> Result<Self, MemoryError>
    where
        T: Clone,
    {
        let len = Self::slots_for(size)?;
        Self::build(resource, size, len, std::iter::repeat_n(value, len))
    }

    /// Request `size` bytes and build slot `i` with `f(i)`.
    ///
    /// If `f` panics, the slots already built are dropped and the storage is
    /// returned before the panic propagates.
    ///
    /// # Errors
    ///
    /// See [`create`](Self::create).
    pub fn create_with(size: usize, f: impl FnMut(usize) -> T) -> Result<Self, MemoryError> {
        Self::create_with_in(GlobalMemoryRouter::resource(), size, f)
    }

    /// [`create_with`](Self::create_with) against a specific resource.
    ///
    /// # Errors
    ///
    /// See [`create`](Self::create).
    pub fn create_with_in(
        resource: &'static dyn MemoryResource,
        size: usize,
        f: impl FnMut(usize) -> T,
    ) -> Result<Self, MemoryError> {
        let len = Self::slots_for(size)?;
        Self::build(resource, size, len, (0..len).map(f))
    }

    /// Whole `T` slots in `size` bytes. A zero-sized `T` always gets one.
    fn slots_for(size: usize) -> Result<usize, MemoryError> {
        if align_of::<T>() > POOL_ALIGN {
            return Err(MemoryError::UnsupportedAlignment {
                align: align_of::<T>(),
                max: POOL_ALIGN,
            });
        }
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }
        match size_of::<T>() {
            0 => Ok(1),
            elem if size < elem => Err(MemoryError::InvalidSize),
            elem => Ok(size / elem),
        }
    }

    fn build(
        resource: &'static dyn MemoryResource,
        size: usize,
        len: usize,
        elems: impl Iterator<Item = T>,
    ) -> Result<Self, MemoryError> {
        let base = resource.allocate(size)?;
        let mut guard = InitGuard::<T> {
            resource,
            base,
            size,
            written: 0,
            _marker: PhantomData,
        };

        for value in elems.take(len) {
            // Safety: written < len and len * size_of::<T>() <= size; base is
            // aligned to POOL_ALIGN >= align_of::<T>().
            unsafe { base.as_ptr().cast::<T>().add(guard.written).write(value) };
            guard.written += 1;
        }
        debug_assert_eq!(guard.written, len);

        // On failure the guard drops the elements and frees the storage.
        let cell = resource.allocate(CELL_SIZE)?.cast::<ControlCell>();
        let len = guard.written;
        mem::forget(guard);

        // Safety: fresh CELL_SIZE allocation aligned to POOL_ALIGN.
        unsafe {
            cell.as_ptr().write(ControlCell {
                strong: AtomicUsize::new(1),
                base,
                size,
                len,
                drop_elems: drop_elems::<T>,
                type_id: TypeId::of::<T>,
                resource,
            });
        }

        Ok(Self {
            inner: Some(HandleInner {
                cell,
                ptr: base.cast::<T>(),
                len,
            }),
            _marker: PhantomData,
        })
    }
}

impl<T: ?Sized> SharedHandle<T> {
    /// The empty handle.
    pub const fn empty() -> Self {
        Self {
            inner: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn is_some(&self) -> bool {
        self.inner.is_some()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// Move the contents out, leaving this handle empty.
    pub fn take(&mut self) -> Self {
        mem::take(self)
    }

    /// The viewed value, or `None` for an empty handle.
    pub fn value(&self) -> Option<&T> {
        // Safety: the object outlives every handle that points at it.
        self.inner.as_ref().map(|inner| unsafe { inner.ptr.as_ref() })
    }

    /// Elements reachable through this view: the constructed slot count for
    /// handles from a constructor or [`cast`](Self::cast), 1 for projected
    /// views, 0 for the empty handle.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.len)
    }

    fn cell(&self) -> Option<&ControlCell> {
        // Safety: the cell outlives every handle that points at it.
        self.inner.as_ref().map(|inner| unsafe { inner.cell.as_ref() })
    }

    /// Bytes requested for the object storage; 0 for the empty handle.
    pub fn byte_size(&self) -> usize {
        self.cell().map_or(0, |cell| cell.size)
    }

    /// Live handles sharing this object; 0 for the empty handle.
    pub fn strong_count(&self) -> usize {
        self.cell()
            .map_or(0, |cell| cell.strong.load(Ordering::Relaxed))
    }

    /// Address of the viewed object, null for the empty handle.
    #[inline]
    pub fn addr(&self) -> *const () {
        self.inner
            .as_ref()
            .map_or(ptr::null(), |inner| inner.ptr.as_ptr().cast::<()>().cast_const())
    }

    /// Recover the concrete element type recorded at construction. Yields an
    /// empty handle if `C` is not that type. On success the new handle shares
    /// this one's count and sees every constructed element.
    pub fn cast<C: 'static>(&self) -> SharedHandle<C> {
        let Some(inner) = &self.inner else {
            return SharedHandle::empty();
        };
        // Safety: the cell outlives every handle that points at it.
        let cell = unsafe { inner.cell.as_ref() };
        if (cell.type_id)() != TypeId::of::<C>() {
            return SharedHandle::empty();
        }
        // Safety: self holds a reference.
        unsafe { retain(inner.cell) };
        SharedHandle {
            inner: Some(HandleInner {
                cell: inner.cell,
                ptr: cell.base.cast::<C>(),
                len: cell.len,
            }),
            _marker: PhantomData,
        }
    }

    /// Project to a view of the same object, e.g. `h.map(|s| s as &dyn Shape)`.
    /// The new handle shares this one's count.
    pub fn map<U: ?Sized>(&self, f: impl FnOnce(&T) -> &U) -> SharedHandle<U> {
        self.try_map(|value| Some(f(value)))
    }

    /// Like [`map`](Self::map), but an empty handle comes back if `f` returns
    /// `None`.
    pub fn try_map<U: ?Sized>(&self, f: impl FnOnce(&T) -> Option<&U>) -> SharedHandle<U> {
        let Some(inner) = &self.inner else {
            return SharedHandle::empty();
        };
        // Safety: the object outlives every handle that points at it.
        let value = unsafe { inner.ptr.as_ref() };
        let Some(projected) = f(value) else {
            return SharedHandle::empty();
        };
        let ptr = NonNull::from(projected);
        // Safety: self holds a reference.
        unsafe { retain(inner.cell) };
        SharedHandle {
            inner: Some(HandleInner {
                cell: inner.cell,
                ptr,
                len: 1,
            }),
            _marker: PhantomData,
        }
    }
}

impl<T> SharedHandle<T> {
    /// Element `index`.
    ///
    /// # Errors
    ///
    /// `OutOfRange` unless `index < self.len()`.
    pub fn get(&self, index: usize) -> Result<&T, MemoryError> {
        match &self.inner {
            Some(inner) if index < inner.len => {
                // Safety: index is within the constructed elements.
                Ok(unsafe { &*inner.ptr.as_ptr().add(index) })
            }
            _ => Err(MemoryError::OutOfRange {
                index,
                len: self.len(),
            }),
        }
    }

    /// Every element reachable through this view.
    pub fn as_slice(&self) -> &[T] {
        match &self.inner {
            // Safety: `len` elements are constructed starting at `ptr`.
            Some(inner) => unsafe { std::slice::from_raw_parts(inner.ptr.as_ptr(), inner.len) },
            None => &[],
        }
    }

    /// Address of the first element, null for the empty handle.
    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self.inner
            .as_ref()
            .map_or(ptr::null(), |inner| inner.ptr.as_ptr().cast_const())
    }
}

impl<T: ?Sized> Clone for SharedHandle<T> {
    fn clone(&self) -> Self {
        if let Some(inner) = &self.inner {
            // Safety: self holds a reference.
            unsafe { retain(inner.cell) };
        }
        Self {
            inner: self.inner,
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized> Drop for SharedHandle<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            // Safety: this handle held one reference.
            unsafe { release(inner.cell) };
        }
    }
}

impl<T: ?Sized> Default for SharedHandle<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ?Sized> ops::Deref for SharedHandle<T> {
    type Target = T;

    /// # Panics
    ///
    /// Panics on an empty handle.
    fn deref(&self) -> &T {
        match self.value() {
            Some(value) => value,
            None => panic!("dereferenced an empty SharedHandle"),
        }
    }
}

impl<T> ops::Index<usize> for SharedHandle<T> {
    type Output = T;

    /// # Panics
    ///
    /// Panics with the `OutOfRange` message unless `index < self.len()`.
    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }
}

impl<T: ?Sized> PartialEq for SharedHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl<T: ?Sized> Eq for SharedHandle<T> {}

impl<T> PartialEq<*const T> for SharedHandle<T> {
    fn eq(&self, other: &*const T) -> bool {
        self.as_ptr() == *other
    }
}

impl<T: ?Sized> PartialOrd for SharedHandle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: ?Sized> Ord for SharedHandle<T> {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.addr().cmp(&other.addr())
    }
}

impl<T: ?Sized> hash::Hash for SharedHandle<T> {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SharedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(value) => f.debug_tuple("SharedHandle").field(&value).finish(),
            None => f.write_str("SharedHandle(<empty>)"),
        }
    }
}

impl<T: ?Sized> fmt::Pointer for SharedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.addr(), f)
    }
}
