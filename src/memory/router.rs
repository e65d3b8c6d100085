use super::config::PoolSetConfig;
use super::error::MemoryError;
use super::pool_set::PoolSet;
use super::raw::{RawAllocator, SystemAllocator};
use super::stats;
use crate::sync::OnceLock;
use std::ptr::NonNull;

/// Size-based allocation service. Shared handles and the typed adapter hold
/// one of these as `&'static dyn MemoryResource` so they can free into the
/// router that produced their memory.
pub trait MemoryResource: Send + Sync {
    /// # Errors
    ///
    /// `InvalidSize` for `size == 0`, `OutOfMemory` when the heap is exhausted.
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, MemoryError>;

    /// # Safety
    /// `ptr` must come from `allocate` on this resource with the same `size`,
    /// and must not have been freed already.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize);

    /// Bytes the pool serving `size` has recycled so far; 0 if `size` is not pooled.
    fn recycled_bytes(&self, size: usize) -> usize;
}

/// Routes each request by size: `1..=ceiling` to the matching pool, anything
/// larger straight to the raw allocator.
pub struct MemoryRouter<A: RawAllocator = SystemAllocator> {
    pools: PoolSet<A>,
    raw: A,
}

impl<A: RawAllocator + Clone> MemoryRouter<A> {
    /// Router with the default shape ([`POOL_COUNT`](super::config::POOL_COUNT)
    /// classes of [`SIZE_STEP`](super::config::SIZE_STEP) bytes).
    pub fn new(raw: A) -> Self {
        Self {
            pools: PoolSet::build(PoolSetConfig::default(), raw.clone()),
            raw,
        }
    }

    /// # Errors
    ///
    /// Returns `MemoryError::InvalidConfig` if `config` fails validation.
    pub fn with_config(config: PoolSetConfig, raw: A) -> Result<Self, MemoryError> {
        Ok(Self {
            pools: PoolSet::new(config, raw.clone())?,
            raw,
        })
    }
}

impl<A: RawAllocator> MemoryRouter<A> {
    pub fn pools(&self) -> &PoolSet<A> {
        &self.pools
    }

    /// Largest request served from a pool.
    pub fn ceiling(&self) -> usize {
        self.pools.ceiling()
    }

    /// Allocate `size` bytes. Pooled payloads are aligned to
    /// [`POOL_ALIGN`](super::config::POOL_ALIGN), oversized ones to
    /// [`RAW_ALIGN`](super::config::RAW_ALIGN).
    ///
    /// # Errors
    ///
    /// `InvalidSize` for `size == 0`, `OutOfMemory` when the heap is exhausted.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }
        match self.pools.pool_for(size) {
            Some(pool) => pool.allocate(),
            None => {
                let ptr = self.raw.allocate(size)?;
                stats::large_acquired(size);
                tracing::trace!(size, "oversized request served by the raw allocator");
                Ok(ptr)
            }
        }
    }

    /// Free memory from [`allocate`](Self::allocate). `size` picks the same
    /// route the allocation took.
    ///
    /// # Safety
    /// - `ptr` must come from `allocate` on this router.
    /// - `size` must equal the size passed to `allocate`.
    /// - `ptr` must not have been freed already.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        debug_assert!(size != 0, "deallocate called with size 0");
        if size == 0 {
            return;
        }
        match self.pools.pool_for(size) {
            // Safety: same size, same route as the allocation (caller contract).
            Some(pool) => unsafe { pool.deallocate(ptr) },
            None => {
                tracing::trace!(size, "oversized block returned to the raw allocator");
                stats::large_released(size);
                // Safety: oversized allocations come from self.raw with this size.
                unsafe { self.raw.deallocate(ptr, size) };
            }
        }
    }

    pub fn recycled_bytes(&self, size: usize) -> usize {
        self.pools.pool_for(size).map_or(0, |pool| pool.recycled_bytes())
    }
}

impl<A: RawAllocator> MemoryResource for MemoryRouter<A> {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, MemoryError> {
        MemoryRouter::allocate(self, size)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        // Safety: forwarded caller contract.
        unsafe { MemoryRouter::deallocate(self, ptr, size) }
    }

    fn recycled_bytes(&self, size: usize) -> usize {
        MemoryRouter::recycled_bytes(self, size)
    }
}

impl<A: RawAllocator> std::fmt::Debug for MemoryRouter<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRouter")
            .field("pools", &self.pools)
            .finish_non_exhaustive()
    }
}

static GLOBAL_ROUTER_INSTANCE: OnceLock<MemoryRouter> = OnceLock::new();

/// The process-wide router over the system heap. Built on first use with the
/// default shape, or explicitly with [`init_with_config`](Self::init_with_config)
/// before anything touches it. Never torn down.
pub struct GlobalMemoryRouter;

impl GlobalMemoryRouter {
    /// Build the global router with the default shape.
    ///
    /// # Errors
    ///
    /// Returns `MemoryError::AlreadyInitialized` if the router already exists.
    pub fn init() -> Result<(), MemoryError> {
        Self::init_with_config(PoolSetConfig::default())
    }

    /// Build the global router with a custom shape.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if `config` fails validation, `AlreadyInitialized` if
    /// the router already exists.
    pub fn init_with_config(config: PoolSetConfig) -> Result<(), MemoryError> {
        let router = MemoryRouter::with_config(config, SystemAllocator)?;
        GLOBAL_ROUTER_INSTANCE
            .set(router)
            .map_err(|_| MemoryError::AlreadyInitialized)?;
        tracing::info!(
            pools = config.pool_count,
            size_step = config.size_step,
            ceiling = config.ceiling(),
            "global memory router initialized"
        );
        Ok(())
    }

    /// The global router, built with the default shape if nobody initialized it.
    pub fn get() -> &'static MemoryRouter {
        GLOBAL_ROUTER_INSTANCE.get_or_init(|| {
            tracing::info!("global memory router initialized with default shape");
            MemoryRouter::new(SystemAllocator)
        })
    }

    /// The global router as a shareable resource.
    pub fn resource() -> &'static dyn MemoryResource {
        Self::get()
    }

    /// # Errors
    ///
    /// `InvalidSize` for `size == 0`, `OutOfMemory` when the heap is exhausted.
    pub fn allocate(size: usize) -> Result<NonNull<u8>, MemoryError> {
        Self::get().allocate(size)
    }

    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) with the same `size`
    /// and must not have been freed already.
    pub unsafe fn deallocate(ptr: NonNull<u8>, size: usize) {
        // Safety: forwarded caller contract.
        unsafe { Self::get().deallocate(ptr, size) }
    }

    pub fn recycled_bytes(size: usize) -> usize {
        Self::get().recycled_bytes(size)
    }
}
