//! Process-wide byte gauges for the pools and the oversized path.
//!
//! Each gauge is updated on its own with `Relaxed` ordering, so a snapshot
//! taken while other threads allocate can show the total briefly out of step
//! with its parts. Display only; nothing in the allocator reads them back.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Signed byte gauge. A release racing ahead of its matching acquire can push
/// the raw value below zero for a moment; reads clamp at zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Total bytes currently held from the raw allocator (blocks + oversized)
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}

// Breakdown by path
crate::sync::static_atomic! {
    pub static POOL_COMMITTED: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static LARGE_ALLOC_LIVE: Counter = Counter::new();
}

// Cumulative bytes of idle blocks handed back to the raw allocator
crate::sync::static_atomic! {
    pub static POOL_RECYCLED: Counter = Counter::new();
}

/// Record `size` bytes of block memory obtained from the raw allocator.
pub fn block_acquired(size: usize) {
    TOTAL_COMMITTED.add(size);
    POOL_COMMITTED.add(size);
}

/// Record `size` bytes of block memory returned to the raw allocator.
/// `recycled` is false for teardown releases, which are not idle-block recycling.
pub fn block_released(size: usize, recycled: bool) {
    TOTAL_COMMITTED.sub(size);
    POOL_COMMITTED.sub(size);
    if recycled {
        POOL_RECYCLED.add(size);
    }
}

/// Record an oversized allocation served directly by the raw allocator.
pub fn large_acquired(size: usize) {
    TOTAL_COMMITTED.add(size);
    LARGE_ALLOC_LIVE.add(size);
}

/// Record an oversized allocation returned to the raw allocator.
pub fn large_released(size: usize) {
    TOTAL_COMMITTED.sub(size);
    LARGE_ALLOC_LIVE.sub(size);
}
