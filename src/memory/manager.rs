use super::stats;
use crate::sync::atomic::Ordering;

/// Point-in-time view of the process-wide memory gauges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes currently held from the raw allocator by this layer.
    pub total_committed: usize,
    /// Bytes currently held in pool blocks.
    pub pool_committed: usize,
    /// Bytes currently held by oversized allocations.
    pub large_alloc_live: usize,
    /// Cumulative bytes of idle blocks returned to the raw allocator.
    pub pool_recycled: usize,
}

impl MemoryStats {
    /// Read every gauge. Values are diagnostic and may be mutually
    /// inconsistent while other threads allocate.
    #[must_use]
    pub fn snapshot() -> Self {
        Self {
            total_committed: stats::TOTAL_COMMITTED.load(Ordering::Relaxed),
            pool_committed: stats::POOL_COMMITTED.load(Ordering::Relaxed),
            large_alloc_live: stats::LARGE_ALLOC_LIVE.load(Ordering::Relaxed),
            pool_recycled: stats::POOL_RECYCLED.load(Ordering::Relaxed),
        }
    }
}
