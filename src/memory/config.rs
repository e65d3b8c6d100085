use super::error::MemoryError;
use super::pool::checked_block_size;

/// Width of one size class in bytes.
pub const SIZE_STEP: usize = 8;

/// Number of pooled size classes.
pub const POOL_COUNT: usize = 128;

/// Largest request served from a pool; anything above goes to the raw allocator.
pub const MAX_POOLED_SIZE: usize = SIZE_STEP * POOL_COUNT;

/// Slots carved out of every block.
pub const NODES_PER_BLOCK: usize = 4096;

/// Alignment guaranteed for every pooled payload.
pub const POOL_ALIGN: usize = 8;

/// Alignment requested from the system heap for blocks and oversized requests.
pub const RAW_ALIGN: usize = 16;

/// Shape of a [`PoolSet`](super::pool_set::PoolSet): how many size classes and
/// how wide each one is. Fixed for the lifetime of the set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSetConfig {
    /// Number of size classes. Default: [`POOL_COUNT`].
    pub pool_count: usize,

    /// Width of each size class in bytes. Must be a multiple of
    /// [`POOL_ALIGN`]. Default: [`SIZE_STEP`].
    pub size_step: usize,
}

impl Default for PoolSetConfig {
    fn default() -> Self {
        Self {
            pool_count: POOL_COUNT,
            size_step: SIZE_STEP,
        }
    }
}

impl PoolSetConfig {
    /// Largest size served by a pool under this configuration.
    #[must_use]
    pub fn ceiling(&self) -> usize {
        self.size_step * self.pool_count
    }

    /// Reject shapes that cannot route: empty sets, zero or misaligned steps,
    /// overflowing ceilings, and classes whose blocks do not fit in an `isize`.
    ///
    /// # Errors
    ///
    /// Returns `MemoryError::InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.pool_count == 0 {
            return Err(MemoryError::InvalidConfig(
                "pool_count must be at least 1".to_string(),
            ));
        }
        if self.size_step == 0 || !self.size_step.is_multiple_of(POOL_ALIGN) {
            return Err(MemoryError::InvalidConfig(format!(
                "size_step {} must be a non-zero multiple of {POOL_ALIGN}",
                self.size_step
            )));
        }
        let Some(ceiling) = self.size_step.checked_mul(self.pool_count) else {
            return Err(MemoryError::InvalidConfig(format!(
                "ceiling overflows: {} classes of {} bytes",
                self.pool_count, self.size_step
            )));
        };
        // The widest class has the largest block.
        if checked_block_size(ceiling).is_none() {
            return Err(MemoryError::InvalidConfig(format!(
                "blocks of {NODES_PER_BLOCK} {ceiling}-byte slots exceed isize::MAX"
            )));
        }
        Ok(())
    }
}
