use super::config::PoolSetConfig;
use super::error::MemoryError;
use super::pool::Pool;
use super::raw::RawAllocator;

/// One [`Pool`] per size class. Pool `i` serves payloads of
/// `(i + 1) * size_step` bytes; a request of `size` bytes goes to
/// `ceil(size / size_step) - 1`.
pub struct PoolSet<A: RawAllocator> {
    pools: Box<[Pool<A>]>,
    size_step: usize,
    ceiling: usize,
}

impl<A: RawAllocator + Clone> PoolSet<A> {
    /// Build the pools described by `config`, each drawing blocks from a clone
    /// of `raw`. Pools start empty.
    ///
    /// # Errors
    ///
    /// Returns `MemoryError::InvalidConfig` if `config` fails validation.
    pub fn new(config: PoolSetConfig, raw: A) -> Result<Self, MemoryError> {
        config.validate()?;
        Ok(Self::build(config, raw))
    }

    /// `config` must already be valid.
    pub(crate) fn build(config: PoolSetConfig, raw: A) -> Self {
        let pools = (0..config.pool_count)
            .map(|i| Pool::new((i + 1) * config.size_step, raw.clone()))
            .collect();
        Self {
            pools,
            size_step: config.size_step,
            ceiling: config.ceiling(),
        }
    }
}

impl<A: RawAllocator> PoolSet<A> {
    #[inline]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    #[inline]
    pub fn size_step(&self) -> usize {
        self.size_step
    }

    /// Largest request served from a pool.
    #[inline]
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Size class for `size`, or `None` for zero and for anything above the ceiling.
    #[inline]
    pub fn index_for(&self, size: usize) -> Option<usize> {
        if size == 0 || size > self.ceiling {
            return None;
        }
        Some(size.div_ceil(self.size_step) - 1)
    }

    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    #[inline]
    pub fn pool(&self, index: usize) -> &Pool<A> {
        &self.pools[index]
    }

    #[inline]
    pub fn pool_for(&self, size: usize) -> Option<&Pool<A>> {
        self.index_for(size).map(|i| &self.pools[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pool<A>> {
        self.pools.iter()
    }
}

impl<A: RawAllocator> std::fmt::Debug for PoolSet<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSet")
            .field("pools", &self.pools.len())
            .field("size_step", &self.size_step)
            .field("ceiling", &self.ceiling)
            .finish()
    }
}
