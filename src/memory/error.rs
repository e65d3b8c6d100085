/// Errors surfaced by the pool allocator, the router and shared handles.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// The system heap could not supply a block or an oversized request.
    #[error("out of memory: raw allocator could not supply {size} bytes")]
    OutOfMemory { size: usize },

    /// A zero-byte allocation was requested.
    #[error("cannot allocate zero bytes")]
    InvalidSize,

    /// Element access past the end of a shared handle.
    #[error("index {index} out of range for handle holding {len} elements")]
    OutOfRange { index: usize, len: usize },

    /// A typed request needs stricter alignment than pooled slots provide.
    #[error("alignment {align} exceeds the supported maximum of {max}")]
    UnsupportedAlignment { align: usize, max: usize },

    /// A pool set was configured with an unusable shape.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// The process-wide router was configured after it had already been built.
    #[error("memory router already initialized")]
    AlreadyInitialized,
}
