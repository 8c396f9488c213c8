use thiserror::Error;

/// Result type local to arbor-mem.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(
        "allocator capacity {allocator_capacity} must equal manager capacity {manager_capacity}"
    )]
    AllocatorMismatch {
        allocator_capacity: u64,
        manager_capacity: u64,
    },

    #[error("duplicate pool name found: '{0}'")]
    DuplicatePool(String),

    #[error("operation '{op}' is not supported on pool '{pool}'")]
    UnsupportedOp { pool: String, op: &'static str },

    #[error("capacity authority is gone for pool '{0}'")]
    AuthorityUnavailable(String),

    #[error("memory manager has already been initialized")]
    AlreadyInitialized,

    #[error("memory manager is not initialized")]
    NotInitialized,

    // Backpressure, not a bug: the caller must spill, retry, or abort.
    #[error(
        "capacity exceeded for pool '{pool}': requested {requested} bytes, granted {granted}, used {used}"
    )]
    CapacityExceeded {
        pool: String,
        requested: u64,
        granted: u64,
        used: u64,
    },
}

impl From<arbor_core::Error> for Error {
    fn from(e: arbor_core::Error) -> Self {
        Error::Config(e.to_string())
    }
}
