//! Error types for the pipeline core.
//!
//! Pool errors are local: the caller decides whether to fall back or fail.
//! Pipeline errors fan out verbatim to every consumer attached to a computation.

use thiserror::Error;

/// Errors raised by a [`BucketedPool`](crate::memory::BucketedPool).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("Invalid pool request size: {size}")]
    InvalidSize { size: usize },

    #[error(
        "Pool hard cap violation: hard cap {hard_cap} bytes, used {used} bytes, \
         free {free} bytes, requested {requested} bytes"
    )]
    PoolSizeViolation {
        hard_cap: usize,
        used: usize,
        free: usize,
        requested: usize,
    },

    #[error("Allocation of {bucketed_size} bytes failed: {reason}")]
    AllocationFailed { bucketed_size: usize, reason: String },
}

impl From<PoolError> for std::io::Error {
    fn from(err: PoolError) -> Self {
        let kind = match err {
            PoolError::InvalidSize { .. } => std::io::ErrorKind::InvalidInput,
            PoolError::PoolSizeViolation { .. } | PoolError::AllocationFailed { .. } => {
                std::io::ErrorKind::OutOfMemory
            }
        };
        std::io::Error::new(kind, err)
    }
}

/// Errors delivered to pipeline consumers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Producer {producer} failed: {reason}")]
    Producer { producer: String, reason: String },
}

impl PipelineError {
    /// Cancellation is surfaced through `on_cancellation`, never as a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true if a fallback (e.g. an unpooled allocation) is reasonable.
    pub fn is_capacity_error(&self) -> bool {
        matches!(self, Self::Pool(PoolError::PoolSizeViolation { .. }))
    }
}
