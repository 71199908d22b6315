//! The cache related error.

use std::sync::Arc;

use thiserror::Error;

use super::block::BlockId;

/// The result of cache operation.
pub type CacheResult<T> = Result<T, CacheError>;

/// An error occurs in cache operation.
///
/// The error is cloneable, because a single failed read is reported to every
/// caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The backend failed to read or write a block
    #[error("I/O error on block {id:?}: {source}")]
    Io {
        /// The block being read, `None` for a write without identity
        id: Option<BlockId>,
        /// The error reported by the backend
        source: Arc<std::io::Error>,
    },
    /// The cache failed to allocate a data region
    #[error("Out of memory, failed to allocate {size} bytes")]
    OutOfMemory {
        /// The size of the failed allocation
        size: usize,
    },
    /// The cache is short of memory, the reservation should be retried
    /// once it drained
    #[error("Reservation of {reserve} bytes throttled")]
    Throttled {
        /// The size of the refused reservation
        reserve: usize,
    },
    /// The block is not cached, and the caller asked not to read it
    #[error("Block {0} is not cached")]
    NotCached(BlockId),
    /// The block was freed while a read on it was in flight
    #[error("Block {0} was freed during read")]
    FreedInRead(BlockId),
    /// The buffer is shared with the cache and must be released before
    /// mutation
    #[error("The buffer is frozen")]
    Frozen,
    /// The data of the buffer was evicted from the cache
    #[error("The buffer was evicted")]
    Evicted,
    /// Argument is invalid
    #[error("Argument is invalid, context is {context:#?}")]
    ArgumentInvalid {
        /// Context of the error
        context: Vec<String>,
    },
    /// A internal cache error.
    #[error("{0}")]
    Internal(Arc<anyhow::Error>),
}

impl CacheError {
    /// Wraps an I/O error reported by the backend.
    #[must_use]
    pub fn io(id: Option<BlockId>, err: std::io::Error) -> Self {
        Self::Io {
            id,
            source: Arc::new(err),
        }
    }
}

impl From<tokio::task::JoinError> for CacheError {
    #[inline]
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(Arc::new(anyhow::Error::new(err)))
    }
}
