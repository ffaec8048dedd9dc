//! Coordination error types.

use thiserror::Error;

/// Errors from the dedup cache. Callers treat every variant as a cache miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Dedup cache unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the lease lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Someone else holds the lock and the wait budget ran out.
    #[error("Lock {key} is busy")]
    Busy { key: String },

    /// The lock store could not be reached.
    #[error("Lock store error: {0}")]
    Store(String),
}

impl LockError {
    pub fn is_busy(&self) -> bool {
        matches!(self, LockError::Busy { .. })
    }
}

impl From<redis::RedisError> for LockError {
    fn from(e: redis::RedisError) -> Self {
        LockError::Store(e.to_string())
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Unavailable(e.to_string())
    }
}

/// Errors from the admission gate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    /// The same actor already holds a slot on the resource.
    #[error("Admission slot for resource {resource_id} and actor {actor_id} is taken")]
    Conflict { resource_id: i64, actor_id: i64 },
}
