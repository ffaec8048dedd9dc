//! Coordination primitives placed in front of the ledger.
//!
//! - [`DedupCache`]: advisory "already issued" set, fail-open.
//! - [`LockService`]: per-identity lease lock with bounded wait and hold.
//! - [`AdmissionGate`]: in-process put-if-absent slots with a hold timeout.
//!
//! None of these are authoritative. They cut contention before it reaches
//! the ledger's row locks; correctness still rests on the ledger.

pub mod cache;
pub mod error;
pub mod gate;
pub mod lock;

pub use cache::{DedupCache, InMemoryDedupCache, RedisDedupCache};
pub use error::{CacheError, GateError, LockError};
pub use gate::{AdmissionGate, AdmissionToken, DEFAULT_GATE_HOLD};
pub use lock::{InMemoryLockService, Lease, LockKey, LockService, RedisLockService, with_lease};
