//! The authoritative record of every scarce resource.
//!
//! All mutations happen inside a [`LedgerTx`]. Rows read with a
//! `*_for_update` method stay exclusively locked until the transaction commits
//! or is dropped, and lock waits are bounded so contention surfaces as
//! [`LedgerError::LockTimeout`] instead of an unbounded stall.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{LedgerError, Result};
pub use memory::{InMemoryLedger, InMemoryLedgerTx};
pub use postgres::{PostgresLedger, PostgresLedgerTx};
pub use store::{DEFAULT_LOCK_WAIT, Ledger, LedgerTx};
