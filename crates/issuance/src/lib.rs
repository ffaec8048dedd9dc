//! Coupon issuance under contention.
//!
//! [`CouponIssuanceGuard`] layers the dedup cache, the per-member lease lock
//! and the ledger's coupon row lock so that a member ends up with at most one
//! live unit per coupon and a coupon never issues past its total.
//! [`EventCouponService`] puts the admission gate in front of the guard for
//! event-linked claims. [`EventStatusSweeper`] moves event statuses forward on
//! a timer.

pub mod error;
pub mod event_coupon;
pub mod guard;
pub mod sweeper;

pub use error::{IssuanceError, Result};
pub use event_coupon::EventCouponService;
pub use guard::{CouponIssuanceGuard, IssuanceConfig, IssuanceOutcome};
pub use sweeper::EventStatusSweeper;
