//! Shared types used across the marketplace coordination crates.

pub mod error;
pub mod money;
pub mod types;

pub use error::ErrorClass;
pub use money::Money;
pub use types::{CouponId, EventId, IssuanceId, MemberId, OptionId, OrderId, PaymentId};
