//! Domain layer for the marketplace coordination system.
//!
//! This crate holds the aggregates that compete for scarce resources and the
//! state machines that govern them:
//! - `Coupon` and `MemberCoupon` (limited issuance, one record per member)
//! - `Event` (promotion window that gates coupon claims)
//! - `Order` with `OrderStatus` transitions
//! - `Payment` with an append-only status log
//! - `Inventory` counters that never go negative
//!
//! Nothing here performs I/O. Callers pass `now` explicitly and persist through
//! the ledger while holding the relevant row locks.

pub mod coupon;
pub mod event;
pub mod inventory;
pub mod order;
pub mod payment;

pub use coupon::{Coupon, CouponError, Discount, MemberCoupon, MemberCouponStatus, NewMemberCoupon};
pub use event::{Event, EventStatus};
pub use inventory::{Inventory, InventoryError};
pub use order::{Order, OrderAction, OrderError, OrderLine, OrderStatus};
pub use payment::{NewPayment, Payment, PaymentError, PaymentLogEntry, PaymentStatus};
