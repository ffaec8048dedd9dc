use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CouponId, EventId, IssuanceId, MemberId, OptionId, OrderId, PaymentId};
use domain::{Coupon, Event, Inventory, MemberCoupon, NewMemberCoupon, NewPayment, Order, Payment};

use crate::Result;

/// Default bound on how long a transaction waits for a row lock.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(3);

/// Core trait for ledger implementations.
///
/// Read methods on the ledger itself see committed state only and take no
/// locks. Anything that decides on a mutation must go through [`Ledger::begin`].
#[async_trait]
pub trait Ledger: Clone + Send + Sync + 'static {
    type Tx: LedgerTx;

    /// Opens a transaction.
    async fn begin(&self) -> Result<Self::Tx>;

    async fn coupon(&self, id: CouponId) -> Result<Option<Coupon>>;

    async fn event(&self, id: EventId) -> Result<Option<Event>>;

    /// Events the status sweeper may still move forward.
    async fn sweepable_events(&self) -> Result<Vec<Event>>;

    async fn order(&self, id: OrderId) -> Result<Option<Order>>;

    async fn payment(&self, id: PaymentId) -> Result<Option<Payment>>;

    /// Most recent payment created for an order.
    async fn payment_for_order(&self, order_id: OrderId) -> Result<Option<Payment>>;

    async fn inventory(&self, option_id: OptionId) -> Result<Option<Inventory>>;

    async fn member_coupon(&self, id: IssuanceId) -> Result<Option<MemberCoupon>>;

    /// The member's AVAILABLE or USED record for a coupon, if any.
    async fn find_active_issuance(
        &self,
        member_id: MemberId,
        coupon_id: CouponId,
    ) -> Result<Option<MemberCoupon>>;

    /// Payments still PENDING that were created before `created_before`.
    async fn stale_pending_payments(&self, created_before: DateTime<Utc>) -> Result<Vec<Payment>>;
}

/// A unit of work against the ledger.
///
/// Writes become visible to others on [`LedgerTx::commit`]. Dropping the
/// transaction without committing rolls it back and releases its locks.
#[async_trait]
pub trait LedgerTx: Send + Sized {
    async fn insert_coupon(&mut self, coupon: &Coupon) -> Result<()>;
    async fn coupon_for_update(&mut self, id: CouponId) -> Result<Option<Coupon>>;
    async fn save_coupon(&mut self, coupon: &Coupon) -> Result<()>;

    async fn insert_event(&mut self, event: &Event) -> Result<()>;
    async fn event_for_update(&mut self, id: EventId) -> Result<Option<Event>>;
    async fn save_event(&mut self, event: &Event) -> Result<()>;

    async fn insert_order(&mut self, order: &Order) -> Result<()>;
    async fn order_for_update(&mut self, id: OrderId) -> Result<Option<Order>>;
    async fn save_order(&mut self, order: &Order) -> Result<()>;

    async fn insert_inventory(&mut self, inventory: &Inventory) -> Result<()>;
    async fn inventory_for_update(&mut self, option_id: OptionId) -> Result<Option<Inventory>>;
    async fn save_inventory(&mut self, inventory: &Inventory) -> Result<()>;

    async fn insert_payment(&mut self, payment: NewPayment) -> Result<Payment>;
    async fn payment_for_update(&mut self, id: PaymentId) -> Result<Option<Payment>>;
    /// Persists status changes and appends log entries not yet stored.
    async fn save_payment(&mut self, payment: &Payment) -> Result<()>;

    /// Fails with [`crate::LedgerError::UniqueViolation`] if the member already
    /// holds an AVAILABLE or USED record for the coupon.
    async fn insert_issuance(&mut self, issuance: NewMemberCoupon) -> Result<MemberCoupon>;
    async fn member_coupon_for_update(&mut self, id: IssuanceId) -> Result<Option<MemberCoupon>>;
    async fn find_active_issuance(
        &mut self,
        member_id: MemberId,
        coupon_id: CouponId,
    ) -> Result<Option<MemberCoupon>>;
    /// Records of every status the member holds for the coupon.
    async fn count_issuances(&mut self, member_id: MemberId, coupon_id: CouponId) -> Result<u32>;
    async fn save_issuance(&mut self, issuance: &MemberCoupon) -> Result<()>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}
