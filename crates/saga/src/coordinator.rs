//! Fulfillment saga coordinator.

use std::time::Instant;

use chrono::{DateTime, Utc};
use common::{MemberId, Money, OrderId, PaymentId};
use domain::{NewPayment, Order, OrderAction, OrderStatus, Payment, PaymentStatus};
use ledger::{Ledger, LedgerTx};
use serde::Serialize;

use crate::catalog::CatalogReader;
use crate::error::{Result, SagaError, Shortfall};
use crate::gateway::{ConfirmRequest, PaymentGateway, PaymentProvider, Receipt};

/// Actor name recorded on payment log entries written by the saga.
const SAGA_ACTOR: &str = "saga";

/// What happens to the order when payment fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureMode {
    /// Back to PENDING so the member can pay again.
    #[default]
    Rollback,
    /// CANCELLED for good.
    Cancel,
}

impl FailureMode {
    fn action(self) -> OrderAction {
        match self {
            FailureMode::Rollback => OrderAction::Rollback,
            FailureMode::Cancel => OrderAction::Cancel,
        }
    }
}

/// Payment confirmation request for one order.
#[derive(Debug, Clone)]
pub struct ConfirmPayment {
    pub order_id: OrderId,
    pub member_id: MemberId,
    pub amount: Money,
    pub provider: String,
    pub payment_key: String,
    pub on_failure: FailureMode,
}

/// Result of a confirmed payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentReceipt {
    pub order_id: OrderId,
    pub payment_id: PaymentId,
    pub amount: Money,
    pub transaction_id: String,
    pub approved_at: DateTime<Utc>,
}

/// Orchestrates order completion, payment confirmation and compensation.
///
/// All ledger work for one order happens under the order row lock, taken
/// first. Inventory rows are locked in ascending option id order.
pub struct FulfillmentSaga<L, P, C> {
    ledger: L,
    gateway: PaymentGateway<P>,
    catalog: C,
}

impl<L, P, C> FulfillmentSaga<L, P, C>
where
    L: Ledger,
    P: PaymentProvider,
    C: CatalogReader,
{
    pub fn new(ledger: L, gateway: PaymentGateway<P>, catalog: C) -> Self {
        Self {
            ledger,
            gateway,
            catalog,
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn gateway(&self) -> &PaymentGateway<P> {
        &self.gateway
    }

    /// Completes the order and confirms its payment.
    ///
    /// On payment failure the order is compensated and the payment error is
    /// returned. A second call for an already completed order is rejected
    /// with an invalid transition and changes nothing.
    #[tracing::instrument(skip(self, command), fields(order_id = %command.order_id, member_id = %command.member_id))]
    pub async fn confirm_payment(&self, command: ConfirmPayment) -> Result<PaymentReceipt> {
        metrics::counter!("saga_executions_total").increment(1);
        let started = Instant::now();

        let payment = self.reserve(&command).await?;
        tracing::info!(payment_id = %payment.id, "Order completed, confirming payment");

        let request = ConfirmRequest {
            payment_key: command.payment_key.clone(),
            order_id: command.order_id,
            amount: command.amount,
        };
        let result = match self.gateway.confirm(&request).await {
            Ok(receipt) => self.settle(&payment, receipt).await,
            Err(payment_err) => {
                let reason = payment_err.to_string();
                if let Err(compensation_err) = self
                    .run_compensation(command.order_id, &reason, command.on_failure, SAGA_ACTOR)
                    .await
                {
                    metrics::counter!("saga_manual_intervention_total").increment(1);
                    tracing::error!(
                        order_id = %command.order_id,
                        payment_id = %payment.id,
                        original_error = %payment_err,
                        compensation_error = %compensation_err,
                        "Compensation failed, manual intervention required"
                    );
                }
                Err(SagaError::Payment(payment_err))
            }
        };

        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    /// Forward step: one transaction that completes the order, deducts stock,
    /// consumes the coupon and records a PENDING payment.
    async fn reserve(&self, command: &ConfirmPayment) -> Result<Payment> {
        let now = Utc::now();
        let mut tx = self.ledger.begin().await?;

        let mut order = tx
            .order_for_update(command.order_id)
            .await?
            .ok_or(SagaError::OrderNotFound(command.order_id))?;
        if order.member_id != command.member_id {
            return Err(SagaError::NotOrderOwner {
                order_id: order.id,
                member_id: command.member_id,
            });
        }
        order.status.transition(OrderAction::Complete)?;
        let expected = order.payable_amount();
        if command.amount != expected {
            return Err(SagaError::AmountMismatch {
                expected,
                actual: command.amount,
            });
        }

        let mut rows = Vec::with_capacity(order.lines.len());
        let mut shortfalls = Vec::new();
        for line in order.lines_by_option() {
            let stock = tx.inventory_for_update(line.option_id).await?;
            let listed = self.catalog.is_available(line.option_id).await;
            let available = stock.map_or(0, |s| s.available);
            if !listed || available < line.quantity {
                shortfalls.push(Shortfall {
                    option_id: line.option_id,
                    requested: line.quantity,
                    available,
                    listed,
                });
            }
            if let Some(stock) = stock {
                rows.push((stock, line.quantity));
            }
        }
        if !shortfalls.is_empty() {
            tracing::info!(shortfalls = shortfalls.len(), "Order cannot be fulfilled");
            return Err(SagaError::InsufficientStock(shortfalls));
        }

        for (mut stock, quantity) in rows {
            stock.deduct(quantity)?;
            tx.save_inventory(&stock).await?;
        }

        order.apply(OrderAction::Complete, now)?;
        tx.save_order(&order).await?;

        if let Some(issuance_id) = order.member_coupon_id {
            let mut record = tx
                .member_coupon_for_update(issuance_id)
                .await?
                .ok_or(SagaError::MemberCouponNotFound(issuance_id))?;
            record.mark_used(order.id, now)?;
            tx.save_issuance(&record).await?;
        }

        let payment = tx
            .insert_payment(NewPayment::new(
                order.id,
                command.amount,
                command.provider.clone(),
                command.payment_key.clone(),
                now,
            )?)
            .await?;
        tx.commit().await?;
        Ok(payment)
    }

    /// Records the provider's approval. If this fails the provider has
    /// charged the member but the ledger does not show it.
    async fn settle(&self, payment: &Payment, receipt: Receipt) -> Result<PaymentReceipt> {
        match self.record_approval(payment, &receipt).await {
            Ok(approved) => {
                tracing::info!(payment_id = %approved.id, "Payment approved");
                Ok(PaymentReceipt {
                    order_id: approved.order_id,
                    payment_id: approved.id,
                    amount: approved.amount(),
                    transaction_id: receipt.transaction_id,
                    approved_at: receipt.approved_at,
                })
            }
            Err(e) => {
                metrics::counter!("saga_manual_intervention_total").increment(1);
                tracing::error!(
                    order_id = %payment.order_id,
                    payment_id = %payment.id,
                    transaction_id = %receipt.transaction_id,
                    error = %e,
                    "Payment approved by provider but not recorded, manual intervention required"
                );
                Err(e)
            }
        }
    }

    async fn record_approval(&self, payment: &Payment, receipt: &Receipt) -> Result<Payment> {
        let mut tx = self.ledger.begin().await?;
        let mut order = tx
            .order_for_update(payment.order_id)
            .await?
            .ok_or(SagaError::OrderNotFound(payment.order_id))?;
        let mut payment = tx
            .payment_for_update(payment.id)
            .await?
            .ok_or(SagaError::PaymentNotFound(payment.order_id))?;

        payment.approve(receipt.transaction_id.clone(), SAGA_ACTOR, receipt.approved_at)?;
        tx.save_payment(&payment).await?;
        order.mark_settleable(Utc::now());
        tx.save_order(&order).await?;
        tx.commit().await?;
        Ok(payment)
    }

    /// Undoes a completed order whose payment never got approved.
    ///
    /// Returns false when there is nothing to compensate, which makes repeated
    /// calls harmless.
    #[tracing::instrument(skip(self))]
    pub async fn compensate(&self, order_id: OrderId, reason: &str) -> Result<bool> {
        self.run_compensation(order_id, reason, FailureMode::Rollback, SAGA_ACTOR)
            .await
    }

    pub(crate) async fn run_compensation(
        &self,
        order_id: OrderId,
        reason: &str,
        mode: FailureMode,
        actor: &str,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.ledger.begin().await?;
        let mut order = tx
            .order_for_update(order_id)
            .await?
            .ok_or(SagaError::OrderNotFound(order_id))?;
        if order.status != OrderStatus::Completed {
            tracing::debug!(status = %order.status, "Nothing to compensate");
            return Ok(false);
        }

        let mut payment = match self.ledger.payment_for_order(order_id).await? {
            Some(p) => tx.payment_for_update(p.id).await?,
            None => None,
        };
        if let Some(p) = &payment
            && p.status != PaymentStatus::Pending
        {
            tracing::debug!(payment_status = %p.status, "Payment already settled, not compensating");
            return Ok(false);
        }

        self.restore_stock(&mut tx, &order).await?;
        order.apply(mode.action(), now)?;
        tx.save_order(&order).await?;
        self.release_coupon(&mut tx, &order).await?;
        if let Some(p) = payment.as_mut() {
            p.fail(reason, actor, now)?;
            tx.save_payment(p).await?;
        }
        tx.commit().await?;

        metrics::counter!("saga_compensations_total").increment(1);
        tracing::warn!(%order_id, %reason, status = %order.status, "Order compensated");
        Ok(true)
    }

    /// Cancels an order on the member's behalf.
    ///
    /// A PENDING order is simply cancelled. A COMPLETED order also gets its
    /// stock back, its coupon released and its payment cancelled, at the
    /// provider first when it was already approved. While the payment is
    /// still being confirmed the cancel is refused with
    /// [`SagaError::PaymentInProgress`]; the member retries once it settles.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        order_id: OrderId,
        member_id: MemberId,
        reason: &str,
    ) -> Result<Order> {
        let order = self
            .ledger
            .order(order_id)
            .await?
            .ok_or(SagaError::OrderNotFound(order_id))?;
        if order.member_id != member_id {
            return Err(SagaError::NotOrderOwner { order_id, member_id });
        }
        order.status.transition(OrderAction::Cancel)?;

        let mut refunded = None;
        if order.status == OrderStatus::Completed
            && let Some(payment) = self.ledger.payment_for_order(order_id).await?
        {
            match payment.status {
                PaymentStatus::Pending => return Err(SagaError::PaymentInProgress(order_id)),
                PaymentStatus::Approved => {
                    self.gateway.cancel(&payment.payment_key, reason).await?;
                    refunded = Some(payment.id);
                }
                PaymentStatus::Failed | PaymentStatus::Cancelled => {}
            }
        }

        match self.cancel_in_ledger(order_id, member_id, reason, refunded).await {
            Ok(order) => Ok(order),
            Err(e) => {
                if let Some(payment_id) = refunded {
                    metrics::counter!("saga_manual_intervention_total").increment(1);
                    tracing::error!(
                        %order_id,
                        %payment_id,
                        error = %e,
                        "Payment cancelled at provider but order not cancelled, manual intervention required"
                    );
                }
                Err(e)
            }
        }
    }

    /// Ledger half of a member cancel. `refunded` names the payment already
    /// cancelled at the provider, if any.
    async fn cancel_in_ledger(
        &self,
        order_id: OrderId,
        member_id: MemberId,
        reason: &str,
        refunded: Option<PaymentId>,
    ) -> Result<Order> {
        let actor = format!("member:{member_id}");
        let now = Utc::now();
        let mut tx = self.ledger.begin().await?;
        let mut order = tx
            .order_for_update(order_id)
            .await?
            .ok_or(SagaError::OrderNotFound(order_id))?;
        let was_completed = order.status == OrderStatus::Completed;
        order.apply(OrderAction::Cancel, now)?;

        if was_completed {
            // Re-checked under the order lock: a confirmation may have started
            // or finished since the read above.
            if let Some(p) = self.ledger.payment_for_order(order_id).await?
                && let Some(mut payment) = tx.payment_for_update(p.id).await?
            {
                match payment.status {
                    PaymentStatus::Pending => return Err(SagaError::PaymentInProgress(order_id)),
                    PaymentStatus::Approved if refunded != Some(payment.id) => {
                        return Err(SagaError::PaymentInProgress(order_id));
                    }
                    PaymentStatus::Approved => {
                        payment.cancel(reason, actor.as_str(), now)?;
                        tx.save_payment(&payment).await?;
                    }
                    PaymentStatus::Failed | PaymentStatus::Cancelled => {}
                }
            }
            self.restore_stock(&mut tx, &order).await?;
            self.release_coupon(&mut tx, &order).await?;
        }
        tx.save_order(&order).await?;
        tx.commit().await?;

        tracing::info!(%order_id, was_completed, "Order cancelled");
        Ok(order)
    }

    async fn restore_stock(&self, tx: &mut L::Tx, order: &Order) -> Result<()> {
        for line in order.lines_by_option() {
            match tx.inventory_for_update(line.option_id).await? {
                Some(mut stock) => {
                    stock.restore(line.quantity)?;
                    tx.save_inventory(&stock).await?;
                }
                None => {
                    tracing::warn!(option_id = %line.option_id, "Inventory row missing on restore");
                }
            }
        }
        Ok(())
    }

    async fn release_coupon(&self, tx: &mut L::Tx, order: &Order) -> Result<()> {
        let Some(issuance_id) = order.member_coupon_id else {
            return Ok(());
        };
        let mut record = tx
            .member_coupon_for_update(issuance_id)
            .await?
            .ok_or(SagaError::MemberCouponNotFound(issuance_id))?;
        record.release(order.id)?;
        tx.save_issuance(&record).await?;
        Ok(())
    }
}
