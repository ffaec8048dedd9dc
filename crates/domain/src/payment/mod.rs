//! Payment attempts and their append-only audit log.

mod state;

pub use state::PaymentStatus;

use chrono::{DateTime, Utc};
use common::{Money, OrderId, PaymentId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during payment operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PaymentError {
    #[error("Invalid payment transition: {from} -> {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    /// Payment amount must be positive.
    #[error("Invalid payment amount: {0}")]
    InvalidAmount(Money),

    /// Approval requires the provider's transaction id.
    #[error("Provider transaction id is required for approval")]
    MissingProviderTransaction,
}

/// One status transition recorded against a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentLogEntry {
    /// Status the payment moved to.
    pub status: PaymentStatus,
    /// Who drove the transition (`saga`, `reconciler`, `member:<id>`).
    pub actor: String,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// A payment about to be inserted; the ledger assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    pub order_id: OrderId,
    pub amount: Money,
    pub provider: String,
    pub payment_key: String,
    pub created_at: DateTime<Utc>,
}

impl NewPayment {
    pub fn new(
        order_id: OrderId,
        amount: Money,
        provider: impl Into<String>,
        payment_key: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, PaymentError> {
        if !amount.is_positive() {
            return Err(PaymentError::InvalidAmount(amount));
        }
        Ok(Self {
            order_id,
            amount,
            provider: provider.into(),
            payment_key: payment_key.into(),
            created_at,
        })
    }
}

/// A payment for one order.
///
/// `amount` never changes after creation and `logs` is append-only: every
/// status transition appends exactly one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub order_id: OrderId,
    amount: Money,
    pub provider: String,
    pub payment_key: String,
    pub status: PaymentStatus,
    pub provider_transaction_id: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    logs: Vec<PaymentLogEntry>,
}

impl Payment {
    /// Builds the stored record from an insert request.
    pub fn from_new(id: PaymentId, new: NewPayment) -> Self {
        Self {
            id,
            order_id: new.order_id,
            amount: new.amount,
            provider: new.provider,
            payment_key: new.payment_key,
            status: PaymentStatus::Pending,
            provider_transaction_id: None,
            approved_at: None,
            created_at: new.created_at,
            logs: Vec::new(),
        }
    }

    /// Rebuilds a payment loaded from storage.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: PaymentId,
        order_id: OrderId,
        amount: Money,
        provider: String,
        payment_key: String,
        status: PaymentStatus,
        provider_transaction_id: Option<String>,
        approved_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
        logs: Vec<PaymentLogEntry>,
    ) -> Self {
        Self {
            id,
            order_id,
            amount,
            provider,
            payment_key,
            status,
            provider_transaction_id,
            approved_at,
            created_at,
            logs,
        }
    }

    pub fn amount(&self) -> Money {
        self.amount
    }

    pub fn logs(&self) -> &[PaymentLogEntry] {
        &self.logs
    }

    pub fn approve(
        &mut self,
        provider_transaction_id: impl Into<String>,
        actor: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), PaymentError> {
        let tx_id = provider_transaction_id.into();
        if tx_id.trim().is_empty() {
            return Err(PaymentError::MissingProviderTransaction);
        }
        self.move_to(PaymentStatus::Approved, actor.into(), None, at)?;
        self.provider_transaction_id = Some(tx_id);
        self.approved_at = Some(at);
        Ok(())
    }

    pub fn fail(
        &mut self,
        reason: impl Into<String>,
        actor: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), PaymentError> {
        self.move_to(PaymentStatus::Failed, actor.into(), Some(reason.into()), at)
    }

    pub fn cancel(
        &mut self,
        reason: impl Into<String>,
        actor: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), PaymentError> {
        self.move_to(PaymentStatus::Cancelled, actor.into(), Some(reason.into()), at)
    }

    fn move_to(
        &mut self,
        next: PaymentStatus,
        actor: String,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), PaymentError> {
        if !self.status.can_transition_to(next) {
            return Err(PaymentError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.logs.push(PaymentLogEntry {
            status: next,
            actor,
            reason,
            at,
        });
        Ok(())
    }
}
