//! Saga error types.

use common::{ErrorClass, IssuanceId, MemberId, Money, OptionId, OrderId};
use domain::{CouponError, InventoryError, OrderError, PaymentError};
use ledger::LedgerError;
use serde::Serialize;
use thiserror::Error;

use crate::gateway::GatewayError;

/// One order line that cannot be fulfilled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shortfall {
    pub option_id: OptionId,
    pub requested: u32,
    pub available: u32,
    /// False when the option is no longer on sale.
    pub listed: bool,
}

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("Order {order_id} does not belong to member {member_id}")]
    NotOrderOwner {
        order_id: OrderId,
        member_id: MemberId,
    },

    /// Covers repeated completion of an already completed order.
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    #[error("Payment amount {actual} does not match payable amount {expected}")]
    AmountMismatch { expected: Money, actual: Money },

    /// Every line that fell short, collected before anything was deducted.
    #[error("Insufficient stock for {} option(s)", .0.len())]
    InsufficientStock(Vec<Shortfall>),

    #[error("Member coupon not found: {0}")]
    MemberCouponNotFound(IssuanceId),

    #[error("No payment recorded for order {0}")]
    PaymentNotFound(OrderId),

    #[error("Payment error: {0}")]
    Payment(#[from] GatewayError),

    #[error("Payment record error: {0}")]
    PaymentRecord(#[from] PaymentError),

    #[error("Coupon error: {0}")]
    Coupon(#[from] CouponError),

    #[error("Inventory error: {0}")]
    Stock(#[from] InventoryError),

    /// The order's payment is still being confirmed.
    #[error("Payment for order {0} is still being confirmed")]
    PaymentInProgress(OrderId),

    #[error("Too many concurrent requests on {resource}")]
    TooManyRequests { resource: String },

    #[error("Storage error: {0}")]
    Storage(#[source] LedgerError),
}

impl SagaError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            SagaError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            SagaError::NotOrderOwner { .. } => "NOT_ORDER_OWNER",
            SagaError::Order(OrderError::InvalidTransition { .. }) => "INVALID_ORDER_TRANSITION",
            SagaError::Order(_) => "INVALID_ORDER",
            SagaError::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            SagaError::InsufficientStock(_) => "INSUFFICIENT_STOCK",
            SagaError::MemberCouponNotFound(_) => "MEMBER_COUPON_NOT_FOUND",
            SagaError::PaymentNotFound(_) => "PAYMENT_NOT_FOUND",
            SagaError::Payment(GatewayError::Terminal(_)) => "PAYMENT_REJECTED",
            SagaError::Payment(_) => "PAYMENT_UNAVAILABLE",
            SagaError::PaymentRecord(_) => "INVALID_PAYMENT_STATE",
            SagaError::Coupon(_) => "INVALID_COUPON_STATE",
            SagaError::Stock(_) => "INVALID_STOCK_CHANGE",
            SagaError::PaymentInProgress(_) => "PAYMENT_IN_PROGRESS",
            SagaError::TooManyRequests { .. } => "TOO_MANY_REQUESTS",
            SagaError::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SagaError::OrderNotFound(_)
            | SagaError::MemberCouponNotFound(_)
            | SagaError::PaymentNotFound(_) => ErrorClass::NotFound,
            SagaError::NotOrderOwner { .. } => ErrorClass::Forbidden,
            SagaError::Order(_)
            | SagaError::AmountMismatch { .. }
            | SagaError::InsufficientStock(_)
            | SagaError::PaymentRecord(_)
            | SagaError::Coupon(_)
            | SagaError::Stock(_) => ErrorClass::InvariantViolated,
            SagaError::Payment(GatewayError::Terminal(_)) => ErrorClass::ExternalTerminal,
            SagaError::Payment(_) => ErrorClass::ExternalTransient,
            SagaError::PaymentInProgress(_) | SagaError::TooManyRequests { .. } => {
                ErrorClass::Conflict
            }
            SagaError::Storage(_) => ErrorClass::Internal,
        }
    }
}

impl From<LedgerError> for SagaError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::LockTimeout { resource } => SagaError::TooManyRequests { resource },
            other => SagaError::Storage(other),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{OrderAction, OrderStatus};

    #[test]
    fn test_repeated_completion_is_an_invariant_violation() {
        let err = SagaError::from(OrderError::InvalidTransition {
            from: OrderStatus::Completed,
            action: OrderAction::Complete,
        });
        assert_eq!(err.code(), "INVALID_ORDER_TRANSITION");
        assert_eq!(err.class(), ErrorClass::InvariantViolated);
    }

    #[test]
    fn test_gateway_errors_split_by_class() {
        let rejected = SagaError::from(GatewayError::Terminal("card declined".into()));
        assert_eq!(rejected.class(), ErrorClass::ExternalTerminal);
        let exhausted = SagaError::from(GatewayError::Exhausted {
            attempts: 3,
            last: "502".into(),
        });
        assert_eq!(exhausted.class(), ErrorClass::ExternalTransient);
        assert!(exhausted.class().is_retryable());
    }

    #[test]
    fn test_payment_in_progress_is_retryable() {
        let err = SagaError::PaymentInProgress(OrderId::new(1));
        assert_eq!(err.code(), "PAYMENT_IN_PROGRESS");
        assert!(err.class().is_retryable());
    }

    #[test]
    fn test_row_lock_timeout_is_contention() {
        let err = SagaError::from(LedgerError::LockTimeout {
            resource: "order 1".into(),
        });
        assert_eq!(err.class(), ErrorClass::Conflict);
    }
}
