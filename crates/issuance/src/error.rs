use common::{CouponId, ErrorClass, EventId, MemberId};
use coordination::LockError;
use domain::CouponError;
use ledger::LedgerError;
use thiserror::Error;

/// Errors returned by coupon issuance and event claims.
///
/// Lock contention of any kind surfaces as [`IssuanceError::TooManyRequests`];
/// callers may retry it. Duplicates are not errors.
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("Coupon {0} not found")]
    CouponNotFound(CouponId),

    #[error("Coupon {0} is not issuable")]
    NotIssuable(CouponId),

    #[error("Coupon {0} is outside its validity window")]
    OutOfWindow(CouponId),

    #[error("Coupon {0} is out of stock")]
    OutOfStock(CouponId),

    #[error("Member {member_id} reached the limit of {limit} for coupon {coupon_id}")]
    LimitExceeded {
        coupon_id: CouponId,
        member_id: MemberId,
        limit: u32,
    },

    #[error("Too many concurrent requests on {resource}")]
    TooManyRequests { resource: String },

    #[error("Member {member_id} already has a claim in flight for event {event_id}")]
    EntryConflict {
        event_id: EventId,
        member_id: MemberId,
    },

    #[error("Event {0} not found")]
    EventNotFound(EventId),

    #[error("Event {0} is not open")]
    EventNotOpen(EventId),

    #[error("Event {0} has no coupon assigned")]
    EventCouponNotAssigned(EventId),

    #[error("Issuance record error: {0}")]
    Record(CouponError),

    #[error("Lock store unavailable: {0}")]
    LockUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(#[source] LedgerError),
}

impl IssuanceError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            IssuanceError::CouponNotFound(_) => "COUPON_NOT_FOUND",
            IssuanceError::NotIssuable(_) => "COUPON_NOT_ISSUABLE",
            IssuanceError::OutOfWindow(_) => "COUPON_OUT_OF_WINDOW",
            IssuanceError::OutOfStock(_) => "COUPON_OUT_OF_STOCK",
            IssuanceError::LimitExceeded { .. } => "COUPON_LIMIT_EXCEEDED",
            IssuanceError::TooManyRequests { .. } => "TOO_MANY_REQUESTS",
            IssuanceError::EntryConflict { .. } => "EVENT_ENTRY_CONFLICT",
            IssuanceError::EventNotFound(_) => "EVENT_NOT_FOUND",
            IssuanceError::EventNotOpen(_) => "EVENT_NOT_OPEN",
            IssuanceError::EventCouponNotAssigned(_) => "EVENT_COUPON_NOT_ASSIGNED",
            IssuanceError::Record(_) => "COUPON_RECORD_INVALID",
            IssuanceError::LockUnavailable(_) => "LOCK_UNAVAILABLE",
            IssuanceError::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            IssuanceError::CouponNotFound(_) | IssuanceError::EventNotFound(_) => {
                ErrorClass::NotFound
            }
            IssuanceError::TooManyRequests { .. } | IssuanceError::EntryConflict { .. } => {
                ErrorClass::Conflict
            }
            IssuanceError::NotIssuable(_)
            | IssuanceError::OutOfWindow(_)
            | IssuanceError::OutOfStock(_)
            | IssuanceError::LimitExceeded { .. }
            | IssuanceError::EventNotOpen(_)
            | IssuanceError::EventCouponNotAssigned(_)
            | IssuanceError::Record(_) => ErrorClass::InvariantViolated,
            IssuanceError::LockUnavailable(_) | IssuanceError::Storage(_) => ErrorClass::Internal,
        }
    }
}

impl From<CouponError> for IssuanceError {
    fn from(e: CouponError) -> Self {
        match e {
            CouponError::NotActive(id) => IssuanceError::NotIssuable(id),
            CouponError::OutOfWindow(id) => IssuanceError::OutOfWindow(id),
            CouponError::OutOfStock(id) => IssuanceError::OutOfStock(id),
            other @ CouponError::InvalidStatus { .. } => IssuanceError::Record(other),
        }
    }
}

impl From<LedgerError> for IssuanceError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::LockTimeout { resource } => IssuanceError::TooManyRequests { resource },
            other => IssuanceError::Storage(other),
        }
    }
}

impl From<LockError> for IssuanceError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Busy { key } => IssuanceError::TooManyRequests { resource: key },
            LockError::Store(msg) => IssuanceError::LockUnavailable(msg),
        }
    }
}

/// Result type for issuance operations.
pub type Result<T> = std::result::Result<T, IssuanceError>;
