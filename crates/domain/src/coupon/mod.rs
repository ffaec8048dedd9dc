//! Coupon definitions and the per-member issuance records.

mod member_coupon;

pub use member_coupon::{MemberCoupon, MemberCouponStatus, NewMemberCoupon};

use chrono::{DateTime, Utc};
use common::{CouponId, IssuanceId, Money};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during coupon operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CouponError {
    /// The coupon has been deactivated.
    #[error("Coupon {0} is not active")]
    NotActive(CouponId),

    /// `now` falls outside `[starts_at, ends_at]`.
    #[error("Coupon {0} is outside its validity window")]
    OutOfWindow(CouponId),

    /// Every unit has been issued.
    #[error("Coupon {0} is out of stock")]
    OutOfStock(CouponId),

    /// Member coupon is not in a state that allows the action.
    #[error("Member coupon {id} cannot {action} from {status} status")]
    InvalidStatus {
        id: IssuanceId,
        status: MemberCouponStatus,
        action: &'static str,
    },
}

/// How much a coupon takes off an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Discount {
    /// Fixed amount off.
    Amount { amount: Money },
    /// Percentage off, optionally capped.
    Percentage { percent: u8, max: Option<Money> },
}

/// A limited-quantity coupon definition.
///
/// `issued_quantity` only grows and never exceeds `total_quantity`. It must
/// only be changed while holding the coupon row lock in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: CouponId,
    pub name: String,
    pub discount: Discount,
    pub min_order_amount: Option<Money>,
    /// `None` means unlimited.
    pub total_quantity: Option<u32>,
    pub issued_quantity: u32,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub active: bool,
}

impl Coupon {
    /// Checks that a new unit may be issued at `now`.
    ///
    /// Checks run in a fixed order: active flag, validity window, remaining stock.
    pub fn validate_issuable(&self, now: DateTime<Utc>) -> Result<(), CouponError> {
        if !self.active {
            return Err(CouponError::NotActive(self.id));
        }
        if now < self.starts_at || now > self.ends_at {
            return Err(CouponError::OutOfWindow(self.id));
        }
        if self.is_exhausted() {
            return Err(CouponError::OutOfStock(self.id));
        }
        Ok(())
    }

    /// Increments the issued counter by one.
    pub fn increase_issued(&mut self) -> Result<(), CouponError> {
        if self.is_exhausted() {
            return Err(CouponError::OutOfStock(self.id));
        }
        self.issued_quantity += 1;
        Ok(())
    }

    /// Units left to issue, or `None` when unlimited.
    pub fn remaining(&self) -> Option<u32> {
        self.total_quantity
            .map(|total| total.saturating_sub(self.issued_quantity))
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == Some(0)
    }

    /// Discount granted on an order of `order_amount`.
    ///
    /// Zero when the order is below the minimum amount. Never exceeds the order amount.
    pub fn discount_for(&self, order_amount: Money) -> Money {
        if let Some(min) = self.min_order_amount
            && order_amount < min
        {
            return Money::zero();
        }
        let discount = match self.discount {
            Discount::Amount { amount } => amount,
            Discount::Percentage { percent, max } => {
                let raw = order_amount.percent(percent);
                match max {
                    Some(max) if raw > max => max,
                    _ => raw,
                }
            }
        };
        discount.min(order_amount)
    }

    /// Time until the coupon stops being valid, zero if already past.
    pub fn issuance_ttl(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.ends_at - now).to_std().unwrap_or_default()
    }
}
