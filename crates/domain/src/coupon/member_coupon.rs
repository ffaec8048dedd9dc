//! Issuance records: one coupon unit held by one member.

use chrono::{DateTime, Utc};
use common::{CouponId, IssuanceId, MemberId, OrderId};
use serde::{Deserialize, Serialize};

use super::CouponError;

/// Lifecycle of an issued coupon unit.
///
/// ```text
/// Available ──use──► Used
///     │  ▲             │
///     │  └──release────┘
///     └──(past expiry)──► Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MemberCouponStatus {
    #[default]
    Available,
    Used,
    Expired,
}

impl MemberCouponStatus {
    /// Available and used records both occupy the member's single slot for a coupon.
    pub fn is_active(&self) -> bool {
        matches!(self, MemberCouponStatus::Available | MemberCouponStatus::Used)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemberCouponStatus::Available => "AVAILABLE",
            MemberCouponStatus::Used => "USED",
            MemberCouponStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AVAILABLE" => Some(MemberCouponStatus::Available),
            "USED" => Some(MemberCouponStatus::Used),
            "EXPIRED" => Some(MemberCouponStatus::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemberCouponStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An issuance record about to be inserted; the ledger assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMemberCoupon {
    pub coupon_id: CouponId,
    pub member_id: MemberId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A coupon unit issued to a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberCoupon {
    pub id: IssuanceId,
    pub coupon_id: CouponId,
    pub member_id: MemberId,
    pub status: MemberCouponStatus,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_order_id: Option<OrderId>,
    pub used_at: Option<DateTime<Utc>>,
}

impl MemberCoupon {
    /// Builds the stored record from an insert request.
    pub fn from_new(id: IssuanceId, new: NewMemberCoupon) -> Self {
        Self {
            id,
            coupon_id: new.coupon_id,
            member_id: new.member_id,
            status: MemberCouponStatus::Available,
            issued_at: new.issued_at,
            expires_at: new.expires_at,
            used_order_id: None,
            used_at: None,
        }
    }

    /// Status as observed at `now`. An available unit past its expiry reads as expired.
    pub fn effective_status(&self, now: DateTime<Utc>) -> MemberCouponStatus {
        match self.status {
            MemberCouponStatus::Available if now > self.expires_at => MemberCouponStatus::Expired,
            status => status,
        }
    }

    /// Persists lazy expiry into the record. Returns true if the status changed.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == MemberCouponStatus::Available && now > self.expires_at {
            self.status = MemberCouponStatus::Expired;
            return true;
        }
        false
    }

    /// Consumes the unit for `order_id`.
    pub fn mark_used(&mut self, order_id: OrderId, now: DateTime<Utc>) -> Result<(), CouponError> {
        let status = self.effective_status(now);
        if status != MemberCouponStatus::Available {
            return Err(CouponError::InvalidStatus {
                id: self.id,
                status,
                action: "use",
            });
        }
        self.status = MemberCouponStatus::Used;
        self.used_order_id = Some(order_id);
        self.used_at = Some(now);
        Ok(())
    }

    /// Returns a unit consumed by `order_id` to the member.
    pub fn release(&mut self, order_id: OrderId) -> Result<(), CouponError> {
        if self.status != MemberCouponStatus::Used || self.used_order_id != Some(order_id) {
            return Err(CouponError::InvalidStatus {
                id: self.id,
                status: self.status,
                action: "release",
            });
        }
        self.status = MemberCouponStatus::Available;
        self.used_order_id = None;
        self.used_at = None;
        Ok(())
    }
}
