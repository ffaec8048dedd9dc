//! Coupon issuance guard.
//!
//! Order of defences for one (member, coupon) request:
//!
//! 1. Dedup cache probe. A hit is confirmed against the ledger before it is
//!    returned; an unconfirmed hit is treated as a miss.
//! 2. Per-member lease lock on the coupon.
//! 3. Second cache probe, inside the lock.
//! 4. Coupon row lock in the ledger. Duplicate check, validation, limit
//!    check, counter increment and insert all happen under it.
//! 5. Cache backfill after commit.
//!
//! The ledger is the only authority. The cache and the lease lock cut
//! contention; losing either never produces a second live unit.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::{CouponId, MemberId};
use coordination::{DedupCache, LockKey, LockService, with_lease};
use domain::{Coupon, MemberCoupon, NewMemberCoupon};
use ledger::{Ledger, LedgerTx};
use serde::Serialize;

use crate::error::{IssuanceError, Result};

/// Lock namespace for coupon issuance.
const LOCK_RESOURCE: &str = "coupon";

/// Timing budget for the per-member lease lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuanceConfig {
    /// Longest time to wait for the lease.
    pub lock_wait: Duration,
    /// Lease lifetime if the holder never releases it.
    pub lock_hold: Duration,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(3),
            lock_hold: Duration::from_secs(10),
        }
    }
}

/// Result of a successful issuance request.
///
/// `duplicate` is true when the member already held a live unit; the
/// existing record is returned and nothing was issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuanceOutcome {
    pub issuance: MemberCoupon,
    pub duplicate: bool,
}

impl IssuanceOutcome {
    fn issued(issuance: MemberCoupon) -> Self {
        Self {
            issuance,
            duplicate: false,
        }
    }

    fn duplicate(issuance: MemberCoupon) -> Self {
        Self {
            issuance,
            duplicate: true,
        }
    }
}

/// Issues limited coupons with at most one live unit per member.
pub struct CouponIssuanceGuard<L, C, K> {
    ledger: L,
    cache: C,
    locks: K,
    config: IssuanceConfig,
}

impl<L, C, K> CouponIssuanceGuard<L, C, K>
where
    L: Ledger,
    C: DedupCache,
    K: LockService,
{
    pub fn new(ledger: L, cache: C, locks: K) -> Self {
        Self {
            ledger,
            cache,
            locks,
            config: IssuanceConfig::default(),
        }
    }

    pub fn with_config(mut self, config: IssuanceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Issues one unit of `coupon_id` to `member_id`, or returns the unit the
    /// member already holds.
    pub async fn issue(&self, member_id: MemberId, coupon_id: CouponId) -> Result<IssuanceOutcome> {
        self.issue_with_limit(member_id, coupon_id, None).await
    }

    /// Like [`issue`](Self::issue), but also rejects the request once the
    /// member holds `limit` records of any status for the coupon.
    #[tracing::instrument(skip(self))]
    pub async fn issue_with_limit(
        &self,
        member_id: MemberId,
        coupon_id: CouponId,
        limit: Option<u32>,
    ) -> Result<IssuanceOutcome> {
        let started = Instant::now();
        let result = self.guarded_issue(member_id, coupon_id, limit).await;

        let outcome = match &result {
            Ok(o) if o.duplicate => "duplicate",
            Ok(_) => "issued",
            Err(e) => e.code(),
        };
        metrics::counter!("coupon_issuance_total", "outcome" => outcome).increment(1);
        metrics::histogram!("coupon_issuance_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn guarded_issue(
        &self,
        member_id: MemberId,
        coupon_id: CouponId,
        limit: Option<u32>,
    ) -> Result<IssuanceOutcome> {
        if let Some(existing) = self.confirmed_cache_hit(member_id, coupon_id).await? {
            return Ok(IssuanceOutcome::duplicate(existing));
        }

        let key = LockKey::new(LOCK_RESOURCE, coupon_id, member_id);
        with_lease(
            &self.locks,
            &key,
            self.config.lock_wait,
            self.config.lock_hold,
            || self.issue_locked(member_id, coupon_id, limit),
        )
        .await
    }

    async fn issue_locked(
        &self,
        member_id: MemberId,
        coupon_id: CouponId,
        limit: Option<u32>,
    ) -> Result<IssuanceOutcome> {
        if let Some(existing) = self.confirmed_cache_hit(member_id, coupon_id).await? {
            return Ok(IssuanceOutcome::duplicate(existing));
        }

        let now = Utc::now();
        let mut tx = self.ledger.begin().await?;
        let mut coupon = tx
            .coupon_for_update(coupon_id)
            .await?
            .ok_or(IssuanceError::CouponNotFound(coupon_id))?;

        if let Some(mut existing) = tx.find_active_issuance(member_id, coupon_id).await? {
            if existing.expire_if_due(now) {
                tracing::debug!(issuance_id = %existing.id, "Expiring lapsed unit before reissue");
                tx.save_issuance(&existing).await?;
            } else {
                tx.rollback().await?;
                self.backfill(&coupon, member_id, now).await;
                return Ok(IssuanceOutcome::duplicate(existing));
            }
        }

        coupon.validate_issuable(now)?;

        if let Some(limit) = limit {
            let held = tx.count_issuances(member_id, coupon_id).await?;
            if held >= limit {
                return Err(IssuanceError::LimitExceeded {
                    coupon_id,
                    member_id,
                    limit,
                });
            }
        }

        coupon.increase_issued()?;
        tx.save_coupon(&coupon).await?;

        let inserted = tx
            .insert_issuance(NewMemberCoupon {
                coupon_id,
                member_id,
                issued_at: now,
                expires_at: coupon.ends_at,
            })
            .await;
        let issuance = match inserted {
            Ok(issuance) => issuance,
            Err(e) if e.is_unique_violation() => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::debug!(error = %rollback_err, "Rollback after unique violation failed");
                }
                return self.resolve_insert_race(member_id, coupon_id).await;
            }
            Err(e) => return Err(e.into()),
        };
        tx.commit().await?;

        tracing::info!(
            issuance_id = %issuance.id,
            issued = coupon.issued_quantity,
            "Coupon issued"
        );
        self.backfill(&coupon, member_id, now).await;
        Ok(IssuanceOutcome::issued(issuance))
    }

    /// Another transaction won the unique slot. Return its record, or ask
    /// the caller to retry if it is not visible yet.
    async fn resolve_insert_race(
        &self,
        member_id: MemberId,
        coupon_id: CouponId,
    ) -> Result<IssuanceOutcome> {
        match self.ledger.find_active_issuance(member_id, coupon_id).await? {
            Some(winner) => Ok(IssuanceOutcome::duplicate(winner)),
            None => Err(IssuanceError::TooManyRequests {
                resource: LockKey::new(LOCK_RESOURCE, coupon_id, member_id).to_string(),
            }),
        }
    }

    /// Probes the cache and confirms a hit against committed ledger state.
    ///
    /// Cache failures are treated as a miss.
    async fn confirmed_cache_hit(
        &self,
        member_id: MemberId,
        coupon_id: CouponId,
    ) -> Result<Option<MemberCoupon>> {
        match self.cache.probe(coupon_id, member_id).await {
            Ok(false) => Ok(None),
            Ok(true) => {
                let now = Utc::now();
                let found = self
                    .ledger
                    .find_active_issuance(member_id, coupon_id)
                    .await?
                    .filter(|record| record.effective_status(now).is_active());
                if found.is_none() {
                    tracing::debug!("Stale dedup cache hit, continuing as miss");
                }
                Ok(found)
            }
            Err(e) => {
                metrics::counter!("dedup_cache_errors_total").increment(1);
                tracing::warn!(error = %e, "Dedup cache probe failed, continuing as miss");
                Ok(None)
            }
        }
    }

    async fn backfill(&self, coupon: &Coupon, member_id: MemberId, now: DateTime<Utc>) {
        let ttl = coupon.issuance_ttl(now);
        if ttl.is_zero() {
            return;
        }
        if let Err(e) = self.cache.record(coupon.id, member_id, ttl).await {
            metrics::counter!("dedup_cache_errors_total").increment(1);
            tracing::warn!(error = %e, "Dedup cache backfill failed");
        }
    }
}
