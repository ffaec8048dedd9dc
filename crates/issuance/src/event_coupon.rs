//! Event-linked coupon claims behind the admission gate.

use chrono::Utc;
use common::{EventId, MemberId};
use coordination::{AdmissionGate, DedupCache, LockService};
use domain::Event;
use ledger::Ledger;

use crate::error::{IssuanceError, Result};
use crate::guard::{CouponIssuanceGuard, IssuanceOutcome};

/// Claims an event's coupon for a member.
///
/// A second claim from the same member on the same event is rejected with
/// [`IssuanceError::EntryConflict`] while the first is still in flight.
pub struct EventCouponService<L, C, K> {
    guard: CouponIssuanceGuard<L, C, K>,
    gate: AdmissionGate,
}

impl<L, C, K> EventCouponService<L, C, K>
where
    L: Ledger,
    C: DedupCache,
    K: LockService,
{
    pub fn new(guard: CouponIssuanceGuard<L, C, K>, gate: AdmissionGate) -> Self {
        Self { guard, gate }
    }

    pub fn guard(&self) -> &CouponIssuanceGuard<L, C, K> {
        &self.guard
    }

    #[tracing::instrument(skip(self))]
    pub async fn claim(&self, event_id: EventId, member_id: MemberId) -> Result<IssuanceOutcome> {
        let token = self
            .gate
            .try_enter(event_id, member_id)
            .map_err(|_| IssuanceError::EntryConflict {
                event_id,
                member_id,
            })?;

        let result = self.claim_admitted(event_id, member_id).await;
        token.release();
        result
    }

    async fn claim_admitted(&self, event_id: EventId, member_id: MemberId) -> Result<IssuanceOutcome> {
        let event = self
            .guard
            .ledger()
            .event(event_id)
            .await?
            .ok_or(IssuanceError::EventNotFound(event_id))?;

        let coupon_id = claimable_coupon(&event)?;
        self.guard
            .issue_with_limit(member_id, coupon_id, Some(event.limit_per_user))
            .await
    }
}

fn claimable_coupon(event: &Event) -> Result<common::CouponId> {
    if !event.is_ongoing(Utc::now()) {
        return Err(IssuanceError::EventNotOpen(event.id));
    }
    event
        .coupon_id
        .ok_or(IssuanceError::EventCouponNotAssigned(event.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use common::{CouponId, Money};
    use coordination::{InMemoryDedupCache, InMemoryLockService};
    use domain::{Coupon, Discount, EventStatus};
    use ledger::{InMemoryLedger, LedgerTx};

    fn open_event(coupon_id: Option<CouponId>) -> Event {
        let now = Utc::now();
        Event {
            id: EventId::new(5),
            title: "Launch week".to_string(),
            status: EventStatus::Open,
            public: true,
            limit_per_user: Event::DEFAULT_LIMIT_PER_USER,
            starts_at: now - Duration::hours(1),
            ends_at: now + Duration::hours(1),
            coupon_id,
        }
    }

    async fn service(event: Event) -> EventCouponService<InMemoryLedger, InMemoryDedupCache, InMemoryLockService> {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        let mut tx = ledger.begin().await.unwrap();
        tx.insert_coupon(&Coupon {
            id: CouponId::new(1),
            name: "LAUNCH".to_string(),
            discount: Discount::Amount {
                amount: Money::new(2000),
            },
            min_order_amount: None,
            total_quantity: Some(100),
            issued_quantity: 0,
            starts_at: now - Duration::days(1),
            ends_at: now + Duration::days(1),
            active: true,
        })
        .await
        .unwrap();
        tx.insert_event(&event).await.unwrap();
        tx.commit().await.unwrap();

        let guard = CouponIssuanceGuard::new(ledger, InMemoryDedupCache::new(), InMemoryLockService::new());
        EventCouponService::new(guard, AdmissionGate::default())
    }

    #[tokio::test]
    async fn test_claim_issues_event_coupon_and_frees_slot() {
        let svc = service(open_event(Some(CouponId::new(1)))).await;
        let outcome = svc.claim(EventId::new(5), MemberId::new(9)).await.unwrap();
        assert!(!outcome.duplicate);
        assert_eq!(outcome.issuance.coupon_id, CouponId::new(1));
        assert_eq!(svc.gate.occupied(), 0);

        let again = svc.claim(EventId::new(5), MemberId::new(9)).await.unwrap();
        assert!(again.duplicate);
    }

    #[tokio::test]
    async fn test_claim_rejected_while_slot_held() {
        let svc = service(open_event(Some(CouponId::new(1)))).await;
        let _in_flight = svc.gate.try_enter(EventId::new(5), MemberId::new(9)).unwrap();

        let err = svc.claim(EventId::new(5), MemberId::new(9)).await.unwrap_err();
        assert_eq!(err.code(), "EVENT_ENTRY_CONFLICT");
        assert!(err.class().is_retryable());
    }

    #[tokio::test]
    async fn test_event_checks() {
        let svc = service(open_event(None)).await;
        let err = svc.claim(EventId::new(5), MemberId::new(9)).await.unwrap_err();
        assert!(matches!(err, IssuanceError::EventCouponNotAssigned(_)));
        assert_eq!(svc.gate.occupied(), 0);

        let err = svc.claim(EventId::new(6), MemberId::new(9)).await.unwrap_err();
        assert!(matches!(err, IssuanceError::EventNotFound(_)));

        let mut paused = open_event(Some(CouponId::new(1)));
        paused.status = EventStatus::Paused;
        let svc = service(paused).await;
        let err = svc.claim(EventId::new(5), MemberId::new(9)).await.unwrap_err();
        assert!(matches!(err, IssuanceError::EventNotOpen(_)));
    }
}
