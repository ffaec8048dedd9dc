//! End-to-end issuance scenarios against the in-memory ledger, cache and locks.

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{CouponId, EventId, MemberId, Money};
use coordination::{AdmissionGate, InMemoryDedupCache, InMemoryLockService};
use domain::{Coupon, Discount, Event, EventStatus, MemberCouponStatus};
use futures_util::future::join_all;
use issuance::{CouponIssuanceGuard, EventCouponService, IssuanceError};
use ledger::{InMemoryLedger, Ledger, LedgerTx};

type Guard = CouponIssuanceGuard<InMemoryLedger, InMemoryDedupCache, InMemoryLockService>;

fn coupon(id: i64, total: u32, issued: u32) -> Coupon {
    let now = Utc::now();
    Coupon {
        id: CouponId::new(id),
        name: format!("SCARCE-{id}"),
        discount: Discount::Percentage {
            percent: 15,
            max: Some(Money::new(5000)),
        },
        min_order_amount: Some(Money::new(10_000)),
        total_quantity: Some(total),
        issued_quantity: issued,
        starts_at: now - Duration::days(1),
        ends_at: now + Duration::days(14),
        active: true,
    }
}

async fn setup(c: Coupon) -> (Arc<Guard>, InMemoryLedger) {
    let ledger = InMemoryLedger::new();
    let mut tx = ledger.begin().await.unwrap();
    tx.insert_coupon(&c).await.unwrap();
    tx.commit().await.unwrap();
    let guard = CouponIssuanceGuard::new(
        ledger.clone(),
        InMemoryDedupCache::new(),
        InMemoryLockService::new(),
    );
    (Arc::new(guard), ledger)
}

async fn issued(ledger: &InMemoryLedger, id: i64) -> u32 {
    ledger
        .coupon(CouponId::new(id))
        .await
        .unwrap()
        .unwrap()
        .issued_quantity
}

#[tokio::test]
async fn happy_path_then_duplicate() {
    let (guard, ledger) = setup(coupon(10, 10, 3)).await;

    let first = guard.issue(MemberId::new(7), CouponId::new(10)).await.unwrap();
    assert!(!first.duplicate);
    assert_eq!(first.issuance.status, MemberCouponStatus::Available);
    assert_eq!(issued(&ledger, 10).await, 4);

    let second = guard.issue(MemberId::new(7), CouponId::new(10)).await.unwrap();
    assert!(second.duplicate);
    assert_eq!(second.issuance.id, first.issuance.id);
    assert_eq!(issued(&ledger, 10).await, 4);
}

#[tokio::test]
async fn exhausted_coupon_rejects() {
    let (guard, ledger) = setup(coupon(10, 1, 1)).await;
    let err = guard
        .issue(MemberId::new(7), CouponId::new(10))
        .await
        .unwrap_err();
    assert!(matches!(err, IssuanceError::OutOfStock(_)));
    assert_eq!(issued(&ledger, 10).await, 1);
    assert!(ledger.issuances_for_coupon(CouponId::new(10)).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_member_concurrent_requests_issue_once() {
    let (guard, ledger) = setup(coupon(10, 100, 0)).await;

    let tasks = (0..20).map(|_| {
        let guard = Arc::clone(&guard);
        tokio::spawn(async move { guard.issue(MemberId::new(7), CouponId::new(10)).await })
    });
    let outcomes: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert_eq!(outcomes.iter().filter(|o| !o.duplicate).count(), 1);
    let first_id = outcomes[0].issuance.id;
    assert!(outcomes.iter().all(|o| o.issuance.id == first_id));
    assert_eq!(issued(&ledger, 10).await, 1);
    assert_eq!(ledger.issuances_for_coupon(CouponId::new(10)).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn total_is_never_exceeded_under_contention() {
    const TOTAL: u32 = 5;
    const EXTRA: usize = 7;
    let (guard, ledger) = setup(coupon(10, TOTAL, 0)).await;

    let tasks = (0..TOTAL as usize + EXTRA).map(|i| {
        let guard = Arc::clone(&guard);
        tokio::spawn(async move { guard.issue(MemberId::new(100 + i as i64), CouponId::new(10)).await })
    });
    let results: Vec<_> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();

    let ok = results.iter().filter(|r| r.is_ok()).count();
    let out_of_stock = results
        .iter()
        .filter(|r| matches!(r, Err(IssuanceError::OutOfStock(_))))
        .count();
    assert_eq!(ok, TOTAL as usize);
    assert_eq!(out_of_stock, EXTRA);
    assert_eq!(issued(&ledger, 10).await, TOTAL);
    assert_eq!(ledger.issuances_for_coupon(CouponId::new(10)).len(), TOTAL as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_event_claims_never_both_pass_the_gate() {
    let (guard, ledger) = setup(coupon(10, 100, 0)).await;
    let now = Utc::now();
    let mut tx = ledger.begin().await.unwrap();
    tx.insert_event(&Event {
        id: EventId::new(3),
        title: "Flash sale".to_string(),
        status: EventStatus::Open,
        public: true,
        limit_per_user: 1,
        starts_at: now - Duration::hours(1),
        ends_at: now + Duration::hours(1),
        coupon_id: Some(CouponId::new(10)),
    })
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let guard = Arc::into_inner(guard).unwrap();
    let service = Arc::new(EventCouponService::new(guard, AdmissionGate::default()));

    let tasks = (0..10).map(|_| {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.claim(EventId::new(3), MemberId::new(7)).await })
    });
    let results: Vec<_> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();

    let fresh = results
        .iter()
        .filter(|r| matches!(r, Ok(o) if !o.duplicate))
        .count();
    assert_eq!(fresh, 1);
    assert!(results.iter().all(|r| match r {
        Ok(_) => true,
        Err(e) => matches!(e, IssuanceError::EntryConflict { .. }),
    }));
    assert_eq!(issued(&ledger, 10).await, 1);
}
