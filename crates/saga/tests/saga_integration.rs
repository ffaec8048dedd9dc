//! Integration tests for the order fulfillment saga.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use common::{CouponId, IssuanceId, MemberId, Money, OptionId, OrderId};
use domain::{
    Inventory, MemberCouponStatus, NewMemberCoupon, Order, OrderLine, OrderStatus, PaymentStatus,
};
use ledger::{InMemoryLedger, Ledger, LedgerTx};
use saga::{
    ConfirmPayment, FailureMode, FulfillmentSaga, GatewayError, InMemoryCatalog,
    InMemoryPaymentProvider, PaymentGateway, ProviderError, SagaError,
};

type TestSaga = FulfillmentSaga<InMemoryLedger, InMemoryPaymentProvider, InMemoryCatalog>;

const MEMBER: i64 = 7;

struct TestHarness {
    saga: Arc<TestSaga>,
    ledger: InMemoryLedger,
    provider: InMemoryPaymentProvider,
    catalog: InMemoryCatalog,
}

impl TestHarness {
    fn new() -> Self {
        let ledger = InMemoryLedger::new();
        let provider = InMemoryPaymentProvider::new();
        let catalog = InMemoryCatalog::new();
        let saga = Arc::new(FulfillmentSaga::new(
            ledger.clone(),
            PaymentGateway::new(provider.clone()),
            catalog.clone(),
        ));
        Self {
            saga,
            ledger,
            provider,
            catalog,
        }
    }

    async fn stock(&self, option: i64, available: u32) {
        let mut tx = self.ledger.begin().await.unwrap();
        tx.insert_inventory(&Inventory::new(OptionId::new(option), available))
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    async fn available(&self, option: i64) -> u32 {
        self.ledger
            .inventory(OptionId::new(option))
            .await
            .unwrap()
            .map_or(0, |i| i.available)
    }

    /// Issues a unit of coupon 1 to the test member.
    async fn member_coupon(&self) -> IssuanceId {
        let now = Utc::now();
        let mut tx = self.ledger.begin().await.unwrap();
        let record = tx
            .insert_issuance(NewMemberCoupon {
                coupon_id: CouponId::new(1),
                member_id: MemberId::new(MEMBER),
                issued_at: now,
                expires_at: now + Duration::days(7),
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        record.id
    }

    async fn order(
        &self,
        id: i64,
        lines: &[(i64, u32, i64)],
        coupon: Option<(IssuanceId, Money)>,
    ) -> Order {
        let lines = lines
            .iter()
            .map(|&(option, qty, price)| OrderLine::new(OptionId::new(option), qty, Money::new(price)))
            .collect();
        let order = Order::new(
            OrderId::new(id),
            MemberId::new(MEMBER),
            lines,
            coupon,
            Utc::now(),
        )
        .unwrap();
        let mut tx = self.ledger.begin().await.unwrap();
        tx.insert_order(&order).await.unwrap();
        tx.commit().await.unwrap();
        order
    }

    async fn reload(&self, order_id: OrderId) -> Order {
        self.ledger.order(order_id).await.unwrap().unwrap()
    }

    fn confirm(order: &Order, mode: FailureMode) -> ConfirmPayment {
        ConfirmPayment {
            order_id: order.id,
            member_id: order.member_id,
            amount: order.payable_amount(),
            provider: "in-memory".to_string(),
            payment_key: format!("pk_{}", order.id),
            on_failure: mode,
        }
    }
}

#[tokio::test]
async fn test_successful_confirmation() {
    let h = TestHarness::new();
    h.stock(42, 5).await;
    let order = h.order(1, &[(42, 2, 15000)], None).await;

    let receipt = h
        .saga
        .confirm_payment(TestHarness::confirm(&order, FailureMode::Rollback))
        .await
        .unwrap();

    assert_eq!(receipt.amount, Money::new(30000));
    assert_eq!(receipt.transaction_id, "pk_1");
    assert_eq!(h.available(42).await, 3);

    let stored = h.reload(order.id).await;
    assert_eq!(stored.status, OrderStatus::Completed);
    assert!(stored.settleable);

    let payment = h.ledger.payment_for_order(order.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Approved);
    assert_eq!(payment.provider_transaction_id.as_deref(), Some("pk_1"));
    assert_eq!(payment.logs().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_payment_failure_compensates_everything() {
    let h = TestHarness::new();
    h.stock(42, 5).await;
    let issuance = h.member_coupon().await;
    let order = h
        .order(1, &[(42, 2, 15000)], Some((issuance, Money::new(3000))))
        .await;
    h.provider.fail_next(ProviderError::Timeout, 3);

    let err = h
        .saga
        .confirm_payment(TestHarness::confirm(&order, FailureMode::Rollback))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SagaError::Payment(GatewayError::Exhausted { attempts: 3, .. })
    ));
    assert_eq!(err.code(), "PAYMENT_UNAVAILABLE");
    assert_eq!(h.provider.confirm_calls(), 3);

    assert_eq!(h.available(42).await, 5);
    let stored = h.reload(order.id).await;
    assert_eq!(stored.status, OrderStatus::Pending);
    assert!(!stored.settleable);

    let payment = h.ledger.payment_for_order(order.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.logs().len(), 1);

    let coupon = h.ledger.member_coupon(issuance).await.unwrap().unwrap();
    assert_eq!(coupon.status, MemberCouponStatus::Available);
    assert_eq!(coupon.used_order_id, None);
}

#[tokio::test]
async fn test_rollback_lets_the_member_pay_again() {
    let h = TestHarness::new();
    h.stock(42, 5).await;
    let order = h.order(1, &[(42, 2, 15000)], None).await;
    h.provider.push_confirm(Err(ProviderError::Status {
        status: 400,
        body: "card declined".to_string(),
    }));

    let err = h
        .saga
        .confirm_payment(TestHarness::confirm(&order, FailureMode::Rollback))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PAYMENT_REJECTED");
    assert_eq!(h.provider.confirm_calls(), 1);

    let mut retry = TestHarness::confirm(&order, FailureMode::Rollback);
    retry.payment_key = "pk_retry".to_string();
    h.saga.confirm_payment(retry).await.unwrap();
    assert_eq!(h.available(42).await, 3);
    let payment = h.ledger.payment_for_order(order.id).await.unwrap().unwrap();
    assert_eq!(payment.payment_key, "pk_retry");
    assert_eq!(payment.status, PaymentStatus::Approved);
}

#[tokio::test]
async fn test_cancel_mode_cancels_the_order() {
    let h = TestHarness::new();
    h.stock(42, 5).await;
    let order = h.order(1, &[(42, 1, 15000)], None).await;
    h.provider.push_confirm(Err(ProviderError::Status {
        status: 403,
        body: "rejected".to_string(),
    }));

    h.saga
        .confirm_payment(TestHarness::confirm(&order, FailureMode::Cancel))
        .await
        .unwrap_err();

    assert_eq!(h.reload(order.id).await.status, OrderStatus::Cancelled);
    assert_eq!(h.available(42).await, 5);
}

#[tokio::test]
async fn test_repeated_confirmation_deducts_once() {
    let h = TestHarness::new();
    h.stock(42, 5).await;
    let order = h.order(1, &[(42, 2, 15000)], None).await;

    h.saga
        .confirm_payment(TestHarness::confirm(&order, FailureMode::Rollback))
        .await
        .unwrap();
    let err = h
        .saga
        .confirm_payment(TestHarness::confirm(&order, FailureMode::Rollback))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "INVALID_ORDER_TRANSITION");
    assert_eq!(h.available(42).await, 3);
    assert_eq!(h.provider.confirm_calls(), 1);
}

#[tokio::test]
async fn test_insufficient_stock_reports_every_line() {
    let h = TestHarness::new();
    h.stock(1, 1).await;
    h.stock(2, 10).await;
    h.stock(3, 10).await;
    h.catalog.set_available(OptionId::new(3), false);
    let order = h
        .order(1, &[(1, 2, 1000), (2, 1, 1000), (3, 1, 1000), (4, 1, 1000)], None)
        .await;

    let err = h
        .saga
        .confirm_payment(TestHarness::confirm(&order, FailureMode::Rollback))
        .await
        .unwrap_err();

    let SagaError::InsufficientStock(shortfalls) = err else {
        panic!("expected insufficient stock, got {err:?}");
    };
    let short: Vec<i64> = shortfalls.iter().map(|s| s.option_id.get()).collect();
    assert_eq!(short, vec![1, 3, 4]);
    assert!(!shortfalls[1].listed);
    assert_eq!(shortfalls[2].available, 0);

    assert_eq!(h.available(1).await, 1);
    assert_eq!(h.available(2).await, 10);
    assert_eq!(h.reload(order.id).await.status, OrderStatus::Pending);
    assert!(h.ledger.payment_for_order(order.id).await.unwrap().is_none());
    assert_eq!(h.provider.confirm_calls(), 0);
}

#[tokio::test]
async fn test_amount_must_match_payable() {
    let h = TestHarness::new();
    h.stock(42, 5).await;
    let order = h.order(1, &[(42, 1, 15000)], None).await;
    let mut command = TestHarness::confirm(&order, FailureMode::Rollback);
    command.amount = Money::new(14000);

    let err = h.saga.confirm_payment(command).await.unwrap_err();
    assert_eq!(err.code(), "AMOUNT_MISMATCH");
    assert_eq!(h.available(42).await, 5);
}

#[tokio::test]
async fn test_only_the_owner_may_confirm() {
    let h = TestHarness::new();
    h.stock(42, 5).await;
    let order = h.order(1, &[(42, 1, 15000)], None).await;
    let mut command = TestHarness::confirm(&order, FailureMode::Rollback);
    command.member_id = MemberId::new(99);

    let err = h.saga.confirm_payment(command).await.unwrap_err();
    assert_eq!(err.code(), "NOT_ORDER_OWNER");

    let missing = ConfirmPayment {
        order_id: OrderId::new(404),
        ..TestHarness::confirm(&order, FailureMode::Rollback)
    };
    let err = h.saga.confirm_payment(missing).await.unwrap_err();
    assert_eq!(err.code(), "ORDER_NOT_FOUND");
}

#[tokio::test]
async fn test_failed_compensation_surfaces_the_payment_error() {
    let h = TestHarness::new();
    h.stock(42, 5).await;
    let order = h.order(1, &[(42, 2, 15000)], None).await;
    h.provider.push_confirm(Err(ProviderError::Status {
        status: 400,
        body: "card declined".to_string(),
    }));
    // The reserve commit succeeds, the compensation commit does not.
    h.ledger.fail_commits_after(1);

    let err = h
        .saga
        .confirm_payment(TestHarness::confirm(&order, FailureMode::Rollback))
        .await
        .unwrap_err();
    h.ledger.clear_commit_failures();

    assert!(matches!(err, SagaError::Payment(GatewayError::Terminal(_))));
    assert_eq!(h.reload(order.id).await.status, OrderStatus::Completed);
    assert_eq!(h.available(42).await, 3);

    assert!(h.saga.compensate(order.id, "manual retry").await.unwrap());
    assert_eq!(h.reload(order.id).await.status, OrderStatus::Pending);
    assert_eq!(h.available(42).await, 5);
    assert!(!h.saga.compensate(order.id, "manual retry").await.unwrap());
}

#[tokio::test]
async fn test_cancel_completed_order_refunds_at_provider() {
    let h = TestHarness::new();
    h.stock(42, 5).await;
    let issuance = h.member_coupon().await;
    let order = h
        .order(1, &[(42, 2, 15000)], Some((issuance, Money::new(3000))))
        .await;
    h.saga
        .confirm_payment(TestHarness::confirm(&order, FailureMode::Rollback))
        .await
        .unwrap();

    let cancelled = h
        .saga
        .cancel_order(order.id, MemberId::new(MEMBER), "changed my mind")
        .await
        .unwrap();

    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(h.provider.cancelled(), vec!["pk_1".to_string()]);
    assert_eq!(h.available(42).await, 5);

    let payment = h.ledger.payment_for_order(order.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Cancelled);
    assert_eq!(payment.logs().len(), 2);
    assert_eq!(payment.logs()[1].actor, format!("member:{MEMBER}"));

    let coupon = h.ledger.member_coupon(issuance).await.unwrap().unwrap();
    assert_eq!(coupon.status, MemberCouponStatus::Available);
}

#[tokio::test]
async fn test_cancel_keeps_order_when_provider_refuses() {
    let h = TestHarness::new();
    h.stock(42, 5).await;
    let order = h.order(1, &[(42, 1, 15000)], None).await;
    h.saga
        .confirm_payment(TestHarness::confirm(&order, FailureMode::Rollback))
        .await
        .unwrap();
    h.provider.set_fail_cancel(true);

    let err = h
        .saga
        .cancel_order(order.id, MemberId::new(MEMBER), "changed my mind")
        .await
        .unwrap_err();

    assert_eq!(err.code(), "PAYMENT_REJECTED");
    assert_eq!(h.reload(order.id).await.status, OrderStatus::Completed);
    assert_eq!(h.available(42).await, 4);
}

#[tokio::test]
async fn test_cancel_pending_order() {
    let h = TestHarness::new();
    h.stock(42, 5).await;
    let order = h.order(1, &[(42, 1, 15000)], None).await;

    let cancelled = h
        .saga
        .cancel_order(order.id, MemberId::new(MEMBER), "no longer needed")
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(h.available(42).await, 5);
    assert!(h.provider.cancelled().is_empty());

    let err = h
        .saga
        .cancel_order(order.id, MemberId::new(MEMBER), "again")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_ORDER_TRANSITION");
}

#[tokio::test(start_paused = true)]
async fn test_cancel_refused_while_payment_is_confirming() {
    let h = TestHarness::new();
    h.stock(42, 5).await;
    let order = h.order(1, &[(42, 2, 15000)], None).await;
    h.provider.set_confirm_delay(StdDuration::from_millis(200));

    let confirming = {
        let saga = h.saga.clone();
        let command = TestHarness::confirm(&order, FailureMode::Rollback);
        tokio::spawn(async move { saga.confirm_payment(command).await })
    };
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert_eq!(h.reload(order.id).await.status, OrderStatus::Completed);

    let err = h
        .saga
        .cancel_order(order.id, MemberId::new(MEMBER), "changed my mind")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PAYMENT_IN_PROGRESS");
    assert!(err.class().is_retryable());
    assert_eq!(h.available(42).await, 3);

    confirming.await.unwrap().unwrap();
    let payment = h.ledger.payment_for_order(order.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Approved);
    assert!(h.provider.cancelled().is_empty());

    // Once the payment settles the member can cancel, and the charge is
    // refunded at the provider.
    let cancelled = h
        .saga
        .cancel_order(order.id, MemberId::new(MEMBER), "changed my mind")
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(h.provider.cancelled(), vec!["pk_1".to_string()]);
    assert_eq!(h.available(42).await, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_orders_do_not_deadlock() {
    const ROUNDS: i64 = 20;
    let h = TestHarness::new();
    h.stock(1, 100).await;
    h.stock(2, 100).await;

    for round in 0..ROUNDS {
        let forward = h.order(round * 2 + 1, &[(1, 1, 1000), (2, 1, 1000)], None).await;
        let reverse = h.order(round * 2 + 2, &[(2, 1, 1000), (1, 1, 1000)], None).await;

        let tasks: Vec<_> = [forward, reverse]
            .iter()
            .map(|order| {
                let saga = h.saga.clone();
                let command = TestHarness::confirm(order, FailureMode::Rollback);
                tokio::spawn(async move { saga.confirm_payment(command).await })
            })
            .collect();
        for task in tasks {
            let result = task.await.unwrap();
            assert!(result.is_ok(), "round {round}: {result:?}");
        }
    }

    let confirmed = u32::try_from(ROUNDS * 2).unwrap();
    assert_eq!(h.available(1).await, 100 - confirmed);
    assert_eq!(h.available(2).await, 100 - confirmed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_confirmations_deduct_once() {
    const CALLERS: usize = 8;
    let h = TestHarness::new();
    h.stock(42, 5).await;
    let order = h.order(1, &[(42, 2, 15000)], None).await;

    let tasks: Vec<_> = (0..CALLERS)
        .map(|_| {
            let saga = h.saga.clone();
            let command = TestHarness::confirm(&order, FailureMode::Rollback);
            tokio::spawn(async move { saga.confirm_payment(command).await })
        })
        .collect();

    let mut approved = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => approved += 1,
            Err(e) => assert_eq!(e.code(), "INVALID_ORDER_TRANSITION"),
        }
    }

    assert_eq!(approved, 1);
    assert_eq!(h.available(42).await, 3);
    assert_eq!(h.provider.confirm_calls(), 1);
    let payment = h.ledger.payment_for_order(order.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Approved);
    assert_eq!(h.reload(order.id).await.status, OrderStatus::Completed);
}
