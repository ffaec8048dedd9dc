//! Lifecycle tests spanning orders, coupons, inventory and payments.
//!
//! These exercise the aggregates the way the fulfillment saga drives them,
//! without any storage.

use chrono::{Duration, Utc};
use common::{CouponId, IssuanceId, MemberId, Money, OptionId, OrderId, PaymentId};
use domain::{
    Coupon, Discount, Inventory, MemberCoupon, MemberCouponStatus, NewMemberCoupon, NewPayment,
    Order, OrderAction, OrderLine, OrderStatus, Payment, PaymentStatus,
};

fn coupon() -> Coupon {
    let now = Utc::now();
    Coupon {
        id: CouponId::new(1),
        name: "TENOFF".to_string(),
        discount: Discount::Percentage {
            percent: 10,
            max: None,
        },
        min_order_amount: None,
        total_quantity: Some(10),
        issued_quantity: 3,
        starts_at: now - Duration::days(1),
        ends_at: now + Duration::days(7),
        active: true,
    }
}

mod fulfillment_lifecycle {
    use super::*;

    #[test]
    fn completion_then_failed_payment_restores_everything() {
        let now = Utc::now();
        let mut coupon = coupon();
        coupon.validate_issuable(now).unwrap();
        coupon.increase_issued().unwrap();
        assert_eq!(coupon.issued_quantity, 4);

        let mut member_coupon = MemberCoupon::from_new(
            IssuanceId::new(1),
            NewMemberCoupon {
                coupon_id: coupon.id,
                member_id: MemberId::new(5),
                issued_at: now,
                expires_at: coupon.ends_at,
            },
        );

        let lines = vec![OrderLine::new(OptionId::new(42), 2, Money::new(5000))];
        let discount = coupon.discount_for(Money::new(10_000));
        let mut order = Order::new(
            OrderId::new(1),
            MemberId::new(5),
            lines,
            Some((member_coupon.id, discount)),
            now,
        )
        .unwrap();
        assert_eq!(order.payable_amount(), Money::new(9_000));

        let mut stock = Inventory::new(OptionId::new(42), 5);

        // forward
        stock.deduct(2).unwrap();
        order.apply(OrderAction::Complete, now).unwrap();
        member_coupon.mark_used(order.id, now).unwrap();
        let mut payment = Payment::from_new(
            PaymentId::new(1),
            NewPayment::new(order.id, order.payable_amount(), "toss", "pk", now).unwrap(),
        );
        assert_eq!(stock.available, 3);

        // compensation
        stock.restore(2).unwrap();
        order.apply(OrderAction::Rollback, now).unwrap();
        member_coupon.release(order.id).unwrap();
        payment.fail("declined", "saga", now).unwrap();

        assert_eq!(stock.available, 5);
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(member_coupon.status, MemberCouponStatus::Available);
        assert_eq!(payment.status, PaymentStatus::Failed);
        assert_eq!(payment.logs().len(), 1);
    }

    #[test]
    fn exhausted_coupon_blocks_next_issue() {
        let mut coupon = coupon();
        coupon.total_quantity = Some(1);
        coupon.issued_quantity = 0;

        coupon.increase_issued().unwrap();
        assert!(coupon.validate_issuable(Utc::now()).is_err());
        assert_eq!(coupon.remaining(), Some(0));
    }

    #[test]
    fn cancelled_order_is_terminal() {
        let now = Utc::now();
        let mut order = Order::new(
            OrderId::new(2),
            MemberId::new(1),
            vec![OrderLine::new(OptionId::new(1), 1, Money::new(100))],
            None,
            now,
        )
        .unwrap();
        order.apply(OrderAction::Complete, now).unwrap();
        order.apply(OrderAction::Cancel, now).unwrap();
        assert!(order.status.is_terminal());
        assert!(order.apply(OrderAction::Rollback, now).is_err());
    }
}
