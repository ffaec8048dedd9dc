//! Order aggregate and related types.

mod state;

pub use state::{OrderAction, OrderStatus};

use chrono::{DateTime, Utc};
use common::{IssuanceId, MemberId, Money, OptionId, OrderId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during order operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrderError {
    /// Order is not in a status that allows the action.
    #[error("Invalid state transition: cannot {action} from {from} status")]
    InvalidTransition {
        from: OrderStatus,
        action: OrderAction,
    },

    /// Invalid quantity.
    #[error("Invalid quantity for option {option_id}: {quantity} (must be greater than 0)")]
    InvalidQuantity { option_id: OptionId, quantity: u32 },

    /// Order has no lines.
    #[error("Order has no lines")]
    NoLines,

    /// The same option appears on two lines.
    #[error("Option {0} appears more than once")]
    DuplicateOption(OptionId),
}

/// One ordered option with the price frozen at order time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub option_id: OptionId,
    pub quantity: u32,
    pub unit_price: Money,
}

impl OrderLine {
    pub fn new(option_id: OptionId, quantity: u32, unit_price: Money) -> Self {
        Self {
            option_id,
            quantity,
            unit_price,
        }
    }

    /// Returns the total price for this line (quantity * unit_price).
    pub fn total_price(&self) -> Money {
        self.unit_price.multiply(self.quantity)
    }
}

/// A member's order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub member_id: MemberId,
    pub status: OrderStatus,
    pub lines: Vec<OrderLine>,
    pub total_amount: Money,
    pub discount_amount: Money,
    /// Member coupon applied to this order, consumed on completion.
    pub member_coupon_id: Option<IssuanceId>,
    /// Set once payment is approved; settlement only picks up these orders.
    pub settleable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Creates a pending order, computing the total from the line snapshots.
    pub fn new(
        id: OrderId,
        member_id: MemberId,
        lines: Vec<OrderLine>,
        coupon: Option<(IssuanceId, Money)>,
        now: DateTime<Utc>,
    ) -> Result<Self, OrderError> {
        if lines.is_empty() {
            return Err(OrderError::NoLines);
        }
        let mut seen = std::collections::HashSet::new();
        for line in &lines {
            if line.quantity == 0 {
                return Err(OrderError::InvalidQuantity {
                    option_id: line.option_id,
                    quantity: line.quantity,
                });
            }
            if !seen.insert(line.option_id) {
                return Err(OrderError::DuplicateOption(line.option_id));
            }
        }

        let total_amount: Money = lines.iter().map(OrderLine::total_price).sum();
        let (member_coupon_id, discount_amount) = match coupon {
            Some((id, discount)) => (Some(id), discount.min(total_amount)),
            None => (None, Money::zero()),
        };

        Ok(Self {
            id,
            member_id,
            status: OrderStatus::Pending,
            lines,
            total_amount,
            discount_amount,
            member_coupon_id,
            settleable: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Amount the member is charged.
    pub fn payable_amount(&self) -> Money {
        self.total_amount.saturating_sub(self.discount_amount)
    }

    /// Applies `action` through the status transition table.
    pub fn apply(&mut self, action: OrderAction, now: DateTime<Utc>) -> Result<(), OrderError> {
        self.status = self.status.transition(action)?;
        if action != OrderAction::Complete {
            self.settleable = false;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Marks the order eligible for settlement after payment approval.
    pub fn mark_settleable(&mut self, now: DateTime<Utc>) {
        self.settleable = true;
        self.updated_at = now;
    }

    /// Lines sorted by option id, the order in which inventory rows are locked.
    pub fn lines_by_option(&self) -> Vec<OrderLine> {
        let mut lines = self.lines.clone();
        lines.sort_by_key(|l| l.option_id);
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(lines: Vec<OrderLine>, coupon: Option<(IssuanceId, Money)>) -> Order {
        Order::new(OrderId::new(1), MemberId::new(9), lines, coupon, Utc::now()).unwrap()
    }

    #[test]
    fn test_total_from_line_snapshots() {
        let o = order(
            vec![
                OrderLine::new(OptionId::new(42), 2, Money::new(5000)),
                OrderLine::new(OptionId::new(7), 1, Money::new(3000)),
            ],
            None,
        );
        assert_eq!(o.total_amount, Money::new(13_000));
        assert_eq!(o.payable_amount(), Money::new(13_000));
        assert_eq!(o.status, OrderStatus::Pending);
    }

    #[test]
    fn test_discount_reduces_payable_and_is_capped() {
        let line = OrderLine::new(OptionId::new(1), 1, Money::new(1000));
        let o = order(vec![line], Some((IssuanceId::new(3), Money::new(300))));
        assert_eq!(o.payable_amount(), Money::new(700));

        let o = order(vec![line], Some((IssuanceId::new(3), Money::new(5000))));
        assert_eq!(o.discount_amount, Money::new(1000));
        assert_eq!(o.payable_amount(), Money::zero());
    }

    #[test]
    fn test_rejects_empty_and_zero_quantity() {
        let now = Utc::now();
        assert_eq!(
            Order::new(OrderId::new(1), MemberId::new(1), vec![], None, now),
            Err(OrderError::NoLines)
        );
        let err = Order::new(
            OrderId::new(1),
            MemberId::new(1),
            vec![OrderLine::new(OptionId::new(5), 0, Money::new(1))],
            None,
            now,
        )
        .unwrap_err();
        assert!(matches!(err, OrderError::InvalidQuantity { .. }));
    }

    #[test]
    fn test_rejects_duplicate_option() {
        let line = OrderLine::new(OptionId::new(5), 1, Money::new(1));
        let err = Order::new(
            OrderId::new(1),
            MemberId::new(1),
            vec![line, line],
            None,
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, OrderError::DuplicateOption(OptionId::new(5)));
    }

    #[test]
    fn test_apply_complete_then_rollback() {
        let mut o = order(vec![OrderLine::new(OptionId::new(1), 1, Money::new(10))], None);
        o.apply(OrderAction::Complete, Utc::now()).unwrap();
        o.mark_settleable(Utc::now());
        assert!(o.settleable);

        o.apply(OrderAction::Rollback, Utc::now()).unwrap();
        assert_eq!(o.status, OrderStatus::Pending);
        assert!(!o.settleable);
    }

    #[test]
    fn test_second_completion_rejected() {
        let mut o = order(vec![OrderLine::new(OptionId::new(1), 1, Money::new(10))], None);
        o.apply(OrderAction::Complete, Utc::now()).unwrap();
        assert_eq!(
            o.apply(OrderAction::Complete, Utc::now()),
            Err(OrderError::InvalidTransition {
                from: OrderStatus::Completed,
                action: OrderAction::Complete,
            })
        );
    }

    #[test]
    fn test_lines_sorted_for_locking() {
        let o = order(
            vec![
                OrderLine::new(OptionId::new(9), 1, Money::new(1)),
                OrderLine::new(OptionId::new(2), 1, Money::new(1)),
            ],
            None,
        );
        let ids: Vec<_> = o.lines_by_option().iter().map(|l| l.option_id).collect();
        assert_eq!(ids, vec![OptionId::new(2), OptionId::new(9)]);
    }
}
