//! Order state machine.

use serde::{Deserialize, Serialize};

use super::OrderError;

/// The status of an order in its lifecycle.
///
/// State transitions:
/// ```text
///             ┌──────── rollback ────────┐
///             ▼                          │
/// Pending ──complete──► Completed ──refund──► Refunded
///    │                      │
///    └──cancel──► Cancelled ◄──cancel──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderStatus {
    /// Order placed, awaiting payment confirmation.
    #[default]
    Pending,

    /// Stock deducted and payment requested.
    Completed,

    /// Order was cancelled (terminal state).
    Cancelled,

    /// Payment was returned to the member (terminal state).
    Refunded,
}

/// An action applied to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderAction {
    Complete,
    Cancel,
    Refund,
    /// Compensation: undo a completion whose payment did not go through.
    Rollback,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Complete => "complete",
            OrderAction::Cancel => "cancel",
            OrderAction::Refund => "refund",
            OrderAction::Rollback => "rollback",
        }
    }
}

impl std::fmt::Display for OrderAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl OrderStatus {
    /// Returns the status reached by applying `action`, or an error if the
    /// transition is not allowed.
    pub fn transition(self, action: OrderAction) -> Result<OrderStatus, OrderError> {
        use OrderAction::*;
        use OrderStatus::*;

        match (self, action) {
            (Pending, Complete) => Ok(Completed),
            (Pending, Cancel) => Ok(Cancelled),
            (Completed, Cancel) => Ok(Cancelled),
            (Completed, Refund) => Ok(Refunded),
            (Completed, Rollback) => Ok(Pending),
            (Pending, Refund | Rollback)
            | (Completed, Complete)
            | (Cancelled | Refunded, _) => Err(OrderError::InvalidTransition {
                from: self,
                action,
            }),
        }
    }

    pub fn can_complete(&self) -> bool {
        self.transition(OrderAction::Complete).is_ok()
    }

    pub fn can_cancel(&self) -> bool {
        self.transition(OrderAction::Cancel).is_ok()
    }

    /// Returns true if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Refunded)
    }

    /// Returns the status name as stored in the ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Refunded => "REFUNDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OrderStatus::Pending),
            "COMPLETED" => Some(OrderStatus::Completed),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            "REFUNDED" => Some(OrderStatus::Refunded),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OrderStatus; 4] = [
        OrderStatus::Pending,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
        OrderStatus::Refunded,
    ];

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(OrderStatus::default(), OrderStatus::Pending);
    }

    #[test]
    fn test_pending_transitions() {
        let s = OrderStatus::Pending;
        assert_eq!(s.transition(OrderAction::Complete), Ok(OrderStatus::Completed));
        assert_eq!(s.transition(OrderAction::Cancel), Ok(OrderStatus::Cancelled));
        assert!(s.transition(OrderAction::Refund).is_err());
        assert!(s.transition(OrderAction::Rollback).is_err());
    }

    #[test]
    fn test_completed_transitions() {
        let s = OrderStatus::Completed;
        assert!(s.transition(OrderAction::Complete).is_err());
        assert_eq!(s.transition(OrderAction::Cancel), Ok(OrderStatus::Cancelled));
        assert_eq!(s.transition(OrderAction::Refund), Ok(OrderStatus::Refunded));
        assert_eq!(s.transition(OrderAction::Rollback), Ok(OrderStatus::Pending));
    }

    #[test]
    fn test_terminal_states_admit_nothing() {
        for s in [OrderStatus::Cancelled, OrderStatus::Refunded] {
            assert!(s.is_terminal());
            for action in [
                OrderAction::Complete,
                OrderAction::Cancel,
                OrderAction::Refund,
                OrderAction::Rollback,
            ] {
                assert_eq!(
                    s.transition(action),
                    Err(OrderError::InvalidTransition { from: s, action })
                );
            }
        }
    }

    #[test]
    fn test_can_helpers_follow_transition_table() {
        assert!(OrderStatus::Pending.can_complete());
        assert!(!OrderStatus::Completed.can_complete());
        assert!(OrderStatus::Completed.can_cancel());
        assert!(!OrderStatus::Refunded.can_cancel());
    }

    #[test]
    fn test_text_round_trip() {
        for s in ALL {
            assert_eq!(OrderStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(OrderStatus::Completed.to_string(), "COMPLETED");
    }

    #[test]
    fn test_serialization() {
        let status = OrderStatus::Completed;
        let json = serde_json::to_string(&status).unwrap();
        let deserialized: OrderStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(status, deserialized);
    }
}
