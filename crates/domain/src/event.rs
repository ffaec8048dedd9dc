//! Promotion events that hand out a coupon to participants.

use chrono::{DateTime, Utc};
use common::{CouponId, EventId};
use serde::{Deserialize, Serialize};

/// Status of a promotion event.
///
/// Time-driven transitions only move forward:
/// ```text
/// Draft/Planned ──(start, public)──► Open ──(end)──► Ended
/// Draft/Planned ──(end)────────────────────────────► Ended
/// ```
/// `Paused` and `Cancelled` are operator decisions and are never changed by the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EventStatus {
    #[default]
    Draft,
    Planned,
    Open,
    Paused,
    Ended,
    Cancelled,
}

impl EventStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Ended | EventStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Draft => "DRAFT",
            EventStatus::Planned => "PLANNED",
            EventStatus::Open => "OPEN",
            EventStatus::Paused => "PAUSED",
            EventStatus::Ended => "ENDED",
            EventStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(EventStatus::Draft),
            "PLANNED" => Some(EventStatus::Planned),
            "OPEN" => Some(EventStatus::Open),
            "PAUSED" => Some(EventStatus::Paused),
            "ENDED" => Some(EventStatus::Ended),
            "CANCELLED" => Some(EventStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A time-boxed promotion event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub title: String,
    pub status: EventStatus,
    pub public: bool,
    /// Coupons a single member may claim through this event.
    pub limit_per_user: u32,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub coupon_id: Option<CouponId>,
}

impl Event {
    /// Default number of claims per member.
    pub const DEFAULT_LIMIT_PER_USER: u32 = 1;

    /// True when members may currently claim.
    pub fn is_ongoing(&self, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::Open && now >= self.starts_at && now <= self.ends_at
    }

    /// The status the clock moves this event to at `now`, if any.
    pub fn next_status(&self, now: DateTime<Utc>) -> Option<EventStatus> {
        match self.status {
            EventStatus::Draft | EventStatus::Planned => {
                if now > self.ends_at {
                    Some(EventStatus::Ended)
                } else if now >= self.starts_at && self.public {
                    Some(EventStatus::Open)
                } else {
                    None
                }
            }
            EventStatus::Open if now > self.ends_at => Some(EventStatus::Ended),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(status: EventStatus, public: bool) -> Event {
        let now = Utc::now();
        Event {
            id: EventId::new(1),
            title: "Spring drop".to_string(),
            status,
            public,
            limit_per_user: Event::DEFAULT_LIMIT_PER_USER,
            starts_at: now - Duration::hours(1),
            ends_at: now + Duration::hours(1),
            coupon_id: Some(CouponId::new(7)),
        }
    }

    #[test]
    fn test_is_ongoing_requires_open_and_window() {
        let now = Utc::now();
        assert!(event(EventStatus::Open, true).is_ongoing(now));
        assert!(!event(EventStatus::Paused, true).is_ongoing(now));
        let e = event(EventStatus::Open, true);
        assert!(!e.is_ongoing(e.ends_at + Duration::seconds(1)));
    }

    #[test]
    fn test_public_planned_event_opens_at_start() {
        let now = Utc::now();
        assert_eq!(
            event(EventStatus::Planned, true).next_status(now),
            Some(EventStatus::Open)
        );
        assert_eq!(event(EventStatus::Draft, false).next_status(now), None);
    }

    #[test]
    fn test_events_end_after_window() {
        let e = event(EventStatus::Open, true);
        let after = e.ends_at + Duration::seconds(1);
        assert_eq!(e.next_status(after), Some(EventStatus::Ended));
        assert_eq!(
            event(EventStatus::Draft, false).next_status(after),
            Some(EventStatus::Ended)
        );
    }

    #[test]
    fn test_operator_states_are_untouched() {
        let e = event(EventStatus::Paused, true);
        assert_eq!(e.next_status(e.ends_at + Duration::days(1)), None);
        let e = event(EventStatus::Cancelled, true);
        assert_eq!(e.next_status(e.ends_at + Duration::days(1)), None);
        assert_eq!(event(EventStatus::Open, true).next_status(Utc::now()), None);
    }

    #[test]
    fn test_status_text_round_trip() {
        assert_eq!(EventStatus::parse("OPEN"), Some(EventStatus::Open));
        assert_eq!(EventStatus::Cancelled.to_string(), "CANCELLED");
        assert!(EventStatus::Ended.is_terminal());
    }
}
