//! Timer-driven event status reconciliation.

use std::time::Duration;

use chrono::Utc;
use ledger::{Ledger, LedgerError, LedgerTx};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Moves event statuses forward as their windows open and close.
///
/// Each event is re-read under its row lock before it is changed, so a sweep
/// never overwrites a concurrent manual change such as a pause.
pub struct EventStatusSweeper<L> {
    ledger: L,
    interval: Duration,
}

impl<L: Ledger> EventStatusSweeper<L> {
    pub fn new(ledger: L, interval: Duration) -> Self {
        Self { ledger, interval }
    }

    /// Runs one pass. Returns the number of events whose status changed.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<usize, LedgerError> {
        let now = Utc::now();
        let mut moved = 0;

        for candidate in self.ledger.sweepable_events().await? {
            if candidate.next_status(now).is_none() {
                continue;
            }

            let mut tx = self.ledger.begin().await?;
            let Some(mut event) = tx.event_for_update(candidate.id).await? else {
                continue;
            };
            let Some(next) = event.next_status(now) else {
                tx.rollback().await?;
                continue;
            };

            tracing::info!(event_id = %event.id, from = %event.status, to = %next, "Event status advanced");
            event.status = next;
            tx.save_event(&event).await?;
            tx.commit().await?;
            moved += 1;
        }

        Ok(moved)
    }

    /// Sweeps on every tick until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::warn!(error = %e, "Event status sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Event status sweeper stopped");
                        break;
                    }
                }
            }
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use common::EventId;
    use domain::{Event, EventStatus};
    use ledger::InMemoryLedger;

    fn event(id: i64, status: EventStatus, public: bool, started_hours_ago: i64, ends_in_hours: i64) -> Event {
        let now = Utc::now();
        Event {
            id: EventId::new(id),
            title: format!("event-{id}"),
            status,
            public,
            limit_per_user: 1,
            starts_at: now - ChronoDuration::hours(started_hours_ago),
            ends_at: now + ChronoDuration::hours(ends_in_hours),
            coupon_id: None,
        }
    }

    async fn seeded(events: &[Event]) -> InMemoryLedger {
        let ledger = InMemoryLedger::new();
        let mut tx = ledger.begin().await.unwrap();
        for e in events {
            tx.insert_event(e).await.unwrap();
        }
        tx.commit().await.unwrap();
        ledger
    }

    async fn status(ledger: &InMemoryLedger, id: i64) -> EventStatus {
        ledger.event(EventId::new(id)).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_sweep_moves_forward_only() {
        let ledger = seeded(&[
            event(1, EventStatus::Planned, true, 1, 1),
            event(2, EventStatus::Planned, false, 1, 1),
            event(3, EventStatus::Open, true, 3, -1),
            event(4, EventStatus::Paused, true, 3, -1),
            event(5, EventStatus::Draft, true, 5, -2),
        ])
        .await;
        let sweeper = EventStatusSweeper::new(ledger.clone(), Duration::from_secs(60));

        assert_eq!(sweeper.sweep_once().await.unwrap(), 3);
        assert_eq!(status(&ledger, 1).await, EventStatus::Open);
        assert_eq!(status(&ledger, 2).await, EventStatus::Planned);
        assert_eq!(status(&ledger, 3).await, EventStatus::Ended);
        assert_eq!(status(&ledger, 4).await, EventStatus::Paused);
        assert_eq!(status(&ledger, 5).await, EventStatus::Ended);

        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let ledger = seeded(&[event(1, EventStatus::Planned, true, 1, 1)]).await;
        let (tx, rx) = watch::channel(false);
        let handle = EventStatusSweeper::new(ledger.clone(), Duration::from_millis(10)).spawn(rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(status(&ledger, 1).await, EventStatus::Open);
    }
}
