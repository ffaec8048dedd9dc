//! In-process admission gate.
//!
//! A put-if-absent map keyed by (resource, actor). A slot holder gets an
//! [`AdmissionToken`]; the slot is freed when the token is released or
//! dropped, or when the hold time runs out. Expired slots are purged on
//! every entry attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::GateError;

pub const DEFAULT_GATE_HOLD: Duration = Duration::from_secs(5);

type SlotKey = (i64, i64);

#[derive(Debug, Clone, Copy)]
struct Slot {
    ticket: u64,
    expires_at: Instant,
}

#[derive(Debug)]
struct GateInner {
    slots: Mutex<HashMap<SlotKey, Slot>>,
    next_ticket: AtomicU64,
    hold: Duration,
}

impl GateInner {
    fn free(&self, key: SlotKey, ticket: u64) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(&key).is_some_and(|s| s.ticket == ticket) {
            slots.remove(&key);
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionGate {
    inner: Arc<GateInner>,
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new(DEFAULT_GATE_HOLD)
    }
}

impl AdmissionGate {
    pub fn new(hold: Duration) -> Self {
        Self {
            inner: Arc::new(GateInner {
                slots: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(1),
                hold,
            }),
        }
    }

    pub fn hold(&self) -> Duration {
        self.inner.hold
    }

    /// Claims the slot for (resource, actor).
    ///
    /// Fails with [`GateError::Conflict`] while another unexpired claim for
    /// the same pair exists. Never waits.
    pub fn try_enter(
        &self,
        resource_id: impl Into<i64>,
        actor_id: impl Into<i64>,
    ) -> Result<AdmissionToken, GateError> {
        let key = (resource_id.into(), actor_id.into());
        let now = Instant::now();
        let mut slots = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        slots.retain(|_, slot| slot.expires_at > now);

        if slots.contains_key(&key) {
            metrics::counter!("admission_gate_conflicts_total").increment(1);
            tracing::debug!(resource_id = key.0, actor_id = key.1, "Admission slot taken");
            return Err(GateError::Conflict {
                resource_id: key.0,
                actor_id: key.1,
            });
        }

        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        slots.insert(
            key,
            Slot {
                ticket,
                expires_at: now + self.inner.hold,
            },
        );
        Ok(AdmissionToken {
            gate: Arc::clone(&self.inner),
            key,
            ticket,
            released: false,
        })
    }

    /// Number of unexpired slots.
    pub fn occupied(&self) -> usize {
        let now = Instant::now();
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.expires_at > now)
            .count()
    }
}

/// Proof of admission. Frees the slot on release or drop.
#[derive(Debug)]
pub struct AdmissionToken {
    gate: Arc<GateInner>,
    key: SlotKey,
    ticket: u64,
    released: bool,
}

impl AdmissionToken {
    pub fn release(mut self) {
        self.gate.free(self.key, self.ticket);
        self.released = true;
    }
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        if !self.released {
            self.gate.free(self.key, self.ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_entry_conflicts_until_release() {
        let gate = AdmissionGate::default();
        let token = gate.try_enter(1_i64, 7_i64).unwrap();
        assert_eq!(
            gate.try_enter(1_i64, 7_i64).unwrap_err(),
            GateError::Conflict {
                resource_id: 1,
                actor_id: 7
            }
        );

        token.release();
        assert!(gate.try_enter(1_i64, 7_i64).is_ok());
    }

    #[test]
    fn test_drop_frees_slot() {
        let gate = AdmissionGate::default();
        {
            let _token = gate.try_enter(1_i64, 7_i64).unwrap();
            assert_eq!(gate.occupied(), 1);
        }
        assert_eq!(gate.occupied(), 0);
    }

    #[test]
    fn test_other_actor_and_resource_are_independent() {
        let gate = AdmissionGate::default();
        let _a = gate.try_enter(1_i64, 7_i64).unwrap();
        let _b = gate.try_enter(1_i64, 8_i64).unwrap();
        let _c = gate.try_enter(2_i64, 7_i64).unwrap();
        assert_eq!(gate.occupied(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_slot_is_reclaimed() {
        let gate = AdmissionGate::new(Duration::from_secs(5));
        let stale = gate.try_enter(1_i64, 7_i64).unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        let fresh = gate.try_enter(1_i64, 7_i64).unwrap();

        // The stale token must not free the new holder's slot.
        drop(stale);
        assert!(gate.try_enter(1_i64, 7_i64).is_err());
        fresh.release();
        assert!(gate.try_enter(1_i64, 7_i64).is_ok());
    }
}
