//! Per-identity lease lock.
//!
//! A lease is held for at most `hold`; a crashed holder never blocks others
//! past that. Acquisition waits at most `wait` and then fails with
//! [`LockError::Busy`]. Release only removes a lease whose token still
//! matches, so a holder whose lease already expired cannot free someone
//! else's lock.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::LockError;

/// Base delay for lock retry backoff.
const BACKOFF_BASE: Duration = Duration::from_millis(25);

/// Maximum delay between lock attempts.
const BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Compare-and-delete so a stale holder cannot release a newer lease.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Identity of a lock: one resource, one actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    resource_type: &'static str,
    resource_id: i64,
    actor_id: i64,
}

impl LockKey {
    pub fn new(
        resource_type: &'static str,
        resource_id: impl Into<i64>,
        actor_id: impl Into<i64>,
    ) -> Self {
        Self {
            resource_type,
            resource_id: resource_id.into(),
            actor_id: actor_id.into(),
        }
    }

    pub fn resource_type(&self) -> &'static str {
        self.resource_type
    }

    pub fn resource_id(&self) -> i64 {
        self.resource_id
    }

    pub fn actor_id(&self) -> i64 {
        self.actor_id
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:lock:{}:{}",
            self.resource_type, self.resource_id, self.actor_id
        )
    }
}

/// A held lock. Pass it back to [`LockService::release`].
#[derive(Debug)]
pub struct Lease {
    key: LockKey,
    token: String,
    expires_at: Instant,
}

impl Lease {
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[async_trait]
pub trait LockService: Send + Sync + 'static {
    /// Acquires the lease, waiting at most `wait`. The lease lapses on its
    /// own after `hold`.
    async fn acquire(
        &self,
        key: &LockKey,
        wait: Duration,
        hold: Duration,
    ) -> Result<Lease, LockError>;

    /// Releases the lease if it is still the current holder.
    async fn release(&self, lease: Lease) -> Result<(), LockError>;

    /// Releases the lease without waiting for the result. Called from drop
    /// paths where nothing can be awaited.
    fn release_detached(&self, lease: Lease);
}

/// Releases its lease when dropped, unless it was handed back first.
struct LeaseGuard<'a, L: LockService + ?Sized> {
    locks: &'a L,
    lease: Option<Lease>,
}

impl<L: LockService + ?Sized> Drop for LeaseGuard<'_, L> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            tracing::debug!(key = %lease.key, "Critical section abandoned, releasing lease");
            self.locks.release_detached(lease);
        }
    }
}

/// Runs `body` while holding the lease for `key`.
///
/// The lease is released on every exit path of `body`, including a panic
/// or the caller dropping this future. A failed release is logged and does
/// not mask the body's result; the lease expires anyway.
pub async fn with_lease<L, F, Fut, T, E>(
    locks: &L,
    key: &LockKey,
    wait: Duration,
    hold: Duration,
    body: F,
) -> Result<T, E>
where
    L: LockService + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<LockError>,
{
    let mut guard = LeaseGuard {
        locks,
        lease: Some(locks.acquire(key, wait, hold).await?),
    };
    let result = body().await;
    if let Some(lease) = guard.lease.take()
        && let Err(e) = locks.release(lease).await
    {
        tracing::warn!(key = %key, error = %e, "Failed to release lease");
    }
    result
}

#[derive(Debug)]
struct HeldLease {
    token: String,
    expires_at: Instant,
}

/// In-process lease lock.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockService {
    leases: Arc<Mutex<HashMap<LockKey, HeldLease>>>,
    released: Arc<Notify>,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unexpired leases.
    pub fn held(&self) -> usize {
        let now = Instant::now();
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|l| l.expires_at > now)
            .count()
    }

    fn release_now(&self, lease: &Lease) {
        {
            let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
            match leases.get(&lease.key) {
                Some(current) if current.token == lease.token => {
                    leases.remove(&lease.key);
                }
                _ => {
                    tracing::debug!(key = %lease.key, "Lease already lapsed");
                }
            }
        }
        self.released.notify_waiters();
    }

    /// Takes the lease if free or expired. Otherwise returns when the
    /// current holder's lease runs out.
    fn try_acquire(&self, key: &LockKey, hold: Duration) -> Result<Lease, Instant> {
        let now = Instant::now();
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        leases.retain(|_, lease| lease.expires_at > now);
        if let Some(current) = leases.get(key)
            && current.expires_at > now
        {
            return Err(current.expires_at);
        }
        let token = Uuid::new_v4().to_string();
        let expires_at = now + hold;
        leases.insert(
            key.clone(),
            HeldLease {
                token: token.clone(),
                expires_at,
            },
        );
        Ok(Lease {
            key: key.clone(),
            token,
            expires_at,
        })
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    #[tracing::instrument(skip(self, key), fields(key = %key))]
    async fn acquire(
        &self,
        key: &LockKey,
        wait: Duration,
        hold: Duration,
    ) -> Result<Lease, LockError> {
        let deadline = Instant::now() + wait;
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let holder_expires_at = match self.try_acquire(key, hold) {
                Ok(lease) => return Ok(lease),
                Err(at) => at,
            };

            let now = Instant::now();
            if now >= deadline {
                metrics::counter!("lease_lock_busy_total").increment(1);
                return Err(LockError::Busy {
                    key: key.to_string(),
                });
            }
            let wake_at = deadline.min(holder_expires_at);
            let _ = tokio::time::timeout_at(wake_at, released).await;
        }
    }

    async fn release(&self, lease: Lease) -> Result<(), LockError> {
        self.release_now(&lease);
        Ok(())
    }

    fn release_detached(&self, lease: Lease) {
        self.release_now(&lease);
    }
}

/// `Redis`-backed lease lock using `SET NX PX` and a compare-and-delete
/// release script.
#[derive(Clone)]
pub struct RedisLockService {
    conn_manager: ConnectionManager,
}

impl RedisLockService {
    /// Connects to `Redis`.
    ///
    /// # Errors
    ///
    /// Returns error if connection to `Redis` fails.
    pub async fn new(redis_url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await?;
        Ok(Self { conn_manager })
    }

    pub fn from_manager(conn_manager: ConnectionManager) -> Self {
        Self { conn_manager }
    }
}

/// Exponential backoff with jitter for the given attempt.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt.min(8)));
    let capped = exp.min(BACKOFF_MAX);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4);
    capped + Duration::from_millis(jitter_ms)
}

#[async_trait]
impl LockService for RedisLockService {
    #[tracing::instrument(skip(self, key), fields(key = %key))]
    async fn acquire(
        &self,
        key: &LockKey,
        wait: Duration,
        hold: Duration,
    ) -> Result<Lease, LockError> {
        let mut conn = self.conn_manager.clone();
        let redis_key = key.to_string();
        let token = Uuid::new_v4().to_string();
        let hold_ms = u64::try_from(hold.as_millis()).unwrap_or(u64::MAX).max(1);
        let deadline = Instant::now() + wait;
        let mut attempt = 0;

        loop {
            let started = Instant::now();
            let set: Option<String> = redis::cmd("SET")
                .arg(&redis_key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(hold_ms)
                .query_async(&mut conn)
                .await?;
            if set.is_some() {
                return Ok(Lease {
                    key: key.clone(),
                    token,
                    expires_at: started + hold,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                metrics::counter!("lease_lock_busy_total").increment(1);
                return Err(LockError::Busy { key: redis_key });
            }
            let delay = backoff_delay(attempt).min(deadline - now);
            tracing::trace!(attempt, delay_ms = delay.as_millis() as u64, "Lock busy, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn release(&self, lease: Lease) -> Result<(), LockError> {
        let mut conn = self.conn_manager.clone();
        let script = redis::Script::new(RELEASE_SCRIPT);
        let deleted: i64 = script
            .key(lease.key.to_string())
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;
        if deleted == 0 {
            tracing::debug!(key = %lease.key, "Lease already lapsed");
        }
        Ok(())
    }

    fn release_detached(&self, lease: Lease) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %lease.key, "No runtime to release lease, it will lapse");
            return;
        };
        let service = self.clone();
        runtime.spawn(async move {
            let key = lease.key.clone();
            if let Err(e) = service.release(lease).await {
                tracing::warn!(key = %key, error = %e, "Failed to release abandoned lease");
            }
        });
    }
}
