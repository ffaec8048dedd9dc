//! "Already issued" membership cache keyed by coupon.
//!
//! A hit means "probably issued, go confirm in the ledger". A miss means
//! nothing. The cache may lag the ledger in both directions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use common::{CouponId, MemberId};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::time::Instant;

use crate::error::CacheError;

/// Trait for the fast-path dedup cache.
#[async_trait]
pub trait DedupCache: Send + Sync + 'static {
    /// Returns true if the member is recorded as holding the coupon.
    async fn probe(&self, coupon_id: CouponId, member_id: MemberId) -> Result<bool, CacheError>;

    /// Records the member as holding the coupon. Idempotent. The whole
    /// per-coupon set expires after `ttl`.
    async fn record(
        &self,
        coupon_id: CouponId,
        member_id: MemberId,
        ttl: Duration,
    ) -> Result<(), CacheError>;
}

#[derive(Debug, Default)]
struct IssuedSet {
    members: HashSet<MemberId>,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct InMemoryCacheState {
    sets: HashMap<CouponId, IssuedSet>,
    unavailable: bool,
}

/// In-memory dedup cache for tests and single-node use.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDedupCache {
    state: Arc<RwLock<InMemoryCacheState>>,
}

impl InMemoryDedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail, simulating a cache outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.write() {
            state.unavailable = unavailable;
        }
    }

    /// Drops a member from a coupon's set, simulating eviction.
    pub fn forget(&self, coupon_id: CouponId, member_id: MemberId) {
        if let Ok(mut state) = self.state.write()
            && let Some(set) = state.sets.get_mut(&coupon_id)
        {
            set.members.remove(&member_id);
        }
    }

    /// Number of members recorded for a coupon.
    pub fn len(&self, coupon_id: CouponId) -> usize {
        self.state
            .read()
            .ok()
            .and_then(|s| s.sets.get(&coupon_id).map(|set| set.members.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, coupon_id: CouponId) -> bool {
        self.len(coupon_id) == 0
    }

    fn poisoned() -> CacheError {
        CacheError::Unavailable("cache state poisoned".to_string())
    }
}

#[async_trait]
impl DedupCache for InMemoryDedupCache {
    async fn probe(&self, coupon_id: CouponId, member_id: MemberId) -> Result<bool, CacheError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        if state.unavailable {
            return Err(CacheError::Unavailable("cache offline".to_string()));
        }
        let Some(set) = state.sets.get(&coupon_id) else {
            return Ok(false);
        };
        if set.expires_at.is_some_and(|at| Instant::now() >= at) {
            return Ok(false);
        }
        Ok(set.members.contains(&member_id))
    }

    async fn record(
        &self,
        coupon_id: CouponId,
        member_id: MemberId,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        if state.unavailable {
            return Err(CacheError::Unavailable("cache offline".to_string()));
        }
        let now = Instant::now();
        let set = state.sets.entry(coupon_id).or_default();
        if set.expires_at.is_some_and(|at| now >= at) {
            set.members.clear();
        }
        set.members.insert(member_id);
        set.expires_at = Some(now + ttl);
        Ok(())
    }
}

/// `Redis`-backed dedup cache using one set per coupon.
#[derive(Clone)]
pub struct RedisDedupCache {
    conn_manager: ConnectionManager,
}

impl RedisDedupCache {
    /// Connects to `Redis`.
    ///
    /// # Errors
    ///
    /// Returns error if connection to `Redis` fails.
    pub async fn new(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await?;
        Ok(Self { conn_manager })
    }

    pub fn from_manager(conn_manager: ConnectionManager) -> Self {
        Self { conn_manager }
    }

    fn issued_key(coupon_id: CouponId) -> String {
        format!("coupon:issued:{coupon_id}")
    }
}

#[async_trait]
impl DedupCache for RedisDedupCache {
    async fn probe(&self, coupon_id: CouponId, member_id: MemberId) -> Result<bool, CacheError> {
        let mut conn = self.conn_manager.clone();
        let hit: bool = conn
            .sismember(Self::issued_key(coupon_id), member_id.get())
            .await?;
        Ok(hit)
    }

    async fn record(
        &self,
        coupon_id: CouponId,
        member_id: MemberId,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        let key = Self::issued_key(coupon_id);
        let seconds = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        let _: () = redis::pipe()
            .atomic()
            .sadd(&key, member_id.get())
            .ignore()
            .expire(&key, seconds)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
