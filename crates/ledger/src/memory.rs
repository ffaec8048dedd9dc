use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CouponId, EventId, IssuanceId, MemberId, OptionId, OrderId, PaymentId};
use domain::{
    Coupon, Event, EventStatus, Inventory, MemberCoupon, NewMemberCoupon, NewPayment, Order,
    Payment, PaymentStatus,
};
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};

use crate::{DEFAULT_LOCK_WAIT, Ledger, LedgerError, LedgerTx, Result};

const ACTIVE_ISSUANCE_CONSTRAINT: &str = "uq_member_coupon_active";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Coupon(CouponId),
    Event(EventId),
    Order(OrderId),
    Inventory(OptionId),
    Payment(PaymentId),
    Issuance(IssuanceId),
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowKey::Coupon(id) => write!(f, "coupon {id}"),
            RowKey::Event(id) => write!(f, "event {id}"),
            RowKey::Order(id) => write!(f, "order {id}"),
            RowKey::Inventory(id) => write!(f, "inventory {id}"),
            RowKey::Payment(id) => write!(f, "payment {id}"),
            RowKey::Issuance(id) => write!(f, "member coupon {id}"),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Tables {
    coupons: HashMap<CouponId, Coupon>,
    events: HashMap<EventId, Event>,
    orders: HashMap<OrderId, Order>,
    inventory: HashMap<OptionId, Inventory>,
    payments: HashMap<PaymentId, Payment>,
    issuances: HashMap<IssuanceId, MemberCoupon>,
}

impl Tables {
    fn apply(&mut self, staged: Tables) {
        self.coupons.extend(staged.coupons);
        self.events.extend(staged.events);
        self.orders.extend(staged.orders);
        self.inventory.extend(staged.inventory);
        self.payments.extend(staged.payments);
        self.issuances.extend(staged.issuances);
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    committed: Tables,
    /// (member, coupon) pairs with an active insert not yet committed.
    reserved: HashSet<(MemberId, CouponId)>,
    next_issuance_id: i64,
    next_payment_id: i64,
    /// When set, this many more commits succeed and every later one fails.
    commits_before_failure: Option<usize>,
}

fn lookup<K: Eq + Hash, V: Clone>(
    staged: &HashMap<K, V>,
    committed: &HashMap<K, V>,
    key: &K,
) -> Option<V> {
    staged.get(key).or_else(|| committed.get(key)).cloned()
}

/// In-memory ledger for tests and single-process deployments.
///
/// Row locks are real `tokio` mutexes, so concurrent transactions contend
/// exactly like they would on `SELECT ... FOR UPDATE`. Writes are staged per
/// transaction and applied atomically on commit.
#[derive(Clone)]
pub struct InMemoryLedger {
    state: Arc<RwLock<LedgerState>>,
    row_locks: Arc<Mutex<HashMap<RowKey, Arc<RowMutex<()>>>>>,
    lock_wait: Duration,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            row_locks: Arc::default(),
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }
}

impl InMemoryLedger {
    /// Creates a new empty in-memory ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides how long a transaction waits for a row lock.
    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    /// Lets `n` more commits succeed, then fails every later commit.
    pub fn fail_commits_after(&self, n: usize) {
        if let Ok(mut state) = self.state.write() {
            state.commits_before_failure = Some(n);
        }
    }

    /// Stops injecting commit failures.
    pub fn clear_commit_failures(&self) {
        if let Ok(mut state) = self.state.write() {
            state.commits_before_failure = None;
        }
    }

    /// Every committed issuance record for a coupon, in id order.
    pub fn issuances_for_coupon(&self, coupon_id: CouponId) -> Vec<MemberCoupon> {
        let mut records: Vec<MemberCoupon> = self
            .state
            .read()
            .map(|s| {
                s.committed
                    .issuances
                    .values()
                    .filter(|mc| mc.coupon_id == coupon_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by_key(|mc| mc.id);
        records
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, LedgerState>> {
        self.state
            .read()
            .map_err(|_| LedgerError::Unavailable("ledger state poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, LedgerState>> {
        self.state
            .write()
            .map_err(|_| LedgerError::Unavailable("ledger state poisoned".to_string()))
    }

    fn row_mutex(&self, key: RowKey) -> Result<Arc<RowMutex<()>>> {
        let mut locks = self
            .row_locks
            .lock()
            .map_err(|_| LedgerError::Unavailable("row lock table poisoned".to_string()))?;
        Ok(locks.entry(key).or_default().clone())
    }

    /// Forgets row mutexes nobody holds or waits on. Handles are only cloned
    /// under the table lock, so a count of one means the table owns the last.
    fn prune_row_locks(&self, keys: &[RowKey]) {
        let Ok(mut locks) = self.row_locks.lock() else {
            return;
        };
        for key in keys {
            if locks.get(key).is_some_and(|m| Arc::strong_count(m) == 1) {
                locks.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn tracked_row_locks(&self) -> usize {
        self.row_locks.lock().map_or(0, |locks| locks.len())
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    type Tx = InMemoryLedgerTx;

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(InMemoryLedgerTx {
            ledger: self.clone(),
            held: HashMap::new(),
            staged: Tables::default(),
            reservations: Vec::new(),
        })
    }

    async fn coupon(&self, id: CouponId) -> Result<Option<Coupon>> {
        Ok(self.read()?.committed.coupons.get(&id).cloned())
    }

    async fn event(&self, id: EventId) -> Result<Option<Event>> {
        Ok(self.read()?.committed.events.get(&id).cloned())
    }

    async fn sweepable_events(&self) -> Result<Vec<Event>> {
        let state = self.read()?;
        let mut events: Vec<Event> = state
            .committed
            .events
            .values()
            .filter(|e| {
                matches!(
                    e.status,
                    EventStatus::Draft | EventStatus::Planned | EventStatus::Open
                )
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| e.id);
        Ok(events)
    }

    async fn order(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.read()?.committed.orders.get(&id).cloned())
    }

    async fn payment(&self, id: PaymentId) -> Result<Option<Payment>> {
        Ok(self.read()?.committed.payments.get(&id).cloned())
    }

    async fn payment_for_order(&self, order_id: OrderId) -> Result<Option<Payment>> {
        Ok(self
            .read()?
            .committed
            .payments
            .values()
            .filter(|p| p.order_id == order_id)
            .max_by_key(|p| p.id)
            .cloned())
    }

    async fn inventory(&self, option_id: OptionId) -> Result<Option<Inventory>> {
        Ok(self.read()?.committed.inventory.get(&option_id).copied())
    }

    async fn member_coupon(&self, id: IssuanceId) -> Result<Option<MemberCoupon>> {
        Ok(self.read()?.committed.issuances.get(&id).cloned())
    }

    async fn find_active_issuance(
        &self,
        member_id: MemberId,
        coupon_id: CouponId,
    ) -> Result<Option<MemberCoupon>> {
        Ok(self
            .read()?
            .committed
            .issuances
            .values()
            .find(|mc| {
                mc.member_id == member_id && mc.coupon_id == coupon_id && mc.status.is_active()
            })
            .cloned())
    }

    async fn stale_pending_payments(&self, created_before: DateTime<Utc>) -> Result<Vec<Payment>> {
        let state = self.read()?;
        let mut payments: Vec<Payment> = state
            .committed
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Pending && p.created_at < created_before)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.id);
        Ok(payments)
    }
}

/// Transaction over an [`InMemoryLedger`].
pub struct InMemoryLedgerTx {
    ledger: InMemoryLedger,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    staged: Tables,
    reservations: Vec<(MemberId, CouponId)>,
}

impl InMemoryLedgerTx {
    async fn lock(&mut self, key: RowKey) -> Result<()> {
        if self.held.contains_key(&key) {
            return Ok(());
        }
        let mutex = self.ledger.row_mutex(key)?;
        match tokio::time::timeout(self.ledger.lock_wait, mutex.lock_owned()).await {
            Ok(guard) => {
                self.held.insert(key, guard);
                Ok(())
            }
            Err(_) => {
                metrics::counter!("ledger_lock_timeouts_total").increment(1);
                tracing::debug!(resource = %key, "row lock wait timed out");
                Err(LedgerError::LockTimeout {
                    resource: key.to_string(),
                })
            }
        }
    }

    fn visible_issuances(&self, member_id: MemberId, coupon_id: CouponId) -> Result<Vec<MemberCoupon>> {
        let state = self.ledger.read()?;
        let mut records: HashMap<IssuanceId, MemberCoupon> = state
            .committed
            .issuances
            .values()
            .filter(|mc| mc.member_id == member_id && mc.coupon_id == coupon_id)
            .map(|mc| (mc.id, mc.clone()))
            .collect();
        for mc in self.staged.issuances.values() {
            if mc.member_id == member_id && mc.coupon_id == coupon_id {
                records.insert(mc.id, mc.clone());
            }
        }
        let mut records: Vec<MemberCoupon> = records.into_values().collect();
        records.sort_by_key(|mc| mc.id);
        Ok(records)
    }
}

impl Drop for InMemoryLedgerTx {
    fn drop(&mut self) {
        if !self.reservations.is_empty()
            && let Ok(mut state) = self.ledger.state.write()
        {
            for key in self.reservations.drain(..) {
                state.reserved.remove(&key);
            }
        }
        if !self.held.is_empty() {
            let released: Vec<RowKey> = self.held.drain().map(|(key, _guard)| key).collect();
            self.ledger.prune_row_locks(&released);
        }
    }
}

#[async_trait]
impl LedgerTx for InMemoryLedgerTx {
    async fn insert_coupon(&mut self, coupon: &Coupon) -> Result<()> {
        self.lock(RowKey::Coupon(coupon.id)).await?;
        let exists = lookup(&self.staged.coupons, &self.ledger.read()?.committed.coupons, &coupon.id).is_some();
        if exists {
            return Err(LedgerError::UniqueViolation {
                constraint: "coupons_pkey".to_string(),
            });
        }
        self.staged.coupons.insert(coupon.id, coupon.clone());
        Ok(())
    }

    async fn coupon_for_update(&mut self, id: CouponId) -> Result<Option<Coupon>> {
        self.lock(RowKey::Coupon(id)).await?;
        let coupon = lookup(&self.staged.coupons, &self.ledger.read()?.committed.coupons, &id);
        Ok(coupon)
    }

    async fn save_coupon(&mut self, coupon: &Coupon) -> Result<()> {
        self.lock(RowKey::Coupon(coupon.id)).await?;
        let exists = lookup(&self.staged.coupons, &self.ledger.read()?.committed.coupons, &coupon.id).is_some();
        if !exists {
            return Err(LedgerError::NotFound {
                entity: "coupon",
                id: coupon.id.get(),
            });
        }
        self.staged.coupons.insert(coupon.id, coupon.clone());
        Ok(())
    }

    async fn insert_event(&mut self, event: &Event) -> Result<()> {
        self.lock(RowKey::Event(event.id)).await?;
        let exists = lookup(&self.staged.events, &self.ledger.read()?.committed.events, &event.id).is_some();
        if exists {
            return Err(LedgerError::UniqueViolation {
                constraint: "events_pkey".to_string(),
            });
        }
        self.staged.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn event_for_update(&mut self, id: EventId) -> Result<Option<Event>> {
        self.lock(RowKey::Event(id)).await?;
        let event = lookup(&self.staged.events, &self.ledger.read()?.committed.events, &id);
        Ok(event)
    }

    async fn save_event(&mut self, event: &Event) -> Result<()> {
        self.lock(RowKey::Event(event.id)).await?;
        let exists = lookup(&self.staged.events, &self.ledger.read()?.committed.events, &event.id).is_some();
        if !exists {
            return Err(LedgerError::NotFound {
                entity: "event",
                id: event.id.get(),
            });
        }
        self.staged.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn insert_order(&mut self, order: &Order) -> Result<()> {
        self.lock(RowKey::Order(order.id)).await?;
        let exists = lookup(&self.staged.orders, &self.ledger.read()?.committed.orders, &order.id).is_some();
        if exists {
            return Err(LedgerError::UniqueViolation {
                constraint: "orders_pkey".to_string(),
            });
        }
        self.staged.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn order_for_update(&mut self, id: OrderId) -> Result<Option<Order>> {
        self.lock(RowKey::Order(id)).await?;
        let order = lookup(&self.staged.orders, &self.ledger.read()?.committed.orders, &id);
        Ok(order)
    }

    async fn save_order(&mut self, order: &Order) -> Result<()> {
        self.lock(RowKey::Order(order.id)).await?;
        let exists = lookup(&self.staged.orders, &self.ledger.read()?.committed.orders, &order.id).is_some();
        if !exists {
            return Err(LedgerError::NotFound {
                entity: "order",
                id: order.id.get(),
            });
        }
        self.staged.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn insert_inventory(&mut self, inventory: &Inventory) -> Result<()> {
        self.lock(RowKey::Inventory(inventory.option_id)).await?;
        let exists = lookup(
            &self.staged.inventory,
            &self.ledger.read()?.committed.inventory,
            &inventory.option_id,
        )
        .is_some();
        if exists {
            return Err(LedgerError::UniqueViolation {
                constraint: "inventory_pkey".to_string(),
            });
        }
        self.staged.inventory.insert(inventory.option_id, *inventory);
        Ok(())
    }

    async fn inventory_for_update(&mut self, option_id: OptionId) -> Result<Option<Inventory>> {
        self.lock(RowKey::Inventory(option_id)).await?;
        let inventory = lookup(
            &self.staged.inventory,
            &self.ledger.read()?.committed.inventory,
            &option_id,
        );
        Ok(inventory)
    }

    async fn save_inventory(&mut self, inventory: &Inventory) -> Result<()> {
        self.lock(RowKey::Inventory(inventory.option_id)).await?;
        let exists = lookup(
            &self.staged.inventory,
            &self.ledger.read()?.committed.inventory,
            &inventory.option_id,
        )
        .is_some();
        if !exists {
            return Err(LedgerError::NotFound {
                entity: "inventory",
                id: inventory.option_id.get(),
            });
        }
        self.staged.inventory.insert(inventory.option_id, *inventory);
        Ok(())
    }

    async fn insert_payment(&mut self, payment: NewPayment) -> Result<Payment> {
        let id = {
            let mut state = self.ledger.write()?;
            state.next_payment_id += 1;
            PaymentId::new(state.next_payment_id)
        };
        self.lock(RowKey::Payment(id)).await?;
        let payment = Payment::from_new(id, payment);
        self.staged.payments.insert(id, payment.clone());
        Ok(payment)
    }

    async fn payment_for_update(&mut self, id: PaymentId) -> Result<Option<Payment>> {
        self.lock(RowKey::Payment(id)).await?;
        let payment = lookup(&self.staged.payments, &self.ledger.read()?.committed.payments, &id);
        Ok(payment)
    }

    async fn save_payment(&mut self, payment: &Payment) -> Result<()> {
        self.lock(RowKey::Payment(payment.id)).await?;
        let stored = lookup(
            &self.staged.payments,
            &self.ledger.read()?.committed.payments,
            &payment.id,
        );
        match stored {
            None => Err(LedgerError::NotFound {
                entity: "payment",
                id: payment.id.get(),
            }),
            Some(stored) if stored.logs().len() > payment.logs().len() => Err(
                LedgerError::Corrupt(format!("payment {} log would shrink", payment.id)),
            ),
            Some(_) => {
                self.staged.payments.insert(payment.id, payment.clone());
                Ok(())
            }
        }
    }

    async fn insert_issuance(&mut self, issuance: NewMemberCoupon) -> Result<MemberCoupon> {
        let key = (issuance.member_id, issuance.coupon_id);
        let same_key = |mc: &MemberCoupon| mc.member_id == key.0 && mc.coupon_id == key.1;
        let id = {
            let mut state = self.ledger.write()?;
            let committed_active = state.committed.issuances.values().any(|mc| {
                same_key(mc)
                    && mc.status.is_active()
                    && self
                        .staged
                        .issuances
                        .get(&mc.id)
                        .is_none_or(|staged| staged.status.is_active())
            });
            let staged_active = self
                .staged
                .issuances
                .values()
                .any(|mc| same_key(mc) && mc.status.is_active());
            let reserved_elsewhere =
                state.reserved.contains(&key) && !self.reservations.contains(&key);
            if committed_active || staged_active || reserved_elsewhere {
                return Err(LedgerError::UniqueViolation {
                    constraint: ACTIVE_ISSUANCE_CONSTRAINT.to_string(),
                });
            }
            state.reserved.insert(key);
            state.next_issuance_id += 1;
            IssuanceId::new(state.next_issuance_id)
        };
        if !self.reservations.contains(&key) {
            self.reservations.push(key);
        }
        self.lock(RowKey::Issuance(id)).await?;
        let record = MemberCoupon::from_new(id, issuance);
        self.staged.issuances.insert(id, record.clone());
        Ok(record)
    }

    async fn member_coupon_for_update(&mut self, id: IssuanceId) -> Result<Option<MemberCoupon>> {
        self.lock(RowKey::Issuance(id)).await?;
        let record = lookup(&self.staged.issuances, &self.ledger.read()?.committed.issuances, &id);
        Ok(record)
    }

    async fn find_active_issuance(
        &mut self,
        member_id: MemberId,
        coupon_id: CouponId,
    ) -> Result<Option<MemberCoupon>> {
        Ok(self
            .visible_issuances(member_id, coupon_id)?
            .into_iter()
            .find(|mc| mc.status.is_active()))
    }

    async fn count_issuances(&mut self, member_id: MemberId, coupon_id: CouponId) -> Result<u32> {
        let count = self.visible_issuances(member_id, coupon_id)?.len();
        u32::try_from(count).map_err(|_| LedgerError::Corrupt(format!("{count} issuances")))
    }

    async fn save_issuance(&mut self, issuance: &MemberCoupon) -> Result<()> {
        self.lock(RowKey::Issuance(issuance.id)).await?;
        let exists = lookup(
            &self.staged.issuances,
            &self.ledger.read()?.committed.issuances,
            &issuance.id,
        )
        .is_some();
        if !exists {
            return Err(LedgerError::NotFound {
                entity: "member coupon",
                id: issuance.id.get(),
            });
        }
        self.staged.issuances.insert(issuance.id, issuance.clone());
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        let mut state = self.ledger.write()?;
        if let Some(remaining) = state.commits_before_failure.as_mut() {
            if *remaining == 0 {
                return Err(LedgerError::Unavailable("commit rejected".to_string()));
            }
            *remaining -= 1;
        }
        let staged = std::mem::take(&mut self.staged);
        state.committed.apply(staged);
        for key in self.reservations.drain(..) {
            state.reserved.remove(&key);
        }
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        drop(self);
        Ok(())
    }
}
