use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CouponId, EventId, IssuanceId, MemberId, Money, OptionId, OrderId, PaymentId};
use domain::{
    Coupon, Discount, Event, EventStatus, Inventory, MemberCoupon, MemberCouponStatus,
    NewMemberCoupon, NewPayment, Order, OrderLine, OrderStatus, Payment, PaymentLogEntry,
    PaymentStatus,
};
use sqlx::{PgExecutor, PgPool, Postgres, Row, Transaction, postgres::PgRow};

use crate::{DEFAULT_LOCK_WAIT, Ledger, LedgerError, LedgerTx, Result};

/// SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

const COUPON_COLUMNS: &str = "id, name, discount, min_order_amount, total_quantity, \
     issued_quantity, starts_at, ends_at, active";
const EVENT_COLUMNS: &str =
    "id, title, status, is_public, limit_per_user, starts_at, ends_at, coupon_id";
const ORDER_COLUMNS: &str = "id, member_id, status, lines, total_amount, discount_amount, \
     member_coupon_id, settleable, created_at, updated_at";
const PAYMENT_COLUMNS: &str = "id, order_id, amount, provider, payment_key, status, \
     provider_transaction_id, approved_at, created_at";
const ISSUANCE_COLUMNS: &str =
    "id, coupon_id, member_id, status, issued_at, expires_at, used_order_id, used_at";

/// PostgreSQL-backed ledger.
///
/// Row locks are `SELECT ... FOR UPDATE`; every transaction sets a local
/// `lock_timeout` so lock waits are bounded.
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
    lock_wait: Duration,
}

impl PostgresLedger {
    /// Creates a new PostgreSQL ledger.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }
}

fn map_db_err(e: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.is_unique_violation() {
            return LedgerError::UniqueViolation {
                constraint: db_err.constraint().unwrap_or("unknown").to_string(),
            };
        }
        if db_err.code().as_deref() == Some(LOCK_NOT_AVAILABLE) {
            metrics::counter!("ledger_lock_timeouts_total").increment(1);
            return LedgerError::LockTimeout {
                resource: db_err.message().to_string(),
            };
        }
    }
    LedgerError::Database(e)
}

fn to_u32(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| LedgerError::Corrupt(format!("{column} = {value}")))
}

fn to_i32(value: u32, column: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| LedgerError::Corrupt(format!("{column} = {value}")))
}

fn expect_updated(affected: u64, entity: &'static str, id: i64) -> Result<()> {
    if affected == 0 {
        return Err(LedgerError::NotFound { entity, id });
    }
    Ok(())
}

fn corrupt_status(table: &str, status: &str) -> LedgerError {
    LedgerError::Corrupt(format!("{table}.status = {status}"))
}

fn row_to_coupon(row: &PgRow) -> Result<Coupon> {
    let discount: serde_json::Value = row.try_get("discount")?;
    let discount: Discount = serde_json::from_value(discount)?;
    Ok(Coupon {
        id: CouponId::new(row.try_get("id")?),
        name: row.try_get("name")?,
        discount,
        min_order_amount: row
            .try_get::<Option<i64>, _>("min_order_amount")?
            .map(Money::new),
        total_quantity: row
            .try_get::<Option<i32>, _>("total_quantity")?
            .map(|v| to_u32(v, "total_quantity"))
            .transpose()?,
        issued_quantity: to_u32(row.try_get("issued_quantity")?, "issued_quantity")?,
        starts_at: row.try_get("starts_at")?,
        ends_at: row.try_get("ends_at")?,
        active: row.try_get("active")?,
    })
}

fn row_to_event(row: &PgRow) -> Result<Event> {
    let status: String = row.try_get("status")?;
    Ok(Event {
        id: EventId::new(row.try_get("id")?),
        title: row.try_get("title")?,
        status: EventStatus::parse(&status).ok_or_else(|| corrupt_status("events", &status))?,
        public: row.try_get("is_public")?,
        limit_per_user: to_u32(row.try_get("limit_per_user")?, "limit_per_user")?,
        starts_at: row.try_get("starts_at")?,
        ends_at: row.try_get("ends_at")?,
        coupon_id: row.try_get::<Option<i64>, _>("coupon_id")?.map(CouponId::new),
    })
}

fn row_to_order(row: &PgRow) -> Result<Order> {
    let status: String = row.try_get("status")?;
    let lines: serde_json::Value = row.try_get("lines")?;
    let lines: Vec<OrderLine> = serde_json::from_value(lines)?;
    Ok(Order {
        id: OrderId::new(row.try_get("id")?),
        member_id: MemberId::new(row.try_get("member_id")?),
        status: OrderStatus::parse(&status).ok_or_else(|| corrupt_status("orders", &status))?,
        lines,
        total_amount: Money::new(row.try_get("total_amount")?),
        discount_amount: Money::new(row.try_get("discount_amount")?),
        member_coupon_id: row
            .try_get::<Option<i64>, _>("member_coupon_id")?
            .map(IssuanceId::new),
        settleable: row.try_get("settleable")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_inventory(row: &PgRow) -> Result<Inventory> {
    Ok(Inventory::new(
        OptionId::new(row.try_get("option_id")?),
        to_u32(row.try_get("available")?, "available")?,
    ))
}

fn row_to_issuance(row: &PgRow) -> Result<MemberCoupon> {
    let status: String = row.try_get("status")?;
    Ok(MemberCoupon {
        id: IssuanceId::new(row.try_get("id")?),
        coupon_id: CouponId::new(row.try_get("coupon_id")?),
        member_id: MemberId::new(row.try_get("member_id")?),
        status: MemberCouponStatus::parse(&status)
            .ok_or_else(|| corrupt_status("member_coupons", &status))?,
        issued_at: row.try_get("issued_at")?,
        expires_at: row.try_get("expires_at")?,
        used_order_id: row.try_get::<Option<i64>, _>("used_order_id")?.map(OrderId::new),
        used_at: row.try_get("used_at")?,
    })
}

fn row_to_log(row: &PgRow) -> Result<PaymentLogEntry> {
    let status: String = row.try_get("status")?;
    Ok(PaymentLogEntry {
        status: PaymentStatus::parse(&status)
            .ok_or_else(|| corrupt_status("payment_logs", &status))?,
        actor: row.try_get("actor")?,
        reason: row.try_get("reason")?,
        at: row.try_get("logged_at")?,
    })
}

fn row_to_payment(row: &PgRow, logs: Vec<PaymentLogEntry>) -> Result<Payment> {
    let status: String = row.try_get("status")?;
    Ok(Payment::restore(
        PaymentId::new(row.try_get("id")?),
        OrderId::new(row.try_get("order_id")?),
        Money::new(row.try_get("amount")?),
        row.try_get("provider")?,
        row.try_get("payment_key")?,
        PaymentStatus::parse(&status).ok_or_else(|| corrupt_status("payments", &status))?,
        row.try_get("provider_transaction_id")?,
        row.try_get("approved_at")?,
        row.try_get("created_at")?,
        logs,
    ))
}

async fn fetch_logs<'e, E: PgExecutor<'e>>(
    executor: E,
    payment_id: PaymentId,
) -> Result<Vec<PaymentLogEntry>> {
    let rows = sqlx::query(
        "SELECT status, actor, reason, logged_at FROM payment_logs WHERE payment_id = $1 ORDER BY seq",
    )
    .bind(payment_id.get())
    .fetch_all(executor)
    .await
    .map_err(map_db_err)?;
    rows.iter().map(row_to_log).collect()
}

#[async_trait]
impl Ledger for PostgresLedger {
    type Tx = PostgresLedgerTx;

    async fn begin(&self) -> Result<Self::Tx> {
        let mut tx = self.pool.begin().await?;
        let statement = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_wait.as_millis());
        sqlx::query(&statement).execute(&mut *tx).await?;
        Ok(PostgresLedgerTx { tx })
    }

    async fn coupon(&self, id: CouponId) -> Result<Option<Coupon>> {
        let sql = format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_coupon).transpose()
    }

    async fn event(&self, id: EventId) -> Result<Option<Event>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    async fn sweepable_events(&self) -> Result<Vec<Event>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE status IN ('DRAFT', 'PLANNED', 'OPEN') ORDER BY id"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn order(&self, id: OrderId) -> Result<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_order).transpose()
    }

    async fn payment(&self, id: PaymentId) -> Result<Option<Payment>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1");
        let Some(row) = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let logs = fetch_logs(&self.pool, id).await?;
        row_to_payment(&row, logs).map(Some)
    }

    async fn payment_for_order(&self, order_id: OrderId) -> Result<Option<Payment>> {
        let id: Option<i64> =
            sqlx::query_scalar("SELECT MAX(id) FROM payments WHERE order_id = $1")
                .bind(order_id.get())
                .fetch_one(&self.pool)
                .await?;
        match id {
            Some(id) => self.payment(PaymentId::new(id)).await,
            None => Ok(None),
        }
    }

    async fn inventory(&self, option_id: OptionId) -> Result<Option<Inventory>> {
        let row = sqlx::query("SELECT option_id, available FROM inventory WHERE option_id = $1")
            .bind(option_id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_inventory).transpose()
    }

    async fn member_coupon(&self, id: IssuanceId) -> Result<Option<MemberCoupon>> {
        let sql = format!("SELECT {ISSUANCE_COLUMNS} FROM member_coupons WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_issuance).transpose()
    }

    async fn find_active_issuance(
        &self,
        member_id: MemberId,
        coupon_id: CouponId,
    ) -> Result<Option<MemberCoupon>> {
        let sql = format!(
            "SELECT {ISSUANCE_COLUMNS} FROM member_coupons \
             WHERE member_id = $1 AND coupon_id = $2 AND status IN ('AVAILABLE', 'USED')"
        );
        let row = sqlx::query(&sql)
            .bind(member_id.get())
            .bind(coupon_id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_issuance).transpose()
    }

    async fn stale_pending_payments(&self, created_before: DateTime<Utc>) -> Result<Vec<Payment>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments \
             WHERE status = 'PENDING' AND created_at < $1 ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(created_before)
            .fetch_all(&self.pool)
            .await?;
        let mut payments = Vec::with_capacity(rows.len());
        for row in &rows {
            let id = PaymentId::new(row.try_get("id")?);
            let logs = fetch_logs(&self.pool, id).await?;
            payments.push(row_to_payment(row, logs)?);
        }
        Ok(payments)
    }
}

/// Transaction over a [`PostgresLedger`].
pub struct PostgresLedgerTx {
    tx: Transaction<'static, Postgres>,
}

impl PostgresLedgerTx {
    async fn fetch_for_update(&mut self, sql: &str, id: i64) -> Result<Option<PgRow>> {
        sqlx::query(sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_err)
    }

}

#[async_trait]
impl LedgerTx for PostgresLedgerTx {
    async fn insert_coupon(&mut self, coupon: &Coupon) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO coupons (id, name, discount, min_order_amount, total_quantity, issued_quantity, starts_at, ends_at, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(coupon.id.get())
        .bind(&coupon.name)
        .bind(serde_json::to_value(coupon.discount)?)
        .bind(coupon.min_order_amount.map(|m| m.amount()))
        .bind(
            coupon
                .total_quantity
                .map(|v| to_i32(v, "total_quantity"))
                .transpose()?,
        )
        .bind(to_i32(coupon.issued_quantity, "issued_quantity")?)
        .bind(coupon.starts_at)
        .bind(coupon.ends_at)
        .bind(coupon.active)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn coupon_for_update(&mut self, id: CouponId) -> Result<Option<Coupon>> {
        let sql = format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE id = $1 FOR UPDATE");
        let row = self.fetch_for_update(&sql, id.get()).await?;
        row.as_ref().map(row_to_coupon).transpose()
    }

    async fn save_coupon(&mut self, coupon: &Coupon) -> Result<()> {
        let result = sqlx::query(
            "UPDATE coupons SET issued_quantity = $2, active = $3 WHERE id = $1",
        )
        .bind(coupon.id.get())
        .bind(to_i32(coupon.issued_quantity, "issued_quantity")?)
        .bind(coupon.active)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        expect_updated(result.rows_affected(), "coupon", coupon.id.get())
    }

    async fn insert_event(&mut self, event: &Event) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (id, title, status, is_public, limit_per_user, starts_at, ends_at, coupon_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id.get())
        .bind(&event.title)
        .bind(event.status.as_str())
        .bind(event.public)
        .bind(to_i32(event.limit_per_user, "limit_per_user")?)
        .bind(event.starts_at)
        .bind(event.ends_at)
        .bind(event.coupon_id.map(|c| c.get()))
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn event_for_update(&mut self, id: EventId) -> Result<Option<Event>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1 FOR UPDATE");
        let row = self.fetch_for_update(&sql, id.get()).await?;
        row.as_ref().map(row_to_event).transpose()
    }

    async fn save_event(&mut self, event: &Event) -> Result<()> {
        let result = sqlx::query("UPDATE events SET status = $2 WHERE id = $1")
            .bind(event.id.get())
            .bind(event.status.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_err)?;
        expect_updated(result.rows_affected(), "event", event.id.get())
    }

    async fn insert_order(&mut self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, member_id, status, lines, total_amount, discount_amount, member_coupon_id, settleable, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(order.id.get())
        .bind(order.member_id.get())
        .bind(order.status.as_str())
        .bind(serde_json::to_value(&order.lines)?)
        .bind(order.total_amount.amount())
        .bind(order.discount_amount.amount())
        .bind(order.member_coupon_id.map(|id| id.get()))
        .bind(order.settleable)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn order_for_update(&mut self, id: OrderId) -> Result<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE");
        let row = self.fetch_for_update(&sql, id.get()).await?;
        row.as_ref().map(row_to_order).transpose()
    }

    async fn save_order(&mut self, order: &Order) -> Result<()> {
        let result = sqlx::query(
            "UPDATE orders SET status = $2, settleable = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(order.id.get())
        .bind(order.status.as_str())
        .bind(order.settleable)
        .bind(order.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        expect_updated(result.rows_affected(), "order", order.id.get())
    }

    async fn insert_inventory(&mut self, inventory: &Inventory) -> Result<()> {
        sqlx::query("INSERT INTO inventory (option_id, available) VALUES ($1, $2)")
            .bind(inventory.option_id.get())
            .bind(to_i32(inventory.available, "available")?)
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    async fn inventory_for_update(&mut self, option_id: OptionId) -> Result<Option<Inventory>> {
        let row = self
            .fetch_for_update(
                "SELECT option_id, available FROM inventory WHERE option_id = $1 FOR UPDATE",
                option_id.get(),
            )
            .await?;
        row.as_ref().map(row_to_inventory).transpose()
    }

    async fn save_inventory(&mut self, inventory: &Inventory) -> Result<()> {
        let result = sqlx::query("UPDATE inventory SET available = $2 WHERE option_id = $1")
            .bind(inventory.option_id.get())
            .bind(to_i32(inventory.available, "available")?)
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_err)?;
        expect_updated(result.rows_affected(), "inventory", inventory.option_id.get())
    }

    async fn insert_payment(&mut self, payment: NewPayment) -> Result<Payment> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO payments (order_id, amount, provider, payment_key, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(payment.order_id.get())
        .bind(payment.amount.amount())
        .bind(&payment.provider)
        .bind(&payment.payment_key)
        .bind(PaymentStatus::Pending.as_str())
        .bind(payment.created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        Ok(Payment::from_new(PaymentId::new(id), payment))
    }

    async fn payment_for_update(&mut self, id: PaymentId) -> Result<Option<Payment>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1 FOR UPDATE");
        let Some(row) = self.fetch_for_update(&sql, id.get()).await? else {
            return Ok(None);
        };
        let logs = fetch_logs(&mut *self.tx, id).await?;
        row_to_payment(&row, logs).map(Some)
    }

    async fn save_payment(&mut self, payment: &Payment) -> Result<()> {
        let result = sqlx::query(
            "UPDATE payments SET status = $2, provider_transaction_id = $3, approved_at = $4 WHERE id = $1",
        )
        .bind(payment.id.get())
        .bind(payment.status.as_str())
        .bind(payment.provider_transaction_id.as_deref())
        .bind(payment.approved_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        expect_updated(result.rows_affected(), "payment", payment.id.get())?;

        let stored: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM payment_logs WHERE payment_id = $1")
                .bind(payment.id.get())
                .fetch_one(&mut *self.tx)
                .await
                .map_err(map_db_err)?;
        let stored = usize::try_from(stored)
            .map_err(|_| LedgerError::Corrupt(format!("payment_logs count {stored}")))?;
        if stored > payment.logs().len() {
            return Err(LedgerError::Corrupt(format!(
                "payment {} log would shrink",
                payment.id
            )));
        }

        for (seq, entry) in payment.logs().iter().enumerate().skip(stored) {
            sqlx::query(
                r#"
                INSERT INTO payment_logs (payment_id, seq, status, actor, reason, logged_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(payment.id.get())
            .bind(i32::try_from(seq).map_err(|_| LedgerError::Corrupt(format!("seq {seq}")))?)
            .bind(entry.status.as_str())
            .bind(&entry.actor)
            .bind(entry.reason.as_deref())
            .bind(entry.at)
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_err)?;
        }
        Ok(())
    }

    async fn insert_issuance(&mut self, issuance: NewMemberCoupon) -> Result<MemberCoupon> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO member_coupons (coupon_id, member_id, status, issued_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(issuance.coupon_id.get())
        .bind(issuance.member_id.get())
        .bind(MemberCouponStatus::Available.as_str())
        .bind(issuance.issued_at)
        .bind(issuance.expires_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        Ok(MemberCoupon::from_new(IssuanceId::new(id), issuance))
    }

    async fn member_coupon_for_update(&mut self, id: IssuanceId) -> Result<Option<MemberCoupon>> {
        let sql = format!("SELECT {ISSUANCE_COLUMNS} FROM member_coupons WHERE id = $1 FOR UPDATE");
        let row = self.fetch_for_update(&sql, id.get()).await?;
        row.as_ref().map(row_to_issuance).transpose()
    }

    async fn find_active_issuance(
        &mut self,
        member_id: MemberId,
        coupon_id: CouponId,
    ) -> Result<Option<MemberCoupon>> {
        let sql = format!(
            "SELECT {ISSUANCE_COLUMNS} FROM member_coupons \
             WHERE member_id = $1 AND coupon_id = $2 AND status IN ('AVAILABLE', 'USED')"
        );
        let row = sqlx::query(&sql)
            .bind(member_id.get())
            .bind(coupon_id.get())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_err)?;
        row.as_ref().map(row_to_issuance).transpose()
    }

    async fn count_issuances(&mut self, member_id: MemberId, coupon_id: CouponId) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM member_coupons WHERE member_id = $1 AND coupon_id = $2",
        )
        .bind(member_id.get())
        .bind(coupon_id.get())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        u32::try_from(count).map_err(|_| LedgerError::Corrupt(format!("{count} issuances")))
    }

    async fn save_issuance(&mut self, issuance: &MemberCoupon) -> Result<()> {
        let result = sqlx::query(
            "UPDATE member_coupons SET status = $2, used_order_id = $3, used_at = $4 WHERE id = $1",
        )
        .bind(issuance.id.get())
        .bind(issuance.status.as_str())
        .bind(issuance.used_order_id.map(|id| id.get()))
        .bind(issuance.used_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        expect_updated(result.rows_affected(), "member coupon", issuance.id.get())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(map_db_err)
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(map_db_err)
    }
}
