use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};

use super::{lock_order_of, Store, StoreError, StoreTx};
use crate::config::Config;
use crate::models::{
    NewOrder, Order, OrderLine, OrderLineView, OrderStatus, OrderView, Seat, TicketOffering, User,
    Voucher,
};

/// First key of the two-key advisory lock guarding identity-document claims.
const IDENTITY_DOCUMENT_LOCK_CLASS: i32 = 0x1D0C;

const OFFERING_COLUMNS: &str = "id, event_id, category_id, type_id, name, price, quota, \
     sold_count, requires_identity_document, created_at, updated_at";
const SEAT_COLUMNS: &str = "id, event_id, type_id, seat_number, is_booked, created_at, updated_at";
const VOUCHER_COLUMNS: &str = "id, code, scope, event_id, discount, discount_kind, valid_until, \
     usage_limit, used_count, created_at, updated_at";
const ORDER_COLUMNS: &str =
    "id, user_id, total_amount, discount_amount, status, paid_at, created_at, updated_at";
const ORDER_LINE_COLUMNS: &str = "id, order_id, ticket_offering_id, quantity, unit_price, \
     identity_document_number, identity_document_type, seat_id";

const LINE_VIEW_QUERY: &str = r#"
SELECT l.order_id,
       t.id AS ticket_id,
       t.name AS ticket_name,
       c.name AS category,
       ty.name AS ticket_type,
       e.name AS event_name,
       e.location AS event_location,
       e.starts_at AS event_date,
       l.quantity,
       l.unit_price,
       l.unit_price * l.quantity AS subtotal,
       t.requires_identity_document,
       l.seat_id,
       s.seat_number
FROM order_lines l
JOIN ticket_offerings t ON t.id = l.ticket_offering_id
JOIN events e ON e.id = t.event_id
JOIN ticket_categories c ON c.id = t.category_id
JOIN ticket_types ty ON ty.id = t.type_id
LEFT JOIN seats s ON s.id = l.seat_id
WHERE l.order_id = ANY($1)
ORDER BY l.order_id, l.id
"#;

#[derive(FromRow)]
struct LineViewRow {
    order_id: i64,
    #[sqlx(flatten)]
    line: OrderLineView,
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &Config) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(config.database_acquire_timeout)
            .connect(&config.database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn views_for(&self, orders: Vec<Order>) -> Result<Vec<OrderView>, StoreError> {
        let ids: Vec<i64> = orders.iter().map(|order| order.id).collect();
        let rows: Vec<LineViewRow> = sqlx::query_as(LINE_VIEW_QUERY)
            .bind(&ids)
            .fetch_all(&self.pool)
            .await?;

        let mut lines: BTreeMap<i64, Vec<OrderLineView>> = BTreeMap::new();
        for row in rows {
            lines.entry(row.order_id).or_default().push(row.line);
        }

        Ok(orders
            .into_iter()
            .map(|order| {
                let detail = lines.remove(&order.id).unwrap_or_default();
                OrderView::new(order, detail)
            })
            .collect())
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(PgTx { tx })
    }

    async fn find_user_by_token(&self, token: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, name, email, email_verified, api_token, created_at, updated_at \
             FROM users WHERE api_token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_order_view(&self, order_id: i64) -> Result<Option<OrderView>, StoreError> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        match order {
            Some(order) => Ok(self.views_for(vec![order]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn list_order_views(&self, user_id: i64) -> Result<Vec<OrderView>, StoreError> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 ORDER BY id DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        self.views_for(orders).await
    }

    async fn expired_pending_orders(
        &self,
        cutoff: DateTime<Utc>,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<i64>, StoreError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM orders \
             WHERE status = 'pending' AND created_at <= $1 AND id > $2 \
             ORDER BY id LIMIT $3",
        )
        .bind(cutoff)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    fn expect_one(rows_affected: u64, what: String) -> Result<(), StoreError> {
        if rows_affected == 1 {
            Ok(())
        } else {
            Err(StoreError::NotFound(what))
        }
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn lock_offerings(&mut self, ids: &[i64]) -> Result<Vec<TicketOffering>, StoreError> {
        let ids = lock_order_of(ids);
        let offerings = sqlx::query_as::<_, TicketOffering>(&format!(
            "SELECT {OFFERING_COLUMNS} FROM ticket_offerings \
             WHERE id = ANY($1) ORDER BY id FOR UPDATE"
        ))
        .bind(&ids)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(offerings)
    }

    async fn lock_seats(&mut self, ids: &[i64]) -> Result<Vec<Seat>, StoreError> {
        let ids = lock_order_of(ids);
        let seats = sqlx::query_as::<_, Seat>(&format!(
            "SELECT {SEAT_COLUMNS} FROM seats WHERE id = ANY($1) ORDER BY id FOR UPDATE"
        ))
        .bind(&ids)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(seats)
    }

    async fn lock_voucher(&mut self, code: &str) -> Result<Option<Voucher>, StoreError> {
        let voucher = sqlx::query_as::<_, Voucher>(&format!(
            "SELECT {VOUCHER_COLUMNS} FROM vouchers WHERE code = $1 FOR UPDATE"
        ))
        .bind(code)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(voucher)
    }

    async fn lock_identity_documents(&mut self, event_ids: &[i64]) -> Result<(), StoreError> {
        for event_id in lock_order_of(event_ids) {
            // Two-key form takes int4; collisions only serialize unrelated events.
            let key = (event_id % i64::from(i32::MAX)) as i32;
            sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
                .bind(IDENTITY_DOCUMENT_LOCK_CLASS)
                .bind(key)
                .execute(&mut *self.tx)
                .await?;
        }
        Ok(())
    }

    async fn seated_ticket_types(
        &mut self,
        keys: &[(i64, i64)],
    ) -> Result<HashSet<(i64, i64)>, StoreError> {
        let event_ids: Vec<i64> = keys.iter().map(|(event_id, _)| *event_id).collect();
        let type_ids: Vec<i64> = keys.iter().map(|(_, type_id)| *type_id).collect();
        let rows = sqlx::query_as::<_, (i64, i64)>(
            "SELECT event_id, type_id FROM event_ticket_types \
             WHERE has_seat_number AND event_id = ANY($1) AND type_id = ANY($2)",
        )
        .bind(&event_ids)
        .bind(&type_ids)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().filter(|row| keys.contains(row)).collect())
    }

    async fn used_identity_documents(
        &mut self,
        event_ids: &[i64],
        numbers: &[String],
    ) -> Result<HashSet<(i64, String)>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, String)>(
            "SELECT DISTINCT t.event_id, l.identity_document_number \
             FROM order_lines l \
             JOIN ticket_offerings t ON t.id = l.ticket_offering_id \
             JOIN orders o ON o.id = l.order_id \
             WHERE t.event_id = ANY($1) \
               AND l.identity_document_number = ANY($2) \
               AND o.status <> 'cancelled'",
        )
        .bind(event_ids)
        .bind(numbers)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn count_redemptions(
        &mut self,
        voucher_id: i64,
        user_id: i64,
    ) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM voucher_redemptions WHERE voucher_id = $1 AND user_id = $2",
        )
        .bind(voucher_id)
        .bind(user_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count)
    }

    async fn reserve_quota(&mut self, offering_id: i64, quantity: i32) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE ticket_offerings \
             SET quota = quota - $2, sold_count = sold_count + $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(offering_id)
        .bind(quantity)
        .execute(&mut *self.tx)
        .await?;
        Self::expect_one(
            result.rows_affected(),
            format!("ticket offering {offering_id}"),
        )
    }

    async fn release_quota(&mut self, offering_id: i64, quantity: i32) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE ticket_offerings \
             SET quota = quota + $2, sold_count = sold_count - $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(offering_id)
        .bind(quantity)
        .execute(&mut *self.tx)
        .await?;
        Self::expect_one(
            result.rows_affected(),
            format!("ticket offering {offering_id}"),
        )
    }

    async fn set_seat_booked(&mut self, seat_id: i64, booked: bool) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE seats SET is_booked = $2, updated_at = NOW() WHERE id = $1")
                .bind(seat_id)
                .bind(booked)
                .execute(&mut *self.tx)
                .await?;
        Self::expect_one(result.rows_affected(), format!("seat {seat_id}"))
    }

    async fn insert_order(&mut self, order: &NewOrder) -> Result<Order, StoreError> {
        let inserted = sqlx::query_as::<_, Order>(&format!(
            "INSERT INTO orders (user_id, total_amount, discount_amount, status) \
             VALUES ($1, $2, $3, 'pending') RETURNING {ORDER_COLUMNS}"
        ))
        .bind(order.user_id)
        .bind(order.total_amount)
        .bind(order.discount_amount)
        .fetch_one(&mut *self.tx)
        .await?;

        for line in &order.lines {
            sqlx::query(
                "INSERT INTO order_lines \
                 (order_id, ticket_offering_id, quantity, unit_price, \
                  identity_document_number, identity_document_type, seat_id) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(inserted.id)
            .bind(line.ticket_offering_id)
            .bind(line.quantity)
            .bind(line.unit_price)
            .bind(line.identity_document_number.as_deref())
            .bind(line.identity_document_type)
            .bind(line.seat_id)
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(inserted)
    }

    async fn redeem_voucher(
        &mut self,
        voucher_id: i64,
        user_id: i64,
        order_id: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE vouchers SET used_count = used_count + 1, updated_at = NOW() \
             WHERE id = $1 AND used_count < usage_limit",
        )
        .bind(voucher_id)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() != 1 {
            return Err(StoreError::Invariant(format!(
                "voucher {voucher_id} is over its usage limit"
            )));
        }

        sqlx::query(
            "INSERT INTO voucher_redemptions (voucher_id, user_id, order_id) VALUES ($1, $2, $3)",
        )
        .bind(voucher_id)
        .bind(user_id)
        .bind(order_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_order(&mut self, order_id: i64) -> Result<Option<Order>, StoreError> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(order_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(order)
    }

    async fn order_lines(&mut self, order_id: i64) -> Result<Vec<OrderLine>, StoreError> {
        let lines = sqlx::query_as::<_, OrderLine>(&format!(
            "SELECT {ORDER_LINE_COLUMNS} FROM order_lines WHERE order_id = $1 ORDER BY id"
        ))
        .bind(order_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(lines)
    }

    async fn update_order_status(
        &mut self,
        order_id: i64,
        status: OrderStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE orders SET status = $2, paid_at = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(order_id)
        .bind(status)
        .bind(paid_at)
        .execute(&mut *self.tx)
        .await?;
        Self::expect_one(result.rows_affected(), format!("order {order_id}"))
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
