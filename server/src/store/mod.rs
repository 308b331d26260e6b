//! Transaction-scoped persistence for the checkout engine.
//!
//! Every mutation of shared inventory goes through a [`StoreTx`]: rows are
//! locked, read, validated and mutated inside one transaction that is either
//! committed or dropped. Dropping a transaction without calling
//! [`StoreTx::commit`] rolls it back.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{
    NewOrder, Order, OrderLine, OrderStatus, OrderView, Seat, TicketOffering, User, Voucher,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// SQLSTATE codes that mean "try the whole transaction again".
const LOCK_NOT_AVAILABLE: &str = "55P03";
const DEADLOCK_DETECTED: &str = "40P01";
const SERIALIZATION_FAILURE: &str = "40001";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Lock wait timeout, deadlock, serialization failure or pool exhaustion.
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("record not found: {0}")]
    NotFound(String),

    /// A write would break a storage invariant (negative quota, voucher over its limit).
    #[error("storage invariant violated: {0}")]
    Invariant(String),

    #[error("database error")]
    Database(#[source] sqlx::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::PoolTimedOut => StoreError::Transient(error.to_string()),
            sqlx::Error::Database(db_error) => {
                let code = db_error.code();
                match code.as_deref() {
                    Some(LOCK_NOT_AVAILABLE | DEADLOCK_DETECTED | SERIALIZATION_FAILURE) => {
                        StoreError::Transient(db_error.message().to_string())
                    }
                    _ => StoreError::Database(error),
                }
            }
            _ => StoreError::Database(error),
        }
    }
}

/// Entry point to a backing store.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    type Tx: StoreTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn find_user_by_token(&self, token: &str) -> Result<Option<User>, StoreError>;

    async fn find_order_view(&self, order_id: i64) -> Result<Option<OrderView>, StoreError>;

    /// Orders of one user, newest first.
    async fn list_order_views(&self, user_id: i64) -> Result<Vec<OrderView>, StoreError>;

    /// Ids of pending orders created at or before `cutoff`, ascending, strictly
    /// after `after_id`, at most `limit` of them.
    async fn expired_pending_orders(
        &self,
        cutoff: DateTime<Utc>,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<i64>, StoreError>;
}

/// One open transaction.
///
/// Lock methods sort and deduplicate their ids and acquire row locks in
/// ascending order. Callers must lock offerings before seats, seats before the
/// voucher, and the voucher before identity-document locks.
#[async_trait]
pub trait StoreTx: Send {
    /// Locks and returns the offerings that exist among `ids`.
    async fn lock_offerings(&mut self, ids: &[i64]) -> Result<Vec<TicketOffering>, StoreError>;

    /// Locks and returns the seats that exist among `ids`.
    async fn lock_seats(&mut self, ids: &[i64]) -> Result<Vec<Seat>, StoreError>;

    async fn lock_voucher(&mut self, code: &str) -> Result<Option<Voucher>, StoreError>;

    /// Serializes identity-document claims per event until the transaction ends.
    async fn lock_identity_documents(&mut self, event_ids: &[i64]) -> Result<(), StoreError>;

    /// Subset of `keys` ((event id, type id) pairs) configured with numbered seats.
    async fn seated_ticket_types(
        &mut self,
        keys: &[(i64, i64)],
    ) -> Result<HashSet<(i64, i64)>, StoreError>;

    /// (event id, document number) pairs already claimed by a non-cancelled order.
    async fn used_identity_documents(
        &mut self,
        event_ids: &[i64],
        numbers: &[String],
    ) -> Result<HashSet<(i64, String)>, StoreError>;

    async fn count_redemptions(&mut self, voucher_id: i64, user_id: i64)
        -> Result<i64, StoreError>;

    /// `quota -= quantity`, `sold_count += quantity`.
    async fn reserve_quota(&mut self, offering_id: i64, quantity: i32) -> Result<(), StoreError>;

    /// `quota += quantity`, `sold_count -= quantity`.
    async fn release_quota(&mut self, offering_id: i64, quantity: i32) -> Result<(), StoreError>;

    async fn set_seat_booked(&mut self, seat_id: i64, booked: bool) -> Result<(), StoreError>;

    /// Inserts a pending order with its lines.
    async fn insert_order(&mut self, order: &NewOrder) -> Result<Order, StoreError>;

    /// Bumps `used_count` and records the redemption.
    async fn redeem_voucher(
        &mut self,
        voucher_id: i64,
        user_id: i64,
        order_id: i64,
    ) -> Result<(), StoreError>;

    async fn lock_order(&mut self, order_id: i64) -> Result<Option<Order>, StoreError>;

    async fn order_lines(&mut self, order_id: i64) -> Result<Vec<OrderLine>, StoreError>;

    async fn update_order_status(
        &mut self,
        order_id: i64,
        status: OrderStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
}

/// Sorted, deduplicated copy of `ids`, the order in which rows get locked.
pub fn lock_order_of(ids: &[i64]) -> Vec<i64> {
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    ids
}
