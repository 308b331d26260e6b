//! In-memory store with the same transactional contract as [`PgStore`].
//!
//! Row locks are per-row async mutexes held by the transaction until commit
//! or drop. Writes are buffered in the transaction and applied to a copy of
//! the committed state on commit, so a failed or dropped transaction leaves
//! nothing behind.
//!
//! [`PgStore`]: super::PgStore

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};

use super::{lock_order_of, Store, StoreError, StoreTx};
use crate::models::{
    DiscountKind, Event, NewOrder, Order, OrderLine, OrderLineView, OrderStatus, OrderView, Seat,
    TicketOffering, User, Voucher, VoucherRedemption, VoucherScope,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Offering(i64),
    Seat(i64),
    Voucher(i64),
    IdentityDocuments(i64),
    Order(i64),
}

#[derive(Debug, Default)]
struct RowLocks {
    rows: Mutex<HashMap<RowKey, Arc<RowMutex<()>>>>,
}

impl RowLocks {
    async fn acquire(&self, key: RowKey) -> OwnedMutexGuard<()> {
        let row = {
            let mut rows = self.rows.lock();
            Arc::clone(rows.entry(key).or_default())
        };
        row.lock_owned().await
    }

    /// Forgets rows nobody holds or waits on. Clones of a row's mutex are only
    /// taken under the map lock, so a count of one means the map is the sole
    /// owner.
    fn release(&self, keys: impl IntoIterator<Item = RowKey>) {
        let mut rows = self.rows.lock();
        for key in keys {
            if rows.get(&key).is_some_and(|row| Arc::strong_count(row) == 1) {
                rows.remove(&key);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.rows.lock().len()
    }
}

/// Guards owned by one transaction. Dropping it unlocks every row and prunes
/// the lock table.
#[derive(Debug)]
struct HeldRows {
    locks: Arc<RowLocks>,
    guards: HashMap<RowKey, OwnedMutexGuard<()>>,
}

impl HeldRows {
    fn new(locks: Arc<RowLocks>) -> Self {
        Self {
            locks,
            guards: HashMap::new(),
        }
    }
}

impl Drop for HeldRows {
    fn drop(&mut self) {
        let keys: Vec<RowKey> = self.guards.drain().map(|(key, _guard)| key).collect();
        self.locks.release(keys);
    }
}

/// Committed contents of the store. Compared whole in tests to prove that a
/// rejected checkout changed nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryState {
    pub users: BTreeMap<i64, User>,
    pub events: BTreeMap<i64, Event>,
    pub categories: BTreeMap<i64, String>,
    pub ticket_types: BTreeMap<i64, String>,
    pub seating: HashMap<(i64, i64), bool>,
    pub offerings: BTreeMap<i64, TicketOffering>,
    pub seats: BTreeMap<i64, Seat>,
    pub vouchers: BTreeMap<i64, Voucher>,
    pub redemptions: Vec<VoucherRedemption>,
    pub orders: BTreeMap<i64, Order>,
    pub order_lines: Vec<OrderLine>,
}

#[derive(Debug)]
enum Write {
    ReserveQuota { offering_id: i64, quantity: i32 },
    ReleaseQuota { offering_id: i64, quantity: i32 },
    SetSeatBooked { seat_id: i64, booked: bool },
    InsertOrder { order: Order, lines: Vec<OrderLine> },
    RedeemVoucher { redemption: VoucherRedemption },
    UpdateOrderStatus {
        order_id: i64,
        status: OrderStatus,
        paid_at: Option<DateTime<Utc>>,
    },
}

impl MemoryState {
    fn apply(&mut self, write: Write, now: DateTime<Utc>) -> Result<(), StoreError> {
        match write {
            Write::ReserveQuota {
                offering_id,
                quantity,
            } => {
                let offering = self.offering_mut(offering_id)?;
                if offering.quota < quantity {
                    return Err(StoreError::Invariant(format!(
                        "ticket offering {offering_id} quota would drop below zero"
                    )));
                }
                offering.quota -= quantity;
                offering.sold_count += quantity;
                offering.updated_at = now;
            }
            Write::ReleaseQuota {
                offering_id,
                quantity,
            } => {
                let offering = self.offering_mut(offering_id)?;
                if offering.sold_count < quantity {
                    return Err(StoreError::Invariant(format!(
                        "ticket offering {offering_id} sold count would drop below zero"
                    )));
                }
                offering.quota += quantity;
                offering.sold_count -= quantity;
                offering.updated_at = now;
            }
            Write::SetSeatBooked { seat_id, booked } => {
                let seat = self
                    .seats
                    .get_mut(&seat_id)
                    .ok_or_else(|| StoreError::NotFound(format!("seat {seat_id}")))?;
                seat.is_booked = booked;
                seat.updated_at = now;
            }
            Write::InsertOrder { order, lines } => {
                self.orders.insert(order.id, order);
                self.order_lines.extend(lines);
            }
            Write::RedeemVoucher { redemption } => {
                let voucher = self.vouchers.get_mut(&redemption.voucher_id).ok_or_else(|| {
                    StoreError::NotFound(format!("voucher {}", redemption.voucher_id))
                })?;
                if voucher.used_count >= voucher.usage_limit {
                    return Err(StoreError::Invariant(format!(
                        "voucher {} is over its usage limit",
                        voucher.id
                    )));
                }
                voucher.used_count += 1;
                voucher.updated_at = now;
                self.redemptions.push(redemption);
            }
            Write::UpdateOrderStatus {
                order_id,
                status,
                paid_at,
            } => {
                let order = self
                    .orders
                    .get_mut(&order_id)
                    .ok_or_else(|| StoreError::NotFound(format!("order {order_id}")))?;
                order.status = status;
                order.paid_at = paid_at;
                order.updated_at = now;
            }
        }
        Ok(())
    }

    fn offering_mut(&mut self, offering_id: i64) -> Result<&mut TicketOffering, StoreError> {
        self.offerings
            .get_mut(&offering_id)
            .ok_or_else(|| StoreError::NotFound(format!("ticket offering {offering_id}")))
    }

    fn order_view(&self, order: &Order) -> OrderView {
        let lines = self
            .order_lines
            .iter()
            .filter(|line| line.order_id == order.id)
            .filter_map(|line| self.line_view(line))
            .collect();
        OrderView::new(order.clone(), lines)
    }

    fn line_view(&self, line: &OrderLine) -> Option<OrderLineView> {
        let offering = self.offerings.get(&line.ticket_offering_id)?;
        let event = self.events.get(&offering.event_id)?;
        let seat = line.seat_id.and_then(|id| self.seats.get(&id));
        Some(OrderLineView {
            ticket_id: offering.id,
            ticket_name: offering.name.clone(),
            category: self
                .categories
                .get(&offering.category_id)
                .cloned()
                .unwrap_or_default(),
            ticket_type: self
                .ticket_types
                .get(&offering.type_id)
                .cloned()
                .unwrap_or_default(),
            event_name: event.name.clone(),
            event_location: event.location.clone(),
            event_date: event.starts_at,
            quantity: line.quantity,
            unit_price: line.unit_price,
            subtotal: line.unit_price * Decimal::from(line.quantity),
            requires_identity_document: offering.requires_identity_document,
            seat_id: line.seat_id,
            seat_number: seat.map(|seat| seat.seat_number.clone()),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    locks: Arc<RowLocks>,
    next_id: Arc<AtomicI64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Copy of the committed state.
    pub fn snapshot(&self) -> MemoryState {
        self.state.lock().clone()
    }

    pub fn add_user(&self, name: &str, email: &str, email_verified: bool, token: &str) -> User {
        let now = Utc::now();
        let user = User {
            id: self.allocate_id(),
            name: name.to_string(),
            email: email.to_string(),
            email_verified,
            api_token: Some(token.to_string()),
            created_at: now,
            updated_at: now,
        };
        self.state.lock().users.insert(user.id, user.clone());
        user
    }

    pub fn add_event(&self, name: &str, location: &str, starts_at: DateTime<Utc>) -> i64 {
        let now = Utc::now();
        let event = Event {
            id: self.allocate_id(),
            name: name.to_string(),
            location: location.to_string(),
            starts_at,
            created_at: now,
            updated_at: now,
        };
        let id = event.id;
        self.state.lock().events.insert(id, event);
        id
    }

    pub fn add_category(&self, name: &str) -> i64 {
        let id = self.allocate_id();
        self.state.lock().categories.insert(id, name.to_string());
        id
    }

    pub fn add_ticket_type(&self, name: &str) -> i64 {
        let id = self.allocate_id();
        self.state.lock().ticket_types.insert(id, name.to_string());
        id
    }

    /// Sets the numbered-seat flag of an (event, ticket type) pair.
    pub fn configure_seating(&self, event_id: i64, type_id: i64, has_seat_number: bool) {
        self.state
            .lock()
            .seating
            .insert((event_id, type_id), has_seat_number);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_offering(
        &self,
        event_id: i64,
        category_id: i64,
        type_id: i64,
        name: &str,
        price: Decimal,
        quota: i32,
        requires_identity_document: bool,
    ) -> i64 {
        let now = Utc::now();
        let offering = TicketOffering {
            id: self.allocate_id(),
            event_id,
            category_id,
            type_id,
            name: name.to_string(),
            price,
            quota,
            sold_count: 0,
            requires_identity_document,
            created_at: now,
            updated_at: now,
        };
        let id = offering.id;
        self.state.lock().offerings.insert(id, offering);
        id
    }

    pub fn add_seat(&self, event_id: i64, type_id: i64, seat_number: &str) -> i64 {
        let now = Utc::now();
        let seat = Seat {
            id: self.allocate_id(),
            event_id,
            type_id,
            seat_number: seat_number.to_string(),
            is_booked: false,
            created_at: now,
            updated_at: now,
        };
        let id = seat.id;
        self.state.lock().seats.insert(id, seat);
        id
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_voucher(
        &self,
        code: &str,
        scope: VoucherScope,
        event_id: Option<i64>,
        discount: Decimal,
        discount_kind: DiscountKind,
        valid_until: DateTime<Utc>,
        usage_limit: i32,
    ) -> i64 {
        let now = Utc::now();
        let voucher = Voucher {
            id: self.allocate_id(),
            code: code.to_string(),
            scope,
            event_id,
            discount,
            discount_kind,
            valid_until,
            usage_limit,
            used_count: 0,
            created_at: now,
            updated_at: now,
        };
        let id = voucher.id;
        self.state.lock().vouchers.insert(id, voucher);
        id
    }

    /// Moves an order's creation time, for exercising the expiry sweep.
    pub fn backdate_order(&self, order_id: i64, created_at: DateTime<Utc>) {
        if let Some(order) = self.state.lock().orders.get_mut(&order_id) {
            order.created_at = created_at;
        }
    }

    pub fn offering(&self, id: i64) -> Option<TicketOffering> {
        self.state.lock().offerings.get(&id).cloned()
    }

    pub fn seat(&self, id: i64) -> Option<Seat> {
        self.state.lock().seats.get(&id).cloned()
    }

    pub fn voucher(&self, id: i64) -> Option<Voucher> {
        self.state.lock().vouchers.get(&id).cloned()
    }

    pub fn order(&self, id: i64) -> Option<Order> {
        self.state.lock().orders.get(&id).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(MemoryTx {
            store: self.clone(),
            held: HeldRows::new(Arc::clone(&self.locks)),
            writes: Vec::new(),
        })
    }

    async fn find_user_by_token(&self, token: &str) -> Result<Option<User>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .users
            .values()
            .find(|user| user.api_token.as_deref() == Some(token))
            .cloned())
    }

    async fn find_order_view(&self, order_id: i64) -> Result<Option<OrderView>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .orders
            .get(&order_id)
            .map(|order| state.order_view(order)))
    }

    async fn list_order_views(&self, user_id: i64) -> Result<Vec<OrderView>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .orders
            .values()
            .rev()
            .filter(|order| order.user_id == user_id)
            .map(|order| state.order_view(order))
            .collect())
    }

    async fn expired_pending_orders(
        &self,
        cutoff: DateTime<Utc>,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<i64>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .orders
            .range(after_id.saturating_add(1)..)
            .map(|(_, order)| order)
            .filter(|order| order.status == OrderStatus::Pending && order.created_at <= cutoff)
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|order| order.id)
            .collect())
    }
}

#[derive(Debug)]
pub struct MemoryTx {
    store: MemoryStore,
    held: HeldRows,
    writes: Vec<Write>,
}

impl MemoryTx {
    async fn lock(&mut self, key: RowKey) {
        if !self.held.guards.contains_key(&key) {
            let guard = self.store.locks.acquire(key).await;
            self.held.guards.insert(key, guard);
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn lock_offerings(&mut self, ids: &[i64]) -> Result<Vec<TicketOffering>, StoreError> {
        let ids = lock_order_of(ids);
        for id in &ids {
            self.lock(RowKey::Offering(*id)).await;
        }
        let state = self.store.state.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.offerings.get(id).cloned())
            .collect())
    }

    async fn lock_seats(&mut self, ids: &[i64]) -> Result<Vec<Seat>, StoreError> {
        let ids = lock_order_of(ids);
        for id in &ids {
            self.lock(RowKey::Seat(*id)).await;
        }
        let state = self.store.state.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.seats.get(id).cloned())
            .collect())
    }

    async fn lock_voucher(&mut self, code: &str) -> Result<Option<Voucher>, StoreError> {
        let voucher_id = {
            let state = self.store.state.lock();
            state
                .vouchers
                .values()
                .find(|voucher| voucher.code == code)
                .map(|voucher| voucher.id)
        };
        let Some(voucher_id) = voucher_id else {
            return Ok(None);
        };
        self.lock(RowKey::Voucher(voucher_id)).await;
        Ok(self.store.state.lock().vouchers.get(&voucher_id).cloned())
    }

    async fn lock_identity_documents(&mut self, event_ids: &[i64]) -> Result<(), StoreError> {
        for id in lock_order_of(event_ids) {
            self.lock(RowKey::IdentityDocuments(id)).await;
        }
        Ok(())
    }

    async fn seated_ticket_types(
        &mut self,
        keys: &[(i64, i64)],
    ) -> Result<HashSet<(i64, i64)>, StoreError> {
        let state = self.store.state.lock();
        Ok(keys
            .iter()
            .filter(|key| state.seating.get(key).copied().unwrap_or(false))
            .copied()
            .collect())
    }

    async fn used_identity_documents(
        &mut self,
        event_ids: &[i64],
        numbers: &[String],
    ) -> Result<HashSet<(i64, String)>, StoreError> {
        let state = self.store.state.lock();
        let mut used = HashSet::new();
        for line in &state.order_lines {
            let Some(number) = line.identity_document_number.as_ref() else {
                continue;
            };
            if !numbers.contains(number) {
                continue;
            }
            let live = state
                .orders
                .get(&line.order_id)
                .is_some_and(|order| order.status != OrderStatus::Cancelled);
            let event_id = state
                .offerings
                .get(&line.ticket_offering_id)
                .map(|offering| offering.event_id);
            if let (true, Some(event_id)) = (live, event_id) {
                if event_ids.contains(&event_id) {
                    used.insert((event_id, number.clone()));
                }
            }
        }
        Ok(used)
    }

    async fn count_redemptions(
        &mut self,
        voucher_id: i64,
        user_id: i64,
    ) -> Result<i64, StoreError> {
        let state = self.store.state.lock();
        let count = state
            .redemptions
            .iter()
            .filter(|redemption| redemption.voucher_id == voucher_id && redemption.user_id == user_id)
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn reserve_quota(&mut self, offering_id: i64, quantity: i32) -> Result<(), StoreError> {
        self.writes.push(Write::ReserveQuota {
            offering_id,
            quantity,
        });
        Ok(())
    }

    async fn release_quota(&mut self, offering_id: i64, quantity: i32) -> Result<(), StoreError> {
        self.writes.push(Write::ReleaseQuota {
            offering_id,
            quantity,
        });
        Ok(())
    }

    async fn set_seat_booked(&mut self, seat_id: i64, booked: bool) -> Result<(), StoreError> {
        self.writes.push(Write::SetSeatBooked { seat_id, booked });
        Ok(())
    }

    async fn insert_order(&mut self, new_order: &NewOrder) -> Result<Order, StoreError> {
        let now = Utc::now();
        let order = Order {
            id: self.store.allocate_id(),
            user_id: new_order.user_id,
            total_amount: new_order.total_amount,
            discount_amount: new_order.discount_amount,
            status: OrderStatus::Pending,
            paid_at: None,
            created_at: now,
            updated_at: now,
        };
        let lines = new_order
            .lines
            .iter()
            .map(|line| OrderLine {
                id: self.store.allocate_id(),
                order_id: order.id,
                ticket_offering_id: line.ticket_offering_id,
                quantity: line.quantity,
                unit_price: line.unit_price,
                identity_document_number: line.identity_document_number.clone(),
                identity_document_type: line.identity_document_type,
                seat_id: line.seat_id,
            })
            .collect();
        self.writes.push(Write::InsertOrder {
            order: order.clone(),
            lines,
        });
        Ok(order)
    }

    async fn redeem_voucher(
        &mut self,
        voucher_id: i64,
        user_id: i64,
        order_id: i64,
    ) -> Result<(), StoreError> {
        let redemption = VoucherRedemption {
            id: self.store.allocate_id(),
            voucher_id,
            user_id,
            order_id,
            created_at: Utc::now(),
        };
        self.writes.push(Write::RedeemVoucher { redemption });
        Ok(())
    }

    async fn lock_order(&mut self, order_id: i64) -> Result<Option<Order>, StoreError> {
        self.lock(RowKey::Order(order_id)).await;
        Ok(self.store.state.lock().orders.get(&order_id).cloned())
    }

    async fn order_lines(&mut self, order_id: i64) -> Result<Vec<OrderLine>, StoreError> {
        let state = self.store.state.lock();
        Ok(state
            .order_lines
            .iter()
            .filter(|line| line.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn update_order_status(
        &mut self,
        order_id: i64,
        status: OrderStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.writes.push(Write::UpdateOrderStatus {
            order_id,
            status,
            paid_at,
        });
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        let MemoryTx {
            store,
            held,
            writes,
        } = self;
        let now = Utc::now();
        {
            let mut state = store.state.lock();
            let mut next = state.clone();
            for write in writes {
                next.apply(write, now)?;
            }
            *state = next;
        }
        drop(held);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn seeded() -> (MemoryStore, i64) {
        let store = MemoryStore::new();
        let event = store.add_event("Concert", "Hall", Utc::now());
        let category = store.add_category("Regular");
        let kind = store.add_ticket_type("Standing");
        let offering = store.add_offering(
            event,
            category,
            kind,
            "Regular Standing",
            Decimal::from(100),
            5,
            false,
        );
        (store, offering)
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_writes() {
        let (store, offering) = seeded();
        let before = store.snapshot();

        let mut tx = store.begin().await.unwrap();
        tx.lock_offerings(&[offering]).await.unwrap();
        tx.reserve_quota(offering, 2).await.unwrap();
        drop(tx);

        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_commit_applies_writes() {
        let (store, offering) = seeded();

        let mut tx = store.begin().await.unwrap();
        tx.lock_offerings(&[offering]).await.unwrap();
        tx.reserve_quota(offering, 2).await.unwrap();
        tx.commit().await.unwrap();

        let offering = store.offering(offering).unwrap();
        assert_eq!(offering.quota, 3);
        assert_eq!(offering.sold_count, 2);
    }

    #[tokio::test]
    async fn test_commit_rejects_negative_quota_atomically() {
        let (store, offering) = seeded();
        let before = store.snapshot();

        let mut tx = store.begin().await.unwrap();
        tx.reserve_quota(offering, 3).await.unwrap();
        tx.reserve_quota(offering, 3).await.unwrap();
        let result = tx.commit().await;

        assert!(matches!(result, Err(StoreError::Invariant(_))));
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_row_lock_blocks_second_transaction() {
        let (store, offering) = seeded();

        let mut first = store.begin().await.unwrap();
        first.lock_offerings(&[offering]).await.unwrap();

        let contender = store.clone();
        let waiter = tokio::spawn(async move {
            let mut second = contender.begin().await.unwrap();
            second.lock_offerings(&[offering]).await.unwrap()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        first.reserve_quota(offering, 1).await.unwrap();
        first.commit().await.unwrap();

        let seen = waiter.await.unwrap();
        assert_eq!(seen[0].quota, 4);
    }

    #[tokio::test]
    async fn test_lock_table_is_pruned_after_release() {
        let (store, offering) = seeded();

        let mut first = store.begin().await.unwrap();
        first.lock_offerings(&[offering]).await.unwrap();
        first.lock_order(999).await.unwrap();
        assert_eq!(store.locks.len(), 2);

        let contender = store.clone();
        let waiter = tokio::spawn(async move {
            let mut second = contender.begin().await.unwrap();
            second.lock_offerings(&[offering]).await.unwrap();
            second
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The waiter still shares the offering row, so only the order row goes.
        drop(first);
        let second = waiter.await.unwrap();
        assert_eq!(store.locks.len(), 1);

        second.commit().await.unwrap();
        assert_eq!(store.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_missing_rows_are_skipped_when_locking() {
        let (store, offering) = seeded();
        let mut tx = store.begin().await.unwrap();
        let locked = tx.lock_offerings(&[offering, 9_999]).await.unwrap();
        assert_eq!(locked.len(), 1);
    }
}
