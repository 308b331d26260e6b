use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};

use crate::models::OrderStatus;
use crate::store::{Store, StoreError, StoreTx};

/// Cancels pending orders that were never paid and returns their tickets and
/// seats to inventory.
#[derive(Debug, Clone)]
pub struct ExpiryReaper<S> {
    store: S,
    expiry: Duration,
    batch_size: i64,
}

impl<S: Store> ExpiryReaper<S> {
    pub fn new(store: S, expiry: Duration, batch_size: i64) -> Self {
        Self {
            store,
            expiry,
            batch_size: batch_size.max(1),
        }
    }

    /// Sweeps every order that was pending at `now - expiry`, one batch of ids
    /// at a time. Returns how many orders were cancelled.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = now - self.expiry;
        let mut after_id = 0;
        let mut cancelled = 0;

        loop {
            let ids = self
                .store
                .expired_pending_orders(cutoff, after_id, self.batch_size)
                .await?;
            let Some(&last_id) = ids.last() else {
                break;
            };

            for order_id in &ids {
                match self.cancel_order(*order_id).await {
                    Ok(true) => cancelled += 1,
                    Ok(false) => {}
                    // Left pending; the next sweep picks it up again.
                    Err(e) if e.is_transient() => {
                        warn!(order_id, error = %e, "Could not cancel expired order");
                    }
                    Err(e) => return Err(e),
                }
            }

            after_id = last_id;
            if (ids.len() as i64) < self.batch_size {
                break;
            }
        }

        Ok(cancelled)
    }

    /// Cancels one order in its own transaction. Returns `false` when the
    /// order is gone or no longer pending.
    pub async fn cancel_order(&self, order_id: i64) -> Result<bool, StoreError> {
        let mut tx = self.store.begin().await?;
        let Some(order) = tx.lock_order(order_id).await? else {
            return Ok(false);
        };
        if !order.status.can_transition_to(OrderStatus::Cancelled) {
            return Ok(false);
        }

        let lines = tx.order_lines(order_id).await?;
        let mut quantities: BTreeMap<i64, i32> = BTreeMap::new();
        for line in &lines {
            *quantities.entry(line.ticket_offering_id).or_insert(0) += line.quantity;
        }
        let seat_ids: Vec<i64> = lines.iter().filter_map(|line| line.seat_id).collect();

        let offering_ids: Vec<i64> = quantities.keys().copied().collect();
        tx.lock_offerings(&offering_ids).await?;
        tx.lock_seats(&seat_ids).await?;

        tx.update_order_status(order_id, OrderStatus::Cancelled, None)
            .await?;
        for (offering_id, quantity) in &quantities {
            tx.release_quota(*offering_id, *quantity).await?;
        }
        for seat_id in &seat_ids {
            tx.set_seat_booked(*seat_id, false).await?;
        }
        tx.commit().await?;

        info!(
            order_id,
            user_id = order.user_id,
            lines = lines.len(),
            seats = seat_ids.len(),
            "Expired order cancelled"
        );
        Ok(true)
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until the task is dropped.
    pub async fn run(self, interval: StdDuration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.sweep(Utc::now()).await {
                Ok(0) => {}
                Ok(cancelled) => info!(cancelled, "Expiry sweep finished"),
                Err(e) => error!(error = %e, "Expiry sweep failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    use crate::checkout::{CartItem, CheckoutRequest, CheckoutService};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_cancellation_restores_inventory() {
        let store = MemoryStore::new();
        let buyer = store.add_user("Lee", "lee@example.com", true, "token-lee");
        let event = store.add_event("Play", "Theatre", Utc::now());
        let category = store.add_category("Stalls");
        let seated = store.add_ticket_type("Seated");
        let standing = store.add_ticket_type("Standing");
        store.configure_seating(event, seated, true);
        let seat_offering =
            store.add_offering(event, category, seated, "Stalls Seated", dec!(50), 4, false);
        let standing_offering =
            store.add_offering(event, category, standing, "Stalls Standing", dec!(20), 10, false);
        let seat = store.add_seat(event, seated, "C3");
        let before = (
            store.offering(seat_offering).unwrap(),
            store.offering(standing_offering).unwrap(),
            store.seat(seat).unwrap(),
        );

        let service = CheckoutService::new(store.clone());
        let order = service
            .create_order(
                &buyer,
                &CheckoutRequest::new(vec![
                    CartItem::new(seat_offering, 1).with_seat(seat),
                    CartItem::new(standing_offering, 2),
                    CartItem::new(standing_offering, 1),
                ]),
            )
            .await
            .unwrap();
        assert_eq!(store.offering(standing_offering).unwrap().quota, 7);

        let reaper = ExpiryReaper::new(store.clone(), Duration::minutes(15), 100);
        assert_eq!(reaper.sweep(Utc::now()).await.unwrap(), 0);

        let cancelled = reaper
            .sweep(Utc::now() + Duration::minutes(16))
            .await
            .unwrap();
        assert_eq!(cancelled, 1);
        assert_eq!(
            store.order(order.order_id).unwrap().status,
            OrderStatus::Cancelled
        );

        let after = (
            store.offering(seat_offering).unwrap(),
            store.offering(standing_offering).unwrap(),
            store.seat(seat).unwrap(),
        );
        assert_eq!(after.0.quota, before.0.quota);
        assert_eq!(after.0.sold_count, before.0.sold_count);
        assert_eq!(after.1.quota, before.1.quota);
        assert_eq!(after.1.sold_count, before.1.sold_count);
        assert_eq!(after.2.is_booked, before.2.is_booked);
    }

    #[tokio::test]
    async fn test_paid_orders_are_left_alone() {
        let store = MemoryStore::new();
        let buyer = store.add_user("Lee", "lee@example.com", true, "token-lee");
        let event = store.add_event("Play", "Theatre", Utc::now());
        let category = store.add_category("Stalls");
        let kind = store.add_ticket_type("Standing");
        let offering = store.add_offering(event, category, kind, "Stalls", dec!(20), 3, false);
        let service = CheckoutService::new(store.clone());
        let request = CheckoutRequest::new(vec![CartItem::new(offering, 1)]);

        let paid = service.create_order(&buyer, &request).await.unwrap();
        service.mark_order_paid(&buyer, paid.order_id).await.unwrap();
        let pending = service.create_order(&buyer, &request).await.unwrap();

        let reaper = ExpiryReaper::new(store.clone(), Duration::minutes(1), 1);
        let cancelled = reaper
            .sweep(Utc::now() + Duration::minutes(5))
            .await
            .unwrap();

        assert_eq!(cancelled, 1);
        assert_eq!(store.order(paid.order_id).unwrap().status, OrderStatus::Paid);
        assert_eq!(
            store.order(pending.order_id).unwrap().status,
            OrderStatus::Cancelled
        );
        assert_eq!(store.offering(offering).unwrap().quota, 2);
        assert!(!reaper.cancel_order(pending.order_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_walks_every_batch() {
        let store = MemoryStore::new();
        let buyer = store.add_user("Lee", "lee@example.com", true, "token-lee");
        let event = store.add_event("Play", "Theatre", Utc::now());
        let category = store.add_category("Stalls");
        let kind = store.add_ticket_type("Standing");
        let offering = store.add_offering(event, category, kind, "Stalls", dec!(20), 10, false);
        let service = CheckoutService::new(store.clone());
        let request = CheckoutRequest::new(vec![CartItem::new(offering, 1)]);
        for _ in 0..5 {
            service.create_order(&buyer, &request).await.unwrap();
        }
        let fresh = service.create_order(&buyer, &request).await.unwrap();
        store.backdate_order(fresh.order_id, Utc::now() + Duration::hours(1));

        let reaper = ExpiryReaper::new(store.clone(), Duration::minutes(1), 2);
        let cancelled = reaper
            .sweep(Utc::now() + Duration::minutes(2))
            .await
            .unwrap();

        assert_eq!(cancelled, 5);
        assert_eq!(store.offering(offering).unwrap().quota, 9);
        assert_eq!(
            store.order(fresh.order_id).unwrap().status,
            OrderStatus::Pending
        );
    }
}
