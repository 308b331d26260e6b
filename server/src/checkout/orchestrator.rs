use chrono::Utc;
use tracing::{info, instrument};

use super::cart::CheckoutRequest;
use super::policy::{authorize, OrderAction};
use super::pricing::{self, CheckoutSnapshot, VoucherState};
use super::CheckoutError;
use crate::models::{OrderStatus, OrderView, User};
use crate::store::{lock_order_of, Store, StoreError, StoreTx};

/// Transactional entry point for buying tickets and settling orders.
#[derive(Debug, Clone)]
pub struct CheckoutService<S> {
    store: S,
}

impl<S: Store> CheckoutService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Validates the cart against locked inventory and, when every rule
    /// passes, reserves it and writes a pending order in the same transaction.
    #[instrument(skip_all, fields(user_id = user.id, lines = request.tickets.len()))]
    pub async fn create_order(
        &self,
        user: &User,
        request: &CheckoutRequest,
    ) -> Result<OrderView, CheckoutError> {
        pricing::precheck(user, request).map_err(|errors| reject(user, errors))?;

        let mut tx = self.store.begin().await?;
        let snapshot = lock_checkout_rows(&mut tx, user, request).await?;

        // Returning here drops `tx`, which rolls back the locks taken above.
        let plan = pricing::evaluate(user, request, &snapshot, Utc::now())
            .map_err(|errors| reject(user, errors))?;

        for (offering_id, quantity) in &plan.quantities {
            tx.reserve_quota(*offering_id, *quantity).await?;
        }
        for seat_id in &plan.seat_ids {
            tx.set_seat_booked(*seat_id, true).await?;
        }
        let order = tx.insert_order(&plan.to_new_order(user.id)).await?;
        if let Some(voucher_id) = plan.voucher_id {
            tx.redeem_voucher(voucher_id, user.id, order.id).await?;
        }
        tx.commit().await?;

        info!(
            order_id = order.id,
            user_id = user.id,
            subtotal = %plan.subtotal,
            discount = %plan.discount,
            total = %plan.total,
            voucher_id = ?plan.voucher_id,
            "Order created"
        );

        self.store
            .find_order_view(order.id)
            .await?
            .ok_or(CheckoutError::OrderNotFound(order.id))
    }

    /// Pending → Paid for the order's owner.
    #[instrument(skip_all, fields(user_id = user.id, order_id = order_id))]
    pub async fn mark_order_paid(
        &self,
        user: &User,
        order_id: i64,
    ) -> Result<OrderView, CheckoutError> {
        let mut tx = self.store.begin().await?;
        let order = tx
            .lock_order(order_id)
            .await?
            .ok_or(CheckoutError::OrderNotFound(order_id))?;

        if !authorize(user, &order, OrderAction::MarkPaid) {
            return Err(CheckoutError::Forbidden {
                user_id: user.id,
                order_id,
                action: OrderAction::MarkPaid,
            });
        }
        if !order.status.can_transition_to(OrderStatus::Paid) {
            return Err(CheckoutError::InvalidStatus {
                order_id,
                status: order.status,
            });
        }

        let paid_at = Utc::now();
        tx.update_order_status(order_id, OrderStatus::Paid, Some(paid_at))
            .await?;
        tx.commit().await?;
        info!(order_id, user_id = user.id, %paid_at, "Order paid");

        self.store
            .find_order_view(order_id)
            .await?
            .ok_or(CheckoutError::OrderNotFound(order_id))
    }

    pub async fn get_order(&self, user: &User, order_id: i64) -> Result<OrderView, CheckoutError> {
        let view = self
            .store
            .find_order_view(order_id)
            .await?
            .ok_or(CheckoutError::OrderNotFound(order_id))?;

        if !authorize(user, &view, OrderAction::View) {
            return Err(CheckoutError::Forbidden {
                user_id: user.id,
                order_id,
                action: OrderAction::View,
            });
        }
        Ok(view)
    }

    pub async fn list_orders(&self, user: &User) -> Result<Vec<OrderView>, CheckoutError> {
        Ok(self.store.list_order_views(user.id).await?)
    }
}

fn reject(user: &User, errors: Vec<String>) -> CheckoutError {
    info!(user_id = user.id, errors = ?errors, "Checkout rejected");
    CheckoutError::Rejected(errors)
}

/// Locks offerings, then seats, then the voucher, then per-event document
/// claims, and reads what validation needs while holding them.
async fn lock_checkout_rows<T: StoreTx>(
    tx: &mut T,
    user: &User,
    request: &CheckoutRequest,
) -> Result<CheckoutSnapshot, StoreError> {
    let offerings = tx.lock_offerings(&request.offering_ids()).await?;
    let seats = tx.lock_seats(&request.seat_ids()).await?;

    let voucher = match request.voucher_code() {
        Some(code) => {
            let voucher = tx.lock_voucher(code).await?;
            let user_redemptions = match &voucher {
                Some(voucher) => tx.count_redemptions(voucher.id, user.id).await?,
                None => 0,
            };
            Some(VoucherState {
                voucher,
                user_redemptions,
            })
        }
        None => None,
    };

    let document_events = lock_order_of(
        &offerings
            .iter()
            .filter(|offering| offering.requires_identity_document)
            .map(|offering| offering.event_id)
            .collect::<Vec<_>>(),
    );
    let used_documents = if document_events.is_empty() {
        Default::default()
    } else {
        tx.lock_identity_documents(&document_events).await?;
        tx.used_identity_documents(&document_events, &request.document_numbers())
            .await?
    };

    let mut seating_keys: Vec<(i64, i64)> =
        offerings.iter().map(|offering| offering.seating_key()).collect();
    seating_keys.sort_unstable();
    seating_keys.dedup();
    let seated_ticket_types = tx.seated_ticket_types(&seating_keys).await?;

    Ok(CheckoutSnapshot::new(
        offerings,
        seats,
        seated_ticket_types,
        used_documents,
        voucher,
    ))
}
