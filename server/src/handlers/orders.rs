use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::warn;

use crate::auth::AuthUser;
use crate::checkout::CheckoutRequest;
use crate::models::OrderView;
use crate::payment::PaymentIntent;
use crate::state::AppState;
use crate::store::Store;
use crate::utils::error::AppError;
use crate::utils::response::{created, success};

#[derive(Serialize)]
struct CheckoutPayload {
    order: OrderView,
    payment_intent: Option<PaymentIntent>,
}

pub async fn create_order<S: Store>(
    State(state): State<AppState<S>>,
    AuthUser(user): AuthUser,
    body: Result<Json<CheckoutRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) =
        body.map_err(|rejection| AppError::ValidationError(vec![rejection.body_text()]))?;
    let order = state.checkout.create_order(&user, &request).await?;

    let payment_intent = match state
        .payments
        .create_intent(order.order_id, order.total_amount)
        .await
    {
        Ok(intent) => Some(intent),
        Err(e) => {
            // The order stays pending and expires if it is never paid.
            warn!(order_id = order.order_id, error = %e, "Payment intent creation failed");
            None
        }
    };

    let payload = CheckoutPayload {
        order,
        payment_intent,
    };
    Ok(created(payload, "Order created").into_response())
}

pub async fn list_orders<S: Store>(
    State(state): State<AppState<S>>,
    AuthUser(user): AuthUser,
) -> Result<Response, AppError> {
    let orders = state.checkout.list_orders(&user).await?;
    Ok(success(orders, "Orders retrieved").into_response())
}

pub async fn get_order<S: Store>(
    State(state): State<AppState<S>>,
    AuthUser(user): AuthUser,
    Path(order_id): Path<i64>,
) -> Result<Response, AppError> {
    let order = state.checkout.get_order(&user, order_id).await?;
    Ok(success(order, "Order retrieved").into_response())
}

pub async fn mark_order_paid<S: Store>(
    State(state): State<AppState<S>>,
    AuthUser(user): AuthUser,
    Path(order_id): Path<i64>,
) -> Result<Response, AppError> {
    let order = state.checkout.mark_order_paid(&user, order_id).await?;
    Ok(success(order, "Order paid").into_response())
}
