use axum::middleware::map_response_with_state;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::{create_cors_layer, security_headers, Config, SecurityHeaders};
use crate::handlers::{create_order, get_order, health_check, list_orders, mark_order_paid};
use crate::state::AppState;
use crate::store::Store;

pub fn create_routes<S: Store>(state: AppState<S>, config: &Config) -> Router {
    let orders = Router::new()
        .route("/orders", post(create_order::<S>).get(list_orders::<S>))
        .route("/orders/:id", get(get_order::<S>))
        .route("/orders/:id/pay", post(mark_order_paid::<S>));

    // Layers run bottom-up: the request id is set before tracing sees it.
    Router::new()
        .route("/health", get(health_check))
        .nest("/v1", orders)
        .with_state(state)
        .layer(map_response_with_state(
            SecurityHeaders::new(config.production),
            security_headers,
        ))
        .layer(create_cors_layer(&config.cors_allowed_origins))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}
