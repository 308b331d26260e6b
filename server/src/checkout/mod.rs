//! Checkout: cart validation, pricing, inventory reservation and the order
//! lifecycle that follows it.

use thiserror::Error;

use crate::models::OrderStatus;
use crate::store::StoreError;
use crate::utils::error::AppError;

pub mod cart;
pub mod orchestrator;
pub mod policy;
pub mod pricing;
pub mod reaper;

pub use cart::{CartItem, CheckoutRequest};
pub use orchestrator::CheckoutService;
pub use policy::{authorize, OrderAction};
pub use reaper::ExpiryReaper;

#[derive(Debug, Error)]
pub enum CheckoutError {
    /// The cart broke one or more business rules; nothing was written.
    #[error("checkout rejected: {}", .0.join("; "))]
    Rejected(Vec<String>),

    #[error("order {0} not found")]
    OrderNotFound(i64),

    #[error("user {user_id} may not {action} order {order_id}")]
    Forbidden {
        user_id: i64,
        order_id: i64,
        action: OrderAction,
    },

    #[error("order {order_id} is {status}")]
    InvalidStatus { order_id: i64, status: OrderStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<CheckoutError> for AppError {
    fn from(error: CheckoutError) -> Self {
        match error {
            CheckoutError::Rejected(errors) => AppError::ValidationError(errors),
            CheckoutError::OrderNotFound(order_id) => {
                AppError::NotFound(format!("Order {order_id} was not found"))
            }
            CheckoutError::Forbidden { action, .. } => {
                AppError::Forbidden(format!("You are not allowed to {action} this order"))
            }
            CheckoutError::InvalidStatus { status, .. } => AppError::InvalidOrderStatus(format!(
                "Order cannot be paid in its current status ({status})"
            )),
            CheckoutError::Store(error) => AppError::StorageError(error),
        }
    }
}
