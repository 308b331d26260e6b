use std::fmt;

use crate::models::{Order, OrderView, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderAction {
    View,
    MarkPaid,
}

impl fmt::Display for OrderAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderAction::View => f.write_str("view"),
            OrderAction::MarkPaid => f.write_str("pay"),
        }
    }
}

/// Anything that records which user an order belongs to.
pub trait OwnedOrder {
    fn owner_id(&self) -> i64;
}

impl OwnedOrder for Order {
    fn owner_id(&self) -> i64 {
        self.user_id
    }
}

impl OwnedOrder for OrderView {
    fn owner_id(&self) -> i64 {
        self.user_id
    }
}

/// Whether `user` may perform `action` on `order`. Status rules are checked
/// separately by the caller.
pub fn authorize(user: &User, order: &impl OwnedOrder, action: OrderAction) -> bool {
    match action {
        OrderAction::View | OrderAction::MarkPaid => user.id == order.owner_id(),
    }
}
