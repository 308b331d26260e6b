use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Cancelled,
}

impl OrderStatus {
    /// Pending is the only state with outgoing transitions.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        match (self, next) {
            (OrderStatus::Pending, OrderStatus::Paid) => true,
            (OrderStatus::Pending, OrderStatus::Cancelled) => true,
            (OrderStatus::Pending, OrderStatus::Pending) => false,
            (OrderStatus::Paid, _) | (OrderStatus::Cancelled, _) => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "identity_document_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IdentityDocumentType {
    DrivingLicense,
    Passport,
    National,
}

impl IdentityDocumentType {
    pub const ALL: [IdentityDocumentType; 3] = [
        IdentityDocumentType::DrivingLicense,
        IdentityDocumentType::Passport,
        IdentityDocumentType::National,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IdentityDocumentType::DrivingLicense => "driving_license",
            IdentityDocumentType::Passport => "passport",
            IdentityDocumentType::National => "national",
        }
    }

    /// Comma separated list used in validation messages.
    pub fn valid_values() -> String {
        Self::ALL
            .iter()
            .map(|kind| kind.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromStr for IdentityDocumentType {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub total_amount: Decimal,
    pub discount_amount: Decimal,
    pub status: OrderStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Line item. `unit_price` is the offering price at the moment of sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct OrderLine {
    pub id: i64,
    pub order_id: i64,
    pub ticket_offering_id: i64,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub identity_document_number: Option<String>,
    pub identity_document_type: Option<IdentityDocumentType>,
    pub seat_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub user_id: i64,
    pub total_amount: Decimal,
    pub discount_amount: Decimal,
    pub lines: Vec<NewOrderLine>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOrderLine {
    pub ticket_offering_id: i64,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub identity_document_number: Option<String>,
    pub identity_document_type: Option<IdentityDocumentType>,
    pub seat_id: Option<i64>,
}

/// Order as returned to the buyer, with lines resolved against the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderView {
    pub order_id: i64,
    pub user_id: i64,
    pub status: OrderStatus,
    pub total_amount: Decimal,
    pub discount_amount: Decimal,
    pub order_date: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub order_detail: Vec<OrderLineView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct OrderLineView {
    pub ticket_id: i64,
    pub ticket_name: String,
    pub category: String,
    #[serde(rename = "type")]
    pub ticket_type: String,
    pub event_name: String,
    pub event_location: String,
    pub event_date: DateTime<Utc>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
    pub requires_identity_document: bool,
    pub seat_id: Option<i64>,
    pub seat_number: Option<String>,
}

impl OrderView {
    pub fn new(order: Order, order_detail: Vec<OrderLineView>) -> Self {
        Self {
            order_id: order.id,
            user_id: order.user_id,
            status: order.status,
            total_amount: order.total_amount,
            discount_amount: order.discount_amount,
            order_date: order.created_at,
            paid_at: order.paid_at,
            order_detail,
        }
    }
}
