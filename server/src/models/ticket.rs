use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A sellable (event, category, type) combination.
///
/// `quota` is the capacity not yet committed to a live order, so it never
/// drops below zero. `sold_count` moves in the opposite direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TicketOffering {
    pub id: i64,
    pub event_id: i64,
    pub category_id: i64,
    pub type_id: i64,
    pub name: String,
    pub price: Decimal,
    pub quota: i32,
    pub sold_count: i32,
    pub requires_identity_document: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TicketOffering {
    /// Key of the seat configuration this offering falls under.
    pub fn seating_key(&self) -> (i64, i64) {
        (self.event_id, self.type_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Seat {
    pub id: i64,
    pub event_id: i64,
    pub type_id: i64,
    pub seat_number: String,
    pub is_booked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
