use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "voucher_scope", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VoucherScope {
    /// Redeemable on any event.
    General,
    /// Redeemable only when every ticket in the cart belongs to `event_id`.
    Specific,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "discount_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DiscountKind {
    Percentage,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Voucher {
    pub id: i64,
    pub code: String,
    pub scope: VoucherScope,
    pub event_id: Option<i64>,
    pub discount: Decimal,
    pub discount_kind: DiscountKind,
    pub valid_until: DateTime<Utc>,
    pub usage_limit: i32,
    pub used_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Voucher {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until <= now
    }

    pub fn is_exhausted(&self) -> bool {
        self.used_count >= self.usage_limit
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct VoucherRedemption {
    pub id: i64,
    pub voucher_id: i64,
    pub user_id: i64,
    pub order_id: i64,
    pub created_at: DateTime<Utc>,
}
