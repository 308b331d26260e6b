use serde::{Deserialize, Serialize};

/// Longest voucher code the checkout accepts.
pub const MAX_VOUCHER_CODE_LEN: usize = 255;

/// One cart line as posted by the client.
///
/// The document type stays a raw string here so an unknown value becomes a
/// validation message rather than a deserialization failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub ticket_id: i64,
    pub quantity: i32,
    #[serde(default)]
    pub identity_document_number: Option<String>,
    #[serde(default)]
    pub identity_document_type: Option<String>,
    #[serde(default)]
    pub seat_id: Option<i64>,
}

impl CartItem {
    pub fn new(ticket_id: i64, quantity: i32) -> Self {
        Self {
            ticket_id,
            quantity,
            identity_document_number: None,
            identity_document_type: None,
            seat_id: None,
        }
    }

    pub fn with_identity_document(mut self, number: &str, kind: &str) -> Self {
        self.identity_document_number = Some(number.to_string());
        self.identity_document_type = Some(kind.to_string());
        self
    }

    pub fn with_seat(mut self, seat_id: i64) -> Self {
        self.seat_id = Some(seat_id);
        self
    }

    /// Trimmed document number, `None` when absent or blank.
    pub fn document_number(&self) -> Option<&str> {
        self.identity_document_number
            .as_deref()
            .map(str::trim)
            .filter(|number| !number.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub tickets: Vec<CartItem>,
    #[serde(default)]
    pub voucher_code: Option<String>,
}

impl CheckoutRequest {
    pub fn new(tickets: Vec<CartItem>) -> Self {
        Self {
            tickets,
            voucher_code: None,
        }
    }

    pub fn with_voucher(mut self, code: &str) -> Self {
        self.voucher_code = Some(code.to_string());
        self
    }

    /// The voucher code if one was filled in. Blank codes count as absent.
    pub fn voucher_code(&self) -> Option<&str> {
        self.voucher_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
    }

    pub fn offering_ids(&self) -> Vec<i64> {
        self.tickets.iter().map(|item| item.ticket_id).collect()
    }

    pub fn seat_ids(&self) -> Vec<i64> {
        self.tickets.iter().filter_map(|item| item.seat_id).collect()
    }

    pub fn document_numbers(&self) -> Vec<String> {
        self.tickets
            .iter()
            .filter_map(CartItem::document_number)
            .map(str::to_string)
            .collect()
    }
}
