use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Handle returned to the client so it can complete payment out of band.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentIntent {
    pub id: Uuid,
    pub order_id: i64,
    pub amount: Decimal,
}

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Payment provider unavailable: {0}")]
    Unavailable(String),

    #[error("Payment rejected: {0}")]
    Rejected(String),
}

/// Outbound seam to the payment provider. Called after the order commits, so
/// a failure here never undoes a reservation.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(
        &self,
        order_id: i64,
        amount: Decimal,
    ) -> Result<PaymentIntent, PaymentError>;
}

/// Issues intents locally and records them in the log.
#[derive(Debug, Clone, Default)]
pub struct LoggingPaymentGateway;

#[async_trait]
impl PaymentGateway for LoggingPaymentGateway {
    async fn create_intent(
        &self,
        order_id: i64,
        amount: Decimal,
    ) -> Result<PaymentIntent, PaymentError> {
        if amount.is_sign_negative() {
            return Err(PaymentError::Rejected(format!(
                "amount {} is negative",
                amount
            )));
        }
        let intent = PaymentIntent {
            id: Uuid::new_v4(),
            order_id,
            amount,
        };
        info!(intent_id = %intent.id, order_id, amount = %amount, "Payment intent created");
        Ok(intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_intent_carries_order_and_amount() {
        let intent = LoggingPaymentGateway
            .create_intent(7, dec!(180.00))
            .await
            .unwrap();

        assert_eq!(intent.order_id, 7);
        assert_eq!(intent.amount, dec!(180.00));
        assert!(!intent.id.is_nil());
    }

    #[tokio::test]
    async fn test_negative_amount_is_rejected() {
        let result = LoggingPaymentGateway.create_intent(7, dec!(-1)).await;
        assert!(matches!(result, Err(PaymentError::Rejected(_))));
    }
}
