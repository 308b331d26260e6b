use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use crate::store::StoreError;
use crate::utils::response::error as error_response;

#[derive(Debug, Error)]
pub enum AppError {
    /// Every business-rule violation found in one pass.
    #[error("Validation error: {}", .0.join("; "))]
    ValidationError(Vec<String>),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Transition not allowed from the order's current status.
    #[error("Invalid order status: {0}")]
    InvalidOrderStatus(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] StoreError),

    #[error("Internal server error")]
    InternalServerError(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::AuthError(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidOrderStatus(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::StorageError(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            AppError::StorageError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "VALIDATION_ERROR",
            AppError::AuthError(_) => "AUTH_ERROR",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::InvalidOrderStatus(_) => "INVALID_ORDER_STATUS",
            AppError::StorageError(e) if e.is_transient() => "TRANSIENT_ERROR",
            AppError::StorageError(_) => "DATABASE_ERROR",
            AppError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    fn log(&self) {
        match self {
            AppError::ValidationError(errors) => {
                warn!(errors = ?errors, "Validation failed");
            }
            AppError::AuthError(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::InvalidOrderStatus(msg) => {
                warn!(code = self.code(), message = %msg, "Request rejected");
            }
            AppError::StorageError(e) if e.is_transient() => {
                warn!(error = %e, "Transient storage failure, client may retry");
            }
            AppError::StorageError(e) => {
                error!(error = ?e, "Storage error");
            }
            AppError::InternalServerError(msg) => {
                error!(error = ?self, message = %msg, "Application error");
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        // Log internal details
        self.log();

        // Only expose high-level message to the client
        let (public_message, details) = match &self {
            AppError::ValidationError(errors) => (
                "The request cannot be processed due to the following errors".to_string(),
                Some(json!(errors)),
            ),
            AppError::AuthError(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::InvalidOrderStatus(msg) => (msg.clone(), None),
            AppError::StorageError(e) if e.is_transient() => (
                "The request conflicted with concurrent activity, please retry".to_string(),
                None,
            ),
            AppError::StorageError(_) => ("A database error occurred".to_string(), None),
            AppError::InternalServerError(_) => ("An internal error occurred".to_string(), None),
        };

        error_response(code, public_message, details, status)
    }
}
