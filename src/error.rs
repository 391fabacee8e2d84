// =============================================================================
// ERROR MODULE
// =============================================================================
// Custom error types and their HTTP responses.
//
// ERROR HANDLING PHILOSOPHY:
// - Errors should be informative but not leak internal details
// - Use typed errors instead of stringly-typed errors
// - Map errors to appropriate HTTP status codes
// - A failed order transaction is rolled back before it is classified here
// =============================================================================

use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

/// Postgres SQLSTATE for foreign_key_violation
const FOREIGN_KEY_VIOLATION: &str = "23503";

// =============================================================================
// CUSTOM ERROR TYPE
// =============================================================================
#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // INFRASTRUCTURE ERRORS
    // -------------------------------------------------------------------------
    /// Database query failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis operation failed
    #[error("Cache error: {0}")]
    Redis(#[from] redis::RedisError),

    // -------------------------------------------------------------------------
    // VALIDATION ERRORS
    // -------------------------------------------------------------------------
    /// Invalid request data
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Invalid payment mode: {0}")]
    InvalidPaymentMode(String),

    /// Generic unknown entity
    #[error("Not found: {0}")]
    NotFound(String),

    // -------------------------------------------------------------------------
    // INVENTORY / ORDER ERRORS
    // -------------------------------------------------------------------------
    #[error("Product {0} not found")]
    ProductNotFound(i64),

    #[error("Order {0} not found")]
    OrderNotFound(i64),

    /// Requested quantity exceeds the locked stock value
    #[error("Insufficient stock for product {product_id}: available {available}, requested {requested}")]
    OutOfStock {
        product_id: i64,
        available: i32,
        requested: i32,
    },

    /// Stored stock violates the non-negative invariant
    #[error("Stock of product {product_id} is corrupt ({stock})")]
    CorruptStock { product_id: i64, stock: i64 },

    // -------------------------------------------------------------------------
    // PAYMENT ERRORS
    // -------------------------------------------------------------------------
    /// The provider did not call back before the waiter timed out
    #[error("Timed out waiting for the provider callback of {reference}")]
    CallbackTimeout { reference: String },

    /// Provider rejected the request or could not be reached
    #[error("Payment provider error: {message}")]
    Gateway {
        message: String,
        detail: Option<serde_json::Value>,
        reference: Option<String>,
    },

    #[error("Secret key renewal failed: {0}")]
    SecretRenewalFailed(String),

    /// A waiter is already registered for this reference
    #[error("A payment attempt is already waiting on reference {0}")]
    DuplicateWaiter(String),

    // -------------------------------------------------------------------------
    // INTERNAL ERRORS
    // -------------------------------------------------------------------------
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Attaches the merchant reference to a gateway failure
    pub fn with_reference(self, reference: &str) -> Self {
        match self {
            AppError::Gateway {
                message, detail, ..
            } => AppError::Gateway {
                message,
                detail,
                reference: Some(reference.to_string()),
            },
            other => other,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.classify().0
    }

    /// (status, machine code, client-facing message)
    fn classify(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            AppError::InvalidPaymentMode(mode) => (
                StatusCode::BAD_REQUEST,
                "INVALID_PAYMENT_MODE",
                format!(
                    "Invalid payment mode '{}'. Accepted: 'Carte', 'PayPal', 'Espèces', 'Mobile Money'",
                    mode
                ),
            ),

            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),

            AppError::ProductNotFound(_) => {
                (StatusCode::NOT_FOUND, "PRODUCT_NOT_FOUND", self.to_string())
            }

            AppError::OrderNotFound(_) => {
                (StatusCode::NOT_FOUND, "ORDER_NOT_FOUND", self.to_string())
            }

            AppError::OutOfStock { .. } => {
                (StatusCode::BAD_REQUEST, "OUT_OF_STOCK", self.to_string())
            }

            AppError::CorruptStock { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CORRUPT_STOCK",
                "Stock data of a product is inconsistent".to_string(),
            ),

            AppError::CallbackTimeout { .. } => (
                StatusCode::REQUEST_TIMEOUT,
                "CALLBACK_TIMEOUT",
                "Timed out waiting for the transaction notification".to_string(),
            ),

            AppError::Gateway { message, .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "GATEWAY_ERROR",
                message.clone(),
            ),

            // Surfaces as a gateway failure of the enclosing payment call
            AppError::SecretRenewalFailed(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "GATEWAY_ERROR",
                format!("Payment provider credential unavailable: {}", msg),
            ),

            AppError::DuplicateWaiter(_) => (
                StatusCode::CONFLICT,
                "DUPLICATE_REFERENCE",
                self.to_string(),
            ),

            AppError::Database(err) if is_foreign_key_violation(err) => (
                StatusCode::BAD_REQUEST,
                "UNKNOWN_REFERENCE",
                "The client id does not exist".to_string(),
            ),

            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
            ),

            AppError::Redis(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CACHE_ERROR",
                "A cache error occurred".to_string(),
            ),

            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            ),
        }
    }
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some(FOREIGN_KEY_VIOLATION),
        _ => false,
    }
}

// =============================================================================
// HTTP RESPONSE CONVERSION
// =============================================================================
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = self.classify();

        if status.is_server_error() {
            tracing::error!(error_code = error_code, error = %self, "Request failed");
        } else {
            tracing::warn!(error_code = error_code, error = %self, "Request rejected");
        }

        let (reference, details) = match self {
            AppError::CallbackTimeout { reference } => (Some(reference), None),
            AppError::Gateway {
                detail, reference, ..
            } => (reference, detail),
            _ => (None, None),
        };

        let body = ErrorResponse::new(error_code, message)
            .with_reference(reference)
            .with_details(details);

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

// =============================================================================
// CONVERSION HELPERS
// =============================================================================

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

// Malformed bodies and paths are client errors (400), not axum's 422
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Gateway {
            message: format!("Could not reach the payment provider: {}", err),
            detail: None,
            reference: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn render(err: AppError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_callback_timeout_is_408_with_reference() {
        let (status, body) = render(AppError::CallbackTimeout {
            reference: "REF0123456789".into(),
        })
        .await;

        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(body["success"], false);
        assert_eq!(body["reference"], "REF0123456789");
    }

    #[tokio::test]
    async fn test_out_of_stock_is_400() {
        let (status, body) = render(AppError::OutOfStock {
            product_id: 7,
            available: 1,
            requested: 2,
        })
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "OUT_OF_STOCK");
    }

    #[tokio::test]
    async fn test_gateway_error_passes_provider_detail_through() {
        let err = AppError::Gateway {
            message: "Provider rejected the transaction".into(),
            detail: Some(serde_json::json!({"message": "invalid account"})),
            reference: None,
        }
        .with_reference("REFXYZ");

        let (status, body) = render(err).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["details"]["message"], "invalid account");
        assert_eq!(body["reference"], "REFXYZ");
    }

    #[tokio::test]
    async fn test_secret_renewal_failure_reports_gateway_code() {
        let (status, body) = render(AppError::SecretRenewalFailed("no push".into())).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "GATEWAY_ERROR");
    }

    #[tokio::test]
    async fn test_corrupt_stock_hides_internal_detail() {
        let (status, body) = render(AppError::CorruptStock {
            product_id: 3,
            stock: -4,
        })
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body["message"].as_str().unwrap().contains("-4"));
    }
}
