//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use reelkit_billing::BillingError;
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Resource not found")]
    NotFound,

    // Billing errors
    #[error("No payment profile on file")]
    NoPayerOnFile,
    #[error("Subscription is not active: {0}")]
    SubscriptionInvalid(String),
    #[error("Daily spending cap reached")]
    CapReached {
        remaining_cents: i64,
        cap_cents: i64,
        portal_url: String,
    },

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Upstream billing provider error: {0}")]
    Upstream(String),
    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    /// Map a billing-core error onto the HTTP taxonomy.
    ///
    /// Cap rejections carry the portal URL so clients can send the user
    /// straight to their billing settings.
    pub fn from_billing(err: BillingError, portal_url: &str) -> Self {
        match err {
            BillingError::LedgerNotFound(_) => ApiError::NotFound,
            BillingError::NoPayerOnFile(_) => ApiError::NoPayerOnFile,
            BillingError::SubscriptionInvalid(msg) => ApiError::SubscriptionInvalid(msg),
            BillingError::InvalidQuantity(q) => {
                ApiError::BadRequest(format!("invalid quantity: {q}"))
            }
            BillingError::MissingPrice(kind) | BillingError::PriceUnusable(kind) => {
                ApiError::BadRequest(format!("usage kind not billable: {kind}"))
            }
            BillingError::CapExceeded {
                remaining_cents,
                cap_cents,
                ..
            } => ApiError::CapReached {
                remaining_cents,
                cap_cents,
                portal_url: portal_url.to_string(),
            },
            BillingError::StripeApi(msg) | BillingError::MeterRejected(msg) => {
                ApiError::Upstream(msg)
            }
            BillingError::Database(msg) => ApiError::Database(msg),
            other => {
                tracing::error!(error = %other, "unexpected billing error");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),

            ApiError::NoPayerOnFile => (
                StatusCode::PAYMENT_REQUIRED,
                "NO_PAYER_ON_FILE",
                "Add a payment method before using billable features".to_string(),
            ),
            ApiError::SubscriptionInvalid(msg) => (
                StatusCode::PAYMENT_REQUIRED,
                "SUBSCRIPTION_INVALID",
                msg.clone(),
            ),
            ApiError::CapReached { .. } => (
                StatusCode::PAYMENT_REQUIRED,
                "DAILY_CAP_REACHED",
                self.to_string(),
            ),

            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Upstream(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "UPSTREAM_ERROR",
                "Billing provider error".to_string(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
        };

        let mut error = json!({
            "code": code,
            "message": message,
        });

        if let ApiError::CapReached {
            remaining_cents,
            cap_cents,
            portal_url,
        } = &self
        {
            error["remaining_cents"] = json!(remaining_cents);
            error["cap_cents"] = json!(cap_cents);
            error["portal_url"] = json!(portal_url);
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            _ => ApiError::Database(err.to_string()),
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn billing_errors_map_to_taxonomy() {
        let user = Uuid::nil();
        assert!(matches!(
            ApiError::from_billing(BillingError::LedgerNotFound(user), ""),
            ApiError::NotFound
        ));
        assert!(matches!(
            ApiError::from_billing(BillingError::NoPayerOnFile(user), ""),
            ApiError::NoPayerOnFile
        ));
        assert!(matches!(
            ApiError::from_billing(BillingError::InvalidQuantity(0), ""),
            ApiError::BadRequest(_)
        ));
    }

    #[test]
    fn cap_rejection_carries_portal_url() {
        let err = ApiError::from_billing(
            BillingError::CapExceeded {
                pending_cents: 14_960,
                cap_cents: 15_000,
                remaining_cents: 40,
            },
            "https://example.com/portal",
        );
        match err {
            ApiError::CapReached {
                remaining_cents,
                cap_cents,
                portal_url,
            } => {
                assert_eq!(remaining_cents, 40);
                assert_eq!(cap_cents, 15_000);
                assert_eq!(portal_url, "https://example.com/portal");
            }
            other => panic!("expected CapReached, got {other:?}"),
        }
    }
}
