//! Billing error types

use thiserror::Error;
use uuid::Uuid;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Ledger not found for user: {0}")]
    LedgerNotFound(Uuid),

    #[error("No payment profile on file for user: {0}")]
    NoPayerOnFile(Uuid),

    #[error("Subscription is not active: {0}")]
    SubscriptionInvalid(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(i64),

    #[error("No price configured for usage kind: {0}")]
    MissingPrice(String),

    #[error("Price has no per-unit amount: {0}")]
    PriceUnusable(String),

    #[error("Daily spending cap reached: {pending_cents} of {cap_cents} cents pending, {remaining_cents} remaining")]
    CapExceeded {
        pending_cents: i64,
        cap_cents: i64,
        remaining_cents: i64,
    },

    #[error("Meter event rejected: {0}")]
    MeterRejected(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook event type not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
