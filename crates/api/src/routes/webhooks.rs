//! Stripe webhook endpoint

use axum::{extract::State, http::HeaderMap, Json};
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /api/webhook/stripe
///
/// Signature failures are the only non-200 outcome. Reconciliation errors
/// are logged and acknowledged so Stripe does not retry events whose
/// failures a redelivery would not fix.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<serde_json::Value>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing stripe-signature header".to_string()))?;

    let event = state
        .billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|_| ApiError::BadRequest("invalid webhook signature".to_string()))?;

    if let Err(e) = state.billing.webhooks.handle_event(event).await {
        tracing::error!(error = %e, "webhook reconciliation failed");
    }

    Ok(Json(json!({ "received": true })))
}
