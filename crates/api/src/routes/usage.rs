//! Usage recording endpoint

use std::str::FromStr;

use axum::{extract::State, http::HeaderMap, Json};
use reelkit_billing::UsageOutcome;
use reelkit_shared::UsageKind;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";

#[derive(Debug, Deserialize)]
pub struct UsageRequest {
    /// Usage kind: script, voice, lipsync, or edit
    pub kind: String,
    /// Units consumed, defaults to 1
    pub quantity: Option<i64>,
    /// Client idempotency token; the header takes precedence
    pub idem: Option<String>,
}

/// POST /api/billing/usage
///
/// Charges the authenticated user for generated content. Retries with the
/// same idempotency token are safe: the paid portion dedupes on the meter.
pub async fn record_usage(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
    Json(body): Json<UsageRequest>,
) -> ApiResult<Json<UsageOutcome>> {
    let kind = UsageKind::from_str(&body.kind).map_err(ApiError::BadRequest)?;
    let quantity = body.quantity.unwrap_or(1);

    let token = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(body.idem)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let outcome = state
        .billing
        .accountant
        .charge(user.user_id, kind, quantity, &token)
        .await
        .map_err(|e| ApiError::from_billing(e, &state.billing.portal_url))?;

    Ok(Json(outcome))
}
