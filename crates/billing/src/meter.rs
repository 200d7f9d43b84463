//! Billing meter event reporting
//!
//! async-stripe 0.39 predates the Billing Meters API, so meter events go
//! through a thin reqwest adapter against the raw endpoint. The seam is a
//! trait so the accounting core can be tested without network access.

use serde::Deserialize;

use crate::error::{BillingError, BillingResult};

const METER_EVENTS_URL: &str = "https://api.stripe.com/v1/billing/meter_events";

/// Identifier Stripe assigned (or echoed back) for a reported meter event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterEventId(pub String);

/// Destination for metered usage reports
pub trait MeterSink: Send + Sync {
    /// Report `quantity` units against a meter for a customer.
    ///
    /// The identifier doubles as Stripe's idempotency key: re-sending the
    /// same identifier within the dedup window records the usage once.
    fn record(
        &self,
        event_name: &str,
        customer_id: &str,
        quantity: i64,
        identifier: &str,
    ) -> impl std::future::Future<Output = BillingResult<MeterEventId>> + Send;
}

/// Stripe-backed meter sink
#[derive(Clone)]
pub struct StripeMeterSink {
    http: reqwest::Client,
    secret_key: String,
}

#[derive(Deserialize)]
struct MeterEventResponse {
    identifier: String,
}

#[derive(Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
}

impl StripeMeterSink {
    pub fn new(secret_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            secret_key: secret_key.to_string(),
        }
    }
}

impl MeterSink for StripeMeterSink {
    async fn record(
        &self,
        event_name: &str,
        customer_id: &str,
        quantity: i64,
        identifier: &str,
    ) -> BillingResult<MeterEventId> {
        let quantity = quantity.to_string();
        let params = [
            ("event_name", event_name),
            ("identifier", identifier),
            ("payload[stripe_customer_id]", customer_id),
            ("payload[value]", quantity.as_str()),
        ];

        let response = self
            .http
            .post(METER_EVENTS_URL)
            .basic_auth(&self.secret_key, None::<&str>)
            .form(&params)
            .send()
            .await
            .map_err(|e| BillingError::MeterRejected(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response
                .json::<StripeErrorBody>()
                .await
                .ok()
                .and_then(|b| b.error.message)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(BillingError::MeterRejected(message));
        }

        let body: MeterEventResponse = response
            .json()
            .await
            .map_err(|e| BillingError::MeterRejected(e.to_string()))?;

        Ok(MeterEventId(body.identifier))
    }
}
