//! Lifecycle notification dispatch
//!
//! Posts billing lifecycle events (trial started, subscription activated,
//! renewed, payment failed) to an optional internal webhook. Delivery is
//! fire-and-forget: a dead endpoint must never fail a reconciliation.

use serde_json::json;
use uuid::Uuid;

/// Fire-and-forget notification sender
#[derive(Clone)]
pub struct NotificationDispatcher {
    http: reqwest::Client,
    endpoint: Option<String>,
}

impl NotificationDispatcher {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("NOTIFY_WEBHOOK_URL").ok())
    }

    /// Send a notification without blocking the caller.
    ///
    /// Errors are logged and swallowed.
    pub fn send(&self, user_id: Uuid, event: &'static str, detail: serde_json::Value) {
        let Some(endpoint) = self.endpoint.clone() else {
            tracing::debug!(user_id = %user_id, event, "notification endpoint not configured");
            return;
        };

        let http = self.http.clone();
        let body = json!({
            "user_id": user_id,
            "event": event,
            "detail": detail,
        });

        tokio::spawn(async move {
            match http.post(&endpoint).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(event, "notification delivered");
                }
                Ok(response) => {
                    tracing::warn!(event, status = %response.status(), "notification rejected");
                }
                Err(err) => {
                    tracing::warn!(event, error = %err, "notification delivery failed");
                }
            }
        });
    }
}
