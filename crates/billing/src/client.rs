//! Stripe client configuration

use reelkit_shared::UsageKind;
use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Per-kind Stripe wiring: the metered price and the meter event it feeds
#[derive(Debug, Clone)]
pub struct KindPricing {
    /// Stripe price ID (metered, attached to the usage subscription)
    pub price_id: String,
    /// Billing meter event name this kind reports against
    pub meter_event: String,
}

/// Price/meter table for all usage kinds
#[derive(Debug, Clone)]
pub struct PricingTable {
    pub script: KindPricing,
    pub voice: KindPricing,
    pub lipsync: KindPricing,
    pub edit: KindPricing,
}

impl PricingTable {
    pub fn for_kind(&self, kind: UsageKind) -> &KindPricing {
        match kind {
            UsageKind::Script => &self.script,
            UsageKind::Voice => &self.voice,
            UsageKind::Lipsync => &self.lipsync,
            UsageKind::Edit => &self.edit,
        }
    }

    /// All price IDs, in canonical kind order
    pub fn all_price_ids(&self) -> Vec<&str> {
        UsageKind::ALL
            .iter()
            .map(|k| self.for_kind(*k).price_id.as_str())
            .collect()
    }
}

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Metered price and meter event name per usage kind
    pub pricing: PricingTable,
    /// Hard ceiling on unbilled local spend, in cents
    pub daily_cap_cents: i64,
    /// One-time trial credit seeded for trialing payers, in cents
    pub trial_credit_cents: i64,
    /// Customer-facing billing portal URL, surfaced in cap responses
    pub portal_url: String,
}

fn required(key: &str) -> BillingResult<String> {
    std::env::var(key).map_err(|_| BillingError::Config(format!("{key} not set")))
}

fn kind_pricing(kind: UsageKind) -> BillingResult<KindPricing> {
    let suffix = kind.as_str().to_uppercase();
    Ok(KindPricing {
        price_id: required(&format!("STRIPE_PRICE_{suffix}"))?,
        meter_event: required(&format!("STRIPE_METER_{suffix}"))?,
    })
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            pricing: PricingTable {
                script: kind_pricing(UsageKind::Script)?,
                voice: kind_pricing(UsageKind::Voice)?,
                lipsync: kind_pricing(UsageKind::Lipsync)?,
                edit: kind_pricing(UsageKind::Edit)?,
            },
            daily_cap_cents: std::env::var("DAILY_CAP_CENTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15_000),
            trial_credit_cents: std::env::var("TRIAL_CREDIT_CENTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(500),
            portal_url: std::env::var("BILLING_PORTAL_URL")
                .unwrap_or_else(|_| "https://billing.stripe.com/p/login".to_string()),
        })
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
