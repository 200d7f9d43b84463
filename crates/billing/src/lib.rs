//! Reelkit Billing
//!
//! Usage-credit accounting on top of Stripe: a per-user ledger with trial
//! credit and a daily soft cap, metered usage reporting, usage subscription
//! provisioning, and webhook reconciliation.

pub mod client;
pub mod error;
pub mod ledger;
pub mod meter;
pub mod notify;
pub mod pricing;
pub mod provision;
pub mod usage;
pub mod webhooks;

pub use client::{KindPricing, PricingTable, StripeClient, StripeConfig};
pub use error::{BillingError, BillingResult};
pub use ledger::{Ledger, LedgerStore};
pub use meter::{MeterEventId, MeterSink, StripeMeterSink};
pub use notify::NotificationDispatcher;
pub use pricing::PriceResolver;
pub use provision::UsageProvisioner;
pub use usage::{UsageAccountant, UsageOutcome};
pub use webhooks::WebhookHandler;

use sqlx::PgPool;

/// Everything the HTTP layer needs, wired together
pub struct BillingService {
    pub accountant: UsageAccountant<StripeMeterSink>,
    pub webhooks: WebhookHandler,
    pub portal_url: String,
}

impl BillingService {
    /// Build the full billing stack from environment configuration
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::new(stripe, pool, NotificationDispatcher::from_env()))
    }

    pub fn new(stripe: StripeClient, pool: PgPool, notify: NotificationDispatcher) -> Self {
        let ledgers = LedgerStore::new(pool);
        let provisioner = UsageProvisioner::new(stripe.clone(), ledgers.clone());
        let meter = StripeMeterSink::new(&stripe.config().secret_key);
        let portal_url = stripe.config().portal_url.clone();

        let accountant = UsageAccountant::new(
            stripe.clone(),
            ledgers.clone(),
            PriceResolver::new(),
            provisioner.clone(),
            meter,
        );
        let webhooks = WebhookHandler::new(stripe, ledgers, provisioner, notify);

        Self {
            accountant,
            webhooks,
            portal_url,
        }
    }
}
