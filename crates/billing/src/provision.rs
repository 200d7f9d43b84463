//! Usage subscription provisioning
//!
//! Every payer carries a second, zero-quantity subscription holding the four
//! metered prices. Meter events land on it and Stripe invoices the
//! accumulated usage at period end.

use std::collections::HashMap;
use std::str::FromStr;

use stripe::{
    CreateSubscription, CreateSubscriptionItems, CustomerId, ListSubscriptions, Subscription,
    SubscriptionId, SubscriptionStatus, UpdateSubscription, UpdateSubscriptionItems,
};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::ledger::LedgerStore;

/// Metadata marker distinguishing the usage subscription from access plans
const PLAN_METADATA_KEY: &str = "plan";
const USAGE_PLAN: &str = "usage";

/// Idempotent provisioner for the per-payer usage subscription
#[derive(Clone)]
pub struct UsageProvisioner {
    stripe: StripeClient,
    ledgers: LedgerStore,
}

impl UsageProvisioner {
    pub fn new(stripe: StripeClient, ledgers: LedgerStore) -> Self {
        Self { stripe, ledgers }
    }

    /// Find or create the usage subscription for a customer.
    ///
    /// Safe to call on every usage request: an existing subscription is
    /// reused, and any metered prices missing from it (added kinds after the
    /// subscription was created) are appended as line items.
    pub async fn ensure_usage_subscription(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> BillingResult<String> {
        let subscription = match self.find_existing(customer_id).await? {
            Some(subscription) => {
                self.append_missing_items(&subscription).await?;
                subscription
            }
            None => self.create(user_id, customer_id).await?,
        };

        let subscription_id = subscription.id.to_string();
        self.ledgers
            .set_usage_subscription(user_id, &subscription_id)
            .await?;
        Ok(subscription_id)
    }

    async fn find_existing(&self, customer_id: &str) -> BillingResult<Option<Subscription>> {
        let customer = CustomerId::from_str(customer_id)
            .map_err(|_| BillingError::Internal(format!("bad customer id: {customer_id}")))?;

        let params = ListSubscriptions {
            customer: Some(customer),
            ..Default::default()
        };
        let subscriptions = Subscription::list(self.stripe.inner(), &params).await?;

        Ok(subscriptions.data.into_iter().find(|s| {
            s.status != SubscriptionStatus::Canceled
                && s.metadata.get(PLAN_METADATA_KEY).map(String::as_str) == Some(USAGE_PLAN)
        }))
    }

    async fn create(&self, user_id: Uuid, customer_id: &str) -> BillingResult<Subscription> {
        let customer = CustomerId::from_str(customer_id)
            .map_err(|_| BillingError::Internal(format!("bad customer id: {customer_id}")))?;

        let mut params = CreateSubscription::new(customer);
        // Metered prices take no quantity; usage arrives via meter events
        params.items = Some(
            self.stripe
                .config()
                .pricing
                .all_price_ids()
                .into_iter()
                .map(|price_id| CreateSubscriptionItems {
                    price: Some(price_id.to_string()),
                    ..Default::default()
                })
                .collect(),
        );
        let mut metadata = HashMap::new();
        metadata.insert(PLAN_METADATA_KEY.to_string(), USAGE_PLAN.to_string());
        metadata.insert("user_id".to_string(), user_id.to_string());
        params.metadata = Some(metadata);

        let subscription = Subscription::create(self.stripe.inner(), params).await?;
        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            "created usage subscription"
        );
        Ok(subscription)
    }

    async fn append_missing_items(&self, subscription: &Subscription) -> BillingResult<()> {
        let existing: Vec<String> = subscription
            .items
            .data
            .iter()
            .filter_map(|item| item.price.as_ref().map(|p| p.id.to_string()))
            .collect();

        let missing: Vec<UpdateSubscriptionItems> = self
            .stripe
            .config()
            .pricing
            .all_price_ids()
            .into_iter()
            .filter(|price_id| !existing.iter().any(|e| e == price_id))
            .map(|price_id| UpdateSubscriptionItems {
                price: Some(price_id.to_string()),
                ..Default::default()
            })
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        let subscription_id = SubscriptionId::from_str(subscription.id.as_str())
            .map_err(|_| BillingError::Internal("bad subscription id".to_string()))?;
        let added = missing.len();
        let params = UpdateSubscription {
            items: Some(missing),
            ..Default::default()
        };
        Subscription::update(self.stripe.inner(), &subscription_id, params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            added,
            "appended missing metered prices to usage subscription"
        );
        Ok(())
    }
}
