//! Stripe webhook handling
//!
//! Reconciles subscription, invoice, checkout, and customer events into the
//! user ledger. Signature verification is mandatory; reconciliation failures
//! are logged and swallowed so Stripe gets a 200 and retries stay quiet.

use std::collections::HashMap;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use reelkit_shared::AccessStatus;
use sha2::Sha256;
use stripe::{
    CheckoutSession, Customer, CustomerId, Event, EventObject, EventType, Expandable, Invoice,
    InvoiceBillingReason, Subscription, UpdateCustomer, Webhook,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{Ledger, LedgerStore};
use crate::notify::NotificationDispatcher;
use crate::provision::UsageProvisioner;

type HmacSha256 = Hmac<Sha256>;

/// A subscription younger than this at activation already produced a
/// creation notification; the follow-up activation event stays silent.
const ACTIVATION_DEDUP_SECS: i64 = 120;

/// Metadata marker on our own usage subscriptions
const USAGE_PLAN: &str = "usage";

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    stripe: StripeClient,
    ledgers: LedgerStore,
    provisioner: UsageProvisioner,
    notify: NotificationDispatcher,
}

impl WebhookHandler {
    pub fn new(
        stripe: StripeClient,
        ledgers: LedgerStore,
        provisioner: UsageProvisioner,
        notify: NotificationDispatcher,
    ) -> Self {
        Self {
            stripe,
            ledgers,
            provisioner,
            notify,
        }
    }

    /// Verify and parse a Stripe webhook event
    ///
    /// Uses manual signature verification to work around async-stripe version
    /// incompatibility with newer Stripe API versions.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        // Try the standard method first
        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "standard webhook parsing failed, trying manual verification"
                );
            }
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        check_signature_at(payload, signature, webhook_secret, now)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// Every event lands in the audit log with its outcome. Idempotency does
    /// not depend on the log: each reconciliation is keyed on its own content
    /// (period_end, granted-once flags, absolute mirrors), so a re-delivered
    /// event converges to the same state.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        tracing::info!(event_type = %event_type, event_id = %event_id, "processing Stripe webhook event");

        let result = self.process_event(event).await;

        let outcome = match &result {
            Ok(()) => "success".to_string(),
            Err(e) => format!("error: {e}"),
        };
        if let Err(e) = self
            .ledgers
            .record_webhook_event(&event_id, &event_type, &outcome)
            .await
        {
            tracing::warn!(event_id = %event_id, error = %e, "failed to record webhook audit row");
        }

        result
    }

    async fn process_event(&self, event: Event) -> BillingResult<()> {
        match event.type_ {
            EventType::CustomerCreated | EventType::CustomerUpdated => {
                self.handle_customer_upsert(event).await
            }
            EventType::CheckoutSessionCompleted => self.handle_checkout_completed(event).await,
            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                self.handle_subscription_changed(event).await
            }
            EventType::CustomerSubscriptionDeleted => self.handle_subscription_deleted(event).await,
            EventType::InvoicePaid => self.handle_invoice_paid(event).await,
            EventType::InvoicePaymentFailed => self.handle_invoice_payment_failed(event).await,
            _ => {
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "received unhandled Stripe event type"
                );
                Ok(())
            }
        }
    }

    /// `customer.created` / `customer.updated`: keep the payer mapping fresh
    async fn handle_customer_upsert(&self, event: Event) -> BillingResult<()> {
        let customer = extract_customer(event)?;

        let Some(user_id) = customer
            .metadata
            .as_ref()
            .and_then(|m| m.get("user_id"))
            .and_then(|id| Uuid::parse_str(id).ok())
        else {
            tracing::debug!(customer_id = %customer.id, "customer has no user_id metadata");
            return Ok(());
        };

        self.ledgers
            .upsert_payer(user_id, customer.id.as_str(), customer.email.as_deref())
            .await?;

        tracing::info!(user_id = %user_id, customer_id = %customer.id, "payer mapping updated");
        Ok(())
    }

    /// `checkout.session.completed`: the moment a payer comes online
    async fn handle_checkout_completed(&self, event: Event) -> BillingResult<()> {
        let session = extract_checkout_session(event)?;

        let Some(user_id) = session
            .metadata
            .as_ref()
            .and_then(|m| m.get("user_id"))
            .and_then(|id| Uuid::parse_str(id).ok())
        else {
            tracing::warn!(session_id = %session.id, "checkout session has no user_id metadata");
            return Ok(());
        };

        let Some(customer_id) = session.customer.as_ref().map(expandable_customer_id) else {
            tracing::warn!(session_id = %session.id, "checkout session has no customer");
            return Ok(());
        };

        let subscription_id = session.subscription.as_ref().map(expandable_subscription_id);
        self.ledgers
            .bind_checkout(user_id, &customer_id, subscription_id.as_deref())
            .await?;

        if let Some(subscription_id) = &subscription_id {
            let id = stripe::SubscriptionId::from_str(subscription_id)
                .map_err(|_| BillingError::Internal("bad subscription id".to_string()))?;
            let subscription = Subscription::retrieve(self.stripe.inner(), &id, &[]).await?;

            self.mirror(user_id, &subscription).await?;

            if subscription.status == stripe::SubscriptionStatus::Trialing {
                let seed = self.stripe.config().trial_credit_cents;
                if self.ledgers.seed_trial_credit(user_id, seed).await? {
                    tracing::info!(user_id = %user_id, cents = seed, "seeded trial credit at checkout");
                }
            }

            // Future usage invoices charge automatically only if the card
            // captured at checkout becomes the customer default
            self.persist_default_payment_method(&customer_id, &subscription)
                .await;
        }

        if let Err(e) = self
            .provisioner
            .ensure_usage_subscription(user_id, &customer_id)
            .await
        {
            tracing::warn!(user_id = %user_id, error = %e, "usage subscription provisioning failed at checkout");
        }

        tracing::info!(user_id = %user_id, customer_id = %customer_id, "checkout completed");
        Ok(())
    }

    /// `customer.subscription.created` / `customer.subscription.updated`
    async fn handle_subscription_changed(&self, event: Event) -> BillingResult<()> {
        let subscription = extract_subscription(event)?;

        // Our own usage subscription must not overwrite the access mirror
        if subscription.metadata.get("plan").map(String::as_str) == Some(USAGE_PLAN) {
            return Ok(());
        }

        let Some(ledger) = self.ledger_for_subscription(&subscription).await? else {
            tracing::warn!(subscription_id = %subscription.id, "no ledger for subscription event");
            return Ok(());
        };
        let user_id = ledger.user_id;
        let prev_status = ledger.access_status;

        let status = self.mirror(user_id, &subscription).await?;

        match status.block_reason() {
            Some(reason) => self.ledgers.set_block(user_id, reason).await?,
            None => self.ledgers.clear_block(user_id).await?,
        }

        if status == AccessStatus::Trialing && !ledger.trial_credit_granted {
            let seed = self.stripe.config().trial_credit_cents;
            if self.ledgers.seed_trial_credit(user_id, seed).await? {
                tracing::info!(user_id = %user_id, cents = seed, "seeded trial credit");
            }
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if let Some(notification) =
            decide_notification(prev_status, status, subscription.created, now)
        {
            self.notify.send(
                user_id,
                notification,
                serde_json::json!({
                    "subscription_id": subscription.id.to_string(),
                    "status": status.as_str(),
                }),
            );
        }

        Ok(())
    }

    /// `customer.subscription.deleted`
    async fn handle_subscription_deleted(&self, event: Event) -> BillingResult<()> {
        let subscription = extract_subscription(event)?;

        if subscription.metadata.get("plan").map(String::as_str) == Some(USAGE_PLAN) {
            return Ok(());
        }

        let Some(ledger) = self.ledger_for_subscription(&subscription).await? else {
            return Ok(());
        };

        self.ledgers
            .mirror_subscription(
                ledger.user_id,
                subscription.id.as_str(),
                None,
                AccessStatus::Canceled,
                None,
            )
            .await?;

        tracing::info!(user_id = %ledger.user_id, subscription_id = %subscription.id, "subscription canceled");
        Ok(())
    }

    /// `invoice.paid`: the payer is in good standing again
    async fn handle_invoice_paid(&self, event: Event) -> BillingResult<()> {
        let invoice = extract_invoice(event)?;

        let Some(ledger) = self.ledger_for_invoice(&invoice).await? else {
            tracing::warn!(invoice_id = %invoice.id, "no ledger for paid invoice");
            return Ok(());
        };
        let user_id = ledger.user_id;

        let paid_at = invoice
            .created
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
            .unwrap_or_else(OffsetDateTime::now_utc);
        self.ledgers.record_payment(user_id, paid_at).await?;

        // A paid usage invoice settles the unbilled pending figure
        let invoice_subscription = invoice.subscription.as_ref().map(expandable_subscription_id);
        if invoice_subscription.is_some() && invoice_subscription == ledger.usage_subscription_id {
            if let Some(period_end) = invoice
                .period_end
                .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
            {
                let reset = self
                    .ledgers
                    .reset_pending_for_period(user_id, period_end)
                    .await?;
                tracing::info!(
                    user_id = %user_id,
                    period_end = %period_end,
                    reset,
                    "usage invoice paid"
                );
            }
        }

        if is_renewal(invoice.billing_reason) {
            self.notify.send(
                user_id,
                "subscription_renewed",
                serde_json::json!({
                    "invoice_id": invoice.id.to_string(),
                    "amount_paid_cents": invoice.amount_paid,
                }),
            );
        }

        Ok(())
    }

    /// `invoice.payment_failed`: block further spend until payment clears
    async fn handle_invoice_payment_failed(&self, event: Event) -> BillingResult<()> {
        let invoice = extract_invoice(event)?;

        let Some(ledger) = self.ledger_for_invoice(&invoice).await? else {
            tracing::warn!(invoice_id = %invoice.id, "no ledger for failed invoice");
            return Ok(());
        };
        let user_id = ledger.user_id;

        let amount_due = invoice.amount_due.unwrap_or(0);
        self.ledgers
            .record_payment_failure(user_id, amount_due)
            .await?;

        tracing::warn!(
            user_id = %user_id,
            invoice_id = %invoice.id,
            amount_due_cents = amount_due,
            "invoice payment failed, billing blocked"
        );

        self.notify.send(
            user_id,
            "payment_failed",
            serde_json::json!({
                "invoice_id": invoice.id.to_string(),
                "amount_due_cents": amount_due,
            }),
        );

        Ok(())
    }

    /// Mirror a subscription's plan, status, and renewal onto the ledger
    async fn mirror(&self, user_id: Uuid, subscription: &Subscription) -> BillingResult<AccessStatus> {
        let status = AccessStatus::parse(&subscription.status.to_string());
        let plan = subscription.metadata.get("plan").map(String::as_str);
        let renewal_at =
            OffsetDateTime::from_unix_timestamp(subscription.current_period_end).ok();

        self.ledgers
            .mirror_subscription(user_id, subscription.id.as_str(), plan, status, renewal_at)
            .await?;
        Ok(status)
    }

    async fn persist_default_payment_method(&self, customer_id: &str, subscription: &Subscription) {
        let Some(payment_method) = subscription.default_payment_method.as_ref() else {
            return;
        };
        let payment_method_id = match payment_method {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(pm) => pm.id.to_string(),
        };

        let Ok(customer) = CustomerId::from_str(customer_id) else {
            return;
        };

        let mut params = UpdateCustomer::default();
        params.invoice_settings = Some(stripe::CustomerInvoiceSettings {
            default_payment_method: Some(payment_method_id.clone()),
            ..Default::default()
        });

        if let Err(e) = Customer::update(self.stripe.inner(), &customer, params).await {
            tracing::warn!(
                customer_id = %customer_id,
                payment_method_id = %payment_method_id,
                error = %e,
                "failed to set default payment method"
            );
        }
    }

    /// Resolve the ledger a subscription event belongs to: metadata first,
    /// then the customer mapping
    async fn ledger_for_subscription(
        &self,
        subscription: &Subscription,
    ) -> BillingResult<Option<Ledger>> {
        if let Some(user_id) = user_id_from_metadata(&subscription.metadata) {
            return self.ledgers.get(user_id).await;
        }
        let customer_id = expandable_customer_id(&subscription.customer);
        self.ledgers.find_by_customer(&customer_id).await
    }

    async fn ledger_for_invoice(&self, invoice: &Invoice) -> BillingResult<Option<Ledger>> {
        let Some(customer) = invoice.customer.as_ref() else {
            return Ok(None);
        };
        self.ledgers
            .find_by_customer(&expandable_customer_id(customer))
            .await
    }
}

/// Manually verify a Stripe signature header against a payload.
///
/// Header format: `t=<unix>,v1=<hex hmac>,...`; the signed payload is
/// `<t>.<body>` keyed by the webhook secret minus its `whsec_` prefix.
fn check_signature_at(
    payload: &str,
    signature: &str,
    webhook_secret: &str,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

    // 5 minute replay tolerance
    if (now - timestamp).abs() > 300 {
        tracing::error!(timestamp, now, "webhook timestamp outside tolerance");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{timestamp}.{payload}");

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::error!("webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Decide which lifecycle notification (if any) a status transition emits.
///
/// At most one of {trial_started, subscription_activated} fires per
/// transition, and an activation arriving within the creation dedup window
/// is the tail of the same signup and stays silent.
pub(crate) fn decide_notification(
    prev: Option<AccessStatus>,
    new: AccessStatus,
    subscription_created: i64,
    now: i64,
) -> Option<&'static str> {
    if prev == Some(new) {
        return None;
    }
    match new {
        AccessStatus::Trialing => Some("trial_started"),
        AccessStatus::Active => {
            if prev == Some(AccessStatus::Trialing)
                && now - subscription_created < ACTIVATION_DEDUP_SECS
            {
                None
            } else {
                Some("subscription_activated")
            }
        }
        _ => None,
    }
}

/// Only a period rollover counts as a renewal; creations, updates, and
/// manual invoices do not re-notify
pub(crate) fn is_renewal(billing_reason: Option<InvoiceBillingReason>) -> bool {
    billing_reason == Some(InvoiceBillingReason::SubscriptionCycle)
}

fn user_id_from_metadata(metadata: &HashMap<String, String>) -> Option<Uuid> {
    metadata
        .get("user_id")
        .and_then(|id| Uuid::parse_str(id).ok())
}

fn expandable_customer_id(customer: &Expandable<Customer>) -> String {
    match customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(c) => c.id.to_string(),
    }
}

fn expandable_subscription_id(subscription: &Expandable<Subscription>) -> String {
    match subscription {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(s) => s.id.to_string(),
    }
}

fn extract_subscription(event: Event) -> BillingResult<Subscription> {
    match event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Subscription".to_string(),
        )),
    }
}

fn extract_invoice(event: Event) -> BillingResult<Invoice> {
    match event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Invoice".to_string(),
        )),
    }
}

fn extract_customer(event: Event) -> BillingResult<Customer> {
    match event.data.object {
        EventObject::Customer(customer) => Ok(customer),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Customer".to_string(),
        )),
    }
}

fn extract_checkout_session(event: Event) -> BillingResult<CheckoutSession> {
    match event.data.object {
        EventObject::CheckoutSession(session) => Ok(session),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected CheckoutSession".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("t={timestamp},v1={sig}")
    }

    #[test]
    fn valid_signature_passes() {
        let payload = r#"{"id":"evt_1","type":"invoice.paid"}"#;
        let secret = "whsec_test_signing_key";
        let now = 1_700_000_000;
        let header = sign(payload, secret, now);
        assert!(check_signature_at(payload, &header, secret, now).is_ok());
    }

    #[test]
    fn tampered_payload_fails() {
        let secret = "whsec_test_signing_key";
        let now = 1_700_000_000;
        let header = sign(r#"{"amount":100}"#, secret, now);
        let result = check_signature_at(r#"{"amount":99900}"#, &header, secret, now);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn stale_timestamp_fails() {
        let payload = "{}";
        let secret = "whsec_test_signing_key";
        let sent = 1_700_000_000;
        let header = sign(payload, secret, sent);
        // 301 seconds later is outside the tolerance window
        let result = check_signature_at(payload, &header, secret, sent + 301);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
        assert!(check_signature_at(payload, &header, secret, sent + 299).is_ok());
    }

    #[test]
    fn malformed_header_fails() {
        let result = check_signature_at("{}", "v1=deadbeef", "whsec_x", 0);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
        let result = check_signature_at("{}", "t=123", "whsec_x", 123);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn trial_start_notifies_once() {
        assert_eq!(
            decide_notification(None, AccessStatus::Trialing, 0, 1000),
            Some("trial_started")
        );
        // Re-delivered event with the same status is silent
        assert_eq!(
            decide_notification(Some(AccessStatus::Trialing), AccessStatus::Trialing, 0, 1000),
            None
        );
    }

    #[test]
    fn activation_notifies_unless_fresh_trial_flip() {
        // Direct signup without trial
        assert_eq!(
            decide_notification(None, AccessStatus::Active, 0, 1000),
            Some("subscription_activated")
        );
        // Trial converted after a real trial period
        assert_eq!(
            decide_notification(Some(AccessStatus::Trialing), AccessStatus::Active, 0, 1000),
            Some("subscription_activated")
        );
        // Trial flipped to active seconds after creation: signup tail, silent
        assert_eq!(
            decide_notification(Some(AccessStatus::Trialing), AccessStatus::Active, 950, 1000),
            None
        );
    }

    #[test]
    fn delinquent_transitions_stay_silent() {
        assert_eq!(
            decide_notification(Some(AccessStatus::Active), AccessStatus::PastDue, 0, 1000),
            None
        );
        assert_eq!(
            decide_notification(Some(AccessStatus::Active), AccessStatus::Canceled, 0, 1000),
            None
        );
    }

    #[test]
    fn only_cycle_invoices_are_renewals() {
        assert!(is_renewal(Some(InvoiceBillingReason::SubscriptionCycle)));
        assert!(!is_renewal(Some(InvoiceBillingReason::SubscriptionCreate)));
        assert!(!is_renewal(Some(InvoiceBillingReason::Manual)));
        assert!(!is_renewal(None));
    }
}
