//! Usage accounting core
//!
//! Splits each usage call into a trial-credited part and a metered paid
//! part, enforces the daily soft cap on unbilled spend, and reports the paid
//! part to Stripe's billing meter.
//!
//! The steps are deliberately not transactional: Stripe's records are
//! authoritative and the local pending figure is a cap heuristic, so a crash
//! mid-sequence can only under-count locally, never double-bill.

use std::str::FromStr;

use reelkit_shared::{AccessStatus, UsageKind};
use serde::Serialize;
use stripe::{Invoice, ListInvoices, Subscription, SubscriptionId, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{Ledger, LedgerStore};
use crate::meter::MeterSink;
use crate::pricing::PriceResolver;
use crate::provision::UsageProvisioner;

/// Result of a successful usage charge
#[derive(Debug, Clone, Serialize)]
pub struct UsageOutcome {
    pub kind: UsageKind,
    pub quantity: i64,
    pub unit_cents: i64,
    /// Cents covered by trial credit
    pub credited_cents: i64,
    /// Cents reported to the meter for invoicing
    pub charged_cents: i64,
    pub free_qty: i64,
    pub paid_qty: i64,
    /// Meter event identifier, absent when the call was fully credited
    pub usage_event_id: Option<String>,
    pub cap_cents: i64,
}

/// The usage accounting service
pub struct UsageAccountant<M: MeterSink> {
    stripe: StripeClient,
    ledgers: LedgerStore,
    prices: PriceResolver,
    provisioner: UsageProvisioner,
    meter: M,
}

impl<M: MeterSink> UsageAccountant<M> {
    pub fn new(
        stripe: StripeClient,
        ledgers: LedgerStore,
        prices: PriceResolver,
        provisioner: UsageProvisioner,
        meter: M,
    ) -> Self {
        Self {
            stripe,
            ledgers,
            prices,
            provisioner,
            meter,
        }
    }

    /// Charge `quantity` units of `kind` to a user.
    ///
    /// `idem_token` makes retries safe: the meter identifier derived from it
    /// dedupes the paid portion on Stripe's side.
    pub async fn charge(
        &self,
        user_id: Uuid,
        kind: UsageKind,
        quantity: i64,
        idem_token: &str,
    ) -> BillingResult<UsageOutcome> {
        if quantity <= 0 {
            return Err(BillingError::InvalidQuantity(quantity));
        }

        let ledger = self.ledgers.get_required(user_id).await?;
        let customer_id = ledger
            .stripe_customer_id
            .clone()
            .ok_or(BillingError::NoPayerOnFile(user_id))?;

        let access = self.verify_access(&ledger).await?;

        let kind_pricing = self.stripe.config().pricing.for_kind(kind).clone();
        let unit_cents = self
            .prices
            .unit_cents(&self.stripe, &kind_pricing.price_id)
            .await?;

        let usage_subscription_id = self
            .provisioner
            .ensure_usage_subscription(user_id, &customer_id)
            .await?;

        let mut pending_cents = ledger.pending_local_cents;
        if self
            .maybe_reset_pending(&ledger, &usage_subscription_id)
            .await?
        {
            pending_cents = 0;
        }

        let mut credit_cents = ledger.trial_credit_cents;
        if access == AccessStatus::Trialing && !ledger.trial_credit_granted {
            let seed = self.stripe.config().trial_credit_cents;
            if self.ledgers.seed_trial_credit(user_id, seed).await? {
                credit_cents = seed;
                tracing::info!(user_id = %user_id, cents = seed, "seeded trial credit");
            }
        }

        let (mut free_qty, mut paid_qty) = split_quantity(quantity, credit_cents, unit_cents);
        let mut charged_cents = charge_cents(quantity, paid_qty, unit_cents)?;

        let cap_cents = self.stripe.config().daily_cap_cents;
        check_cap(pending_cents, charged_cents, cap_cents)?;

        if free_qty > 0 {
            let debit = free_qty * unit_cents;
            if !self.ledgers.debit_trial_credit(user_id, debit).await? {
                // A concurrent call spent the credit first; bill the lot
                free_qty = 0;
                paid_qty = quantity;
                charged_cents = charge_cents(quantity, paid_qty, unit_cents)?;
                check_cap(pending_cents, charged_cents, cap_cents)?;
            }
        }

        let mut usage_event_id = None;
        if paid_qty > 0 {
            let identifier = meter_identifier(user_id, kind, idem_token);
            let event_id = self
                .meter
                .record(&kind_pricing.meter_event, &customer_id, paid_qty, &identifier)
                .await?;
            self.ledgers.add_pending(user_id, charged_cents).await?;
            usage_event_id = Some(event_id.0);
        }

        self.ledgers.bump_counter(user_id, kind, quantity).await?;

        tracing::info!(
            user_id = %user_id,
            kind = %kind,
            quantity,
            free_qty,
            paid_qty,
            charged_cents,
            "charged usage"
        );

        Ok(UsageOutcome {
            kind,
            quantity,
            unit_cents,
            credited_cents: free_qty * unit_cents,
            charged_cents,
            free_qty,
            paid_qty,
            usage_event_id,
            cap_cents,
        })
    }

    /// Check the access subscription is active or trialing.
    ///
    /// Verified live against Stripe; when the lookup fails the locally
    /// mirrored status decides, so a Stripe outage degrades rather than
    /// hard-failing every usage call.
    async fn verify_access(&self, ledger: &Ledger) -> BillingResult<AccessStatus> {
        let subscription_id = ledger
            .access_subscription_id
            .as_deref()
            .ok_or_else(|| BillingError::SubscriptionInvalid("no access subscription".into()))?;

        let status = match self.live_status(subscription_id).await {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    error = %err,
                    "live subscription lookup failed, using mirrored status"
                );
                ledger.access_status.unwrap_or(AccessStatus::Unknown)
            }
        };

        if !status.is_usable() {
            return Err(BillingError::SubscriptionInvalid(format!(
                "access subscription is {status}"
            )));
        }
        Ok(status)
    }

    async fn live_status(&self, subscription_id: &str) -> BillingResult<AccessStatus> {
        let id = SubscriptionId::from_str(subscription_id)
            .map_err(|_| BillingError::Internal("bad subscription id".to_string()))?;
        let subscription = Subscription::retrieve(self.stripe.inner(), &id, &[]).await?;
        Ok(access_status_from(subscription.status))
    }

    /// Zero the pending figure when the newest paid usage invoice covers a
    /// period we have not yet reset for. Keyed on `period_end`, so a second
    /// look at the same invoice is a no-op.
    async fn maybe_reset_pending(
        &self,
        ledger: &Ledger,
        usage_subscription_id: &str,
    ) -> BillingResult<bool> {
        let subscription_id = match SubscriptionId::from_str(usage_subscription_id) {
            Ok(id) => id,
            Err(_) => return Ok(false),
        };

        let mut params = ListInvoices::new();
        params.subscription = Some(subscription_id);
        params.status = Some(stripe::InvoiceStatus::Paid);
        params.limit = Some(1);

        let invoices = Invoice::list(self.stripe.inner(), &params).await?;
        let Some(invoice) = invoices.data.first() else {
            return Ok(false);
        };
        let Some(period_end) = invoice.period_end else {
            return Ok(false);
        };
        let period_end = OffsetDateTime::from_unix_timestamp(period_end)
            .map_err(|e| BillingError::Internal(e.to_string()))?;

        if let Some(marker) = ledger.pending_reset_at {
            if period_end <= marker {
                return Ok(false);
            }
        }

        let reset = self
            .ledgers
            .reset_pending_for_period(ledger.user_id, period_end)
            .await?;
        if reset {
            tracing::info!(
                user_id = %ledger.user_id,
                period_end = %period_end,
                "reset pending spend for paid invoice period"
            );
        }
        Ok(reset)
    }
}

/// Split a quantity into trial-credited and paid units.
///
/// Credit covers whole units only; a remainder smaller than one unit stays
/// on the ledger for a later call.
pub(crate) fn split_quantity(quantity: i64, credit_cents: i64, unit_cents: i64) -> (i64, i64) {
    let coverable = if unit_cents > 0 {
        credit_cents / unit_cents
    } else {
        0
    };
    let free_qty = quantity.min(coverable.max(0));
    (free_qty, quantity - free_qty)
}

/// Chargeable cents for the paid portion.
///
/// The multiplication is checked: a quantity large enough to wrap i64 would
/// otherwise produce a negative charge and slip under the cap, so it is
/// rejected as an invalid quantity before the cap check.
pub(crate) fn charge_cents(
    quantity: i64,
    paid_qty: i64,
    unit_cents: i64,
) -> BillingResult<i64> {
    paid_qty
        .checked_mul(unit_cents)
        .ok_or(BillingError::InvalidQuantity(quantity))
}

/// Reject a charge that would push unbilled spend past the cap.
///
/// Rejection is all-or-nothing and happens before any mutation: a rejected
/// call leaves no meter event, no credit debit, and no counter bump.
pub(crate) fn check_cap(
    pending_cents: i64,
    charge_cents: i64,
    cap_cents: i64,
) -> BillingResult<()> {
    if pending_cents >= cap_cents || pending_cents + charge_cents > cap_cents {
        return Err(BillingError::CapExceeded {
            pending_cents,
            cap_cents,
            remaining_cents: (cap_cents - pending_cents).max(0),
        });
    }
    Ok(())
}

/// Meter identifier for a charge, stable across retries of the same call
pub(crate) fn meter_identifier(user_id: Uuid, kind: UsageKind, token: &str) -> String {
    format!("{user_id}:{kind}:{token}")
}

fn access_status_from(status: SubscriptionStatus) -> AccessStatus {
    match status {
        SubscriptionStatus::Trialing => AccessStatus::Trialing,
        SubscriptionStatus::Active => AccessStatus::Active,
        SubscriptionStatus::PastDue => AccessStatus::PastDue,
        SubscriptionStatus::Canceled => AccessStatus::Canceled,
        SubscriptionStatus::Unpaid => AccessStatus::Unpaid,
        SubscriptionStatus::Incomplete => AccessStatus::Incomplete,
        SubscriptionStatus::IncompleteExpired => AccessStatus::IncompleteExpired,
        SubscriptionStatus::Paused => AccessStatus::Paused,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn split_covers_whole_units_only() {
        // $5.00 credit, 40c units: credit covers 12 units, 20c remainder stays
        assert_eq!(split_quantity(20, 500, 40), (12, 8));
        assert_eq!(split_quantity(5, 500, 40), (5, 0));
        assert_eq!(split_quantity(13, 500, 40), (12, 1));
        // $5.00 credit at $1.00 units covers three whole units for free
        assert_eq!(split_quantity(3, 500, 100), (3, 0));
    }

    #[test]
    fn split_with_no_credit_is_fully_paid() {
        assert_eq!(split_quantity(10, 0, 40), (0, 10));
        assert_eq!(split_quantity(10, 39, 40), (0, 10));
    }

    #[test]
    fn split_sums_to_quantity() {
        for (q, c, u) in [(1, 0, 40), (100, 500, 40), (7, 10_000, 95), (3, 120, 40)] {
            let (free, paid) = split_quantity(q, c, u);
            assert_eq!(free + paid, q);
            assert!(free >= 0 && paid >= 0);
            assert!(free * u <= c || free == 0);
        }
    }

    // Trial user with $5.00 credit buys 20 script units at 40c: 12 free,
    // 8 paid, $3.20 metered.
    #[test]
    fn trial_credit_split() {
        let (free, paid) = split_quantity(20, 500, 40);
        assert_eq!((free, paid), (12, 8));
        assert_eq!(paid * 40, 320);
        assert_eq!(free * 40, 480);
    }

    #[test]
    fn cap_rejects_before_any_spend() {
        // $149.60 pending against a $150.00 cap: a 95c unit must bounce
        let err = check_cap(14_960, 95, 15_000).unwrap_err();
        match err {
            BillingError::CapExceeded {
                pending_cents,
                cap_cents,
                remaining_cents,
            } => {
                assert_eq!(pending_cents, 14_960);
                assert_eq!(cap_cents, 15_000);
                assert_eq!(remaining_cents, 40);
            }
            other => panic!("expected CapExceeded, got {other:?}"),
        }
    }

    #[test]
    fn cap_rejection_reports_headroom() {
        // $149.50 pending, $1.00 unit: one more unit would overshoot by 50c
        let err = check_cap(14_950, 100, 15_000).unwrap_err();
        match err {
            BillingError::CapExceeded { remaining_cents, .. } => {
                assert_eq!(remaining_cents, 50)
            }
            other => panic!("expected CapExceeded, got {other:?}"),
        }
    }

    #[test]
    fn cap_allows_exact_fill() {
        assert!(check_cap(14_960, 40, 15_000).is_ok());
        assert!(check_cap(0, 15_000, 15_000).is_ok());
    }

    #[test]
    fn cap_rejects_when_already_at_cap() {
        let err = check_cap(15_000, 0, 15_000).unwrap_err();
        match err {
            BillingError::CapExceeded { remaining_cents, .. } => {
                assert_eq!(remaining_cents, 0)
            }
            other => panic!("expected CapExceeded, got {other:?}"),
        }
        // Over-cap pending never reports negative headroom
        let err = check_cap(15_100, 40, 15_000).unwrap_err();
        match err {
            BillingError::CapExceeded { remaining_cents, .. } => {
                assert_eq!(remaining_cents, 0)
            }
            other => panic!("expected CapExceeded, got {other:?}"),
        }
    }

    #[test]
    fn charge_is_checked_multiplication() {
        assert_eq!(charge_cents(20, 8, 40).unwrap(), 320);
        assert_eq!(charge_cents(3, 0, 100).unwrap(), 0);
    }

    #[test]
    fn oversized_quantity_cannot_wrap_past_the_cap() {
        // Large enough that paid * unit wraps i64 negative; a wrapped charge
        // would pass the cap check, so the multiplication must reject first
        let quantity = i64::MAX / 50;
        let (free, paid) = split_quantity(quantity, 0, 100);
        assert_eq!(free, 0);
        assert!(check_cap(14_000, paid.wrapping_mul(100), 15_000).is_ok());

        let err = charge_cents(quantity, paid, 100).unwrap_err();
        assert!(matches!(err, BillingError::InvalidQuantity(q) if q == quantity));
    }

    #[test]
    fn meter_identifier_is_stable_per_token() {
        let user = Uuid::nil();
        let a = meter_identifier(user, UsageKind::Voice, "tok-1");
        let b = meter_identifier(user, UsageKind::Voice, "tok-1");
        assert_eq!(a, b);
        assert_eq!(a, format!("{user}:voice:tok-1"));
        assert_ne!(a, meter_identifier(user, UsageKind::Voice, "tok-2"));
        assert_ne!(a, meter_identifier(user, UsageKind::Edit, "tok-1"));
    }
}
