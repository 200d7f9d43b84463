//! User ledger persistence
//!
//! One row per account. All mutations are single-statement conditional
//! UPDATEs so concurrent writers cannot interleave inside a check.

use reelkit_shared::{AccessStatus, UsageKind};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A user's billing ledger row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Ledger {
    pub user_id: Uuid,
    pub stripe_customer_id: Option<String>,
    pub email: Option<String>,
    pub trial_credit_cents: i64,
    pub trial_credit_granted: bool,
    pub trial_used: bool,
    pub pending_local_cents: i64,
    pub pending_reset_at: Option<OffsetDateTime>,
    pub billing_blocked: bool,
    pub billing_blocked_reason: Option<String>,
    pub past_due_cents: i64,
    pub script_count: i64,
    pub voice_count: i64,
    pub lipsync_count: i64,
    pub edit_count: i64,
    pub access_subscription_id: Option<String>,
    pub access_plan: Option<String>,
    pub access_status: Option<AccessStatus>,
    pub access_renewal_at: Option<OffsetDateTime>,
    pub usage_subscription_id: Option<String>,
    pub last_payment_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

/// Ledger store backed by Postgres
#[derive(Clone)]
pub struct LedgerStore {
    pool: PgPool,
}

impl LedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch a ledger by user ID
    pub async fn get(&self, user_id: Uuid) -> BillingResult<Option<Ledger>> {
        let ledger = sqlx::query_as::<_, Ledger>("SELECT * FROM user_ledgers WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(ledger)
    }

    /// Fetch a ledger by user ID, erroring when absent
    pub async fn get_required(&self, user_id: Uuid) -> BillingResult<Ledger> {
        self.get(user_id)
            .await?
            .ok_or(BillingError::LedgerNotFound(user_id))
    }

    /// Fetch a ledger by Stripe customer ID
    pub async fn find_by_customer(&self, customer_id: &str) -> BillingResult<Option<Ledger>> {
        let ledger = sqlx::query_as::<_, Ledger>(
            "SELECT * FROM user_ledgers WHERE stripe_customer_id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(ledger)
    }

    /// Create or refresh the payer mapping for a user.
    ///
    /// Idempotent: re-delivered customer events overwrite with the same
    /// values. Used by `customer.created`/`customer.updated` keyed on the
    /// customer's `metadata.user_id`.
    pub async fn upsert_payer(
        &self,
        user_id: Uuid,
        customer_id: &str,
        email: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_ledgers (user_id, stripe_customer_id, email)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
            SET stripe_customer_id = EXCLUDED.stripe_customer_id,
                email = COALESCE(EXCLUDED.email, user_ledgers.email),
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .bind(email)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bind the customer and access subscription captured at checkout
    pub async fn bind_checkout(
        &self,
        user_id: Uuid,
        customer_id: &str,
        subscription_id: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_ledgers (user_id, stripe_customer_id, access_subscription_id, trial_used)
            VALUES ($1, $2, $3, TRUE)
            ON CONFLICT (user_id) DO UPDATE
            SET stripe_customer_id = EXCLUDED.stripe_customer_id,
                access_subscription_id = COALESCE(EXCLUDED.access_subscription_id, user_ledgers.access_subscription_id),
                trial_used = TRUE,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record the usage subscription ID after provisioning
    pub async fn set_usage_subscription(
        &self,
        user_id: Uuid,
        subscription_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE user_ledgers SET usage_subscription_id = $2, updated_at = NOW() WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Seed the one-time trial credit.
    ///
    /// The `trial_credit_granted` guard makes this a no-op on every call
    /// after the first; returns whether the seed actually happened.
    pub async fn seed_trial_credit(&self, user_id: Uuid, cents: i64) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE user_ledgers
            SET trial_credit_cents = $2,
                trial_credit_granted = TRUE,
                updated_at = NOW()
            WHERE user_id = $1 AND trial_credit_granted = FALSE
            "#,
        )
        .bind(user_id)
        .bind(cents)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomically decrement trial credit.
    ///
    /// Fails (returns false) rather than going negative when a concurrent
    /// call spent the credit first.
    pub async fn debit_trial_credit(&self, user_id: Uuid, cents: i64) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE user_ledgers
            SET trial_credit_cents = trial_credit_cents - $2,
                updated_at = NOW()
            WHERE user_id = $1 AND trial_credit_cents >= $2
            "#,
        )
        .bind(user_id)
        .bind(cents)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Add metered spend to the unbilled pending figure
    pub async fn add_pending(&self, user_id: Uuid, cents: i64) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE user_ledgers
            SET pending_local_cents = pending_local_cents + $2,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(cents)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Zero the pending figure for a newly paid invoice period.
    ///
    /// Keyed on the invoice `period_end`, not the invoice ID: a re-delivered
    /// `invoice.paid` carries the same period and becomes a no-op.
    pub async fn reset_pending_for_period(
        &self,
        user_id: Uuid,
        period_end: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE user_ledgers
            SET pending_local_cents = 0,
                pending_reset_at = $2,
                updated_at = NOW()
            WHERE user_id = $1
              AND (pending_reset_at IS NULL OR pending_reset_at < $2)
            "#,
        )
        .bind(user_id)
        .bind(period_end)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Bump the lifetime counter for a usage kind
    pub async fn bump_counter(
        &self,
        user_id: Uuid,
        kind: UsageKind,
        quantity: i64,
    ) -> BillingResult<()> {
        // counter_column() returns a static identifier, never user input
        let column = kind.counter_column();
        let sql = format!(
            "UPDATE user_ledgers SET {column} = {column} + $2, updated_at = NOW() WHERE user_id = $1"
        );
        sqlx::query(&sql)
            .bind(user_id)
            .bind(quantity)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mirror the access subscription's plan, status, and renewal time
    pub async fn mirror_subscription(
        &self,
        user_id: Uuid,
        subscription_id: &str,
        plan: Option<&str>,
        status: AccessStatus,
        renewal_at: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE user_ledgers
            SET access_subscription_id = $2,
                access_plan = COALESCE($3, access_plan),
                access_status = $4,
                access_renewal_at = COALESCE($5, access_renewal_at),
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(subscription_id)
        .bind(plan)
        .bind(status)
        .bind(renewal_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Block billing with a reason
    pub async fn set_block(&self, user_id: Uuid, reason: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE user_ledgers
            SET billing_blocked = TRUE,
                billing_blocked_reason = $2,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Clear any billing block
    pub async fn clear_block(&self, user_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE user_ledgers
            SET billing_blocked = FALSE,
                billing_blocked_reason = NULL,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed invoice payment: block and remember the amount owed
    pub async fn record_payment_failure(
        &self,
        user_id: Uuid,
        amount_due_cents: i64,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE user_ledgers
            SET billing_blocked = TRUE,
                billing_blocked_reason = 'payment_failed',
                past_due_cents = $2,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(amount_due_cents)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a successful payment: stamp the time, clear block and arrears
    pub async fn record_payment(
        &self,
        user_id: Uuid,
        paid_at: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE user_ledgers
            SET last_payment_at = $2,
                billing_blocked = FALSE,
                billing_blocked_reason = NULL,
                past_due_cents = 0,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(paid_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append a webhook event to the audit log.
    ///
    /// Informational only; duplicate deliveries are dropped by the unique
    /// constraint and reconciliation stays idempotent on its own keys.
    pub async fn record_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        outcome: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stripe_webhook_events (stripe_event_id, event_type, outcome)
            VALUES ($1, $2, $3)
            ON CONFLICT (stripe_event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(outcome)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    async fn store() -> LedgerStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .expect("Failed to connect");
        LedgerStore::new(pool)
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn pending_reset_is_idempotent_per_period() {
        let store = store().await;
        let user = Uuid::new_v4();
        store
            .upsert_payer(user, &format!("cus_{user}"), None)
            .await
            .unwrap();

        store.add_pending(user, 1200).await.unwrap();
        let period_end = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        assert!(store
            .reset_pending_for_period(user, period_end)
            .await
            .unwrap());

        // A re-delivered invoice with the same period_end is a no-op and
        // must not clobber spend accrued since the reset
        store.add_pending(user, 300).await.unwrap();
        assert!(!store
            .reset_pending_for_period(user, period_end)
            .await
            .unwrap());
        let ledger = store.get_required(user).await.unwrap();
        assert_eq!(ledger.pending_local_cents, 300);
        assert_eq!(ledger.pending_reset_at, Some(period_end));

        // A newer period resets again
        let next_period = period_end + time::Duration::days(30);
        assert!(store
            .reset_pending_for_period(user, next_period)
            .await
            .unwrap());
        let ledger = store.get_required(user).await.unwrap();
        assert_eq!(ledger.pending_local_cents, 0);
        assert_eq!(ledger.pending_reset_at, Some(next_period));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn payment_failure_blocks_with_amount_and_payment_clears() {
        let store = store().await;
        let user = Uuid::new_v4();
        store
            .upsert_payer(user, &format!("cus_{user}"), None)
            .await
            .unwrap();

        store.record_payment_failure(user, 2500).await.unwrap();
        let ledger = store.get_required(user).await.unwrap();
        assert!(ledger.billing_blocked);
        assert_eq!(
            ledger.billing_blocked_reason.as_deref(),
            Some("payment_failed")
        );
        assert_eq!(ledger.past_due_cents, 2500);

        store
            .record_payment(user, OffsetDateTime::now_utc())
            .await
            .unwrap();
        let ledger = store.get_required(user).await.unwrap();
        assert!(!ledger.billing_blocked);
        assert_eq!(ledger.billing_blocked_reason, None);
        assert_eq!(ledger.past_due_cents, 0);
        assert!(ledger.last_payment_at.is_some());
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn trial_credit_seeds_once_and_never_goes_negative() {
        let store = store().await;
        let user = Uuid::new_v4();
        store
            .upsert_payer(user, &format!("cus_{user}"), None)
            .await
            .unwrap();

        assert!(store.seed_trial_credit(user, 500).await.unwrap());
        assert!(!store.seed_trial_credit(user, 500).await.unwrap());

        assert!(store.debit_trial_credit(user, 300).await.unwrap());
        // Only 200 left; an oversized debit must fail rather than go negative
        assert!(!store.debit_trial_credit(user, 300).await.unwrap());
        let ledger = store.get_required(user).await.unwrap();
        assert_eq!(ledger.trial_credit_cents, 200);
    }
}
