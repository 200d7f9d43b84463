//! Unit price resolution with an in-process cache
//!
//! Prices are fetched from Stripe once per process and cached by price ID
//! with no expiry. Price changes roll out on redeploy; instances that raced
//! a change may disagree until then, which is acceptable for a soft cap.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;

use stripe::PriceId;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Read-through cache of per-unit prices in cents, keyed by price ID
pub struct PriceResolver {
    cache: RwLock<HashMap<String, i64>>,
}

impl PriceResolver {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the per-unit amount in cents for a price
    pub async fn unit_cents(&self, stripe: &StripeClient, price_id: &str) -> BillingResult<i64> {
        if let Some(cents) = self.cached(price_id) {
            return Ok(cents);
        }

        let id = PriceId::from_str(price_id)
            .map_err(|_| BillingError::MissingPrice(price_id.to_string()))?;
        let price = stripe::Price::retrieve(stripe.inner(), &id, &[]).await?;

        let cents = price
            .unit_amount
            .filter(|c| *c > 0)
            .ok_or_else(|| BillingError::PriceUnusable(price_id.to_string()))?;

        self.insert(price_id, cents);
        tracing::debug!(price_id = %price_id, unit_cents = cents, "cached unit price");
        Ok(cents)
    }

    fn cached(&self, price_id: &str) -> Option<i64> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.get(price_id).copied()
    }

    fn insert(&self, price_id: &str, cents: i64) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(price_id.to_string(), cents);
    }
}

impl Default for PriceResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hit_skips_lookup() {
        let resolver = PriceResolver::new();
        assert_eq!(resolver.cached("price_123"), None);
        resolver.insert("price_123", 40);
        assert_eq!(resolver.cached("price_123"), Some(40));
    }

    #[test]
    fn cache_is_keyed_per_price() {
        let resolver = PriceResolver::new();
        resolver.insert("price_a", 40);
        resolver.insert("price_b", 95);
        assert_eq!(resolver.cached("price_a"), Some(40));
        assert_eq!(resolver.cached("price_b"), Some(95));
        assert_eq!(resolver.cached("price_c"), None);
    }
}
