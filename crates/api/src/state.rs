//! Shared application state

use std::sync::Arc;

use reelkit_billing::BillingService;
use sqlx::PgPool;

use crate::auth::JwtVerifier;

/// State shared across all request handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub billing: Arc<BillingService>,
    pub jwt: JwtVerifier,
}

impl AppState {
    pub fn new(pool: PgPool, billing: BillingService, jwt: JwtVerifier) -> Self {
        Self {
            pool,
            billing: Arc::new(billing),
            jwt,
        }
    }
}
