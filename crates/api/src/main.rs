//! Reelkit API server entry point

use reelkit_api::{auth::JwtVerifier, routes, AppState, Config};
use reelkit_billing::BillingService;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let pool = reelkit_shared::create_pool(&config.database_url).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let billing = BillingService::from_env(pool.clone())?;
    let jwt = JwtVerifier::new(&config.jwt_secret);
    let state = AppState::new(pool, billing, jwt);

    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "reelkit-api listening");
    axum::serve(listener, app).await?;

    Ok(())
}
