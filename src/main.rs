use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

mod api;
mod error;
mod functions;
mod schema;
mod services;

use services::{HttpPairingWebhook, PairingWebhook, DEFAULT_TIMEOUT};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    let create_url =
        std::env::var("WEBHOOK_CREATE_URL").context("WEBHOOK_CREATE_URL not set")?;
    let qr_url = std::env::var("WEBHOOK_QR_URL").context("WEBHOOK_QR_URL not set")?;
    let timeout = std::env::var("WEBHOOK_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TIMEOUT);
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:4000".to_string());

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("failed to connect to postgres")?;
    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .context("failed to run migrations")?;

    let webhook: Arc<dyn PairingWebhook> =
        Arc::new(HttpPairingWebhook::new(create_url, qr_url, timeout)?);
    let state = Arc::new(api::AppState { db, webhook });

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "waplink listening");
    axum::serve(listener, api::router(state)).await?;

    Ok(())
}
