//! Donor pool ledger — entry point.
//!
//! Serves the REST API that takes billing webhooks, issues vote tokens,
//! records votes and closes cycles into payouts. When `AUTO_CLOSE_CYCLES` is
//! set, a background task closes each month once it has ended.

mod api;
mod billing;
mod config;
mod cycle;
mod db;
mod distribution;
mod errors;
mod events;
mod ingest;
mod models;
mod projects;
mod scheduler;
mod signature;
mod subscriptions;
mod tally;
mod tokens;

use std::sync::Arc;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use billing::BillingClient;
use config::Config;
use scheduler::SchedulerState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // Outbound calls to the billing processor.
    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;

    let shutdown = CancellationToken::new();

    // ─── Background scheduler ─────────────────────────────
    let scheduler = if config.auto_close_cycles {
        let state = Arc::new(SchedulerState {
            pool: pool.clone(),
            config: config.clone(),
        });
        Some(tokio::spawn(scheduler::run(state, shutdown.clone())))
    } else {
        info!("Automatic cycle closing disabled");
        None
    };

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState {
        pool: pool.clone(),
        billing: BillingClient::new(client, &config),
        config: config.clone(),
    });

    let app = api::router(api_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(handle) = scheduler {
        let _ = handle.await;
    }
    pool.close().await;

    Ok(())
}
