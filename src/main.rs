mod auth;
mod broker;
mod config;
mod entities;
mod http;
mod ledger;
mod models;
mod notifier;
mod payload;
mod purchase;
mod security;
mod state;
mod wallet;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use migration::MigratorTrait;
use sea_orm::ConnectOptions;
use sea_orm::Database;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::auth::WebAppAuthenticator;
use crate::broker::{BrokerApi, BrokerClient};
use crate::config::ApiConfig;
use crate::ledger::LedgerStore;
use crate::notifier::TelegramNotifier;
use crate::purchase::PurchaseService;
use crate::security::rate_limit::RateLimiter;
use crate::state::{ApiCache, AppState};
use crate::wallet::TransactionSubmitter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = ApiConfig::load().context("Failed to load configuration")?;
    let database = connect_database(&config).await?;
    run_migrations(&database).await?;

    let broker: Arc<dyn BrokerApi> = Arc::new(
        BrokerClient::new(&config.broker).context("Failed to initialize broker client")?,
    );
    // The wallet session itself opens lazily on the first submission.
    let submitter = Arc::new(TransactionSubmitter::new(config.wallet.clone()));
    let ledger = LedgerStore::new(database.clone());
    let limiter = Arc::new(RateLimiter::new());
    let cache = Arc::new(ApiCache::new(&config.cache));

    let authenticator = config
        .auth
        .bot_token
        .as_deref()
        .filter(|token| !token.is_empty())
        .map(WebAppAuthenticator::new);
    if authenticator.is_none() {
        warn!("Session verification disabled: no auth bot token configured");
    }

    let notifier = if config.notifications.enabled() {
        let bot_token = config
            .notifications
            .bot_token
            .as_deref()
            .expect("notifications.enabled() implies a bot token");
        let admin_chat_id = config
            .notifications
            .admin_chat_id
            .expect("notifications.enabled() implies an admin chat id");
        info!("Purchase notifications enabled (admin chat {admin_chat_id})");
        Some(Arc::new(TelegramNotifier::new(bot_token, admin_chat_id)))
    } else {
        warn!("Purchase notifications disabled: bot token or admin chat id not set");
        None
    };

    let purchases = Arc::new(PurchaseService::new(
        Arc::clone(&broker),
        Arc::clone(&submitter),
        ledger.clone(),
        Arc::clone(&limiter),
        authenticator,
        notifier,
        config.limits.clone(),
        config.rate_limiting.clone(),
        config.auth.require_init_data,
    ));

    let app_state = AppState {
        database,
        broker,
        submitter,
        purchases,
        ledger,
        limiter,
        cache,
        limits: config.limits.clone(),
        rate_limiting: config.rate_limiting.clone(),
        admin: config.admin.clone(),
        web: config.web.clone(),
        start_time: Instant::now(),
    };

    let listener = TcpListener::bind(config.server.address())
        .await
        .context("Failed to bind HTTP listener")?;
    let local_addr = listener
        .local_addr()
        .context("Failed to obtain listener address")?;
    info!("Stars API listening on {local_addr}");

    let router: Router = http::router(app_state);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server exited with error")?;

    Ok(())
}

fn init_tracing() {
    let default_filter = "info";
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());
    assert!(!filter.is_empty(), "Tracing filter must not be empty");
    assert!(filter.len() < 256, "Tracing filter length exceeds bounds");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .compact()
        .init();
}

async fn connect_database(config: &ApiConfig) -> Result<sea_orm::DatabaseConnection> {
    let mut options = ConnectOptions::new(config.database.url.clone());
    options
        .max_connections(config.database.max_connections)
        .sqlx_logging(true)
        .sqlx_logging_level(tracing::log::LevelFilter::Debug)
        .acquire_timeout(Duration::from_secs(10));

    if let Some(min) = config.database.min_connections {
        options.min_connections(min);
    }

    assert!(
        config.database.max_connections >= config.database.min_connections.unwrap_or(1),
        "Max connections must be >= min connections"
    );
    assert!(
        config.database.max_connections <= 128,
        "Connection pool oversized"
    );

    Database::connect(options)
        .await
        .context("Failed to connect to PostgreSQL")
}

async fn run_migrations(database: &sea_orm::DatabaseConnection) -> Result<()> {
    migration::Migrator::up(database, None)
        .await
        .context("Database migrations failed")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {err}");
        return;
    }
    info!("Shutdown signal received");
}
