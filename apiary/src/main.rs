use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use apiary::api::{self, AppState};
use apiary::broker::AmqpBroker;
use apiary::config::AppConfig;
use apiary::handler::JsonLogHandler;
use apiary::manager::{TenantManager, TenantManagerConfig};
use apiary::store::{PostgresStore, TenantStore};
use apiary::{metrics, MessageBroker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.store.max_connections)
        .connect(&config.store.url)
        .await
        .context("failed to connect to store")?;
    let store = Arc::new(PostgresStore::new(pool));
    store
        .bootstrap()
        .await
        .context("failed to bootstrap store schema")?;

    let broker = Arc::new(
        AmqpBroker::connect(&config.broker.url)
            .await
            .context("failed to connect to broker")?,
    );

    metrics::init_metrics().context("failed to register metrics")?;

    let manager = Arc::new(TenantManager::new(
        store.clone(),
        broker.clone(),
        Arc::new(JsonLogHandler),
        TenantManagerConfig {
            default_workers: config.workers,
            shutdown_timeout: config.shutdown_timeout(),
        },
    ));
    manager
        .recover()
        .await
        .context("failed to recover tenants")?;

    let app = api::router(AppState {
        manager: manager.clone(),
        store,
    });

    let listener = tokio::net::TcpListener::bind(&config.http.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http.addr))?;
    tracing::info!("listening on {}", config.http.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shutting down");
    manager.shutdown().await;
    if let Err(err) = broker.close().await {
        tracing::warn!("failed to close broker connection: {err}");
    }

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
