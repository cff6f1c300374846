//! Market Ingest Binary
//!
//! Starts the streaming ingestion pipeline.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-ingest
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `INGEST_STRATEGY_ID`: strategy component of the store namespace
//! - `INGEST_USER_ID`: user component of the store namespace
//!
//! ## Optional
//! - `INGEST_ACCOUNT_TYPE`: Binance account type (default: `USD_M_FUTURE_TESTNET`)
//! - `INGEST_WS_URL`: endpoint override
//! - `INGEST_STREAMS`: comma-separated streams to subscribe at start
//! - `INGEST_HEALTH_PORT`: health and metrics port (default: 8083, 0 = disabled)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-ingest)
//! - `RUST_LOG`: Log level (default: info)
//!
//! See `IngestConfig` for the timing variables.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_ingest::infrastructure::telemetry;
use market_ingest::{
    ConnectionManager, EventDispatcher, HealthServer, HealthServerState, InMemoryOrderStore,
    IngestConfig, MessageRouter, OrderCache, TelemetryConfig, TungsteniteDialer, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let config = IngestConfig::from_env().context("invalid configuration")?;
    let _telemetry_guard = telemetry::init(&TelemetryConfig::for_ingest(&config))
        .context("failed to initialize telemetry")?;

    tracing::info!("Starting Market Ingest");
    log_config(&config);

    init_metrics().context("failed to install Prometheus recorder")?;

    let shutdown_token = CancellationToken::new();

    // Router and order cache
    let router = Arc::new(MessageRouter::new());
    let cache = Arc::new(OrderCache::new(
        config.cache_config(),
        Arc::new(InMemoryOrderStore::new()),
    ));
    cache.register_endpoints(&router)?;
    cache.start();

    // Connection manager
    let connection = ConnectionManager::new(
        config.connection(),
        Arc::new(TungsteniteDialer::new()),
        Arc::new(EventDispatcher::new(Arc::clone(&router))),
    );

    // Health server
    if config.server.health_port != 0 {
        let health_state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            connection.clone(),
            Arc::clone(&router),
            Arc::clone(&cache),
        ));
        let health_server =
            HealthServer::new(config.server.health_port, health_state, shutdown_token.clone());
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    connection.connect().await?;
    for stream in &config.stream.streams {
        if let Err(e) = connection.subscribe(stream.clone()).await {
            tracing::warn!(stream = %stream, error = %e, "Initial subscription failed");
        }
    }

    tracing::info!(
        subscriptions = connection.subscriptions().len(),
        "Market ingest ready"
    );

    await_shutdown(shutdown_token).await?;

    let shutdown = async {
        connection.close().await;
        if let Err(e) = cache.deregister_endpoints(&router) {
            tracing::warn!(error = %e, "Failed to deregister cache endpoints");
        }
        cache.shutdown().await
    };
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Final order sync failed"),
        Err(_) => tracing::error!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Graceful shutdown timed out"
        ),
    }

    tracing::info!("Market ingest stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &IngestConfig) {
    tracing::info!(
        account_type = %config.stream.account_type,
        url = %config.stream.url,
        streams = config.stream.streams.len(),
        max_reconnect_attempts = config.reconnect.max_attempts,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        namespace = %config.store_keys().prefix(),
        sync_interval_secs = config.cache.sync_interval.as_secs(),
        cleanup_interval_secs = config.cache.cleanup_interval.as_secs(),
        order_ttl_secs = config.cache.order_ttl.as_secs(),
        "Order cache settings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) -> std::io::Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let terminated = async move {
        terminate.recv().await;
    };

    #[cfg(not(unix))]
    let terminated = std::future::pending::<()>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminated => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
    Ok(())
}
