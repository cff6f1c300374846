//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, connection status reporting, and Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (connected or not)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{CacheStats, MessageRouter, OrderCache, RouterStats};
use crate::domain::events::MarketEvent;
use crate::infrastructure::connection::{ConnectionManager, ConnectionStatus};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Stream connection.
    pub connection: ConnectionInfo,
    /// Router counters.
    pub router: RouterStats,
    /// Order cache sizes.
    pub cache: CacheStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Connected.
    Healthy,
    /// Connecting or reconnecting.
    Degraded,
    /// Disconnected.
    Unhealthy,
}

impl From<ConnectionStatus> for HealthStatus {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Connected => Self::Healthy,
            ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => Self::Degraded,
            ConnectionStatus::Disconnected => Self::Unhealthy,
        }
    }
}

/// Stream connection details.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Endpoint.
    pub url: String,
    /// Connection status.
    pub status: ConnectionStatus,
    /// Active subscriptions, in replay order.
    pub subscriptions: Vec<String>,
    /// Why automatic reconnection gave up, if it has.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_error: Option<String>,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    connection: ConnectionManager,
    router: Arc<MessageRouter<MarketEvent>>,
    cache: Arc<OrderCache>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        connection: ConnectionManager,
        router: Arc<MessageRouter<MarketEvent>>,
        cache: Arc<OrderCache>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            connection,
            router,
            cache,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.connection.status() == ConnectionStatus::Connected {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let connection = &state.connection;
    let status = connection.status();

    HealthResponse {
        status: status.into(),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        connection: ConnectionInfo {
            url: connection.url().to_string(),
            status,
            subscriptions: connection
                .subscriptions()
                .iter()
                .map(ToString::to_string)
                .collect(),
            terminal_error: connection.terminal_error().map(|e| e.to_string()),
        },
        router: state.router.stats(),
        cache: state.cache.stats(),
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::{
        Dialer, HandlerError, StoreKeys, Transport, TransportError,
    };
    use crate::application::services::CacheConfig;
    use crate::domain::order::{OrderStatus, fixtures::order};
    use crate::infrastructure::connection::ConnectionConfig;
    use crate::infrastructure::store::InMemoryOrderStore;

    struct Unreachable;

    #[async_trait]
    impl Dialer for Unreachable {
        async fn dial(&self, _url: &str) -> Result<Transport, TransportError> {
            Err(TransportError::Dial("unreachable".into()))
        }
    }

    fn state() -> Arc<HealthServerState> {
        let handler = Arc::new(|_event: MarketEvent| Ok::<(), HandlerError>(()));
        let connection = ConnectionManager::new(
            ConnectionConfig::new("ws://127.0.0.1:1/ws"),
            Arc::new(Unreachable),
            handler,
        );
        let cache = Arc::new(OrderCache::new(
            CacheConfig::new(StoreKeys::new("s", "u", "SPOT")),
            Arc::new(InMemoryOrderStore::new()),
        ));
        cache.order_initialized(order("1", "BTCUSDT", OrderStatus::Accepted));

        Arc::new(HealthServerState::new(
            "test".into(),
            connection,
            Arc::new(MessageRouter::new()),
            cache,
        ))
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(HealthStatus::from(ConnectionStatus::Connected), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from(ConnectionStatus::Reconnecting), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from(ConnectionStatus::Connecting), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from(ConnectionStatus::Disconnected), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn health_reports_disconnected_pipeline() {
        let response = router(state())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["connection"]["status"], "disconnected");
        assert_eq!(json["cache"]["orders"], 1);
        assert_eq!(json["cache"]["open_orders"], 1);
        assert_eq!(json["router"]["dropped"], 0);
    }

    #[tokio::test]
    async fn probes() {
        let app = router(state());
        let live = app
            .clone()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(live.status(), StatusCode::OK);

        let ready = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
