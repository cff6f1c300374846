#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Ingest - Streaming Ingestion Pipeline
//!
//! Keeps one resilient WebSocket connection to a Binance stream endpoint,
//! routes every decoded event through an in-process message router, and
//! maintains an order cache that is periodically synchronized to a durable
//! store.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core ingestion types
//!   - `order`: cached order entity and statuses
//!   - `subscription`: stream identifiers and the replay registry
//!   - `events`: decoded market events
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: dialer, frame transport, durable store, event handler
//!   - `services`: message router, order cache, event dispatcher
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `binance`: wire messages and stream codec
//!   - `connection`: connection manager, reconnect policy, liveness, dialer
//!   - `store`: in-memory durable store
//!   - `config`: environment configuration
//!   - `health`: health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//! Binance WS ──► ConnectionManager ──► EventDispatcher ──► MessageRouter
//!   ▲   (reader, liveness, replay)                           │
//!   │                                      order.initialized │ order.status_update
//!   └── SUBSCRIBE / pong                                     ▼
//!                                       OrderStore ◄─sync── OrderCache
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core ingestion types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::events::{BookTicker, MarketEvent, Trade};
pub use domain::order::{Order, OrderSide, OrderStatus, OrderType, PositionSide, TimeInForce};
pub use domain::subscription::{StreamId, SubscriptionRegistry};

// Ports
pub use application::ports::{
    Dialer, Frame, HandlerError, MarketEventHandler, OrderStore, StoreError, StoreKeys, Transport,
    TransportError,
};

// Services
pub use application::services::{
    CacheConfig, CacheError, CacheStats, Delivery, EventDispatcher, Handler, MessageRouter,
    OrderCache, Request, Response, RouterError, RouterStats, SyncError, SyncTask,
};

// Connection
pub use infrastructure::connection::{
    ConnectionConfig, ConnectionError, ConnectionManager, ConnectionStatus, LivenessConfig,
    ReconnectConfig, ReconnectPolicy, TungsteniteDialer,
};

// Wire
pub use infrastructure::binance::messages::{AccountType, StreamRequest};

// Store
pub use infrastructure::store::InMemoryOrderStore;

// Infrastructure config
pub use infrastructure::config::{ConfigError, IngestConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
