//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Binance stream wire messages and codec.
pub mod binance;

/// Streaming connection manager, reconnect policy, liveness and dialer.
pub mod connection;

/// In-memory durable order store.
pub mod store;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
