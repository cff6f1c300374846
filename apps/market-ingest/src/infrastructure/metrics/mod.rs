//! Prometheus Metrics Module
//!
//! Exposes pipeline metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Connection**: status, dials, reconnect attempts, replayed subscriptions
//! - **Frames**: inbound frames by kind, protocol errors
//! - **Router**: messages by outcome
//! - **Cache**: sync outcomes, evictions
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::infrastructure::connection::ConnectionStatus;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls return the same handle.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Connection
    describe_gauge!(
        "market_ingest_connection_status",
        "1 for the current connection status, 0 otherwise"
    );
    describe_counter!(
        "market_ingest_dials_total",
        "Dial attempts by outcome"
    );
    describe_counter!(
        "market_ingest_reconnect_attempts_total",
        "Automatic reconnect attempts"
    );
    describe_counter!(
        "market_ingest_replayed_subscriptions_total",
        "Subscribe frames resent after a redial"
    );

    // Frames
    describe_counter!(
        "market_ingest_frames_received_total",
        "Inbound frames by kind"
    );
    describe_counter!(
        "market_ingest_protocol_errors_total",
        "Inbound frames dropped as malformed"
    );

    // Router
    describe_counter!(
        "market_ingest_router_messages_total",
        "Router messages by outcome"
    );

    // Cache
    describe_counter!(
        "market_ingest_cache_syncs_total",
        "Order cache sync passes by outcome"
    );
    describe_counter!(
        "market_ingest_orders_evicted_total",
        "Orders evicted from memory by cleanup"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Router outcome labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterOutcome {
    /// Fire-and-forget message delivered.
    Sent,
    /// Request delivered.
    Request,
    /// Response matched a pending request.
    Response,
    /// Message addressed to an unregistered endpoint.
    Dropped,
    /// Response with no pending request.
    Unmatched,
}

impl RouterOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Request => "request",
            Self::Response => "response",
            Self::Dropped => "dropped",
            Self::Unmatched => "unmatched",
        }
    }
}

const STATUSES: [ConnectionStatus; 4] = [
    ConnectionStatus::Disconnected,
    ConnectionStatus::Connecting,
    ConnectionStatus::Connected,
    ConnectionStatus::Reconnecting,
];

const fn outcome(success: bool) -> &'static str {
    if success { "ok" } else { "error" }
}

/// Publish the current connection status.
pub fn set_connection_status(status: ConnectionStatus) {
    for candidate in STATUSES {
        let value = if candidate == status { 1.0 } else { 0.0 };
        gauge!("market_ingest_connection_status", "status" => candidate.as_str()).set(value);
    }
}

/// Record a dial attempt.
pub fn record_dial(success: bool) {
    counter!("market_ingest_dials_total", "outcome" => outcome(success)).increment(1);
}

/// Record an automatic reconnect attempt.
pub fn record_reconnect_attempt() {
    counter!("market_ingest_reconnect_attempts_total").increment(1);
}

/// Record one replayed subscription.
pub fn record_replayed_subscription() {
    counter!("market_ingest_replayed_subscriptions_total").increment(1);
}

/// Record an inbound frame.
pub fn record_frame(kind: &'static str) {
    counter!("market_ingest_frames_received_total", "kind" => kind).increment(1);
}

/// Record a malformed inbound frame.
pub fn record_protocol_error() {
    counter!("market_ingest_protocol_errors_total").increment(1);
}

/// Record a router message.
pub fn record_router_message(result: RouterOutcome) {
    counter!("market_ingest_router_messages_total", "outcome" => result.as_str()).increment(1);
}

/// Record a cache sync pass.
pub fn record_cache_sync(success: bool) {
    counter!("market_ingest_cache_syncs_total", "outcome" => outcome(success)).increment(1);
}

/// Record orders evicted by cleanup.
pub fn record_orders_evicted(count: usize) {
    counter!("market_ingest_orders_evicted_total").increment(count as u64);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_outcome_as_str() {
        assert_eq!(RouterOutcome::Sent.as_str(), "sent");
        assert_eq!(RouterOutcome::Request.as_str(), "request");
        assert_eq!(RouterOutcome::Response.as_str(), "response");
        assert_eq!(RouterOutcome::Dropped.as_str(), "dropped");
        assert_eq!(RouterOutcome::Unmatched.as_str(), "unmatched");
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(outcome(true), "ok");
        assert_eq!(outcome(false), "error");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        set_connection_status(ConnectionStatus::Connected);
        record_frame("trade");
        record_orders_evicted(3);
    }
}
