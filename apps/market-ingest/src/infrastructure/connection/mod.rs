//! Streaming connection management.
//!
//! - `manager`: connection lifecycle, subscriptions and replay
//! - `reconnect`: exponential backoff with jitter
//! - `liveness`: silent-link detection
//! - `dialer`: tokio-tungstenite transport

pub mod dialer;
pub mod liveness;
pub mod manager;
pub mod reconnect;

pub use dialer::TungsteniteDialer;
pub use liveness::{LinkFault, LivenessConfig, LivenessMonitor, LivenessState};
pub use manager::{ConnectionConfig, ConnectionError, ConnectionManager, ConnectionStatus};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
