//! Subscription Tracking
//!
//! Stream identifiers and the ordered registry of active subscriptions that
//! the connection manager replays after every successful (re)dial.
//!
//! # Invariants
//!
//! - The registry holds each stream identifier at most once.
//! - Iteration order is the order in which identifiers were first added;
//!   replay resends them in exactly this order.

use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// =============================================================================
// Stream Identifier
// =============================================================================

/// Channel suffix for individual trades.
pub const TRADE_CHANNEL: &str = "trade";

/// Channel suffix for best bid/ask updates.
pub const BOOK_TICKER_CHANNEL: &str = "bookTicker";

/// Error returned for a malformed stream identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidStreamId {
    /// Identifier was empty.
    #[error("stream identifier is empty")]
    Empty,
    /// Identifier contained whitespace.
    #[error("stream identifier contains whitespace: {0:?}")]
    Whitespace(String),
}

/// Opaque name of one subscribed data channel, e.g. `btcusdt@trade`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Validate and wrap a raw identifier.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidStreamId`] if the identifier is empty or contains
    /// whitespace.
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidStreamId> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(InvalidStreamId::Empty);
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(InvalidStreamId::Whitespace(raw));
        }
        Ok(Self(raw))
    }

    /// Build `<symbol>@<channel>` with the symbol lower-cased.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidStreamId`] if the symbol is empty or contains
    /// whitespace.
    pub fn for_symbol(symbol: &str, channel: &str) -> Result<Self, InvalidStreamId> {
        if symbol.is_empty() {
            return Err(InvalidStreamId::Empty);
        }
        Self::new(format!("{}@{channel}", symbol.to_lowercase()))
    }

    /// Borrow the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Ordered, de-duplicated set of active subscriptions.
///
/// Thread-safe; callers never lock externally.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    streams: RwLock<Vec<StreamId>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stream. Returns `false` if it was already present.
    pub fn add(&self, stream: StreamId) -> bool {
        let mut streams = self.streams.write();
        if streams.contains(&stream) {
            return false;
        }
        streams.push(stream);
        true
    }

    /// Remove a stream, preserving the order of the rest.
    /// Returns `false` if it was not present.
    pub fn remove(&self, stream: &StreamId) -> bool {
        let mut streams = self.streams.write();
        let before = streams.len();
        streams.retain(|s| s != stream);
        streams.len() != before
    }

    /// Whether the stream is active.
    #[must_use]
    pub fn contains(&self, stream: &StreamId) -> bool {
        self.streams.read().contains(stream)
    }

    /// Copy of the active streams in first-subscribed order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<StreamId> {
        self.streams.read().clone()
    }

    /// Number of active streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    /// Whether no streams are active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }
}
