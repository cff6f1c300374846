//! Market Events
//!
//! Typed events decoded from inbound stream frames. Every decodable frame
//! maps to exactly one variant; payloads with an unknown or missing event
//! type land in [`MarketEvent::Unrecognized`] with the raw JSON preserved.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::Order;

/// A single executed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Instrument symbol.
    pub symbol: String,
    /// Venue trade identifier.
    pub trade_id: i64,
    /// Execution price.
    pub price: Decimal,
    /// Executed quantity.
    pub quantity: Decimal,
    /// True when the buyer was the resting (maker) side.
    pub buyer_is_maker: bool,
    /// Time the trade executed.
    pub trade_time: DateTime<Utc>,
    /// Time the venue emitted the event.
    pub event_time: DateTime<Utc>,
}

/// Best bid/ask snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookTicker {
    /// Instrument symbol.
    pub symbol: String,
    /// Order book update identifier.
    pub update_id: i64,
    /// Best bid price.
    pub bid_price: Decimal,
    /// Best bid quantity.
    pub bid_quantity: Decimal,
    /// Best ask price.
    pub ask_price: Decimal,
    /// Best ask quantity.
    pub ask_quantity: Decimal,
    /// Event time, when the venue provides one.
    pub event_time: Option<DateTime<Utc>>,
}

/// A decoded inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    /// Public trade.
    Trade(Trade),
    /// Best bid/ask update.
    BookTicker(BookTicker),
    /// First report of a newly accepted order.
    OrderInitialized(Order),
    /// Any later report for an order (fill, cancel, expiry, ...).
    OrderStatusUpdate(Order),
    /// A JSON object the decoder has no typed variant for.
    Unrecognized {
        /// Value of the event-type field, if the object had one.
        event_type: Option<String>,
        /// The raw object.
        payload: serde_json::Value,
    },
}

impl MarketEvent {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Trade(_) => "trade",
            Self::BookTicker(_) => "book_ticker",
            Self::OrderInitialized(_) => "order_initialized",
            Self::OrderStatusUpdate(_) => "order_status_update",
            Self::Unrecognized { .. } => "unrecognized",
        }
    }

    /// Symbol the event refers to, if any.
    #[must_use]
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Trade(t) => Some(&t.symbol),
            Self::BookTicker(b) => Some(&b.symbol),
            Self::OrderInitialized(o) | Self::OrderStatusUpdate(o) => Some(&o.symbol),
            Self::Unrecognized { .. } => None,
        }
    }
}
