//! Order Types
//!
//! The cached order entity and its enumerations. An order is created by an
//! "initialized" event, mutated in place by status updates, and becomes
//! logically terminal once it is filled, canceled or expired.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Enumerations
// =============================================================================

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Rejected by the venue or failed locally.
    Failed,
    /// Submitted, not yet acknowledged.
    Pending,
    /// Cancel requested, not yet confirmed.
    Canceling,
    /// Acknowledged and resting.
    Accepted,
    /// Some quantity executed.
    PartiallyFilled,
    /// Fully executed.
    Filled,
    /// Canceled.
    Canceled,
    /// Expired by time-in-force or venue rules.
    Expired,
}

impl OrderStatus {
    /// Whether the order can no longer change.
    ///
    /// `Failed` is not terminal: the venue may still report the
    /// order as canceled or expired afterwards.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Expired)
    }

    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Failed => "FAILED",
            Self::Pending => "PENDING",
            Self::Canceling => "CANCELING",
            Self::Accepted => "ACCEPTED",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown enum value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl FromStr for OrderStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FAILED" => Ok(Self::Failed),
            "PENDING" => Ok(Self::Pending),
            "CANCELING" => Ok(Self::Canceling),
            "ACCEPTED" => Ok(Self::Accepted),
            "PARTIALLY_FILLED" => Ok(Self::PartiallyFilled),
            "FILLED" => Ok(Self::Filled),
            "CANCELED" => Ok(Self::Canceled),
            "EXPIRED" => Ok(Self::Expired),
            other => Err(ParseEnumError {
                kind: "order status",
                value: other.to_string(),
            }),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// Market order.
    Market,
    /// Limit order.
    Limit,
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    /// Buy.
    Buy,
    /// Sell.
    Sell,
}

/// Time in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    /// Good till canceled.
    Gtc,
    /// Immediate or cancel.
    Ioc,
    /// Fill or kill.
    Fok,
}

/// Position side for derivatives accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSide {
    /// Long leg.
    Long,
    /// Short leg.
    Short,
    /// One-way mode.
    Flat,
}

// =============================================================================
// Order
// =============================================================================

/// A cached order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Venue identifier, e.g. `binance`.
    pub exchange: String,
    /// Instrument symbol as reported by the venue.
    pub symbol: String,
    /// Lifecycle status.
    pub status: OrderStatus,
    /// Venue order identifier; primary key of the cache.
    pub id: String,
    /// Client-assigned identifier.
    #[serde(default)]
    pub client_order_id: Option<String>,
    /// Event time of the latest update; drives TTL eviction.
    pub timestamp: DateTime<Utc>,
    /// Order type.
    pub order_type: OrderType,
    /// Order side.
    pub side: OrderSide,
    /// Time in force.
    #[serde(default)]
    pub time_in_force: Option<TimeInForce>,
    /// Limit price.
    #[serde(default)]
    pub price: Option<Decimal>,
    /// Average fill price.
    #[serde(default)]
    pub average: Option<Decimal>,
    /// Price of the most recent fill.
    #[serde(default)]
    pub last_filled_price: Option<Decimal>,
    /// Original quantity.
    pub amount: Decimal,
    /// Cumulative filled quantity.
    #[serde(default)]
    pub filled: Decimal,
    /// Quantity of the most recent fill.
    #[serde(default)]
    pub last_filled: Decimal,
    /// Quantity still open.
    #[serde(default)]
    pub remaining: Decimal,
    /// Fee charged on the most recent fill.
    #[serde(default)]
    pub fee: Option<Decimal>,
    /// Asset the fee was charged in.
    #[serde(default)]
    pub fee_currency: Option<String>,
    /// Quote quantity of the most recent fill.
    #[serde(default)]
    pub cost: Option<Decimal>,
    /// Cumulative quote quantity.
    #[serde(default)]
    pub cum_cost: Option<Decimal>,
    /// Reduce-only flag (derivatives).
    #[serde(default)]
    pub reduce_only: Option<bool>,
    /// Position side (derivatives).
    #[serde(default)]
    pub position_side: Option<PositionSide>,
    /// Whether the submission succeeded.
    #[serde(default = "default_success")]
    pub success: bool,
}

const fn default_success() -> bool {
    true
}

impl Order {
    /// Whether the order can no longer change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the order is older than `cutoff`.
    #[must_use]
    pub fn is_older_than(&self, cutoff: DateTime<Utc>) -> bool {
        self.timestamp < cutoff
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::str::FromStr;

    use super::*;

    pub fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    /// A resting limit order stamped now.
    pub fn order(id: &str, symbol: &str, status: OrderStatus) -> Order {
        Order {
            exchange: "binance".to_string(),
            symbol: symbol.to_string(),
            status,
            id: id.to_string(),
            client_order_id: Some(format!("c-{id}")),
            timestamp: Utc::now(),
            order_type: OrderType::Limit,
            side: OrderSide::Buy,
            time_in_force: Some(TimeInForce::Gtc),
            price: Some(dec("100.5")),
            average: None,
            last_filled_price: None,
            amount: dec("2"),
            filled: Decimal::ZERO,
            last_filled: Decimal::ZERO,
            remaining: dec("2"),
            fee: None,
            fee_currency: None,
            cost: None,
            cum_cost: None,
            reduce_only: None,
            position_side: None,
            success: true,
        }
    }
}
