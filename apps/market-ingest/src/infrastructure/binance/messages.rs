//! Binance WebSocket Message Types
//!
//! Wire format types for Binance market and user-data streams, plus the
//! account-type table that selects the stream endpoint.
//!
//! # Outbound
//! - `SUBSCRIBE` / `UNSUBSCRIBE` control frames
//!
//! # Inbound
//! - `trade`: individual trades (`<symbol>@trade`)
//! - `bookTicker`: best bid/ask (`<symbol>@bookTicker`); spot omits `e`
//! - `executionReport`: spot user-data order updates
//! - `{"result": ..., "id": ...}`: control acknowledgment
//! - `{"error": {"code": .., "msg": ..}, "id": ...}`: control rejection
//!
//! # References
//!
//! - [Spot streams](https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams)
//! - [User data stream](https://developers.binance.com/docs/binance-spot-api-docs/user-data-stream)

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::events::{BookTicker, Trade};
use crate::domain::order::{Order, OrderSide, OrderStatus, OrderType, TimeInForce};
use crate::domain::subscription::StreamId;

// =============================================================================
// Account Types
// =============================================================================

/// Binance account/venue, which determines the stream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    /// Spot.
    Spot,
    /// Cross margin.
    Margin,
    /// Isolated margin.
    IsolatedMargin,
    /// USD-margined futures.
    UsdMFuture,
    /// Coin-margined futures.
    CoinMFuture,
    /// Portfolio margin.
    PortfolioMargin,
    /// Spot testnet.
    SpotTestnet,
    /// USD-margined futures testnet.
    UsdMFutureTestnet,
    /// Coin-margined futures testnet.
    CoinMFutureTestnet,
}

impl AccountType {
    /// Every account type.
    pub const ALL: [Self; 9] = [
        Self::Spot,
        Self::Margin,
        Self::IsolatedMargin,
        Self::UsdMFuture,
        Self::CoinMFuture,
        Self::PortfolioMargin,
        Self::SpotTestnet,
        Self::UsdMFutureTestnet,
        Self::CoinMFutureTestnet,
    ];

    /// Configuration / key-namespace name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Spot => "SPOT",
            Self::Margin => "MARGIN",
            Self::IsolatedMargin => "ISOLATED_MARGIN",
            Self::UsdMFuture => "USD_M_FUTURE",
            Self::CoinMFuture => "COIN_M_FUTURE",
            Self::PortfolioMargin => "PORTFOLIO_MARGIN",
            Self::SpotTestnet => "SPOT_TESTNET",
            Self::UsdMFutureTestnet => "USD_M_FUTURE_TESTNET",
            Self::CoinMFutureTestnet => "COIN_M_FUTURE_TESTNET",
        }
    }

    /// Raw-stream WebSocket endpoint.
    #[must_use]
    pub const fn ws_url(self) -> &'static str {
        match self {
            Self::Spot | Self::Margin | Self::IsolatedMargin => "wss://stream.binance.com:9443/ws",
            Self::UsdMFuture => "wss://fstream.binance.com/ws",
            Self::CoinMFuture => "wss://dstream.binance.com/ws",
            Self::PortfolioMargin => "wss://fstream.binance.com/pm/ws",
            Self::SpotTestnet => "wss://testnet.binance.vision/ws",
            Self::UsdMFutureTestnet => "wss://stream.binancefuture.com/ws",
            Self::CoinMFutureTestnet => "wss://dstream.binancefuture.com/ws",
        }
    }

    /// Whether this is a testnet endpoint.
    #[must_use]
    pub const fn is_testnet(self) -> bool {
        matches!(
            self,
            Self::SpotTestnet | Self::UsdMFutureTestnet | Self::CoinMFutureTestnet
        )
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown account type name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown account type: {0}")]
pub struct UnknownAccountType(pub String);

impl FromStr for AccountType {
    type Err = UnknownAccountType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| UnknownAccountType(s.to_string()))
    }
}

// =============================================================================
// Control Frames
// =============================================================================

/// Control frame method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamMethod {
    /// Start receiving streams.
    Subscribe,
    /// Stop receiving streams.
    Unsubscribe,
}

/// Subscribe/unsubscribe control frame.
///
/// # Wire Format (JSON)
/// ```json
/// {"method": "SUBSCRIBE", "params": ["btcusdt@trade"], "id": 1}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    /// Method.
    pub method: StreamMethod,
    /// Stream identifiers.
    pub params: Vec<String>,
    /// Request ID, echoed in the acknowledgment.
    pub id: i64,
}

impl StreamRequest {
    /// `SUBSCRIBE` for the given streams.
    #[must_use]
    pub fn subscribe(streams: &[StreamId], id: i64) -> Self {
        Self::new(StreamMethod::Subscribe, streams, id)
    }

    /// `UNSUBSCRIBE` for the given streams.
    #[must_use]
    pub fn unsubscribe(streams: &[StreamId], id: i64) -> Self {
        Self::new(StreamMethod::Unsubscribe, streams, id)
    }

    fn new(method: StreamMethod, streams: &[StreamId], id: i64) -> Self {
        Self {
            method,
            params: streams.iter().map(|s| s.as_str().to_string()).collect(),
            id,
        }
    }
}

/// Error body of a rejected control frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlError {
    /// Binance error code.
    pub code: i64,
    /// Description.
    pub msg: String,
}

// =============================================================================
// Conversion Errors
// =============================================================================

/// A wire message decoded but could not be mapped to a domain type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Millisecond timestamp out of range.
    #[error("timestamp out of range: {0}")]
    Timestamp(i64),

    /// Enumerated field had an unknown value.
    #[error("unknown {field}: {value}")]
    UnknownValue {
        /// Field name.
        field: &'static str,
        /// Received value.
        value: String,
    },
}

fn millis(ms: i64) -> Result<DateTime<Utc>, WireError> {
    DateTime::from_timestamp_millis(ms).ok_or(WireError::Timestamp(ms))
}

// =============================================================================
// Market Streams
// =============================================================================

/// Trade stream payload.
///
/// # Wire Format (JSON)
/// ```json
/// {"e":"trade","E":1672515782136,"s":"BNBBTC","t":12345,"p":"0.001","q":"100",
///  "T":1672515782136,"m":true,"M":true}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeMessage {
    /// Event time (ms).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Trade ID.
    #[serde(rename = "t")]
    pub trade_id: i64,
    /// Price.
    #[serde(rename = "p")]
    pub price: Decimal,
    /// Quantity.
    #[serde(rename = "q")]
    pub quantity: Decimal,
    /// Trade time (ms).
    #[serde(rename = "T")]
    pub trade_time: i64,
    /// Is the buyer the market maker?
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
    /// Ignore flag (spot only).
    #[serde(rename = "M", default)]
    pub ignore: Option<bool>,
    /// Trade type (futures only), e.g. `MARKET`.
    #[serde(rename = "X", default)]
    pub trade_type: Option<String>,
}

impl TryFrom<TradeMessage> for Trade {
    type Error = WireError;

    fn try_from(msg: TradeMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            symbol: msg.symbol,
            trade_id: msg.trade_id,
            price: msg.price,
            quantity: msg.quantity,
            buyer_is_maker: msg.buyer_is_maker,
            trade_time: millis(msg.trade_time)?,
            event_time: millis(msg.event_time)?,
        })
    }
}

/// Book ticker stream payload.
///
/// # Wire Format (JSON)
/// ```json
/// {"u":400900217,"s":"BNBUSDT","b":"25.35190000","B":"31.21000000",
///  "a":"25.36520000","A":"40.66000000"}
/// ```
///
/// Futures adds `"e":"bookTicker"`, `E` and `T`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookTickerMessage {
    /// Order book update ID.
    #[serde(rename = "u")]
    pub update_id: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Best bid price.
    #[serde(rename = "b")]
    pub bid_price: Decimal,
    /// Best bid quantity.
    #[serde(rename = "B")]
    pub bid_quantity: Decimal,
    /// Best ask price.
    #[serde(rename = "a")]
    pub ask_price: Decimal,
    /// Best ask quantity.
    #[serde(rename = "A")]
    pub ask_quantity: Decimal,
    /// Event time (ms, futures only).
    #[serde(rename = "E", default)]
    pub event_time: Option<i64>,
}

impl BookTickerMessage {
    /// Whether a raw object carries the spot book ticker fields.
    #[must_use]
    pub fn matches_shape(object: &serde_json::Map<String, serde_json::Value>) -> bool {
        ["u", "s", "b", "B", "a", "A"]
            .iter()
            .all(|k| object.contains_key(*k))
    }
}

impl TryFrom<BookTickerMessage> for BookTicker {
    type Error = WireError;

    fn try_from(msg: BookTickerMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            symbol: msg.symbol,
            update_id: msg.update_id,
            bid_price: msg.bid_price,
            bid_quantity: msg.bid_quantity,
            ask_price: msg.ask_price,
            ask_quantity: msg.ask_quantity,
            event_time: msg.event_time.map(millis).transpose()?,
        })
    }
}

// =============================================================================
// User Data Stream
// =============================================================================

/// Spot `executionReport` payload (subset of fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReportMessage {
    /// Event time (ms).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Client order ID.
    #[serde(rename = "c")]
    pub client_order_id: String,
    /// Side.
    #[serde(rename = "S")]
    pub side: String,
    /// Order type.
    #[serde(rename = "o")]
    pub order_type: String,
    /// Time in force.
    #[serde(rename = "f")]
    pub time_in_force: String,
    /// Order quantity.
    #[serde(rename = "q")]
    pub quantity: Decimal,
    /// Order price.
    #[serde(rename = "p")]
    pub price: Decimal,
    /// Execution type: `NEW`, `TRADE`, `CANCELED`, `REJECTED`, `EXPIRED`, ...
    #[serde(rename = "x")]
    pub execution_type: String,
    /// Order status.
    #[serde(rename = "X")]
    pub status: String,
    /// Order ID.
    #[serde(rename = "i")]
    pub order_id: i64,
    /// Last executed quantity.
    #[serde(rename = "l")]
    pub last_quantity: Decimal,
    /// Cumulative filled quantity.
    #[serde(rename = "z")]
    pub cumulative_quantity: Decimal,
    /// Last executed price.
    #[serde(rename = "L")]
    pub last_price: Decimal,
    /// Commission amount.
    #[serde(rename = "n")]
    pub commission: Decimal,
    /// Commission asset.
    #[serde(rename = "N", default)]
    pub commission_asset: Option<String>,
    /// Transaction time (ms).
    #[serde(rename = "T")]
    pub transaction_time: i64,
    /// Cumulative quote quantity.
    #[serde(rename = "Z")]
    pub cumulative_quote_quantity: Decimal,
    /// Last quote quantity.
    #[serde(rename = "Y", default)]
    pub last_quote_quantity: Option<Decimal>,
}

impl ExecutionReportMessage {
    /// Execution type of a first report.
    pub const NEW: &'static str = "NEW";

    /// Whether this is the first report for the order.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.execution_type == Self::NEW
    }

    /// Map to the cached order representation.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] for an unknown status, side or order type, or an
    /// out-of-range timestamp.
    pub fn to_order(&self) -> Result<Order, WireError> {
        let status = map_status(&self.status)?;
        let side = match self.side.as_str() {
            "BUY" => OrderSide::Buy,
            "SELL" => OrderSide::Sell,
            other => return Err(unknown("side", other)),
        };
        let order_type = match self.order_type.as_str() {
            "MARKET" | "STOP_LOSS" | "TAKE_PROFIT" => OrderType::Market,
            "LIMIT" | "LIMIT_MAKER" | "STOP_LOSS_LIMIT" | "TAKE_PROFIT_LIMIT" => OrderType::Limit,
            other => return Err(unknown("order type", other)),
        };
        let time_in_force = match self.time_in_force.as_str() {
            "GTC" => Some(TimeInForce::Gtc),
            "IOC" => Some(TimeInForce::Ioc),
            "FOK" => Some(TimeInForce::Fok),
            _ => None,
        };

        let filled = self.cumulative_quantity;
        let average = (filled > Decimal::ZERO).then(|| self.cumulative_quote_quantity / filled);
        let non_zero = |d: Decimal| (d > Decimal::ZERO).then_some(d);

        Ok(Order {
            exchange: "binance".to_string(),
            symbol: self.symbol.clone(),
            status,
            id: self.order_id.to_string(),
            client_order_id: Some(self.client_order_id.clone()),
            timestamp: millis(self.transaction_time)?,
            order_type,
            side,
            time_in_force,
            price: non_zero(self.price),
            average,
            last_filled_price: non_zero(self.last_price),
            amount: self.quantity,
            filled,
            last_filled: self.last_quantity,
            remaining: (self.quantity - filled).max(Decimal::ZERO),
            fee: non_zero(self.commission),
            fee_currency: self.commission_asset.clone(),
            cost: self.last_quote_quantity,
            cum_cost: Some(self.cumulative_quote_quantity),
            reduce_only: None,
            position_side: None,
            success: status != OrderStatus::Failed,
        })
    }
}

fn unknown(field: &'static str, value: &str) -> WireError {
    WireError::UnknownValue {
        field,
        value: value.to_string(),
    }
}

fn map_status(raw: &str) -> Result<OrderStatus, WireError> {
    Ok(match raw {
        "PENDING_NEW" => OrderStatus::Pending,
        "NEW" => OrderStatus::Accepted,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "PENDING_CANCEL" => OrderStatus::Canceling,
        "CANCELED" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Failed,
        "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
        other => return Err(unknown("order status", other)),
    })
}
