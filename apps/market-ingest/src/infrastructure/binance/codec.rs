//! Stream Frame Codec
//!
//! Classifies inbound text frames from a Binance stream:
//!
//! - valid JSON object with a `result` field: subscription acknowledgment
//! - valid JSON object with an `error` field: control rejection
//! - any other JSON object: a [`MarketEvent`], typed by its `e` field
//! - the literal text `ping`: a liveness probe answered with `pong`
//! - anything else: [`ProtocolError`]
//!
//! Combined-stream envelopes (`{"stream": .., "data": {..}}`) are unwrapped
//! before classification.

use serde_json::{Map, Value};

use super::messages::{
    BookTickerMessage, ControlError, ExecutionReportMessage, StreamRequest, TradeMessage,
};
use crate::domain::events::{BookTicker, MarketEvent, Trade};

/// Literal text probe some endpoints send instead of a control ping.
pub const PROBE_TEXT: &str = "ping";

/// Literal reply to [`PROBE_TEXT`].
pub const PROBE_REPLY: &str = "pong";

/// Malformed inbound payloads. Dropped per message; never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Text was neither JSON nor the literal probe.
    #[error("invalid JSON: {reason}")]
    InvalidJson {
        /// Parser message.
        reason: String,
    },

    /// JSON value was not an object.
    #[error("expected a JSON object, got {kind}")]
    NotAnObject {
        /// JSON type that was received.
        kind: &'static str,
    },

    /// Binary frames are not part of the protocol.
    #[error("unexpected binary frame ({len} bytes)")]
    UnexpectedBinary {
        /// Frame length.
        len: usize,
    },

    /// A known event type failed to decode.
    #[error("failed to decode {event_type} event: {reason}")]
    Decode {
        /// Event type that failed.
        event_type: String,
        /// Decoder message.
        reason: String,
    },
}

/// A classified inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Control-frame acknowledgment.
    Ack {
        /// Echoed request ID.
        id: Option<i64>,
    },
    /// Control-frame rejection.
    Rejected {
        /// Echoed request ID.
        id: Option<i64>,
        /// Error body.
        error: ControlError,
    },
    /// A market or user-data event.
    Event(MarketEvent),
    /// Literal liveness probe; reply with [`PROBE_REPLY`].
    Probe,
}

/// JSON codec for Binance stream frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamCodec;

impl StreamCodec {
    /// Create a codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Serialize an outbound control frame.
    ///
    /// # Errors
    ///
    /// Returns the serializer error; not expected for well-formed requests.
    pub fn encode(&self, request: &StreamRequest) -> Result<String, serde_json::Error> {
        serde_json::to_string(request)
    }

    /// Classify one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] when the frame is not valid JSON (and not the
    /// literal probe), is not an object, or a known event fails to decode.
    pub fn decode(&self, text: &str) -> Result<Inbound, ProtocolError> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) if text.trim() == PROBE_TEXT => return Ok(Inbound::Probe),
            Err(e) => {
                return Err(ProtocolError::InvalidJson {
                    reason: e.to_string(),
                });
            }
        };

        let Value::Object(mut object) = value else {
            return Err(ProtocolError::NotAnObject {
                kind: json_kind(&value),
            });
        };

        if let Some(Value::Object(data)) = unwrap_combined(&mut object) {
            object = data;
        }

        if object.contains_key("result") {
            return Ok(Inbound::Ack {
                id: object.get("id").and_then(Value::as_i64),
            });
        }

        if let Some(error) = object.get("error") {
            let error: ControlError =
                serde_json::from_value(error.clone()).map_err(|e| decode_error("error", &e))?;
            return Ok(Inbound::Rejected {
                id: object.get("id").and_then(Value::as_i64),
                error,
            });
        }

        decode_event(object).map(Inbound::Event)
    }
}

/// Take `data` out of a `{"stream": .., "data": ..}` envelope.
fn unwrap_combined(object: &mut Map<String, Value>) -> Option<Value> {
    if object.len() == 2 && object.get("stream").is_some_and(Value::is_string) {
        object.remove("data")
    } else {
        None
    }
}

fn decode_event(object: Map<String, Value>) -> Result<MarketEvent, ProtocolError> {
    let event_type = object.get("e").and_then(Value::as_str).map(str::to_string);

    match event_type.as_deref() {
        Some("trade") => {
            let msg: TradeMessage = from_object("trade", object)?;
            Trade::try_from(msg)
                .map(MarketEvent::Trade)
                .map_err(|e| decode_error("trade", &e))
        }
        Some("bookTicker") => decode_book_ticker(object),
        None if BookTickerMessage::matches_shape(&object) => decode_book_ticker(object),
        Some("executionReport") => {
            let msg: ExecutionReportMessage = from_object("executionReport", object)?;
            let order = msg
                .to_order()
                .map_err(|e| decode_error("executionReport", &e))?;
            Ok(if msg.is_new() {
                MarketEvent::OrderInitialized(order)
            } else {
                MarketEvent::OrderStatusUpdate(order)
            })
        }
        _ => Ok(MarketEvent::Unrecognized {
            event_type,
            payload: Value::Object(object),
        }),
    }
}

fn decode_book_ticker(object: Map<String, Value>) -> Result<MarketEvent, ProtocolError> {
    let msg: BookTickerMessage = from_object("bookTicker", object)?;
    BookTicker::try_from(msg)
        .map(MarketEvent::BookTicker)
        .map_err(|e| decode_error("bookTicker", &e))
}

fn from_object<T: serde::de::DeserializeOwned>(
    event_type: &str,
    object: Map<String, Value>,
) -> Result<T, ProtocolError> {
    serde_json::from_value(Value::Object(object)).map_err(|e| decode_error(event_type, &e))
}

fn decode_error(event_type: &str, err: &dyn std::fmt::Display) -> ProtocolError {
    ProtocolError::Decode {
        event_type: event_type.to_string(),
        reason: err.to_string(),
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
