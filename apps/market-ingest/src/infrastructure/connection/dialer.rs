//! WebSocket Dialer
//!
//! [`Dialer`] adapter over `tokio-tungstenite`. TLS uses the rustls provider
//! installed by the binary at startup.

use async_trait::async_trait;
use futures::future;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::application::ports::{Dialer, Frame, Transport, TransportError};

/// Dials real WebSocket endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteDialer;

impl TungsteniteDialer {
    /// Create a dialer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dialer for TungsteniteDialer {
    async fn dial(&self, url: &str) -> Result<Transport, TransportError> {
        let (ws_stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Dial(e.to_string()))?;
        tracing::debug!(url, status = %response.status(), "WebSocket handshake complete");

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| TransportError::Write(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(to_message(frame))));

        let stream = read.map(|result| {
            result
                .map(from_message)
                .map_err(|e| TransportError::Read(e.to_string()))
        });

        Ok(Transport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
        Frame::Ping(payload) => Message::Ping(payload.into()),
        Frame::Pong(payload) => Message::Pong(payload.into()),
        Frame::Close => Message::Close(None),
    }
}

fn from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Binary(bytes) => Frame::Binary(bytes.to_vec()),
        Message::Ping(payload) => Frame::Ping(payload.to_vec()),
        Message::Pong(payload) => Frame::Pong(payload.to_vec()),
        Message::Close(_) => Frame::Close,
        Message::Frame(raw) => Frame::Binary(raw.payload().to_vec()),
    }
}
