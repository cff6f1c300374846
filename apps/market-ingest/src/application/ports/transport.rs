//! Transport Port (Driven Port)
//!
//! A bidirectional frame transport to one stream endpoint. The production
//! adapter wraps `tokio-tungstenite`; tests script frames over in-memory
//! channels.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, Stream};

/// One WebSocket-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Control-level ping.
    Ping(Vec<u8>),
    /// Control-level pong.
    Pong(Vec<u8>),
    /// Close frame.
    Close,
}

/// Transport-level failures. All are retried through the reconnect policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Dial refused or failed before the handshake completed.
    #[error("dial failed: {0}")]
    Dial(String),

    /// Handshake did not complete in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// No live connection to write to.
    #[error("not connected")]
    NotConnected,

    /// Writing a frame failed.
    #[error("write failed: {0}")]
    Write(String),

    /// Reading a frame failed.
    #[error("read failed: {0}")]
    Read(String),

    /// Remote closed the connection.
    #[error("connection closed by remote")]
    ConnectionClosed,

    /// No inbound traffic within the read timeout.
    #[error("no inbound frame within {0:?}")]
    LivenessTimeout(Duration),
}

/// Outbound half of a transport.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;

/// Inbound half of a transport. Ends (`None`) when the remote goes away.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// A freshly dialed connection, split into its halves.
pub struct Transport {
    /// Write half.
    pub sink: FrameSink,
    /// Read half.
    pub stream: FrameStream,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens transports to a URL.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial `url` and complete the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Dial`] when the endpoint refuses or the
    /// handshake fails.
    async fn dial(&self, url: &str) -> Result<Transport, TransportError>;
}
