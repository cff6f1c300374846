//! Scripted transport for connection tests.
//!
//! Each dial pops the next outcome from a script. Accepted dials hand the
//! test a [`RemoteEnd`]: the frames the manager wrote (stamped with the
//! tokio clock at write time) and a sender for frames the manager reads.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, future};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use market_ingest::{
    ConnectionConfig, Dialer, Frame, HandlerError, LivenessConfig, MarketEvent,
    MarketEventHandler, ReconnectConfig, Transport, TransportError,
};

/// What the next dial does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dial {
    Accept,
    Refuse,
}

/// The far side of one accepted dial.
pub struct RemoteEnd {
    pub written: fmpsc::UnboundedReceiver<(Instant, Frame)>,
    pub inbound: fmpsc::UnboundedSender<Result<Frame, TransportError>>,
}

impl RemoteEnd {
    /// Next frame the manager wrote.
    pub async fn next_written(&mut self) -> (Instant, Frame) {
        use futures::StreamExt;
        tokio::time::timeout(Duration::from_secs(120), self.written.next())
            .await
            .expect("timed out waiting for a written frame")
            .expect("writer dropped")
    }

    /// Next written text frame, skipping anything else.
    pub async fn next_text(&mut self) -> (Instant, String) {
        loop {
            if let (at, Frame::Text(text)) = self.next_written().await {
                return (at, text);
            }
        }
    }

    /// Whether the manager has written nothing that is not yet consumed.
    pub fn is_quiet(&mut self) -> bool {
        use futures::{FutureExt, StreamExt};
        self.written.next().now_or_never().is_none()
    }

    /// Push a frame to the manager's reader.
    pub fn push(&self, frame: Frame) {
        self.inbound.unbounded_send(Ok(frame)).unwrap();
    }

    /// Push a text frame.
    pub fn push_text(&self, text: &str) {
        self.push(Frame::Text(text.to_string()));
    }
}

/// Dialer driven by a script of outcomes. An empty script refuses.
pub struct ScriptedDialer {
    script: Mutex<VecDeque<Dial>>,
    dials: AtomicUsize,
    remotes: mpsc::UnboundedSender<RemoteEnd>,
}

impl ScriptedDialer {
    pub fn new(script: &[Dial]) -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            dials: AtomicUsize::new(0),
            remotes,
        });
        (dialer, rx)
    }

    /// Append outcomes to the script.
    pub fn push(&self, outcome: Dial) {
        self.script.lock().push_back(outcome);
    }

    /// Dials attempted so far.
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(&self, _url: &str) -> Result<Transport, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().pop_front().unwrap_or(Dial::Refuse);
        if outcome == Dial::Refuse {
            return Err(TransportError::Dial("connection refused".into()));
        }

        let (written_tx, written) = fmpsc::unbounded::<(Instant, Frame)>();
        let (inbound, inbound_rx) = fmpsc::unbounded::<Result<Frame, TransportError>>();

        let sink = written_tx
            .sink_map_err(|e| TransportError::Write(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>((Instant::now(), frame))));

        let _ = self.remotes.send(RemoteEnd { written, inbound });
        Ok(Transport {
            sink: Box::pin(sink),
            stream: Box::pin(inbound_rx),
        })
    }
}

/// Handler that forwards every event to a channel.
pub fn collecting_handler() -> (
    Arc<dyn MarketEventHandler>,
    mpsc::UnboundedReceiver<MarketEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |event: MarketEvent| {
        let _ = tx.send(event);
        Ok::<(), HandlerError>(())
    };
    (Arc::new(handler), rx)
}

/// Fast, jitter-free config for paused-clock tests.
pub fn test_config(max_attempts: u32) -> ConnectionConfig {
    ConnectionConfig {
        url: "ws://scripted.test/ws".to_string(),
        handshake_timeout: Duration::from_secs(1),
        reconnect: ReconnectConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        },
        liveness: LivenessConfig::new(Duration::from_secs(60), Duration::from_secs(1)),
        replay_interval: Duration::from_millis(300),
    }
}

/// Next accepted remote, or panic.
pub async fn next_remote(remotes: &mut mpsc::UnboundedReceiver<RemoteEnd>) -> RemoteEnd {
    tokio::time::timeout(Duration::from_secs(120), remotes.recv())
        .await
        .expect("timed out waiting for a dial")
        .expect("dialer dropped")
}

/// Poll `condition` on the tokio clock until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..12_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Parse a written control frame.
pub fn control(text: &str) -> serde_json::Value {
    serde_json::from_str(text).unwrap()
}
