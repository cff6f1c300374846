//! Connection Manager
//!
//! Owns one streaming connection: dialing, liveness, bounded reconnection
//! with paced subscription replay, and an idempotent close.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect──► Connecting ──ok──► Connected
//!      ▲                        │                 │ read/write failure,
//!      │ dial failed            │                 ▼ liveness timeout
//!      └────────────────────────┘            Reconnecting ──redial ok──► Connected
//!      ▲                                          │
//!      └──────────── budget exhausted ────────────┘
//! ```
//!
//! `close` is reachable from every state and leaves the manager
//! `Disconnected` for good.
//!
//! # Tasks
//!
//! A successful `connect` spawns exactly one supervisor (reader plus
//! reconnect loop) and one liveness monitor. Each (re)dial that finds active
//! subscriptions spawns a replay task that resends them one per
//! `replay_interval`, in first-subscribed order. Every task observes the
//! same cancellation token.

use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::liveness::{LinkFault, LivenessConfig, LivenessMonitor, LivenessState};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{
    Dialer, Frame, FrameSink, FrameStream, MarketEventHandler, Transport, TransportError,
};
use crate::domain::subscription::{
    BOOK_TICKER_CHANNEL, InvalidStreamId, StreamId, SubscriptionRegistry, TRADE_CHANNEL,
};
use crate::infrastructure::binance::codec::{Inbound, PROBE_REPLY, ProtocolError, StreamCodec};
use crate::infrastructure::binance::messages::StreamRequest;
use crate::infrastructure::metrics;

// =============================================================================
// Error Type
// =============================================================================

/// Errors returned by [`ConnectionManager`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The manager has been closed.
    #[error("connection manager is closed")]
    Closed,

    /// A payload could not be serialized.
    #[error("failed to encode payload: {0}")]
    Encode(String),

    /// A stream identifier was malformed.
    #[error(transparent)]
    InvalidStream(#[from] InvalidStreamId),

    /// Automatic reconnection gave up; no further attempts will be made.
    #[error("reconnect budget exhausted after {attempts} attempts, last error: {last_error}")]
    RetriesExhausted {
        /// Redials attempted.
        attempts: u32,
        /// Failure of the final attempt.
        last_error: TransportError,
    },
}

// =============================================================================
// Configuration and Status
// =============================================================================

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Stream endpoint.
    pub url: String,
    /// Deadline for dial plus handshake.
    pub handshake_timeout: Duration,
    /// Backoff between redials.
    pub reconnect: ReconnectConfig,
    /// Silence tolerance and probe deadline.
    pub liveness: LivenessConfig,
    /// Spacing between replayed subscribe frames.
    pub replay_interval: Duration,
}

impl ConnectionConfig {
    /// Defaults for `url`: 10s handshake, 300ms replay spacing.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            handshake_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            liveness: LivenessConfig::default(),
            replay_interval: Duration::from_millis(300),
        }
    }
}

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No link, and none being established.
    Disconnected,
    /// Initial dial in progress.
    Connecting,
    /// Link up.
    Connected,
    /// Link lost; backing off and redialing.
    Reconnecting,
}

impl ConnectionStatus {
    /// Label for logs, metrics and the health endpoint.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Shared State
// =============================================================================

/// The live link. Status and writer are only ever changed together, under
/// one lock.
struct Link {
    status: ConnectionStatus,
    writer: Option<FrameSink>,
    generation: u64,
}

struct Inner {
    config: ConnectionConfig,
    dialer: Arc<dyn Dialer>,
    handler: Arc<dyn MarketEventHandler>,
    codec: StreamCodec,
    link: Mutex<Link>,
    status_tx: watch::Sender<ConnectionStatus>,
    subscriptions: SubscriptionRegistry,
    liveness: Arc<LivenessState>,
    cancel: CancellationToken,
    closed: AtomicBool,
    connect_lock: Mutex<()>,
    next_request_id: AtomicI64,
    fault_tx: parking_lot::Mutex<Option<mpsc::Sender<LinkFault>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    replay: parking_lot::Mutex<Option<JoinHandle<()>>>,
    terminal: parking_lot::Mutex<Option<ConnectionError>>,
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Handle to one managed streaming connection. Clones share the connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.inner.config.url)
            .field("status", &self.status())
            .field("subscriptions", &self.inner.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager. Nothing is dialed until [`connect`](Self::connect).
    #[must_use]
    pub fn new(
        config: ConnectionConfig,
        dialer: Arc<dyn Dialer>,
        handler: Arc<dyn MarketEventHandler>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                dialer,
                handler,
                codec: StreamCodec::new(),
                link: Mutex::new(Link {
                    status: ConnectionStatus::Disconnected,
                    writer: None,
                    generation: 0,
                }),
                status_tx,
                subscriptions: SubscriptionRegistry::new(),
                liveness: Arc::new(LivenessState::new()),
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
                connect_lock: Mutex::new(()),
                next_request_id: AtomicI64::new(1),
                fault_tx: parking_lot::Mutex::new(None),
                tasks: parking_lot::Mutex::new(Vec::new()),
                replay: parking_lot::Mutex::new(None),
                terminal: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Endpoint this manager dials.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    /// Receiver notified on every status change.
    #[must_use]
    pub fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// The error that ended automatic reconnection, if it has given up.
    #[must_use]
    pub fn terminal_error(&self) -> Option<ConnectionError> {
        self.inner.terminal.lock().clone()
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Active subscriptions in replay order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<StreamId> {
        self.inner.subscriptions.snapshot()
    }

    /// Establish the connection and start the reader and liveness tasks.
    ///
    /// A no-op while connected or reconnecting. Calling it after automatic
    /// reconnection gave up starts over with a fresh budget.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Transport`] if the dial is refused or times out
    /// - [`ConnectionError::Closed`] if the manager was closed
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let _serial = inner.connect_lock.lock().await;
        if inner.is_closed() {
            return Err(ConnectionError::Closed);
        }

        {
            let mut link = inner.link.lock().await;
            if link.status != ConnectionStatus::Disconnected {
                return Ok(());
            }
            inner.set_status(&mut link, ConnectionStatus::Connecting);
        }
        inner.tasks.lock().retain(|task| !task.is_finished());
        inner.terminal.lock().take();

        tracing::info!(url = %inner.config.url, "Connecting to stream");
        let transport = match inner.dial_once().await {
            Ok(transport) => transport,
            Err(e) => {
                let mut link = inner.link.lock().await;
                if link.status == ConnectionStatus::Connecting {
                    inner.set_status(&mut link, ConnectionStatus::Disconnected);
                }
                drop(link);
                tracing::warn!(url = %inner.config.url, error = %e, "Connect failed");
                return Err(e);
            }
        };

        let Transport { sink, stream } = transport;
        let generation = inner.install(sink).await?;

        let (fault_tx, fault_rx) = mpsc::channel(8);
        *inner.fault_tx.lock() = Some(fault_tx.clone());

        let session = inner.cancel.child_token();
        let monitor = LivenessMonitor::new(
            inner.config.liveness,
            Arc::clone(&inner.liveness),
            fault_tx,
            session.clone(),
        );
        let supervisor = Arc::clone(inner).supervise(stream, generation, fault_rx, session);

        let span = tracing::info_span!("stream_session", url = %inner.config.url);
        let mut tasks = inner.tasks.lock();
        tasks.push(tokio::spawn(supervisor.instrument(span.clone())));
        tasks.push(tokio::spawn(monitor.run().instrument(span)));
        drop(tasks);

        tracing::info!(url = %inner.config.url, "Connected to stream");
        Ok(())
    }

    /// Subscribe to `stream`.
    ///
    /// While connected the subscribe frame is sent immediately. While
    /// reconnecting the stream is recorded and sent by the replay that
    /// follows the redial. When disconnected, connects first.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Closed`] after [`close`](Self::close)
    /// - [`ConnectionError::RetriesExhausted`] if automatic reconnection gave up
    /// - [`ConnectionError::Transport`] if connecting or writing fails; a
    ///   failed write leaves the stream recorded for replay
    pub async fn subscribe(&self, stream: StreamId) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(ConnectionError::Closed);
        }
        if self.status() == ConnectionStatus::Disconnected {
            if let Some(err) = self.terminal_error() {
                return Err(err);
            }
            self.connect().await?;
        }

        let mut link = inner.link.lock().await;
        let added = inner.subscriptions.add(stream.clone());
        match link.status {
            ConnectionStatus::Connected => {
                let request = StreamRequest::subscribe(slice::from_ref(&stream), inner.next_id());
                tracing::info!(stream = %stream, id = request.id, "Subscribing");
                let text = inner.encode_request(&request)?;
                inner.write_locked(&mut link, Frame::Text(text)).await
            }
            ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => {
                tracing::info!(stream = %stream, status = %link.status, "Subscription recorded for replay");
                Ok(())
            }
            ConnectionStatus::Disconnected => {
                if added {
                    inner.subscriptions.remove(&stream);
                }
                Err(TransportError::NotConnected.into())
            }
        }
    }

    /// Subscribe to `<symbol>@trade`.
    ///
    /// # Errors
    ///
    /// See [`subscribe`](Self::subscribe).
    pub async fn subscribe_trade(&self, symbol: &str) -> Result<(), ConnectionError> {
        self.subscribe(StreamId::for_symbol(symbol, TRADE_CHANNEL)?)
            .await
    }

    /// Subscribe to `<symbol>@bookTicker`.
    ///
    /// # Errors
    ///
    /// See [`subscribe`](Self::subscribe).
    pub async fn subscribe_book_ticker(&self, symbol: &str) -> Result<(), ConnectionError> {
        self.subscribe(StreamId::for_symbol(symbol, BOOK_TICKER_CHANNEL)?)
            .await
    }

    /// Drop `stream` from the replay list and, if connected, send an
    /// unsubscribe frame. Returns whether the stream was active.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Closed`] after [`close`](Self::close)
    /// - [`ConnectionError::Transport`] if the unsubscribe frame fails to send
    pub async fn unsubscribe(&self, stream: &StreamId) -> Result<bool, ConnectionError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let mut link = inner.link.lock().await;
        let removed = inner.subscriptions.remove(stream);
        if removed && link.status == ConnectionStatus::Connected {
            let request = StreamRequest::unsubscribe(slice::from_ref(stream), inner.next_id());
            tracing::info!(stream = %stream, id = request.id, "Unsubscribing");
            let text = inner.encode_request(&request)?;
            inner.write_locked(&mut link, Frame::Text(text)).await?;
        }
        Ok(removed)
    }

    /// Serialize `payload` as JSON and write it as one text frame.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Encode`] if serialization fails
    /// - [`ConnectionError::Transport`] with [`TransportError::NotConnected`]
    ///   when there is no live link, or the write error
    /// - [`ConnectionError::Closed`] after [`close`](Self::close)
    pub async fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let text = encode(payload)?;
        let mut link = inner.link.lock().await;
        inner.write_locked(&mut link, Frame::Text(text)).await
    }

    /// Stop every task, close the transport and move to `Disconnected`.
    ///
    /// Idempotent: only the first call does anything.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(url = %inner.config.url, "Closing connection");
        inner.cancel.cancel();

        {
            let mut link = inner.link.lock().await;
            inner.liveness.disarm();
            if let Some(mut writer) = link.writer.take() {
                let deadline = inner.config.liveness.pong_deadline;
                if let Ok(Err(e)) = tokio::time::timeout(deadline, writer.send(Frame::Close)).await {
                    tracing::debug!(error = %e, "Close frame not delivered");
                }
            }
            inner.set_status(&mut link, ConnectionStatus::Disconnected);
        }
        inner.fault_tx.lock().take();

        let mut tasks = std::mem::take(&mut *inner.tasks.lock());
        tasks.extend(inner.replay.lock().take());
        for task in tasks {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                tracing::warn!(error = %e, "Connection task ended abnormally");
            }
        }
        tracing::info!(url = %inner.config.url, "Connection closed");
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> i64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn set_status(&self, link: &mut Link, status: ConnectionStatus) {
        if link.status == status {
            return;
        }
        tracing::debug!(from = %link.status, to = %status, "Connection status changed");
        link.status = status;
        self.status_tx.send_replace(status);
        metrics::set_connection_status(status);
    }

    /// Write one frame on the held link. A failed write is reported to the
    /// supervisor so the link is torn down and redialed.
    async fn write_locked(&self, link: &mut Link, frame: Frame) -> Result<(), ConnectionError> {
        let generation = link.generation;
        let Some(writer) = link.writer.as_mut() else {
            return Err(TransportError::NotConnected.into());
        };
        if let Err(e) = writer.send(frame).await {
            self.report_fault(generation, e.clone());
            return Err(e.into());
        }
        Ok(())
    }

    async fn write_frame(&self, frame: Frame) -> Result<(), ConnectionError> {
        let mut link = self.link.lock().await;
        self.write_locked(&mut link, frame).await
    }

    fn report_fault(&self, generation: u64, error: TransportError) {
        if let Some(tx) = self.fault_tx.lock().as_ref()
            && tx.try_send(LinkFault { generation, error }).is_err()
        {
            tracing::debug!(generation, "Fault channel full, fault already pending");
        }
    }

    async fn dial_once(&self) -> Result<Transport, ConnectionError> {
        let timeout = self.config.handshake_timeout;
        let dial = tokio::time::timeout(timeout, self.dialer.dial(&self.config.url));
        let result = tokio::select! {
            () = self.cancel.cancelled() => return Err(ConnectionError::Closed),
            result = dial => result,
        };
        let outcome = match result {
            Ok(Ok(transport)) => Ok(transport),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::HandshakeTimeout(timeout)),
        };
        metrics::record_dial(outcome.is_ok());
        outcome.map_err(ConnectionError::from)
    }

    /// Make `sink` the live writer, mark the link connected and replay the
    /// active subscriptions. Returns the new link generation.
    async fn install(self: &Arc<Self>, sink: FrameSink) -> Result<u64, ConnectionError> {
        let mut link = self.link.lock().await;
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        link.generation += 1;
        link.writer = Some(sink);
        let generation = link.generation;
        self.set_status(&mut link, ConnectionStatus::Connected);
        self.liveness.arm(generation);
        let streams = self.subscriptions.snapshot();
        drop(link);

        self.spawn_replay(streams);
        Ok(generation)
    }

    // -------------------------------------------------------------------------
    // Supervisor: read loop + reconnect
    // -------------------------------------------------------------------------

    async fn supervise(
        self: Arc<Self>,
        mut stream: FrameStream,
        mut generation: u64,
        mut faults: mpsc::Receiver<LinkFault>,
        session: CancellationToken,
    ) {
        loop {
            let Some(cause) = self.read_until_failure(&mut stream, generation, &mut faults).await
            else {
                break;
            };
            drop(stream);
            tracing::warn!(url = %self.config.url, error = %cause, "Stream link lost");

            match self.reconnect(cause).await {
                Some((next_stream, next_generation)) => {
                    stream = next_stream;
                    generation = next_generation;
                }
                None => break,
            }
        }
        session.cancel();
        tracing::debug!("Connection supervisor stopped");
    }

    /// Returns the failure that ended the link, or `None` on cancellation.
    async fn read_until_failure(
        &self,
        stream: &mut FrameStream,
        generation: u64,
        faults: &mut mpsc::Receiver<LinkFault>,
    ) -> Option<TransportError> {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return None,
                Some(fault) = faults.recv() => {
                    if fault.generation == generation {
                        return Some(fault.error);
                    }
                    tracing::trace!(stale = fault.generation, current = generation, "Stale link fault ignored");
                }
                frame = stream.next() => match frame {
                    None => return Some(TransportError::ConnectionClosed),
                    Some(Err(e)) => return Some(e),
                    Some(Ok(frame)) => {
                        self.liveness.record_inbound();
                        if let Err(e) = self.on_frame(frame).await {
                            return Some(e);
                        }
                    }
                },
            }
        }
    }

    async fn on_frame(&self, frame: Frame) -> Result<(), TransportError> {
        match frame {
            Frame::Text(text) => match self.codec.decode(&text) {
                Ok(Inbound::Event(event)) => {
                    metrics::record_frame(event.kind());
                    if let Err(e) = self.handler.handle(event) {
                        tracing::warn!(error = %e, "Event handler failed");
                    }
                }
                Ok(Inbound::Ack { id }) => {
                    metrics::record_frame("ack");
                    tracing::debug!(id, "Control request acknowledged");
                }
                Ok(Inbound::Rejected { id, error }) => {
                    metrics::record_frame("rejected");
                    tracing::warn!(id, code = error.code, msg = %error.msg, "Control request rejected");
                }
                Ok(Inbound::Probe) => {
                    metrics::record_frame("probe");
                    self.answer_probe(Frame::Text(PROBE_REPLY.to_string())).await?;
                }
                Err(e) => drop_malformed(&e),
            },
            Frame::Ping(payload) => {
                metrics::record_frame("probe");
                self.answer_probe(Frame::Pong(payload)).await?;
            }
            Frame::Pong(_) => tracing::trace!("Pong received"),
            Frame::Binary(bytes) => drop_malformed(&ProtocolError::UnexpectedBinary { len: bytes.len() }),
            Frame::Close => {
                tracing::info!("Remote sent close frame");
                return Err(TransportError::ConnectionClosed);
            }
        }
        Ok(())
    }

    /// Reply to a liveness probe within the pong deadline.
    async fn answer_probe(&self, reply: Frame) -> Result<(), TransportError> {
        let deadline = self.config.liveness.pong_deadline;
        match tokio::time::timeout(deadline, self.write_frame(reply)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(ConnectionError::Transport(e))) => Err(e),
            Ok(Err(e)) => Err(TransportError::Write(e.to_string())),
            Err(_) => Err(TransportError::Write(format!(
                "probe reply not written within {deadline:?}"
            ))),
        }
    }

    /// Back off and redial until a link is up, the budget is spent or the
    /// manager is closed.
    #[tracing::instrument(name = "reconnect", skip_all, fields(cause = %cause))]
    async fn reconnect(
        self: &Arc<Self>,
        cause: TransportError,
    ) -> Option<(FrameStream, u64)> {
        {
            let mut link = self.link.lock().await;
            if self.is_closed() {
                return None;
            }
            self.liveness.disarm();
            link.writer = None;
            self.set_status(&mut link, ConnectionStatus::Reconnecting);
        }
        if let Some(replay) = self.replay.lock().take() {
            replay.abort();
        }

        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());
        let mut last_error = cause;
        loop {
            let Some(delay) = policy.next_delay() else {
                self.give_up(policy.attempts(), last_error).await;
                return None;
            };
            let attempt = policy.attempts();
            metrics::record_reconnect_attempt();
            tracing::info!(
                attempt,
                max_attempts = self.config.reconnect.max_attempts,
                delay_ms = delay.as_millis(),
                "Reconnecting to stream"
            );

            tokio::select! {
                () = self.cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }

            match self.dial_once().await {
                Ok(Transport { sink, stream }) => {
                    let generation = self.install(sink).await.ok()?;
                    tracing::info!(attempt, url = %self.config.url, "Reconnected to stream");
                    return Some((stream, generation));
                }
                Err(ConnectionError::Transport(e)) => {
                    tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
                    last_error = e;
                }
                Err(_) => return None,
            }
        }
    }

    async fn give_up(&self, attempts: u32, last_error: TransportError) {
        let error = ConnectionError::RetriesExhausted {
            attempts,
            last_error,
        };
        tracing::error!(
            url = %self.config.url,
            error = %error,
            "Reconnect budget exhausted, connection permanently down"
        );
        *self.terminal.lock() = Some(error);

        let mut link = self.link.lock().await;
        self.set_status(&mut link, ConnectionStatus::Disconnected);
    }

    // -------------------------------------------------------------------------
    // Replay
    // -------------------------------------------------------------------------

    fn encode_request(&self, request: &StreamRequest) -> Result<String, ConnectionError> {
        self.codec
            .encode(request)
            .map_err(|e| ConnectionError::Encode(e.to_string()))
    }

    fn spawn_replay(self: &Arc<Self>, streams: Vec<StreamId>) {
        if streams.is_empty() {
            return;
        }
        let mut slot = self.replay.lock();
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        let inner = Arc::clone(self);
        let span = tracing::info_span!("replay", count = streams.len());
        *slot = Some(tokio::spawn(
            async move { inner.replay(streams).await }.instrument(span),
        ));
    }

    /// Resend `streams` in order, one per replay interval. A failed send is
    /// logged and skipped.
    async fn replay(&self, streams: Vec<StreamId>) {
        let mut pacer = tokio::time::interval(self.config.replay_interval);
        pacer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(count = streams.len(), "Replaying subscriptions");

        let mut sent = 0_usize;
        for stream in &streams {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                _ = pacer.tick() => {}
            }
            if !self.subscriptions.contains(stream) {
                continue;
            }

            let request = StreamRequest::subscribe(slice::from_ref(stream), self.next_id());
            let result = match self.encode_request(&request) {
                Ok(text) => self.write_frame(Frame::Text(text)).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    sent += 1;
                    metrics::record_replayed_subscription();
                    tracing::debug!(stream = %stream, id = request.id, "Subscription replayed");
                }
                Err(e) => {
                    tracing::warn!(stream = %stream, error = %e, "Replay send failed, skipping");
                }
            }
        }
        tracing::info!(sent, total = streams.len(), "Subscription replay finished");
    }
}

fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<String, ConnectionError> {
    serde_json::to_string(payload).map_err(|e| ConnectionError::Encode(e.to_string()))
}

fn drop_malformed(error: &ProtocolError) {
    metrics::record_protocol_error();
    tracing::warn!(error = %error, "Dropping malformed frame");
}
