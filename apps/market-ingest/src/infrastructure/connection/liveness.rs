//! Liveness Monitor
//!
//! Detects a silently dead link. The reader stamps every inbound frame; the
//! monitor wakes on a short interval and reports a [`LinkFault`] once the
//! link has been silent for longer than the read timeout.
//!
//! The monitor only reports while the state is armed. Arming happens when a
//! link is installed; reporting disarms, so one dead link yields one fault.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::TransportError;

/// Liveness timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Silence tolerated before the link is declared dead.
    pub read_timeout: Duration,
    /// Deadline for answering a probe. Strictly shorter than `read_timeout`.
    pub pong_deadline: Duration,
    /// How often the monitor checks.
    pub check_interval: Duration,
}

impl LivenessConfig {
    /// Config with a check interval derived from the read timeout.
    #[must_use]
    pub fn new(read_timeout: Duration, pong_deadline: Duration) -> Self {
        Self {
            read_timeout,
            pong_deadline,
            check_interval: (read_timeout / 10).clamp(Duration::from_millis(10), Duration::from_secs(5)),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(600), Duration::from_secs(5))
    }
}

/// A link-level failure reported out of band, tagged with the link it
/// belongs to so stale reports can be ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFault {
    /// Link generation the fault was observed on.
    pub generation: u64,
    /// What went wrong.
    pub error: TransportError,
}

/// State shared between the reader and the monitor.
#[derive(Debug)]
pub struct LivenessState {
    last_inbound: RwLock<Instant>,
    generation: AtomicU64,
    armed: AtomicBool,
}

impl Default for LivenessState {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessState {
    /// Disarmed state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_inbound: RwLock::new(Instant::now()),
            generation: AtomicU64::new(0),
            armed: AtomicBool::new(false),
        }
    }

    /// Start watching link `generation`, counting silence from now.
    pub fn arm(&self, generation: u64) {
        *self.last_inbound.write() = Instant::now();
        self.generation.store(generation, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Stop watching. Returns whether it was armed.
    pub fn disarm(&self) -> bool {
        self.armed.swap(false, Ordering::SeqCst)
    }

    /// Whether a link is being watched.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Generation of the watched link.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Stamp an inbound frame.
    pub fn record_inbound(&self) {
        *self.last_inbound.write() = Instant::now();
    }

    /// Time since the last inbound frame (or arming).
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_inbound.read().elapsed()
    }
}

/// Background task body that turns prolonged silence into a [`LinkFault`].
pub struct LivenessMonitor {
    config: LivenessConfig,
    state: Arc<LivenessState>,
    fault_tx: mpsc::Sender<LinkFault>,
    cancel: CancellationToken,
}

impl LivenessMonitor {
    /// Create a monitor. Nothing runs until [`run`](Self::run) is awaited.
    #[must_use]
    pub const fn new(
        config: LivenessConfig,
        state: Arc<LivenessState>,
        fault_tx: mpsc::Sender<LinkFault>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            fault_tx,
            cancel,
        }
    }

    /// Run until cancelled or the fault receiver is gone.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Liveness monitor cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if !self.check().await {
                        tracing::debug!("Fault channel closed, stopping liveness monitor");
                        break;
                    }
                }
            }
        }
    }

    /// Returns `false` when the fault channel is closed.
    async fn check(&self) -> bool {
        if !self.state.is_armed() {
            return true;
        }
        let silence = self.state.silence();
        if silence <= self.config.read_timeout || !self.state.disarm() {
            return true;
        }

        tracing::warn!(
            silence_ms = silence.as_millis(),
            read_timeout_ms = self.config.read_timeout.as_millis(),
            "Liveness timeout, link considered dead"
        );
        let fault = LinkFault {
            generation: self.state.generation(),
            error: TransportError::LivenessTimeout(self.config.read_timeout),
        };
        self.fault_tx.send(fault).await.is_ok()
    }
}
