//! Event Handler Port (Driver Port)
//!
//! Receives decoded events from the connection reader loop. Handlers run
//! synchronously on the reader task; a slow handler delays the next frame.

use crate::domain::events::MarketEvent;

/// Error returned by a handler. Logged by the caller; never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// The handler could not process the event.
    #[error("handler rejected {kind} event: {reason}")]
    Rejected {
        /// Event kind label.
        kind: &'static str,
        /// Human-readable reason.
        reason: String,
    },
}

/// Consumer of decoded market events.
pub trait MarketEventHandler: Send + Sync {
    /// Handle one event.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] when the event could not be processed. The
    /// reader loop logs it and continues.
    fn handle(&self, event: MarketEvent) -> Result<(), HandlerError>;
}

impl<F> MarketEventHandler for F
where
    F: Fn(MarketEvent) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, event: MarketEvent) -> Result<(), HandlerError> {
        self(event)
    }
}
