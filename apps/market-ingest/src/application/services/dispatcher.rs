//! Event Dispatcher
//!
//! Bridges the connection reader loop to the message router: every decoded
//! event is sent to the endpoint named after its kind.

use std::sync::Arc;

use super::router::MessageRouter;
use crate::application::ports::{HandlerError, MarketEventHandler};
use crate::domain::events::MarketEvent;

pub use super::order_cache::{ORDER_INITIALIZED_ENDPOINT, ORDER_STATUS_UPDATE_ENDPOINT};

/// Router endpoint carrying [`MarketEvent::Trade`].
pub const TRADE_ENDPOINT: &str = "trade";

/// Router endpoint carrying [`MarketEvent::BookTicker`].
pub const BOOK_TICKER_ENDPOINT: &str = "bookTicker";

/// Router endpoint carrying [`MarketEvent::Unrecognized`].
pub const UNRECOGNIZED_ENDPOINT: &str = "unrecognized";

/// Endpoint an event is routed to.
#[must_use]
pub const fn endpoint_for(event: &MarketEvent) -> &'static str {
    match event {
        MarketEvent::Trade(_) => TRADE_ENDPOINT,
        MarketEvent::BookTicker(_) => BOOK_TICKER_ENDPOINT,
        MarketEvent::OrderInitialized(_) => ORDER_INITIALIZED_ENDPOINT,
        MarketEvent::OrderStatusUpdate(_) => ORDER_STATUS_UPDATE_ENDPOINT,
        MarketEvent::Unrecognized { .. } => UNRECOGNIZED_ENDPOINT,
    }
}

/// [`MarketEventHandler`] that forwards into a [`MessageRouter`].
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    router: Arc<MessageRouter<MarketEvent>>,
}

impl EventDispatcher {
    /// Dispatch into `router`.
    #[must_use]
    pub const fn new(router: Arc<MessageRouter<MarketEvent>>) -> Self {
        Self { router }
    }

    /// The router events are sent to.
    #[must_use]
    pub const fn router(&self) -> &Arc<MessageRouter<MarketEvent>> {
        &self.router
    }
}

impl MarketEventHandler for EventDispatcher {
    fn handle(&self, event: MarketEvent) -> Result<(), HandlerError> {
        self.router.send(endpoint_for(&event), &event);
        Ok(())
    }
}
