//! Port Interfaces
//!
//! Contracts between the ingestion core and the outside world, following
//! the Hexagonal Architecture pattern. Infrastructure adapters implement
//! these; tests substitute scripted or mocked versions.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`Dialer`]: opens a frame transport to a stream endpoint
//! - [`OrderStore`]: durable hash/set store backing the order cache
//!
//! ## Driver Ports (Inbound)
//!
//! - [`MarketEventHandler`]: receives every decoded event from the reader loop

mod event_handler;
mod order_store;
mod transport;

pub use event_handler::{HandlerError, MarketEventHandler};
#[cfg(test)]
pub use order_store::MockOrderStore;
pub use order_store::{OrderStore, StoreError, StoreKeys};
pub use transport::{Dialer, Frame, FrameSink, FrameStream, Transport, TransportError};
