//! Application Layer - Use cases and port definitions.
//!
//! Services that hold the ingestion pipeline's state (router, order cache)
//! and the ports they reach the outside world through.

/// Port interfaces for the transport, the durable store and event handlers.
pub mod ports;

/// Message routing, order caching and event dispatch.
pub mod services;
