//! Domain Layer - Core ingestion types.
//!
//! Pure data types with no I/O: orders, stream identifiers and the
//! market events decoded from the wire.

/// Market events produced by the stream decoder.
pub mod events;

/// Cached order entity and its enumerations.
pub mod order;

/// Stream identifiers and the subscription replay registry.
pub mod subscription;
