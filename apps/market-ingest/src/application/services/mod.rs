//! Application Services
//!
//! - [`router`]: named-endpoint message router with request/response correlation
//! - [`order_cache`]: in-memory order views synchronized to the durable store
//! - [`dispatcher`]: routes decoded market events to router endpoints

pub mod dispatcher;
pub mod order_cache;
pub mod router;

pub use dispatcher::EventDispatcher;
pub use order_cache::{CacheConfig, CacheError, CacheStats, OrderCache, SyncError, SyncTask};
pub use router::{Delivery, Handler, MessageRouter, Request, Response, RouterError, RouterStats};
