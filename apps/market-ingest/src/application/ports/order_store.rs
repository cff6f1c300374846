//! Order Store Port (Driven Port)
//!
//! Durable key-value store holding the lagging snapshot of the order cache.
//! Modeled on hash and set primitives:
//!
//! - `<namespace>:orders` - hash, field = order ID, value = serialized order
//! - `<namespace>:open_orders` - set of open order IDs
//! - `<namespace>:symbol_orders:<symbol>` - set of order IDs per symbol
//!
//! where `<namespace>` is `<strategy>:<user>:<accountType>`.

use async_trait::async_trait;

/// Durable-store failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The key or hash field does not exist. Callers treat this as a miss.
    #[error("key not found: {key}")]
    NotFound {
        /// Key (and field, for hashes) that was looked up.
        key: String,
    },

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A value could not be encoded for storage.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Any other backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether this is a confirmed "not present" response.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Durable hash/set store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Set many fields of a hash in one round trip.
    async fn hset_many(&self, key: &str, fields: Vec<(String, String)>) -> Result<(), StoreError>;

    /// Read one hash field. Missing key or field is [`StoreError::NotFound`].
    async fn hget(&self, key: &str, field: &str) -> Result<String, StoreError>;

    /// Read all members of a set. A missing key may be reported as
    /// [`StoreError::NotFound`] or as an empty set.
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Add members to a set.
    async fn sadd(&self, key: &str, members: Vec<String>) -> Result<(), StoreError>;

    /// Delete a key of any type. Deleting a missing key succeeds.
    async fn del(&self, key: &str) -> Result<(), StoreError>;
}

/// Deterministic key namespace for one strategy/user/account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    /// Build the namespace `<strategy>:<user>:<account_type>`.
    #[must_use]
    pub fn new(strategy_id: &str, user_id: &str, account_type: &str) -> Self {
        Self {
            prefix: format!("{strategy_id}:{user_id}:{account_type}"),
        }
    }

    /// Namespace prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Hash of serialized orders.
    #[must_use]
    pub fn orders(&self) -> String {
        format!("{}:orders", self.prefix)
    }

    /// Set of open order IDs.
    #[must_use]
    pub fn open_orders(&self) -> String {
        format!("{}:open_orders", self.prefix)
    }

    /// Set of order IDs seen for `symbol`.
    #[must_use]
    pub fn symbol_orders(&self, symbol: &str) -> String {
        format!("{}:symbol_orders:{symbol}", self.prefix)
    }
}
