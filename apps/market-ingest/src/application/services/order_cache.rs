//! Order Cache
//!
//! Authoritative in-memory view of orders plus derived indices, flushed to
//! an [`OrderStore`] on a fixed cadence and evicted by age.
//!
//! # Views
//!
//! - primary map: order ID -> latest order
//! - open set: IDs of orders that are not terminal
//! - symbol index: symbol -> every order ID seen for it
//! - symbol open index: symbol -> open order IDs
//!
//! All four live behind a single lock and are mutated together, so every
//! index entry always refers to a live entry in the primary map.
//!
//! # Background tasks
//!
//! [`OrderCache::start`] spawns a sync ticker and a cleanup ticker. Both
//! observe one cancellation token; [`OrderCache::shutdown`] cancels it,
//! waits for both, then runs a final sync and returns its result.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::router::{Delivery, Handler, MessageRouter, RouterError};
use crate::application::ports::{OrderStore, StoreError, StoreKeys};
use crate::domain::events::MarketEvent;
use crate::domain::order::Order;
use crate::infrastructure::metrics;

/// Router endpoint carrying [`MarketEvent::OrderInitialized`].
pub const ORDER_INITIALIZED_ENDPOINT: &str = "order.initialized";

/// Router endpoint carrying [`MarketEvent::OrderStatusUpdate`].
pub const ORDER_STATUS_UPDATE_ENDPOINT: &str = "order.status_update";

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced by cache reads that fall through to the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The durable store failed.
    #[error("{operation}: {source}")]
    Store {
        /// Cache operation that hit the store.
        operation: &'static str,
        /// Underlying store failure.
        #[source]
        source: StoreError,
    },

    /// A stored order could not be decoded.
    #[error("stored order {id} is not valid JSON: {reason}")]
    Deserialize {
        /// Order ID.
        id: String,
        /// Decoder message.
        reason: String,
    },
}

/// Sync sub-task identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTask {
    /// Write every order into the orders hash.
    Orders,
    /// Replace the open-order set.
    OpenOrders,
    /// Add order IDs to the per-symbol sets.
    SymbolOrders,
}

impl SyncTask {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::OpenOrders => "open_orders",
            Self::SymbolOrders => "symbol_orders",
        }
    }
}

impl std::fmt::Display for SyncTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed sub-task of a sync round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    /// Which sub-task failed.
    pub task: SyncTask,
    /// Why.
    pub error: StoreError,
}

/// Aggregate failure of a sync round. Holds at least one failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sync failed in {} sub-task(s); first: {}: {}", .failures.len(), .failures[0].task, .failures[0].error)]
pub struct SyncError {
    failures: Vec<SyncFailure>,
}

impl SyncError {
    fn from_failures(failures: Vec<SyncFailure>) -> Option<Self> {
        if failures.is_empty() {
            None
        } else {
            Some(Self { failures })
        }
    }

    /// The first failure encountered.
    #[must_use]
    pub fn first(&self) -> &SyncFailure {
        &self.failures[0]
    }

    /// Every failed sub-task, in sub-task order.
    #[must_use]
    pub fn failures(&self) -> &[SyncFailure] {
        &self.failures
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Store key namespace.
    pub keys: StoreKeys,
    /// Period of the sync ticker.
    pub sync_interval: Duration,
    /// Period of the cleanup ticker.
    pub cleanup_interval: Duration,
    /// Age, relative to an order's own timestamp, after which it is evicted
    /// from memory.
    pub order_ttl: Duration,
}

impl CacheConfig {
    /// Config with the default cadence: sync and cleanup every 5s, 24h TTL.
    #[must_use]
    pub const fn new(keys: StoreKeys) -> Self {
        Self {
            keys,
            sync_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(5),
            order_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

// =============================================================================
// Views
// =============================================================================

#[derive(Debug, Default)]
struct Views {
    orders: HashMap<String, Order>,
    open: HashSet<String>,
    symbol_orders: HashMap<String, HashSet<String>>,
    symbol_open: HashMap<String, HashSet<String>>,
}

impl Views {
    /// Insert a new order. It joins the open indices unless it is already
    /// terminal.
    fn initialize(&mut self, order: Order) {
        let id = order.id.clone();
        let symbol = order.symbol.clone();
        let open = !order.is_terminal();
        self.place(order);

        if open {
            self.open.insert(id.clone());
            self.symbol_open.entry(symbol).or_default().insert(id);
        }
    }

    /// Replace an order's payload. Open membership can only be lost here:
    /// a terminal status removes the ID, and no status ever adds it.
    fn apply_update(&mut self, order: Order) {
        let id = order.id.clone();
        let symbol = order.symbol.clone();
        let terminal = order.is_terminal();
        self.place(order);

        if terminal {
            self.open.remove(&id);
            remove_member(&mut self.symbol_open, &symbol, &id);
        }
    }

    /// Put an order fetched from the store into the primary map and symbol
    /// index. The open indices are left to events.
    fn hydrate(&mut self, order: Order) {
        self.place(order);
    }

    /// Store `order` in the primary map and symbol index, moving index
    /// entries if its symbol changed.
    fn place(&mut self, order: Order) {
        let id = order.id.clone();
        let symbol = order.symbol.clone();

        if let Some(previous) = self.orders.insert(id.clone(), order)
            && previous.symbol != symbol
        {
            remove_member(&mut self.symbol_orders, &previous.symbol, &id);
            if remove_member(&mut self.symbol_open, &previous.symbol, &id) {
                self.symbol_open
                    .entry(symbol.clone())
                    .or_default()
                    .insert(id.clone());
            }
        }

        self.symbol_orders.entry(symbol).or_default().insert(id);
    }

    fn evict(&mut self, id: &str) -> Option<Order> {
        let order = self.orders.remove(id)?;
        self.unindex(id, &order.symbol);
        Some(order)
    }

    fn unindex(&mut self, id: &str, symbol: &str) {
        self.open.remove(id);
        remove_member(&mut self.symbol_orders, symbol, id);
        remove_member(&mut self.symbol_open, symbol, id);
    }
}

/// Remove `id` from `symbol`'s members, dropping the entry once empty.
/// Returns whether the ID was present.
fn remove_member(index: &mut HashMap<String, HashSet<String>>, symbol: &str, id: &str) -> bool {
    let Some(members) = index.get_mut(symbol) else {
        return false;
    };
    let removed = members.remove(id);
    if members.is_empty() {
        index.remove(symbol);
    }
    removed
}

/// Point-in-time copy of what a sync round writes.
struct SyncSnapshot {
    orders: Vec<(String, String)>,
    open: Vec<String>,
    by_symbol: Vec<(String, Vec<String>)>,
}

/// Cache size counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    /// Orders in the primary map.
    pub orders: usize,
    /// Open orders.
    pub open_orders: usize,
    /// Symbols with at least one cached order.
    pub symbols: usize,
}

// =============================================================================
// Cache
// =============================================================================

/// Dual-tier order cache.
pub struct OrderCache {
    config: CacheConfig,
    store: Arc<dyn OrderStore>,
    views: RwLock<Views>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    handlers: Mutex<Option<(Handler<MarketEvent>, Handler<MarketEvent>)>>,
}

impl std::fmt::Debug for OrderCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderCache")
            .field("keys", &self.config.keys)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl OrderCache {
    /// Create a cache over `store`. Background tasks are not started.
    #[must_use]
    pub fn new(config: CacheConfig, store: Arc<dyn OrderStore>) -> Self {
        Self {
            config,
            store,
            views: RwLock::new(Views::default()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            handlers: Mutex::new(None),
        }
    }

    /// Store key namespace.
    #[must_use]
    pub const fn keys(&self) -> &StoreKeys {
        &self.config.keys
    }

    // -------------------------------------------------------------------------
    // Event handling
    // -------------------------------------------------------------------------

    /// Record a newly initialized order. First write wins: an ID already in
    /// memory is left untouched.
    pub fn order_initialized(&self, order: Order) {
        let mut views = self.views.write();
        if views.orders.contains_key(&order.id) {
            tracing::trace!(order_id = %order.id, "Order already initialized");
            return;
        }
        tracing::debug!(order_id = %order.id, symbol = %order.symbol, status = %order.status, "Order initialized");
        views.initialize(order);
    }

    /// Apply a status update. Always replaces the cached payload; terminal
    /// statuses leave the open indices while the symbol index keeps the ID.
    /// Updates never make an order open, so a stale non-terminal update
    /// arriving after a terminal one cannot reopen it.
    pub fn order_status_update(&self, order: Order) {
        tracing::debug!(order_id = %order.id, status = %order.status, "Order status update");
        self.views.write().apply_update(order);
    }

    /// Bind the order endpoints on `router` so order events flow into this
    /// cache.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateEndpoint`] if either endpoint is already
    /// bound; nothing is registered in that case.
    pub fn register_endpoints(
        self: &Arc<Self>,
        router: &MessageRouter<MarketEvent>,
    ) -> Result<(), RouterError> {
        let cache = Arc::downgrade(self);
        let initialized = Handler::new(move |delivery: Delivery<'_, MarketEvent>| {
            if let (Some(cache), MarketEvent::OrderInitialized(order)) =
                (cache.upgrade(), delivery.message)
            {
                cache.order_initialized(order.clone());
            }
        });

        let cache = Arc::downgrade(self);
        let status_update = Handler::new(move |delivery: Delivery<'_, MarketEvent>| {
            if let (Some(cache), MarketEvent::OrderStatusUpdate(order)) =
                (cache.upgrade(), delivery.message)
            {
                cache.order_status_update(order.clone());
            }
        });

        router.register(ORDER_INITIALIZED_ENDPOINT, initialized.clone())?;
        if let Err(e) = router.register(ORDER_STATUS_UPDATE_ENDPOINT, status_update.clone()) {
            if let Err(rollback) = router.deregister(ORDER_INITIALIZED_ENDPOINT, &initialized) {
                tracing::warn!(
                    endpoint = ORDER_INITIALIZED_ENDPOINT,
                    error = %rollback,
                    "Failed to roll back endpoint registration"
                );
            }
            return Err(e);
        }

        *self.handlers.lock() = Some((initialized, status_update));
        Ok(())
    }

    /// Undo [`register_endpoints`](Self::register_endpoints).
    ///
    /// # Errors
    ///
    /// Returns the router's error if the endpoints are not bound to this
    /// cache's handlers.
    pub fn deregister_endpoints(&self, router: &MessageRouter<MarketEvent>) -> Result<(), RouterError> {
        let Some((initialized, status_update)) = self.handlers.lock().take() else {
            return Err(RouterError::UnknownEndpoint(
                ORDER_INITIALIZED_ENDPOINT.to_string(),
            ));
        };
        let first = router.deregister(ORDER_INITIALIZED_ENDPOINT, &initialized);
        let second = router.deregister(ORDER_STATUS_UPDATE_ENDPOINT, &status_update);
        first.and(second)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Memory-only lookup.
    #[must_use]
    pub fn cached_order(&self, id: &str) -> Option<Order> {
        self.views.read().orders.get(id).cloned()
    }

    /// Memory first, then the store. A store hit is cached before returning;
    /// a confirmed miss is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Store`] on any store failure other than "not found"
    /// - [`CacheError::Deserialize`] if the stored value is not a valid order
    pub async fn get_order(&self, id: &str) -> Result<Option<Order>, CacheError> {
        if let Some(order) = self.cached_order(id) {
            return Ok(Some(order));
        }

        let raw = match self.store.hget(&self.config.keys.orders(), id).await {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(source) => {
                return Err(CacheError::Store {
                    operation: "get_order",
                    source,
                });
            }
        };

        let order: Order = serde_json::from_str(&raw).map_err(|e| CacheError::Deserialize {
            id: id.to_string(),
            reason: e.to_string(),
        })?;

        let mut views = self.views.write();
        // An event may have landed while the store was queried; it is newer.
        if let Some(current) = views.orders.get(id) {
            return Ok(Some(current.clone()));
        }
        views.hydrate(order.clone());
        drop(views);

        tracing::debug!(order_id = id, "Order hydrated from store");
        Ok(Some(order))
    }

    /// Order IDs seen for `symbol`. Unless `memory_only`, the durable
    /// per-symbol set is unioned in; a missing set counts as empty.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the store read fails.
    pub async fn get_symbol_orders(
        &self,
        symbol: &str,
        memory_only: bool,
    ) -> Result<BTreeSet<String>, CacheError> {
        let mut ids: BTreeSet<String> = self
            .views
            .read()
            .symbol_orders
            .get(symbol)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();

        if memory_only {
            return Ok(ids);
        }

        match self.store.smembers(&self.config.keys.symbol_orders(symbol)).await {
            Ok(members) => ids.extend(members),
            Err(e) if e.is_not_found() => {}
            Err(source) => {
                return Err(CacheError::Store {
                    operation: "get_symbol_orders",
                    source,
                });
            }
        }
        Ok(ids)
    }

    /// Open orders, globally or for one symbol, sorted by ID.
    #[must_use]
    pub fn get_open_orders(&self, symbol: Option<&str>) -> Vec<Order> {
        let views = self.views.read();
        let ids: Box<dyn Iterator<Item = &String>> = match symbol {
            None => Box::new(views.open.iter()),
            Some(symbol) => match views.symbol_open.get(symbol) {
                Some(ids) => Box::new(ids.iter()),
                None => return Vec::new(),
            },
        };
        let mut orders: Vec<Order> = ids.filter_map(|id| views.orders.get(id).cloned()).collect();
        drop(views);
        orders.sort_by(|a, b| a.id.cmp(&b.id));
        orders
    }

    /// Current sizes.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let views = self.views.read();
        CacheStats {
            orders: views.orders.len(),
            open_orders: views.open.len(),
            symbols: views.symbol_orders.len(),
        }
    }

    // -------------------------------------------------------------------------
    // Sync and cleanup
    // -------------------------------------------------------------------------

    /// Flush memory to the store.
    ///
    /// Sub-tasks run concurrently and all run to completion: the orders hash
    /// is written, the open set is cleared and refilled, and every ID is added
    /// to its per-symbol set. Nothing already written is rolled back on
    /// failure; the next round starts from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] listing every failed sub-task.
    #[tracing::instrument(skip(self), fields(namespace = %self.config.keys.prefix()))]
    pub async fn sync_now(&self) -> Result<(), SyncError> {
        let snapshot = self.snapshot()?;
        let keys = &self.config.keys;

        let (orders, open, by_symbol) = tokio::join!(
            self.sync_orders(keys, snapshot.orders),
            self.sync_open_orders(keys, snapshot.open),
            self.sync_symbol_orders(keys, snapshot.by_symbol),
        );

        let failures: Vec<SyncFailure> = [
            (SyncTask::Orders, orders),
            (SyncTask::OpenOrders, open),
            (SyncTask::SymbolOrders, by_symbol),
        ]
        .into_iter()
        .filter_map(|(task, result)| result.err().map(|error| SyncFailure { task, error }))
        .collect();

        metrics::record_cache_sync(failures.is_empty());
        match SyncError::from_failures(failures) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    fn snapshot(&self) -> Result<SyncSnapshot, SyncError> {
        let views = self.views.read();

        let mut orders = Vec::with_capacity(views.orders.len());
        for (id, order) in &views.orders {
            match serde_json::to_string(order) {
                Ok(json) => orders.push((id.clone(), json)),
                Err(e) => {
                    return Err(SyncError {
                        failures: vec![SyncFailure {
                            task: SyncTask::Orders,
                            error: StoreError::Serialization(e.to_string()),
                        }],
                    });
                }
            }
        }

        let open = views.open.iter().cloned().collect();
        let by_symbol = views
            .symbol_orders
            .iter()
            .map(|(symbol, ids)| (symbol.clone(), ids.iter().cloned().collect()))
            .collect();

        Ok(SyncSnapshot {
            orders,
            open,
            by_symbol,
        })
    }

    async fn sync_orders(
        &self,
        keys: &StoreKeys,
        orders: Vec<(String, String)>,
    ) -> Result<(), StoreError> {
        if orders.is_empty() {
            return Ok(());
        }
        self.store.hset_many(&keys.orders(), orders).await
    }

    async fn sync_open_orders(&self, keys: &StoreKeys, open: Vec<String>) -> Result<(), StoreError> {
        let key = keys.open_orders();
        self.store.del(&key).await?;
        if open.is_empty() {
            return Ok(());
        }
        self.store.sadd(&key, open).await
    }

    async fn sync_symbol_orders(
        &self,
        keys: &StoreKeys,
        by_symbol: Vec<(String, Vec<String>)>,
    ) -> Result<(), StoreError> {
        let mut first_error = None;
        for (symbol, ids) in by_symbol {
            if let Err(e) = self.store.sadd(&keys.symbol_orders(&symbol), ids).await {
                tracing::warn!(symbol = %symbol, error = %e, "Symbol order sync failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Evict orders whose timestamp is older than `now - ttl`, from the
    /// primary map and every index. The store is not touched.
    ///
    /// Returns the number of evicted orders.
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Utc::now())
    }

    /// [`cleanup_expired`](Self::cleanup_expired) against an explicit clock.
    pub fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.config.order_ttl).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = now.checked_sub_signed(ttl) else {
            return 0;
        };

        let mut views = self.views.write();
        let expired: Vec<String> = views
            .orders
            .values()
            .filter(|order| order.is_older_than(cutoff))
            .map(|order| order.id.clone())
            .collect();
        for id in &expired {
            views.evict(id);
        }
        drop(views);

        if !expired.is_empty() {
            tracing::debug!(evicted = expired.len(), %cutoff, "Expired orders evicted");
            metrics::record_orders_evicted(expired.len());
        }
        expired.len()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawn the sync and cleanup tickers. Calling it again while they run
    /// is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.cancel.is_cancelled() {
            return;
        }

        let cache = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            cache.run_sync_loop().await;
        }));

        let cache = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            cache.run_cleanup_loop().await;
        }));

        tracing::info!(
            sync_interval_ms = self.config.sync_interval.as_millis(),
            cleanup_interval_ms = self.config.cleanup_interval.as_millis(),
            ttl_secs = self.config.order_ttl.as_secs(),
            "Order cache started"
        );
    }

    async fn run_sync_loop(&self) {
        let period = self.config.sync_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sync_now().await {
                        tracing::warn!(error = %e, "Periodic order sync failed, retrying next interval");
                    }
                }
            }
        }
        tracing::debug!("Order sync loop stopped");
    }

    async fn run_cleanup_loop(&self) {
        let period = self.config.cleanup_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.cleanup_expired();
                }
            }
        }
        tracing::debug!("Order cleanup loop stopped");
    }

    /// Stop the background tasks, wait for them, then flush once more.
    ///
    /// # Errors
    ///
    /// Returns the final sync's [`SyncError`], if any.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Order cache task ended abnormally");
            }
        }

        let result = self.sync_now().await;
        match &result {
            Ok(()) => tracing::info!("Order cache shut down, final sync complete"),
            Err(e) => tracing::error!(error = %e, "Final order sync failed"),
        }
        result
    }
}
