//! Message Router
//!
//! In-process publish/dispatch hub. Named endpoints receive pushed messages;
//! a correlation table pairs asynchronous responses with the callers that
//! issued requests.
//!
//! # Delivery
//!
//! - At most once, best effort: sending to an unbound endpoint is logged and
//!   dropped, never an error.
//! - Handlers run synchronously on the sending task. The endpoint table lock
//!   is released before a handler is invoked, so handlers may themselves
//!   send, register or deregister.
//! - Endpoint names are matched exactly. There are no wildcards or topic
//!   hierarchies.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::infrastructure::metrics::{self, RouterOutcome};

// =============================================================================
// Error Type
// =============================================================================

/// Router contract violations. Returned synchronously, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    /// Endpoint name was empty or blank.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An endpoint with this name is already bound.
    #[error("endpoint already registered: {0}")]
    DuplicateEndpoint(String),

    /// No endpoint with this name is bound.
    #[error("endpoint not registered: {0}")]
    UnknownEndpoint(String),

    /// The endpoint is bound to a different handler.
    #[error("handler does not match the one registered for endpoint {0}")]
    HandlerMismatch(String),

    /// A request with this correlation ID is still pending.
    #[error("correlation id already pending: {0}")]
    DuplicateCorrelationId(Uuid),
}

// =============================================================================
// Handlers and Envelopes
// =============================================================================

/// What a handler receives: the message plus, for requests, the correlation
/// ID it should answer with.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a, M> {
    /// The message payload.
    pub message: &'a M,
    /// Set when the message was sent through [`MessageRouter::request`].
    pub correlation_id: Option<Uuid>,
}

type HandlerFn<M> = dyn Fn(Delivery<'_, M>) + Send + Sync;

/// A shareable endpoint handler.
///
/// Identity is the allocation: clones of one `Handler` compare equal, two
/// handlers built from identical closures do not.
pub struct Handler<M> {
    inner: Arc<HandlerFn<M>>,
}

impl<M> Handler<M> {
    /// Wrap a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Delivery<'_, M>) + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Whether both handles refer to the same handler.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn call(&self, delivery: Delivery<'_, M>) {
        (self.inner)(delivery);
    }
}

impl<M> Clone for Handler<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M> fmt::Debug for Handler<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("ptr", &Arc::as_ptr(&self.inner).cast::<()>())
            .finish()
    }
}

type Callback<M> = Box<dyn FnOnce(M) + Send>;

/// A request awaiting a correlated response.
pub struct Request<M> {
    /// Unique while pending.
    pub correlation_id: Uuid,
    /// Message delivered to the endpoint.
    pub payload: M,
    callback: Callback<M>,
}

impl<M> Request<M> {
    /// Build a request with a fresh random correlation ID.
    pub fn new<F>(payload: M, callback: F) -> Self
    where
        F: FnOnce(M) + Send + 'static,
    {
        Self::with_id(Uuid::new_v4(), payload, callback)
    }

    /// Build a request with a caller-chosen correlation ID.
    pub fn with_id<F>(correlation_id: Uuid, payload: M, callback: F) -> Self
    where
        F: FnOnce(M) + Send + 'static,
    {
        Self {
            correlation_id,
            payload,
            callback: Box::new(callback),
        }
    }
}

impl<M: fmt::Debug> fmt::Debug for Request<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("correlation_id", &self.correlation_id)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// A response to a previously issued request.
#[derive(Debug, Clone)]
pub struct Response<M> {
    /// Correlation ID of the originating request.
    pub correlation_id: Uuid,
    /// Response payload handed to the request callback.
    pub payload: M,
}

// =============================================================================
// Statistics
// =============================================================================

/// Router counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RouterStats {
    /// Messages delivered to a bound endpoint (sends and requests).
    pub sent: u64,
    /// Requests accepted into the correlation table.
    pub requests: u64,
    /// Responses matched to a pending request.
    pub responses: u64,
    /// Messages addressed to an unbound endpoint.
    pub dropped: u64,
    /// Responses with no pending request.
    pub unmatched_responses: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    requests: AtomicU64,
    responses: AtomicU64,
    dropped: AtomicU64,
    unmatched_responses: AtomicU64,
}

// =============================================================================
// Router
// =============================================================================

/// Named-endpoint message router.
///
/// # Example
///
/// ```rust
/// use market_ingest::application::services::router::{Delivery, Handler, MessageRouter};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let router = MessageRouter::<String>::new();
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&seen);
/// let handler = Handler::new(move |_: Delivery<'_, String>| {
///     counter.fetch_add(1, Ordering::SeqCst);
/// });
///
/// router.register("greetings", handler.clone()).unwrap();
/// router.send("greetings", &"hello".to_string());
/// assert_eq!(seen.load(Ordering::SeqCst), 1);
///
/// router.deregister("greetings", &handler).unwrap();
/// ```
pub struct MessageRouter<M> {
    endpoints: RwLock<HashMap<String, Handler<M>>>,
    pending: Mutex<HashMap<Uuid, Callback<M>>>,
    counters: Counters,
}

impl<M> Default for MessageRouter<M> {
    fn default() -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }
}

impl<M> fmt::Debug for MessageRouter<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRouter")
            .field("endpoints", &self.endpoints.read().len())
            .field("pending", &self.pending.lock().len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<M> MessageRouter<M> {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `name`.
    ///
    /// # Errors
    ///
    /// - [`RouterError::InvalidArgument`] if `name` is empty or blank
    /// - [`RouterError::DuplicateEndpoint`] if `name` is already bound
    pub fn register(&self, name: &str, handler: Handler<M>) -> Result<(), RouterError> {
        if name.trim().is_empty() {
            return Err(RouterError::InvalidArgument("endpoint name is empty"));
        }

        match self.endpoints.write().entry(name.to_string()) {
            Entry::Occupied(_) => Err(RouterError::DuplicateEndpoint(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                tracing::debug!(endpoint = name, "Endpoint registered");
                Ok(())
            }
        }
    }

    /// Unbind `name`, provided it is bound to this very `handler`.
    ///
    /// # Errors
    ///
    /// - [`RouterError::UnknownEndpoint`] if `name` is not bound
    /// - [`RouterError::HandlerMismatch`] if a different handler is bound;
    ///   the existing binding is left in place
    pub fn deregister(&self, name: &str, handler: &Handler<M>) -> Result<(), RouterError> {
        let mut endpoints = self.endpoints.write();
        let same = match endpoints.get(name) {
            None => return Err(RouterError::UnknownEndpoint(name.to_string())),
            Some(bound) => bound.same_as(handler),
        };
        if !same {
            return Err(RouterError::HandlerMismatch(name.to_string()));
        }
        endpoints.remove(name);
        drop(endpoints);

        tracing::debug!(endpoint = name, "Endpoint deregistered");
        Ok(())
    }

    /// Whether `name` is bound.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.endpoints.read().contains_key(name)
    }

    /// Names of all bound endpoints, sorted.
    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Deliver `message` to `name`. Unbound endpoints drop the message.
    pub fn send(&self, name: &str, message: &M) {
        self.dispatch(name, message, None);
    }

    /// Record the request's callback, then deliver its payload to `name`.
    ///
    /// The callback stays pending until a matching [`Response`] arrives or
    /// [`cancel_request`](Self::cancel_request) is called, even if `name` is
    /// unbound.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateCorrelationId`] if a request with the
    /// same ID is still pending. The original request is unaffected.
    pub fn request(&self, name: &str, request: Request<M>) -> Result<(), RouterError> {
        let Request {
            correlation_id,
            payload,
            callback,
        } = request;

        match self.pending.lock().entry(correlation_id) {
            Entry::Occupied(_) => return Err(RouterError::DuplicateCorrelationId(correlation_id)),
            Entry::Vacant(slot) => {
                slot.insert(callback);
            }
        }
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        metrics::record_router_message(RouterOutcome::Request);

        self.dispatch(name, &payload, Some(correlation_id));
        Ok(())
    }

    /// Hand `response` to the pending request's callback, consuming it.
    ///
    /// Returns `false` (and logs) when no request is pending under the ID.
    pub fn respond(&self, response: Response<M>) -> bool {
        let callback = self.pending.lock().remove(&response.correlation_id);
        let Some(callback) = callback else {
            self.counters
                .unmatched_responses
                .fetch_add(1, Ordering::Relaxed);
            metrics::record_router_message(RouterOutcome::Unmatched);
            tracing::warn!(
                correlation_id = %response.correlation_id,
                "No callback found for response"
            );
            return false;
        };

        callback(response.payload);
        self.counters.responses.fetch_add(1, Ordering::Relaxed);
        metrics::record_router_message(RouterOutcome::Response);
        true
    }

    /// Drop a pending request without invoking its callback.
    pub fn cancel_request(&self, correlation_id: Uuid) -> bool {
        self.pending.lock().remove(&correlation_id).is_some()
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            requests: self.counters.requests.load(Ordering::Relaxed),
            responses: self.counters.responses.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            unmatched_responses: self.counters.unmatched_responses.load(Ordering::Relaxed),
        }
    }

    fn dispatch(&self, name: &str, message: &M, correlation_id: Option<Uuid>) {
        let handler = self.endpoints.read().get(name).cloned();
        let Some(handler) = handler else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::record_router_message(RouterOutcome::Dropped);
            tracing::debug!(endpoint = name, "No endpoint registered, message dropped");
            return;
        };

        handler.call(Delivery {
            message,
            correlation_id,
        });
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        metrics::record_router_message(RouterOutcome::Sent);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use proptest::prelude::*;

    use super::*;

    fn counting_handler() -> (Handler<u32>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handler = Handler::new(move |_: Delivery<'_, u32>| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (handler, count)
    }

    #[test]
    fn register_rejects_blank_names() {
        let router = MessageRouter::<u32>::new();
        let (handler, _) = counting_handler();
        assert_eq!(
            router.register("", handler.clone()),
            Err(RouterError::InvalidArgument("endpoint name is empty"))
        );
        assert!(matches!(
            router.register("   ", handler),
            Err(RouterError::InvalidArgument(_))
        ));
    }

    #[test]
    fn register_twice_is_duplicate() {
        let router = MessageRouter::<u32>::new();
        let (h1, count) = counting_handler();
        let (h2, _) = counting_handler();

        router.register("x", h1).unwrap();
        assert_eq!(
            router.register("x", h2),
            Err(RouterError::DuplicateEndpoint("x".to_string()))
        );

        router.send("x", &7);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn send_invokes_handler_once_per_call() {
        let router = MessageRouter::<u32>::new();
        let (handler, count) = counting_handler();
        router.register("x", handler).unwrap();

        for i in 0..5 {
            router.send("x", &i);
        }
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert_eq!(router.stats().sent, 5);
    }

    #[test]
    fn send_to_unbound_endpoint_is_dropped() {
        let router = MessageRouter::<u32>::new();
        router.send("nowhere", &1);
        let stats = router.stats();
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn deregister_checks_identity() {
        let router = MessageRouter::<u32>::new();
        let (bound, count) = counting_handler();
        let (other, _) = counting_handler();
        router.register("x", bound.clone()).unwrap();

        assert_eq!(
            router.deregister("x", &other),
            Err(RouterError::HandlerMismatch("x".to_string()))
        );
        // Original binding intact.
        router.send("x", &1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        router.deregister("x", &bound).unwrap();
        assert!(!router.is_registered("x"));
        assert_eq!(
            router.deregister("x", &bound),
            Err(RouterError::UnknownEndpoint("x".to_string()))
        );
    }

    #[test]
    fn reregister_after_deregister() {
        let router = MessageRouter::<u32>::new();
        let (handler, _) = counting_handler();
        router.register("x", handler.clone()).unwrap();
        router.deregister("x", &handler).unwrap();
        router.register("x", handler).unwrap();
        assert_eq!(router.endpoints(), vec!["x".to_string()]);
    }

    #[test]
    fn request_response_round_trip() {
        let router = MessageRouter::<u32>::new();
        let received = Arc::new(Mutex::new(None));
        let ids = Arc::new(Mutex::new(Vec::new()));

        let seen_ids = Arc::clone(&ids);
        router
            .register(
                "svc",
                Handler::new(move |d: Delivery<'_, u32>| {
                    seen_ids.lock().push(d.correlation_id);
                }),
            )
            .unwrap();

        let id = Uuid::new_v4();
        let slot = Arc::clone(&received);
        router
            .request(
                "svc",
                Request::with_id(id, 10, move |reply| *slot.lock() = Some(reply)),
            )
            .unwrap();

        assert_eq!(*ids.lock(), vec![Some(id)]);
        assert_eq!(router.pending_requests(), 1);

        assert!(router.respond(Response {
            correlation_id: id,
            payload: 20,
        }));
        assert_eq!(*received.lock(), Some(20));
        assert_eq!(router.pending_requests(), 0);

        // Consumed exactly once.
        assert!(!router.respond(Response {
            correlation_id: id,
            payload: 30,
        }));
        assert_eq!(*received.lock(), Some(20));

        let stats = router.stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.responses, 1);
        assert_eq!(stats.unmatched_responses, 1);
    }

    #[test]
    fn duplicate_pending_correlation_id_is_rejected() {
        let router = MessageRouter::<u32>::new();
        let (handler, delivered) = counting_handler();
        router.register("svc", handler).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let first_reply = Arc::new(Mutex::new(None));
        let id = Uuid::new_v4();

        let slot = Arc::clone(&first_reply);
        let first_calls = Arc::clone(&calls);
        router
            .request(
                "svc",
                Request::with_id(id, 1, move |reply| {
                    first_calls.fetch_add(1, Ordering::SeqCst);
                    *slot.lock() = Some(reply);
                }),
            )
            .unwrap();

        let second_calls = Arc::clone(&calls);
        assert_eq!(
            router.request(
                "svc",
                Request::with_id(id, 2, move |_| {
                    second_calls.fetch_add(100, Ordering::SeqCst);
                }),
            ),
            Err(RouterError::DuplicateCorrelationId(id))
        );
        // The rejected request was not dispatched.
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        router.respond(Response {
            correlation_id: id,
            payload: 99,
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*first_reply.lock(), Some(99));
        assert_eq!(router.pending_requests(), 0);
    }

    #[test]
    fn cancel_request_discards_callback() {
        let router = MessageRouter::<u32>::new();
        let request = Request::new(1, |_| panic!("cancelled callback must not run"));
        let id = request.correlation_id;
        router.request("unbound", request).unwrap();

        assert!(router.cancel_request(id));
        assert!(!router.respond(Response {
            correlation_id: id,
            payload: 0,
        }));
    }

    #[test]
    fn handler_may_reenter_router() {
        let router = Arc::new(MessageRouter::<u32>::new());
        let (inner, inner_count) = counting_handler();
        router.register("inner", inner).unwrap();

        let weak = Arc::downgrade(&router);
        router
            .register(
                "outer",
                Handler::new(move |d: Delivery<'_, u32>| {
                    if let Some(router) = weak.upgrade() {
                        router.send("inner", d.message);
                    }
                }),
            )
            .unwrap();

        router.send("outer", &1);
        assert_eq!(inner_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_senders_are_all_counted() {
        let router = Arc::new(MessageRouter::<u32>::new());
        let (handler, count) = counting_handler();
        router.register("x", handler).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let router = Arc::clone(&router);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        router.send("x", &i);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 2000);
        assert_eq!(router.stats().sent, 2000);
    }

    proptest! {
        #[test]
        fn every_send_to_a_bound_endpoint_is_delivered_once(
            names in proptest::collection::vec("[a-c]", 1..40),
        ) {
            let router = MessageRouter::<u32>::new();
            let mut counts = HashMap::new();
            for name in ["a", "b"] {
                let (handler, count) = counting_handler();
                router.register(name, handler).unwrap();
                counts.insert(name.to_string(), count);
            }

            for name in &names {
                router.send(name, &0);
            }

            for (name, count) in &counts {
                let expected = names.iter().filter(|n| *n == name).count();
                prop_assert_eq!(count.load(Ordering::SeqCst), expected);
            }
            let unbound = names.iter().filter(|n| n.as_str() == "c").count();
            prop_assert_eq!(router.stats().dropped, unbound as u64);
        }
    }
}
