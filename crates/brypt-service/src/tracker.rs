//! Request correlation.
//!
//! Every outbound request registers a pending entry keyed by a CSPRNG
//! 128-bit request key (redrawn on the unlikely collision). Replies match
//! by `(source, key)`; each expected responder fires `on_response` at most
//! once, and the entry is removed when the expected set is exhausted or the
//! deadline fires, at which point every silent responder yields one
//! `on_error(timeout)`. Deadlines are enforced by the service's 10 ms
//! ticker.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use brypt_types::{Error, NodeIdentifier, RequestKey, StatusCode};

use crate::sync::lock;

/// Default lifetime of a pending request.
pub const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(10);

/// Granularity of deadline enforcement.
pub const TIMER_GRANULARITY: Duration = Duration::from_millis(10);

/// A correlated reply delivered to the issuer.
#[derive(Clone, Debug)]
pub struct Response {
    pub source: NodeIdentifier,
    pub payload: Vec<u8>,
    pub status: StatusCode,
}

/// Issuer callback for each reply.
pub type ResponseCallback = Arc<dyn Fn(Response) + Send + Sync>;

/// Issuer callback for each responder that failed to reply.
pub type ErrorCallback = Arc<dyn Fn(NodeIdentifier, Error) + Send + Sync>;

/// How the recipients of a request were chosen.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestFlavor {
    Directed,
    Broadcast,
    Sampled,
}

struct PendingRequest {
    route: String,
    flavor: RequestFlavor,
    on_response: ResponseCallback,
    on_error: ErrorCallback,
    deadline: Instant,
    expected: HashSet<NodeIdentifier>,
    received: HashSet<NodeIdentifier>,
}

/// An entry removed by expiry or cancellation, with the callbacks the
/// caller still has to fire.
pub struct ClosedRequest {
    pub key: RequestKey,
    pub route: String,
    pub flavor: RequestFlavor,
    pub unresponded: Vec<NodeIdentifier>,
    pub on_error: ErrorCallback,
}

/// The pending-request table.
#[derive(Default)]
pub struct RequestTracker {
    table: StdMutex<HashMap<RequestKey, PendingRequest>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request over `expected` responders.
    ///
    /// An empty responder set completes immediately: the key is returned
    /// but nothing is tracked and no callback will ever fire.
    pub fn track(
        &self,
        route: impl Into<String>,
        flavor: RequestFlavor,
        expected: Vec<NodeIdentifier>,
        deadline: Instant,
        on_response: ResponseCallback,
        on_error: ErrorCallback,
    ) -> RequestKey {
        let mut table = lock(&self.table);
        let mut key = RequestKey::generate();
        while table.contains_key(&key) || !key.is_valid() {
            key = RequestKey::generate();
        }
        if expected.is_empty() {
            return key;
        }
        table.insert(
            key,
            PendingRequest {
                route: route.into(),
                flavor,
                on_response,
                on_error,
                deadline,
                expected: expected.into_iter().collect(),
                received: HashSet::new(),
            },
        );
        key
    }

    /// Match an inbound reply. Returns false for unsolicited replies,
    /// unknown keys, and duplicate responders.
    pub fn handle_reply(
        &self,
        source: NodeIdentifier,
        key: RequestKey,
        status: StatusCode,
        payload: Vec<u8>,
    ) -> bool {
        let callback = {
            let mut table = lock(&self.table);
            let Some(pending) = table.get_mut(&key) else {
                return false;
            };
            if !pending.expected.contains(&source) || !pending.received.insert(source) {
                return false;
            }
            let callback = pending.on_response.clone();
            if pending.received.len() == pending.expected.len() {
                table.remove(&key);
            }
            callback
        };
        callback(Response { source, payload, status });
        true
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn expire(&self, now: Instant) -> Vec<ClosedRequest> {
        let mut table = lock(&self.table);
        let expired: Vec<RequestKey> = table
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(key, _)| *key)
            .collect();
        expired
            .into_iter()
            .filter_map(|key| {
                table.remove(&key).map(|pending| ClosedRequest {
                    key,
                    route: pending.route,
                    flavor: pending.flavor,
                    unresponded: pending
                        .expected
                        .difference(&pending.received)
                        .copied()
                        .collect(),
                    on_error: pending.on_error,
                })
            })
            .collect()
    }

    /// Abort one pending request, returning its callbacks.
    pub fn remove(&self, key: &RequestKey) -> Option<ClosedRequest> {
        let mut table = lock(&self.table);
        table.remove(key).map(|pending| ClosedRequest {
            key: *key,
            route: pending.route,
            flavor: pending.flavor,
            unresponded: pending
                .expected
                .difference(&pending.received)
                .copied()
                .collect(),
            on_error: pending.on_error,
        })
    }

    /// Remove and return everything, for shutdown.
    pub fn drain(&self) -> Vec<ClosedRequest> {
        let mut table = lock(&self.table);
        table
            .drain()
            .map(|(key, pending)| ClosedRequest {
                key,
                route: pending.route,
                flavor: pending.flavor,
                unresponded: pending
                    .expected
                    .difference(&pending.received)
                    .copied()
                    .collect(),
                on_error: pending.on_error,
            })
            .collect()
    }

    /// Number of outstanding requests.
    pub fn outstanding(&self) -> usize {
        lock(&self.table).len()
    }

    /// Whether a key is currently tracked.
    pub fn contains(&self, key: &RequestKey) -> bool {
        lock(&self.table).contains_key(key)
    }
}

/// A deferred reply held open while a downstream query runs.
///
/// The slot resolves exactly once: the first downstream response (or the
/// placeholder once every downstream responder has failed) answers the
/// original requester.
pub struct DeferredSlot {
    requester: NodeIdentifier,
    request_key: RequestKey,
    route: String,
    placeholder: Vec<u8>,
    resolved: AtomicBool,
}

impl DeferredSlot {
    pub fn new(
        requester: NodeIdentifier,
        request_key: RequestKey,
        route: impl Into<String>,
        placeholder: Vec<u8>,
    ) -> Arc<Self> {
        Arc::new(Self {
            requester,
            request_key,
            route: route.into(),
            placeholder,
            resolved: AtomicBool::new(false),
        })
    }

    /// Claim the single resolution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] when the slot was already resolved.
    pub fn claim(&self) -> Result<(), Error> {
        if self.resolved.swap(true, Ordering::SeqCst) {
            return Err(Error::Conflict);
        }
        Ok(())
    }

    /// Whether the slot has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    pub fn requester(&self) -> NodeIdentifier {
        self.requester
    }

    pub fn request_key(&self) -> RequestKey {
        self.request_key
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn placeholder(&self) -> &[u8] {
        &self.placeholder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn noop_response() -> ResponseCallback {
        Arc::new(|_| {})
    }

    fn noop_error() -> ErrorCallback {
        Arc::new(|_, _| {})
    }

    fn counted_response(counter: Arc<AtomicUsize>) -> ResponseCallback {
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_directed_reply_completes_entry() {
        let tracker = RequestTracker::new();
        let responder = NodeIdentifier::generate();
        let hits = Arc::new(AtomicUsize::new(0));
        let key = tracker.track(
            "/ping",
            RequestFlavor::Directed,
            vec![responder],
            Instant::now() + Duration::from_secs(10),
            counted_response(hits.clone()),
            noop_error(),
        );

        assert!(tracker.handle_reply(responder, key, StatusCode::Ok, b"pong!".to_vec()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.outstanding(), 0);

        // A second reply from the same responder is unsolicited.
        assert!(!tracker.handle_reply(responder, key, StatusCode::Ok, Vec::new()));
    }

    #[test]
    fn test_unexpected_source_ignored() {
        let tracker = RequestTracker::new();
        let responder = NodeIdentifier::generate();
        let stranger = NodeIdentifier::generate();
        let key = tracker.track(
            "/ping",
            RequestFlavor::Directed,
            vec![responder],
            Instant::now() + Duration::from_secs(10),
            noop_response(),
            noop_error(),
        );

        assert!(!tracker.handle_reply(stranger, key, StatusCode::Ok, Vec::new()));
        assert_eq!(tracker.outstanding(), 1);
    }

    #[test]
    fn test_broadcast_counts_every_responder_once() {
        let tracker = RequestTracker::new();
        let responders: Vec<NodeIdentifier> =
            (0..3).map(|_| NodeIdentifier::generate()).collect();
        let hits = Arc::new(AtomicUsize::new(0));
        let key = tracker.track(
            "/ping",
            RequestFlavor::Broadcast,
            responders.clone(),
            Instant::now() + Duration::from_secs(10),
            counted_response(hits.clone()),
            noop_error(),
        );

        for responder in &responders {
            assert!(tracker.handle_reply(*responder, key, StatusCode::Ok, Vec::new()));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_expiry_reports_unresponded_peers() {
        let tracker = RequestTracker::new();
        let answered = NodeIdentifier::generate();
        let silent = NodeIdentifier::generate();
        let key = tracker.track(
            "/ping",
            RequestFlavor::Broadcast,
            vec![answered, silent],
            Instant::now() + Duration::from_millis(1),
            noop_response(),
            noop_error(),
        );
        assert!(tracker.handle_reply(answered, key, StatusCode::Ok, Vec::new()));

        let closed = tracker.expire(Instant::now() + Duration::from_millis(5));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].key, key);
        assert_eq!(closed[0].unresponded, vec![silent]);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_expire_leaves_live_entries() {
        let tracker = RequestTracker::new();
        let _key = tracker.track(
            "/ping",
            RequestFlavor::Directed,
            vec![NodeIdentifier::generate()],
            Instant::now() + Duration::from_secs(30),
            noop_response(),
            noop_error(),
        );
        assert!(tracker.expire(Instant::now()).is_empty());
        assert_eq!(tracker.outstanding(), 1);
    }

    #[test]
    fn test_empty_responder_set_tracks_nothing() {
        let tracker = RequestTracker::new();
        let key = tracker.track(
            "/ping",
            RequestFlavor::Broadcast,
            Vec::new(),
            Instant::now(),
            noop_response(),
            noop_error(),
        );
        assert!(key.is_valid());
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_keys_are_unique_and_valid() {
        let tracker = RequestTracker::new();
        let mut seen = HashSet::new();
        for _ in 0..256 {
            let key = tracker.track(
                "/ping",
                RequestFlavor::Directed,
                vec![NodeIdentifier::generate()],
                Instant::now() + Duration::from_secs(10),
                noop_response(),
                noop_error(),
            );
            assert!(key.is_valid());
            assert!(seen.insert(key), "duplicate request key issued");
        }
    }

    #[test]
    fn test_drain_returns_everything() {
        let tracker = RequestTracker::new();
        for _ in 0..4 {
            tracker.track(
                "/ping",
                RequestFlavor::Directed,
                vec![NodeIdentifier::generate()],
                Instant::now() + Duration::from_secs(10),
                noop_response(),
                noop_error(),
            );
        }
        let closed = tracker.drain();
        assert_eq!(closed.len(), 4);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_deferred_slot_resolves_once() {
        let slot = DeferredSlot::new(
            NodeIdentifier::generate(),
            RequestKey::new(1, 2),
            "/ping",
            b"placeholder".to_vec(),
        );
        assert!(!slot.is_resolved());
        slot.claim().expect("first resolution");
        assert_eq!(slot.claim(), Err(Error::Conflict));
        assert!(slot.is_resolved());
    }
}
