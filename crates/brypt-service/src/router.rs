//! Route registration and dispatch.
//!
//! A route is an immutable `/`-prefixed path bound to exactly one handler.
//! A handler is anything exposing `handle(source, payload, next)`; plain
//! closures qualify. The built-in routes are pre-registered and may be
//! overridden, with a warning, before startup freezes the table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use brypt_types::{Error, NodeIdentifier, RequestKey, Result, StatusCode};

use crate::sync::{read, write};

/// Routes the runtime pre-registers on every node.
pub const HANDSHAKE_ROUTE: &str = "/brypt/handshake";
pub const REKEY_ROUTE: &str = "/brypt/rekey";
pub const HEARTBEAT_ROUTE: &str = "/brypt/heartbeat";
pub const INFORMATION_ROUTE: &str = "/brypt/information";
pub const BYE_ROUTE: &str = "/brypt/bye";
pub const CANCEL_ROUTE: &str = "/brypt/cancel";

const BUILTIN_ROUTES: &[&str] = &[
    HANDSHAKE_ROUTE,
    REKEY_ROUTE,
    HEARTBEAT_ROUTE,
    INFORMATION_ROUTE,
    BYE_ROUTE,
    CANCEL_ROUTE,
];

/// True for routes the runtime owns.
pub fn is_builtin(route: &str) -> bool {
    BUILTIN_ROUTES.contains(&route)
}

/// Cooperative cancellation observed by request handlers.
///
/// The token trips when the requester abandons the request (deadline or
/// explicit cancel) or when the service shuts down.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the work should stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Anything that can serve a route.
pub trait RouteHandler: Send + Sync {
    /// Serve one parcel. `payload` is a borrowed view of the decrypted
    /// payload; `next` carries the reply capabilities.
    fn handle(&self, source: &NodeIdentifier, payload: &[u8], next: Next) -> Result<()>;
}

impl<F> RouteHandler for F
where
    F: Fn(&NodeIdentifier, &[u8], Next) -> Result<()> + Send + Sync,
{
    fn handle(&self, source: &NodeIdentifier, payload: &[u8], next: Next) -> Result<()> {
        self(source, payload, next)
    }
}

/// The reply surface handed to a handler.
///
/// Exactly one of [`Next::respond`], [`Next::dispatch`], or [`Next::defer`]
/// may be called; a second call returns `conflict`. If the handler returns
/// without calling any of them, the dispatcher sends an automatic
/// `no_content` reply to a request. A handler that will answer from a later
/// completion calls [`Next::suspend`] before returning, which suppresses
/// the automatic reply while keeping a single `respond` permitted.
#[derive(Clone)]
pub struct Next {
    backend: Arc<dyn NextBackend>,
    source: NodeIdentifier,
    route: String,
    request_key: Option<RequestKey>,
    reply_state: Arc<AtomicU8>,
    cancellation: CancellationToken,
}

const REPLY_UNTOUCHED: u8 = 0;
const REPLY_SUSPENDED: u8 = 1;
const REPLY_CONSUMED: u8 = 2;

/// The service-side realization of the `Next` capabilities.
pub trait NextBackend: Send + Sync {
    /// Send a reply to the requester.
    fn respond(
        &self,
        to: &NodeIdentifier,
        route: &str,
        key: RequestKey,
        status: StatusCode,
        payload: &[u8],
    ) -> Result<()>;

    /// Fire-and-forget notice to every authorized peer except `exclude`.
    fn dispatch(&self, exclude: &NodeIdentifier, route: &str, payload: &[u8]) -> Result<()>;

    /// Hold the reply open while a downstream query resolves it.
    fn defer(
        &self,
        requester: &NodeIdentifier,
        request_key: RequestKey,
        origin_route: &str,
        notice_route: &str,
        notice_payload: &[u8],
        placeholder: &[u8],
    ) -> Result<()>;
}

impl Next {
    pub(crate) fn new(
        backend: Arc<dyn NextBackend>,
        source: NodeIdentifier,
        route: String,
        request_key: Option<RequestKey>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            backend,
            source,
            route,
            request_key,
            reply_state: Arc::new(AtomicU8::new(REPLY_UNTOUCHED)),
            cancellation,
        }
    }

    /// The cancellation token for this request.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Whether the dispatcher still owes the requester an automatic reply.
    pub(crate) fn needs_automatic_reply(&self) -> bool {
        self.reply_state.load(Ordering::SeqCst) == REPLY_UNTOUCHED
    }

    /// The request key, when the inbound parcel was a request.
    pub(crate) fn request_key(&self) -> Option<RequestKey> {
        self.request_key
    }

    fn claim(&self) -> Result<()> {
        if self.reply_state.swap(REPLY_CONSUMED, Ordering::SeqCst) == REPLY_CONSUMED {
            return Err(Error::Conflict);
        }
        Ok(())
    }

    /// Take ownership of the reply: the automatic `no_content` is
    /// suppressed, and a later completion must call [`Next::respond`] (or
    /// let the requester's deadline fire).
    ///
    /// # Errors
    ///
    /// [`Error::Conflict`] when a reply capability was already used.
    pub fn suspend(&self) -> Result<()> {
        match self.reply_state.compare_exchange(
            REPLY_UNTOUCHED,
            REPLY_SUSPENDED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(()),
            Err(REPLY_SUSPENDED) => Ok(()),
            Err(_) => Err(Error::Conflict),
        }
    }

    /// Reply to the requester with a payload and status.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] when the inbound parcel was not a
    /// request; [`Error::Conflict`] when a capability was already used.
    pub fn respond(&self, payload: &[u8], status: StatusCode) -> Result<()> {
        let key = self.request_key.ok_or(Error::InvalidArgument)?;
        self.claim()?;
        self.backend.respond(&self.source, &self.route, key, status, payload)
    }

    /// Reply with a bare status and no payload.
    pub fn respond_status(&self, status: StatusCode) -> Result<()> {
        self.respond(&[], status)
    }

    /// Fire a downstream notice to the rest of the cluster and finish
    /// without replying.
    ///
    /// # Errors
    ///
    /// [`Error::Conflict`] when a capability was already used.
    pub fn dispatch(&self, route: &str, payload: &[u8]) -> Result<()> {
        self.claim()?;
        self.backend.dispatch(&self.source, route, payload)
    }

    /// Defer the reply: issue a downstream query whose result (or the
    /// `placeholder` on failure) answers the original requester.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] when the inbound parcel was not a
    /// request; [`Error::Conflict`] when a capability was already used.
    pub fn defer(&self, notice_route: &str, notice_payload: &[u8], placeholder: &[u8]) -> Result<()> {
        let key = self.request_key.ok_or(Error::InvalidArgument)?;
        self.claim()?;
        self.backend.defer(
            &self.source,
            key,
            &self.route,
            notice_route,
            notice_payload,
            placeholder,
        )
    }
}

/// The route table.
pub struct Router {
    routes: RwLock<HashMap<String, Arc<dyn RouteHandler>>>,
    frozen: AtomicBool,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self { routes: RwLock::new(HashMap::new()), frozen: AtomicBool::new(false) }
    }

    /// Bind a handler to a path.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a malformed path,
    /// [`Error::AlreadyStarted`] once the table is frozen, and
    /// [`Error::Conflict`] for a duplicate non-built-in registration.
    /// Overriding a built-in route is allowed with a warning.
    pub fn register(&self, route: &str, handler: Arc<dyn RouteHandler>) -> Result<()> {
        if !route.starts_with('/') || route.len() < 2 {
            return Err(Error::InvalidArgument);
        }
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        let mut routes = write(&self.routes);
        if routes.contains_key(route) {
            if is_builtin(route) {
                tracing::warn!(route, "overriding a built-in route");
            } else {
                return Err(Error::Conflict);
            }
        }
        routes.insert(route.to_string(), handler);
        Ok(())
    }

    /// Register a built-in handler at construction time, bypassing the
    /// duplicate check.
    pub(crate) fn register_builtin(&self, route: &'static str, handler: Arc<dyn RouteHandler>) {
        write(&self.routes).insert(route.to_string(), handler);
    }

    /// Look up the handler for a path.
    pub fn resolve(&self, route: &str) -> Option<Arc<dyn RouteHandler>> {
        read(&self.routes).get(route).cloned()
    }

    /// Freeze the table; reads are uncontended from here on.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        read(&self.routes).len()
    }

    /// True when no routes are registered.
    pub fn is_empty(&self) -> bool {
        read(&self.routes).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct RecordingBackend {
        responded: AtomicUsize,
        dispatched: AtomicUsize,
        deferred: AtomicUsize,
    }

    impl RecordingBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                responded: AtomicUsize::new(0),
                dispatched: AtomicUsize::new(0),
                deferred: AtomicUsize::new(0),
            })
        }
    }

    impl NextBackend for RecordingBackend {
        fn respond(
            &self,
            _to: &NodeIdentifier,
            _route: &str,
            _key: RequestKey,
            _status: StatusCode,
            _payload: &[u8],
        ) -> Result<()> {
            self.responded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn dispatch(&self, _exclude: &NodeIdentifier, _route: &str, _payload: &[u8]) -> Result<()> {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn defer(
            &self,
            _requester: &NodeIdentifier,
            _key: RequestKey,
            _origin_route: &str,
            _notice_route: &str,
            _notice_payload: &[u8],
            _placeholder: &[u8],
        ) -> Result<()> {
            self.deferred.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn request_next(backend: Arc<RecordingBackend>) -> Next {
        Next::new(
            backend,
            NodeIdentifier::generate(),
            "/ping".to_string(),
            Some(RequestKey::new(1, 2)),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_register_and_resolve() {
        let router = Router::new();
        let handler: Arc<dyn RouteHandler> =
            Arc::new(|_: &NodeIdentifier, _: &[u8], _: Next| Ok(()));
        router.register("/ping", handler).expect("register");
        assert!(router.resolve("/ping").is_some());
        assert!(router.resolve("/pong").is_none());
    }

    #[test]
    fn test_duplicate_registration_conflicts() {
        let router = Router::new();
        let handler: Arc<dyn RouteHandler> =
            Arc::new(|_: &NodeIdentifier, _: &[u8], _: Next| Ok(()));
        router.register("/ping", handler.clone()).expect("register");
        assert_eq!(router.register("/ping", handler), Err(Error::Conflict));
    }

    #[test]
    fn test_builtin_override_is_allowed() {
        let router = Router::new();
        let handler: Arc<dyn RouteHandler> =
            Arc::new(|_: &NodeIdentifier, _: &[u8], _: Next| Ok(()));
        router.register_builtin(HEARTBEAT_ROUTE, handler.clone());
        router.register(HEARTBEAT_ROUTE, handler).expect("override built-in");
    }

    #[test]
    fn test_frozen_table_rejects_registration() {
        let router = Router::new();
        router.freeze();
        let handler: Arc<dyn RouteHandler> =
            Arc::new(|_: &NodeIdentifier, _: &[u8], _: Next| Ok(()));
        assert_eq!(router.register("/late", handler), Err(Error::AlreadyStarted));
    }

    #[test]
    fn test_invalid_paths_rejected() {
        let router = Router::new();
        let handler: Arc<dyn RouteHandler> =
            Arc::new(|_: &NodeIdentifier, _: &[u8], _: Next| Ok(()));
        assert_eq!(router.register("ping", handler.clone()), Err(Error::InvalidArgument));
        assert_eq!(router.register("/", handler), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_next_allows_exactly_one_capability() {
        let backend = RecordingBackend::new();
        let next = request_next(backend.clone());

        next.respond(b"pong", StatusCode::Ok).expect("respond");
        assert_eq!(next.respond(b"again", StatusCode::Ok), Err(Error::Conflict));
        assert_eq!(next.dispatch("/other", b""), Err(Error::Conflict));
        assert_eq!(next.defer("/probe", b"", b""), Err(Error::Conflict));
        assert_eq!(backend.responded.load(Ordering::SeqCst), 1);
        assert!(!next.needs_automatic_reply());
    }

    #[test]
    fn test_suspend_suppresses_automatic_reply() {
        let backend = RecordingBackend::new();
        let next = request_next(backend.clone());
        assert!(next.needs_automatic_reply());

        next.suspend().expect("suspend");
        assert!(!next.needs_automatic_reply());

        // A suspended handler still owns exactly one respond.
        next.respond(b"late", StatusCode::Ok).expect("respond");
        assert_eq!(next.suspend(), Err(Error::Conflict));
        assert_eq!(backend.responded.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_respond_requires_a_request() {
        let backend = RecordingBackend::new();
        let next = Next::new(
            backend,
            NodeIdentifier::generate(),
            "/notice".to_string(),
            None,
            CancellationToken::new(),
        );
        assert_eq!(next.respond(b"", StatusCode::Ok), Err(Error::InvalidArgument));
        // A failed respond does not consume the slot.
        next.dispatch("/other", b"payload").expect("dispatch");
    }

    #[test]
    fn test_defer_consumes_slot() {
        let backend = RecordingBackend::new();
        let next = request_next(backend.clone());
        next.defer("/probe", b"probe-payload", b"placeholder").expect("defer");
        assert_eq!(backend.deferred.load(Ordering::SeqCst), 1);
        assert_eq!(next.respond(b"", StatusCode::Ok), Err(Error::Conflict));
    }

    #[test]
    fn test_cancellation_token_trips_once() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn test_builtin_route_names() {
        for route in BUILTIN_ROUTES {
            assert!(is_builtin(route));
        }
        assert!(!is_builtin("/ping"));
    }
}
