//! The service orchestrator.
//!
//! A [`Service`] is born configured: options, routes, supported algorithms,
//! the logger, and event subscriptions are all accepted until `startup`,
//! which freezes the configuration surface, binds every attached endpoint,
//! and brings up the runtime tasks (the endpoint event pump, per-connection
//! workers, and the request-deadline ticker). `shutdown` cancels pending
//! requests, says goodbye to connected peers, closes endpoints, and
//! persists state when the filesystem is enabled.
//!
//! Inbound frames flow: endpoint → pump → per-connection worker (serialized
//! per peer) → handshake step, reply correlation, or route dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::{Duration, Instant};

use brypt_crypto::suite::{AlgorithmsPackage, SuiteCatalog};
use brypt_message::handshake::{CancelRequest, Goodbye, HandshakeInit, HandshakeReply, RekeyInit, RekeyReply};
use brypt_message::{frame, Parcel, ParcelType, MAX_PAYLOAD_SIZE};
use brypt_types::{
    Error, Event, EventTag, IdentifierPersistence, LogLevel, NodeIdentifier, OptionKey,
    OptionValue, Options, Protocol, RemoteAddress, RequestKey, Result, StatusCode,
};
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot, watch};

use crate::endpoint::{ConnectionId, EndpointEvent, SharedEndpoint};
use crate::logger::{LogCallback, LoggerSlot};
use crate::peer::{Link, PeerProxy};
use crate::persistence;
use crate::registry::PeerRegistry;
use crate::router::{
    CancellationToken, Next, NextBackend, RouteHandler, Router, BYE_ROUTE, CANCEL_ROUTE,
    HANDSHAKE_ROUTE, HEARTBEAT_ROUTE, INFORMATION_ROUTE, REKEY_ROUTE,
};
use crate::session::{self, HandshakeInitiator, SessionError, SessionFault};
use crate::sync::{lock, read, write};
use crate::tcp::TcpEndpoint;
use crate::tracker::{
    DeferredSlot, ErrorCallback, RequestFlavor, RequestTracker, Response, ResponseCallback,
    DEFAULT_REQUEST_DEADLINE, TIMER_GRANULARITY,
};

/// Time allowed between transport connect and session authorization.
pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);

/// Lifecycle of the orchestrator. Construction performs the
/// initial → configured transition; `stopped` is terminal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Configured,
    Running,
    Stopping,
    Stopped,
}

/// Event subscriber callback.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

struct AttachedEndpoint {
    endpoint: SharedEndpoint,
    bootstrap: Option<RemoteAddress>,
}

/// Work items for a per-connection worker. Routing disconnects through the
/// same queue as frames preserves their relative order.
enum WorkerItem {
    Frame(Vec<u8>),
    Closed(Error),
}

struct LinkState {
    endpoint: SharedEndpoint,
    protocol: Protocol,
    remote_uri: String,
    peer: Option<NodeIdentifier>,
    initiator: Option<HandshakeInitiator>,
    worker: mpsc::UnboundedSender<WorkerItem>,
}

struct RuntimeContext {
    handle: Option<tokio::runtime::Handle>,
    owned: Option<tokio::runtime::Runtime>,
}

struct ServiceInner {
    identifier: StdMutex<(NodeIdentifier, IdentifierPersistence)>,
    options: StdRwLock<Arc<Options>>,
    catalog: StdRwLock<Arc<SuiteCatalog>>,
    state: StdMutex<Lifecycle>,
    router: Router,
    tracker: RequestTracker,
    registry: PeerRegistry,
    links: StdMutex<HashMap<ConnectionId, LinkState>>,
    endpoints: StdMutex<Vec<AttachedEndpoint>>,
    subscribers: StdMutex<Vec<(Option<EventTag>, EventCallback)>>,
    logger: LoggerSlot,
    cancellations: StdMutex<HashMap<RequestKey, CancellationToken>>,
    dial_waiters: StdMutex<HashMap<String, Vec<oneshot::Sender<bool>>>>,
    runtime: StdMutex<RuntimeContext>,
    shutdown: watch::Sender<bool>,
    this: Weak<ServiceInner>,
}

/// The embeddable Brypt node runtime.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

impl Service {
    /// A configured service with a fresh ephemeral identifier.
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new_cyclic(|this| ServiceInner {
            identifier: StdMutex::new((
                NodeIdentifier::generate(),
                IdentifierPersistence::Ephemeral,
            )),
            options: StdRwLock::new(Arc::new(Options::default())),
            catalog: StdRwLock::new(Arc::new(SuiteCatalog::standard())),
            state: StdMutex::new(Lifecycle::Configured),
            router: Router::new(),
            tracker: RequestTracker::new(),
            registry: PeerRegistry::new(),
            links: StdMutex::new(HashMap::new()),
            endpoints: StdMutex::new(Vec::new()),
            subscribers: StdMutex::new(Vec::new()),
            logger: LoggerSlot::new(),
            cancellations: StdMutex::new(HashMap::new()),
            dial_waiters: StdMutex::new(HashMap::new()),
            runtime: StdMutex::new(RuntimeContext { handle: None, owned: None }),
            shutdown,
            this: this.clone(),
        });
        inner.register_builtin_routes();
        Self { inner }
    }

    /// This node's identifier.
    pub fn identifier(&self) -> NodeIdentifier {
        lock(&self.inner.identifier).0
    }

    /// Whether the identifier was generated or loaded from storage.
    pub fn identifier_persistence(&self) -> IdentifierPersistence {
        lock(&self.inner.identifier).1
    }

    /// True while the runtime is started.
    pub fn is_running(&self) -> bool {
        *lock(&self.inner.state) == Lifecycle::Running
    }

    /// Set one option. Only permitted while configured.
    pub fn set_option(&self, key: OptionKey, value: impl Into<OptionValue>) -> Result<()> {
        self.inner.require_configured()?;
        let mut updated = (**read(&self.inner.options)).clone();
        updated.set(key, value.into())?;
        self.inner.logger.set_level(updated.log_level);
        *write(&self.inner.options) = Arc::new(updated);
        Ok(())
    }

    /// Read one option.
    pub fn get_option(&self, key: OptionKey) -> OptionValue {
        read(&self.inner.options).get(key)
    }

    /// Replace the supported-algorithms catalog. Only while configured.
    pub fn set_supported_algorithms(&self, packages: Vec<AlgorithmsPackage>) -> Result<()> {
        self.inner.require_configured()?;
        let catalog = SuiteCatalog::new(packages).map_err(|error| match error {
            brypt_crypto::CryptoError::UnknownAlgorithm(_) => Error::NotSupported,
            _ => Error::InvalidConfiguration,
        })?;
        *write(&self.inner.catalog) = Arc::new(catalog);
        Ok(())
    }

    /// Register the log callback. Only while configured; set-once.
    pub fn register_logger(&self, callback: LogCallback) -> Result<()> {
        self.inner.require_configured()?;
        self.inner.logger.register(callback)
    }

    /// Subscribe to one event kind. Only while configured.
    pub fn subscribe(
        &self,
        tag: EventTag,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Result<()> {
        self.inner.require_configured()?;
        lock(&self.inner.subscribers).push((Some(tag), Arc::new(callback)));
        Ok(())
    }

    /// Subscribe to every event. Only while configured.
    pub fn subscribe_all(&self, callback: impl Fn(&Event) + Send + Sync + 'static) -> Result<()> {
        self.inner.require_configured()?;
        lock(&self.inner.subscribers).push((None, Arc::new(callback)));
        Ok(())
    }

    /// Bind a handler to a route. Only while configured.
    pub fn route(&self, path: &str, handler: impl RouteHandler + 'static) -> Result<()> {
        self.inner.require_configured()?;
        self.inner.router.register(path, Arc::new(handler))
    }

    /// Attach a TCP endpoint listening at `uri` on the named interface,
    /// optionally with a bootstrap address to dial at startup. Only while
    /// configured.
    pub fn attach_endpoint(
        &self,
        protocol: Protocol,
        interface: &str,
        uri: &str,
        bootstrap: Option<&str>,
    ) -> Result<()> {
        self.inner.require_configured()?;
        if protocol != Protocol::Tcp {
            return Err(Error::NotSupported);
        }
        let listen = RemoteAddress::new(protocol, uri, false)?;
        let bootstrap = bootstrap
            .map(|uri| RemoteAddress::new(protocol, uri, true))
            .transpose()?;
        tracing::debug!(%listen, interface, "attaching endpoint");
        let endpoint: SharedEndpoint = TcpEndpoint::new(listen.uri());
        self.inner.push_endpoint(endpoint, bootstrap)
    }

    /// Attach a caller-provided endpoint (e.g. an in-memory transport).
    /// Only while configured.
    pub fn attach_custom_endpoint(
        &self,
        endpoint: SharedEndpoint,
        bootstrap: Option<RemoteAddress>,
    ) -> Result<()> {
        self.inner.require_configured()?;
        self.inner.push_endpoint(endpoint, bootstrap)
    }

    /// Detach the endpoint bound to `uri`. Only while configured.
    pub fn detach_endpoint(&self, protocol: Protocol, uri: &str) -> Result<()> {
        self.inner.require_configured()?;
        let mut endpoints = lock(&self.inner.endpoints);
        let before = endpoints.len();
        endpoints.retain(|attached| {
            attached.endpoint.protocol() != protocol || attached.endpoint.uri() != uri
        });
        if endpoints.len() == before {
            return Err(Error::NotAvailable);
        }
        Ok(())
    }

    /// Start the runtime: bind endpoints, spin up the pump and ticker, and
    /// dial bootstraps.
    ///
    /// # Errors
    ///
    /// A bind failure surfaces here (`binding_failed` or `address_in_use`)
    /// and `runtime_started` is never emitted.
    pub fn startup(&self) -> Result<()> {
        self.inner.clone_arc()?.startup()
    }

    /// Stop the runtime. Pending requests cancel with `shutdown_requested`;
    /// connected peers receive a best-effort `/brypt/bye`.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.clone_arc()?.shutdown(Error::ShutdownRequested)
    }

    /// Dial a remote address. The address's bootstrap marker controls
    /// whether it is persisted for future runs.
    pub fn connect(&self, address: RemoteAddress) -> Result<()> {
        let inner = self.inner.clone_arc()?;
        inner.require_running()?;
        if let Some(peer) = inner.registry.find_by_address(&address) {
            if peer.authorization_state() == crate::peer::AuthorizationState::Flagged {
                return Err(Error::AccessDenied);
            }
            if peer.is_authorized() {
                return Err(Error::AlreadyConnected);
            }
        }
        inner.spawn_dial(address, None);
        Ok(())
    }

    /// Disconnect a peer, keeping its proxy and statistics registered.
    pub fn disconnect(&self, identifier: &NodeIdentifier) -> Result<()> {
        let inner = self.inner.clone_arc()?;
        let peer = inner.registry.get(identifier).ok_or(Error::NotAvailable)?;
        inner.disconnect_peer(&peer, Error::SessionClosed, true);
        Ok(())
    }

    /// Operator clearance of a flagged peer.
    pub fn unflag(&self, identifier: &NodeIdentifier) -> Result<()> {
        let peer = self.inner.registry.get(identifier).ok_or(Error::NotAvailable)?;
        peer.unflag();
        Ok(())
    }

    /// The peer proxy for an identifier, if registered.
    pub fn peer(&self, identifier: &NodeIdentifier) -> Option<Arc<PeerProxy>> {
        self.inner.registry.get(identifier)
    }

    /// Identifiers of every connected-and-authorized peer.
    pub fn authorized_peers(&self) -> Vec<NodeIdentifier> {
        self.inner.registry.authorized().iter().map(|peer| peer.identifier()).collect()
    }

    /// Issue a directed request with the default deadline.
    pub fn request(
        &self,
        to: &NodeIdentifier,
        route: &str,
        payload: Vec<u8>,
        on_response: ResponseCallback,
        on_error: ErrorCallback,
    ) -> Result<()> {
        self.request_with_deadline(to, route, payload, DEFAULT_REQUEST_DEADLINE, on_response, on_error)
    }

    /// Issue a directed request with an explicit deadline.
    pub fn request_with_deadline(
        &self,
        to: &NodeIdentifier,
        route: &str,
        payload: Vec<u8>,
        deadline: Duration,
        on_response: ResponseCallback,
        on_error: ErrorCallback,
    ) -> Result<()> {
        let inner = self.inner.clone_arc()?;
        inner.require_running()?;
        validate_outbound(route, &payload)?;
        let peer = inner.registry.get(to).ok_or(Error::NotConnected)?;
        if !peer.is_authorized() {
            return Err(Error::NotConnected);
        }

        let key = inner.tracker.track(
            route,
            RequestFlavor::Directed,
            vec![*to],
            Instant::now() + deadline,
            on_response,
            on_error,
        );
        let parcel = Parcel::request(inner.local_identifier(), route, key, payload);
        inner.send_tracked(peer, parcel, key);
        Ok(())
    }

    /// Issue a request to every authorized peer with the default deadline.
    /// The expected responder set is fixed at issue time; `resolving` peers
    /// are excluded.
    pub fn broadcast_request(
        &self,
        route: &str,
        payload: Vec<u8>,
        on_response: ResponseCallback,
        on_error: ErrorCallback,
    ) -> Result<()> {
        self.broadcast_request_with_deadline(
            route,
            payload,
            DEFAULT_REQUEST_DEADLINE,
            on_response,
            on_error,
        )
    }

    /// Issue a broadcast request with an explicit deadline.
    pub fn broadcast_request_with_deadline(
        &self,
        route: &str,
        payload: Vec<u8>,
        deadline: Duration,
        on_response: ResponseCallback,
        on_error: ErrorCallback,
    ) -> Result<()> {
        let inner = self.inner.clone_arc()?;
        inner.require_running()?;
        validate_outbound(route, &payload)?;
        let peers = inner.registry.authorized();
        inner.issue_fanout(
            route,
            payload,
            peers,
            RequestFlavor::Broadcast,
            deadline,
            on_response,
            on_error,
        );
        Ok(())
    }

    /// Issue a request to a Bernoulli sample of the authorized peers with
    /// the default deadline. `ratio` must lie in (0, 1]; an empty sample is
    /// rounded up to one peer whenever any peer is authorized.
    pub fn sample_request(
        &self,
        route: &str,
        payload: Vec<u8>,
        ratio: f64,
        on_response: ResponseCallback,
        on_error: ErrorCallback,
    ) -> Result<()> {
        self.sample_request_with_deadline(
            route,
            payload,
            ratio,
            DEFAULT_REQUEST_DEADLINE,
            on_response,
            on_error,
        )
    }

    /// Issue a sampled request with an explicit deadline.
    pub fn sample_request_with_deadline(
        &self,
        route: &str,
        payload: Vec<u8>,
        ratio: f64,
        deadline: Duration,
        on_response: ResponseCallback,
        on_error: ErrorCallback,
    ) -> Result<()> {
        let inner = self.inner.clone_arc()?;
        inner.require_running()?;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(Error::InvalidArgument);
        }
        validate_outbound(route, &payload)?;

        // Uniform without replacement; an all-zero draw rounds up to one.
        let mut peers = inner.registry.authorized();
        if !peers.is_empty() {
            let count = ((ratio * peers.len() as f64).round() as usize).clamp(1, peers.len());
            let mut rng = rand::thread_rng();
            peers.shuffle(&mut rng);
            peers.truncate(count);
        }
        inner.issue_fanout(
            route,
            payload,
            peers,
            RequestFlavor::Sampled,
            deadline,
            on_response,
            on_error,
        );
        Ok(())
    }

    /// Send a fire-and-forget notice to one peer.
    pub fn notify(&self, to: &NodeIdentifier, route: &str, payload: Vec<u8>) -> Result<()> {
        let inner = self.inner.clone_arc()?;
        inner.require_running()?;
        validate_outbound(route, &payload)?;
        let peer = inner.registry.get(to).ok_or(Error::NotConnected)?;
        if !peer.is_authorized() {
            return Err(Error::NotConnected);
        }
        let parcel = Parcel::notice(inner.local_identifier(), route, payload);
        inner.spawn_send(peer, parcel);
        Ok(())
    }

    /// Send a fire-and-forget notice to every authorized peer.
    pub fn broadcast_notify(&self, route: &str, payload: Vec<u8>) -> Result<()> {
        let inner = self.inner.clone_arc()?;
        inner.require_running()?;
        validate_outbound(route, &payload)?;
        let mut parcel = Parcel::notice(inner.local_identifier(), route, payload);
        parcel.flags.broadcast = true;
        for peer in inner.registry.authorized() {
            inner.spawn_send(peer, parcel.clone());
        }
        Ok(())
    }
}

fn validate_outbound(route: &str, payload: &[u8]) -> Result<()> {
    if !route.starts_with('/') {
        return Err(Error::InvalidArgument);
    }
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::PayloadTooLarge);
    }
    Ok(())
}

/// Map a session handshake error onto the embedder taxonomy.
fn handshake_cause(error: &SessionError) -> Error {
    match error {
        SessionError::NotSupported => Error::NotSupported,
        SessionError::Conflict(_) => Error::Conflict,
        SessionError::AccessDenied => Error::AccessDenied,
        SessionError::Malformed => Error::InvalidArgument,
        SessionError::Closed => Error::SessionClosed,
        SessionError::Crypto(_) => Error::AccessDenied,
    }
}

fn error_name(error: Error) -> String {
    serde_json::to_value(error)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

fn error_from_name(name: &str) -> Error {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .unwrap_or(Error::SessionClosed)
}

impl ServiceInner {
    fn clone_arc(&self) -> Result<Arc<ServiceInner>> {
        self.this.upgrade().ok_or(Error::NotAvailable)
    }

    fn local_identifier(&self) -> NodeIdentifier {
        lock(&self.identifier).0
    }

    fn options(&self) -> Arc<Options> {
        read(&self.options).clone()
    }

    fn catalog(&self) -> Arc<SuiteCatalog> {
        read(&self.catalog).clone()
    }

    fn require_configured(&self) -> Result<()> {
        match *lock(&self.state) {
            Lifecycle::Configured => Ok(()),
            Lifecycle::Running | Lifecycle::Stopping => Err(Error::AlreadyStarted),
            Lifecycle::Stopped => Err(Error::NotAvailable),
        }
    }

    fn require_running(&self) -> Result<()> {
        match *lock(&self.state) {
            Lifecycle::Running => Ok(()),
            Lifecycle::Configured => Err(Error::NotStarted),
            Lifecycle::Stopping | Lifecycle::Stopped => Err(Error::ShutdownRequested),
        }
    }

    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = lock(&self.runtime).handle.clone();
        if let Some(handle) = handle {
            handle.spawn(future);
        }
    }

    fn emit_event(&self, event: Event) {
        self.logger.emit(LogLevel::Debug, &format!("event: {event:?}"));
        let matching: Vec<EventCallback> = lock(&self.subscribers)
            .iter()
            .filter(|(filter, _)| filter.is_none() || *filter == Some(event.tag()))
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in matching {
            callback(&event);
        }
    }

    fn register_builtin_routes(self: &Arc<Self>) {
        self.router.register_builtin(HEARTBEAT_ROUTE, Arc::new(
            |_source: &NodeIdentifier, _payload: &[u8], next: Next| {
                // Heartbeats may arrive as notices; only requests get the
                // acknowledgement.
                let _ = next.respond(b"alive", StatusCode::Ok);
                Ok(())
            },
        ));

        let this = self.this.clone();
        self.router.register_builtin(INFORMATION_ROUTE, Arc::new(
            move |_source: &NodeIdentifier, _payload: &[u8], next: Next| {
                let Some(inner) = this.upgrade() else {
                    return next.respond_status(StatusCode::ServiceUnavailable);
                };
                let document = serde_json::json!({
                    "identifier": inner.local_identifier(),
                    "version": env!("CARGO_PKG_VERSION"),
                    "peers": inner.registry.len(),
                    "authorized": inner.registry.authorized().len(),
                });
                let payload = serde_json::to_vec(&document).unwrap_or_default();
                let _ = next.respond(&payload, StatusCode::Ok);
                Ok(())
            },
        ));

        // The session-plane routes are consumed by the receive pipeline
        // before dispatch; an application parcel addressed at them is
        // refused.
        for route in [HANDSHAKE_ROUTE, REKEY_ROUTE, BYE_ROUTE, CANCEL_ROUTE] {
            self.router.register_builtin(route, Arc::new(
                |_source: &NodeIdentifier, _payload: &[u8], next: Next| {
                    let _ = next.respond_status(StatusCode::Forbidden);
                    Ok(())
                },
            ));
        }
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    fn startup(self: Arc<Self>) -> Result<()> {
        self.require_configured()?;

        let options = self.options();

        // Resolve the runtime: embed into an ambient tokio runtime when one
        // exists, otherwise own a worker pool sized by `core_threads`.
        {
            let mut runtime = lock(&self.runtime);
            if runtime.handle.is_none() {
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => runtime.handle = Some(handle),
                    Err(_) => {
                        let workers = options.core_threads.max(1);
                        let owned = tokio::runtime::Builder::new_multi_thread()
                            .worker_threads(workers)
                            .thread_name("brypt-core")
                            .enable_all()
                            .build()
                            .map_err(|_| Error::InitializationFailure)?;
                        runtime.handle = Some(owned.handle().clone());
                        runtime.owned = Some(owned);
                    }
                }
            }
        }
        let handle = lock(&self.runtime).handle.clone().ok_or(Error::InitializationFailure)?;
        let _guard = handle.enter();

        // Adopt a persisted identifier before anything observes ours.
        if options.use_bootstraps {
            if let Some(path) = options.configuration_path() {
                if let Ok(Some((_, Some(persisted)))) = persistence::read_configuration(&path) {
                    *lock(&self.identifier) = (persisted, IdentifierPersistence::Persistent);
                }
            }
        }

        self.logger.set_level(options.log_level);
        self.logger.emit(
            LogLevel::Info,
            &format!("starting service {}", self.local_identifier()),
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Bind every attached endpoint; a failure aborts startup before
        // `runtime_started` can fire.
        let mut started: Vec<SharedEndpoint> = Vec::new();
        let attached: Vec<(SharedEndpoint, Option<RemoteAddress>)> = lock(&self.endpoints)
            .iter()
            .map(|entry| (entry.endpoint.clone(), entry.bootstrap.clone()))
            .collect();
        for (endpoint, _) in &attached {
            if let Err(error) = endpoint.start(events_tx.clone()) {
                self.emit_event(Event::BindingFailed {
                    protocol: endpoint.protocol(),
                    uri: endpoint.uri(),
                    cause: error,
                });
                for live in started {
                    live.shutdown();
                }
                return Err(error);
            }
            self.emit_event(Event::EndpointStarted {
                protocol: endpoint.protocol(),
                uri: endpoint.uri(),
            });
            started.push(endpoint.clone());
        }

        self.router.freeze();
        let _ = self.shutdown.send(false);

        // The single pump feeding per-connection workers.
        let pump = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut events_rx = events_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    event = events_rx.recv() => match event {
                        Some(event) => pump.handle_endpoint_event(event).await,
                        None => break,
                    },
                }
            }
        });

        // The request-deadline ticker.
        let ticker = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TIMER_GRANULARITY);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => ticker.expire_requests(),
                }
            }
        });

        *lock(&self.state) = Lifecycle::Running;
        self.emit_event(Event::RuntimeStarted);

        // Dial bootstraps: attached seeds plus the persisted peers file.
        let mut seeds: Vec<RemoteAddress> =
            attached.into_iter().filter_map(|(_, bootstrap)| bootstrap).collect();
        if options.use_bootstraps {
            if let Some(path) = options.peers_path() {
                match persistence::read_bootstraps(&path) {
                    Ok(persisted) => seeds.extend(persisted),
                    Err(_) => self
                        .logger
                        .emit(LogLevel::Warn, "bootstrap file exists but did not parse"),
                }
            }
        }
        seeds.sort();
        seeds.dedup();
        for seed in seeds {
            self.spawn_dial(seed, None);
        }
        Ok(())
    }

    fn shutdown(self: Arc<Self>, cause: Error) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                Lifecycle::Running => *state = Lifecycle::Stopping,
                Lifecycle::Configured => return Err(Error::NotStarted),
                Lifecycle::Stopping | Lifecycle::Stopped => return Err(Error::ShutdownRequested),
            }
        }
        self.logger.emit(LogLevel::Info, "stopping service");
        let _ = self.shutdown.send(true);

        // Cancel every pending request.
        for closed in self.tracker.drain() {
            for peer in closed.unresponded {
                (closed.on_error)(peer, Error::ShutdownRequested);
            }
        }
        for (_, token) in lock(&self.cancellations).drain() {
            token.cancel();
        }

        // Say goodbye and tear down sessions.
        let goodbye = Goodbye { cause: error_name(Error::ShutdownRequested) };
        let payload = goodbye.to_bytes().unwrap_or_default();
        for peer in self.registry.all() {
            if peer.connection_state() != crate::peer::ConnectionState::Connected {
                continue;
            }
            let parcel = Parcel::control(self.local_identifier(), BYE_ROUTE, payload.clone());
            let _ = peer.send_plain(&parcel);
            if let Ok(mut session) = peer.session().try_lock() {
                if let Some(session) = session.as_mut() {
                    session.teardown();
                }
            }
            let protocol = peer.protocol();
            peer.set_disconnected();
            if let Some(protocol) = protocol {
                self.emit_event(Event::PeerDisconnected {
                    identifier: peer.identifier(),
                    protocol,
                    cause: Error::ShutdownRequested,
                });
            }
        }
        lock(&self.links).clear();

        // Close endpoints.
        let attached: Vec<SharedEndpoint> =
            lock(&self.endpoints).iter().map(|entry| entry.endpoint.clone()).collect();
        for endpoint in &attached {
            endpoint.shutdown();
            self.emit_event(Event::EndpointStopped {
                protocol: endpoint.protocol(),
                uri: endpoint.uri(),
            });
        }

        // Persist bootstraps and configuration.
        let options = self.options();
        if options.use_bootstraps {
            if let Some(path) = options.peers_path() {
                let mut addresses: Vec<RemoteAddress> = Vec::new();
                for peer in self.registry.all() {
                    addresses.extend(peer.addresses());
                }
                for entry in lock(&self.endpoints).iter() {
                    if let Some(bootstrap) = &entry.bootstrap {
                        addresses.push(bootstrap.clone());
                    }
                }
                addresses.sort();
                addresses.dedup();
                if persistence::write_bootstraps(&path, &addresses).is_err() {
                    self.logger.emit(LogLevel::Warn, "failed to persist bootstraps");
                }
            }
            if let Some(path) = options.configuration_path() {
                if persistence::write_configuration(&path, &options, &self.local_identifier())
                    .is_err()
                {
                    self.logger.emit(LogLevel::Warn, "failed to persist configuration");
                }
            }
        }

        self.emit_event(Event::RuntimeStopped { cause });
        *lock(&self.state) = Lifecycle::Stopped;

        // An owned worker pool winds down in the background.
        let owned = lock(&self.runtime).owned.take();
        if let Some(runtime) = owned {
            runtime.shutdown_background();
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Dialing
    // -----------------------------------------------------------------

    /// One endpoint per protocol keeps connection handles unambiguous.
    fn push_endpoint(
        &self,
        endpoint: SharedEndpoint,
        bootstrap: Option<RemoteAddress>,
    ) -> Result<()> {
        let mut endpoints = lock(&self.endpoints);
        if endpoints.iter().any(|entry| entry.endpoint.protocol() == endpoint.protocol()) {
            return Err(Error::Conflict);
        }
        endpoints.push(AttachedEndpoint { endpoint, bootstrap });
        Ok(())
    }

    fn endpoint_for(&self, protocol: Protocol) -> Option<SharedEndpoint> {
        lock(&self.endpoints)
            .iter()
            .map(|entry| entry.endpoint.clone())
            .find(|endpoint| endpoint.protocol() == protocol)
    }

    fn spawn_dial(self: &Arc<Self>, address: RemoteAddress, known_peer: Option<NodeIdentifier>) {
        let Some(endpoint) = self.endpoint_for(address.protocol()) else {
            self.logger.emit(
                LogLevel::Warn,
                &format!("no endpoint attached for {address}"),
            );
            return;
        };
        let inner = self.clone();
        self.spawn(async move {
            inner.run_dial(endpoint, address, known_peer).await;
        });
    }

    async fn run_dial(
        self: &Arc<Self>,
        endpoint: SharedEndpoint,
        address: RemoteAddress,
        known_peer: Option<NodeIdentifier>,
    ) {
        let options = self.options();
        let attempts = options.connection_retry_limit.max(1);
        for attempt in 0..attempts {
            if *self.shutdown.borrow() {
                return;
            }
            let (waiter_tx, waiter_rx) = oneshot::channel();
            lock(&self.dial_waiters)
                .entry(address.uri().to_string())
                .or_default()
                .push(waiter_tx);

            if endpoint.dial(address.uri()).is_ok() {
                match tokio::time::timeout(options.connection_timeout(), waiter_rx).await {
                    Ok(Ok(true)) => return,
                    Ok(Ok(false)) | Ok(Err(_)) | Err(_) => {}
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(options.connection_retry_interval()).await;
            }
        }

        self.logger.emit(
            LogLevel::Warn,
            &format!("exhausted connection attempts to {address}"),
        );
        if let Some(identifier) = known_peer {
            if let Some(peer) = self.registry.get(&identifier) {
                peer.set_disconnected();
                self.emit_event(Event::PeerDisconnected {
                    identifier,
                    protocol: address.protocol(),
                    cause: Error::ConnectionFailed,
                });
            }
        }
    }

    fn resolve_dial(&self, uri: &str, connected: bool) {
        let waiters = lock(&self.dial_waiters).remove(uri);
        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.send(connected);
            }
        }
    }

    // -----------------------------------------------------------------
    // Endpoint event pump
    // -----------------------------------------------------------------

    async fn handle_endpoint_event(self: &Arc<Self>, event: EndpointEvent) {
        match event {
            EndpointEvent::Connected { protocol, connection, remote_uri, dialed } => {
                self.handle_connected(protocol, connection, remote_uri, dialed);
            }
            EndpointEvent::Frame { connection, bytes } => {
                let worker = lock(&self.links)
                    .get(&connection)
                    .map(|link| link.worker.clone());
                if let Some(worker) = worker {
                    let _ = worker.send(WorkerItem::Frame(bytes));
                }
            }
            EndpointEvent::Keepalive { .. } => {}
            EndpointEvent::Disconnected { connection, cause } => {
                let worker = lock(&self.links)
                    .get(&connection)
                    .map(|link| link.worker.clone());
                if let Some(worker) = worker {
                    let _ = worker.send(WorkerItem::Closed(cause));
                }
            }
            EndpointEvent::DialFailed { uri, cause } => {
                self.logger.emit(LogLevel::Debug, &format!("dial to {uri} failed: {cause}"));
                self.resolve_dial(&uri, false);
            }
            EndpointEvent::Stopped { protocol, uri } => {
                if *lock(&self.state) == Lifecycle::Running {
                    self.emit_event(Event::EndpointStopped { protocol, uri });
                }
            }
        }
    }

    fn handle_connected(
        self: &Arc<Self>,
        protocol: Protocol,
        connection: ConnectionId,
        remote_uri: String,
        dialed: bool,
    ) {
        let Some(endpoint) = self.endpoint_for(protocol) else { return };

        // The dialing side opens the handshake.
        let initiator = if dialed {
            let catalog = self.catalog();
            let token = self.options().network_token.clone();
            match HandshakeInitiator::new(&catalog, &token, self.local_identifier()) {
                Ok((initiator, init)) => match init.to_bytes() {
                    Ok(payload) => Some((initiator, payload)),
                    Err(_) => None,
                },
                Err(_) => None,
            }
        } else {
            None
        };

        let (worker_tx, mut worker_rx) = mpsc::unbounded_channel::<WorkerItem>();
        let state = LinkState {
            endpoint: endpoint.clone(),
            protocol,
            remote_uri: remote_uri.clone(),
            peer: None,
            initiator: None,
            worker: worker_tx,
        };
        lock(&self.links).insert(connection, state);

        // Per-connection worker: frames for one peer are handled serially,
        // and the transport teardown runs after every queued frame.
        let worker = self.clone();
        self.spawn(async move {
            while let Some(item) = worker_rx.recv().await {
                match item {
                    WorkerItem::Frame(bytes) => worker.process_frame(connection, bytes).await,
                    WorkerItem::Closed(cause) => {
                        worker.handle_transport_disconnect(connection, cause);
                        break;
                    }
                }
            }
        });

        if let Some((initiator, payload)) = initiator {
            lock(&self.links)
                .entry(connection)
                .and_modify(|link| link.initiator = Some(initiator));
            let parcel =
                Parcel::handshake(self.local_identifier(), HANDSHAKE_ROUTE, payload);
            if let Ok(body) = parcel.encode() {
                if let Ok(framed) = frame::encode_frame(&body) {
                    let _ = endpoint.send(connection, framed);
                }
            }
        }

        if dialed {
            self.resolve_dial(&remote_uri, true);
        }

        // The handshake deadline watchdog.
        let watchdog = self.clone();
        self.spawn(async move {
            tokio::time::sleep(HANDSHAKE_DEADLINE).await;
            watchdog.enforce_handshake_deadline(connection);
        });
    }

    fn enforce_handshake_deadline(self: &Arc<Self>, connection: ConnectionId) {
        let pending = {
            let links = lock(&self.links);
            match links.get(&connection) {
                Some(link) => {
                    let authorized = link
                        .peer
                        .and_then(|identifier| self.registry.get(&identifier))
                        .map(|peer| peer.is_authorized())
                        .unwrap_or(false);
                    if authorized {
                        None
                    } else {
                        Some((link.endpoint.clone(), link.peer, link.protocol))
                    }
                }
                None => None,
            }
        };
        let Some((endpoint, peer, protocol)) = pending else { return };

        self.logger.emit(
            LogLevel::Warn,
            &format!("handshake deadline elapsed on {connection}"),
        );
        lock(&self.links).remove(&connection);
        endpoint.disconnect(connection);
        if let Some(identifier) = peer {
            if let Some(proxy) = self.registry.get(&identifier) {
                proxy.set_disconnected();
            }
            self.emit_event(Event::PeerDisconnected {
                identifier,
                protocol,
                cause: Error::Timeout,
            });
        }
    }

    fn handle_transport_disconnect(self: &Arc<Self>, connection: ConnectionId, cause: Error) {
        let removed = lock(&self.links).remove(&connection);
        let Some(link) = removed else { return };
        if let Some(identifier) = link.peer {
            if let Some(peer) = self.registry.get(&identifier) {
                let was_connected =
                    peer.connection_state() == crate::peer::ConnectionState::Connected;
                peer.set_disconnected();
                if was_connected {
                    self.emit_event(Event::PeerDisconnected {
                        identifier,
                        protocol: link.protocol,
                        cause,
                    });
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Frame processing
    // -----------------------------------------------------------------

    async fn process_frame(self: &Arc<Self>, connection: ConnectionId, bytes: Vec<u8>) {
        // The encrypted flag decides whether the frame carries a session
        // trailer; it sits in the fixed header.
        let encrypted = bytes.get(2).is_some_and(|flags| flags & 0b1000 != 0);
        if encrypted {
            self.process_protected_frame(connection, bytes).await;
        } else {
            self.process_plain_frame(connection, bytes).await;
        }
    }

    async fn process_protected_frame(self: &Arc<Self>, connection: ConnectionId, bytes: Vec<u8>) {
        let peer = {
            let links = lock(&self.links);
            links.get(&connection).and_then(|link| link.peer)
        };
        let Some(peer) = peer.and_then(|identifier| self.registry.get(&identifier)) else {
            tracing::debug!(%connection, "encrypted frame before authorization");
            return;
        };
        if !peer.is_authorized() {
            peer.statistics().increment_invalid_frames();
            return;
        }

        let opened = {
            let mut guard = peer.session().lock().await;
            match guard.as_mut() {
                Some(session) => session.unprotect(&bytes),
                None => Err(SessionFault::Closed),
            }
        };
        match opened {
            Ok(parcel) => {
                peer.statistics().increment_received();
                self.dispatch_application(peer, parcel).await;
            }
            Err(SessionFault::Replay) => {
                peer.statistics().increment_invalid_frames();
                tracing::debug!(peer = %peer.identifier(), "replayed frame dropped");
            }
            Err(SessionFault::MacFailure { abuse }) => {
                peer.statistics().increment_invalid_frames();
                if abuse {
                    self.flag_peer(&peer).await;
                }
            }
            Err(SessionFault::Malformed) => {
                peer.statistics().increment_invalid_frames();
            }
            Err(SessionFault::Closed) => {
                tracing::debug!(peer = %peer.identifier(), "frame for a closed session");
            }
        }
    }

    async fn flag_peer(self: &Arc<Self>, peer: &Arc<PeerProxy>) {
        self.logger.emit(
            LogLevel::Warn,
            &format!("flagging peer {} for MAC abuse", peer.identifier()),
        );
        let link = peer.link();
        peer.flag().await;
        peer.set_disconnected();
        let mut protocol = Protocol::Tcp;
        if let Some(link) = link {
            protocol = link.protocol;
            lock(&self.links).remove(&link.connection);
            link.endpoint.disconnect(link.connection);
        }
        self.emit_event(Event::PeerDisconnected {
            identifier: peer.identifier(),
            protocol,
            cause: Error::AccessDenied,
        });
    }

    async fn process_plain_frame(self: &Arc<Self>, connection: ConnectionId, bytes: Vec<u8>) {
        let parcel = match Parcel::decode(&bytes) {
            Ok(parcel) => parcel,
            Err(error) => {
                tracing::debug!(%connection, %error, "dropping malformed frame");
                let peer = lock(&self.links)
                    .get(&connection)
                    .and_then(|link| link.peer)
                    .and_then(|identifier| self.registry.get(&identifier));
                if let Some(peer) = peer {
                    peer.statistics().increment_invalid_frames();
                }
                return;
            }
        };

        match parcel.parcel_type {
            ParcelType::Handshake if parcel.route == HANDSHAKE_ROUTE => {
                self.handle_handshake(connection, parcel).await;
            }
            ParcelType::Handshake if parcel.route == REKEY_ROUTE => {
                self.handle_rekey(connection, parcel).await;
            }
            ParcelType::Control if parcel.route == BYE_ROUTE => {
                self.handle_bye(connection, parcel);
            }
            ParcelType::Control if parcel.route == CANCEL_ROUTE => {
                if let Ok(cancel) = CancelRequest::from_bytes(&parcel.payload) {
                    let token = lock(&self.cancellations).remove(&cancel.request_key);
                    if let Some(token) = token {
                        token.cancel();
                    }
                }
            }
            _ => {
                // Application traffic must arrive encrypted.
                let peer = lock(&self.links)
                    .get(&connection)
                    .and_then(|link| link.peer)
                    .and_then(|identifier| self.registry.get(&identifier));
                if let Some(peer) = peer {
                    peer.statistics().increment_invalid_frames();
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Handshake plane
    // -----------------------------------------------------------------

    async fn handle_handshake(self: &Arc<Self>, connection: ConnectionId, parcel: Parcel) {
        let initiator = lock(&self.links)
            .get_mut(&connection)
            .and_then(|link| link.initiator.take());

        if let Some(initiator) = initiator {
            self.complete_initiated_handshake(connection, parcel, initiator).await;
        } else {
            self.answer_handshake(connection, parcel).await;
        }
    }

    async fn complete_initiated_handshake(
        self: &Arc<Self>,
        connection: ConnectionId,
        parcel: Parcel,
        initiator: HandshakeInitiator,
    ) {
        let remote = parcel.source;
        let reply = match HandshakeReply::from_bytes(&parcel.payload) {
            Ok(reply) => reply,
            Err(_) => {
                self.abort_handshake(connection, Some(remote), Error::InvalidArgument);
                return;
            }
        };
        match initiator.finalize(&reply) {
            Ok(session) => {
                self.establish_peer(connection, remote, session, true).await;
            }
            Err(error) => {
                let cause = handshake_cause(&error);
                self.logger.emit(
                    LogLevel::Warn,
                    &format!("handshake with {remote} failed: {error}"),
                );
                if matches!(error, SessionError::AccessDenied) {
                    let peer = self.registry.ensure(remote);
                    peer.flag().await;
                }
                self.abort_handshake(connection, Some(remote), cause);
            }
        }
    }

    async fn answer_handshake(self: &Arc<Self>, connection: ConnectionId, parcel: Parcel) {
        let remote = parcel.source;
        let init = match HandshakeInit::from_bytes(&parcel.payload) {
            Ok(init) => init,
            Err(_) => {
                self.abort_handshake(connection, Some(remote), Error::InvalidArgument);
                return;
            }
        };

        let catalog = self.catalog();
        let token = self.options().network_token.clone();
        match session::respond(&catalog, &token, remote, &init, &parcel.payload) {
            Ok((session, reply)) => {
                let Ok(payload) = reply.to_bytes() else {
                    self.abort_handshake(connection, Some(remote), Error::InvalidArgument);
                    return;
                };
                let established =
                    self.establish_peer(connection, remote, session, false).await;
                if !established {
                    return;
                }
                let parcel =
                    Parcel::handshake(self.local_identifier(), HANDSHAKE_ROUTE, payload);
                let endpoint = lock(&self.links)
                    .get(&connection)
                    .map(|link| link.endpoint.clone());
                if let Some(endpoint) = endpoint {
                    if let Ok(body) = parcel.encode() {
                        if let Ok(framed) = frame::encode_frame(&body) {
                            let _ = endpoint.send(connection, framed);
                        }
                    }
                }
            }
            Err(error) => {
                let cause = handshake_cause(&error);
                self.logger.emit(
                    LogLevel::Warn,
                    &format!("refusing handshake from {remote}: {error}"),
                );
                self.abort_handshake(connection, Some(remote), cause);
            }
        }
    }

    /// Install a session on the peer, wiring the link and emitting
    /// `peer_connected`. Returns false when the connection was dropped.
    async fn establish_peer(
        self: &Arc<Self>,
        connection: ConnectionId,
        remote: NodeIdentifier,
        session: crate::session::Session,
        dialed: bool,
    ) -> bool {
        let link_parts = {
            let mut links = lock(&self.links);
            match links.get_mut(&connection) {
                Some(link) => {
                    link.peer = Some(remote);
                    Some((link.endpoint.clone(), link.protocol, link.remote_uri.clone()))
                }
                None => None,
            }
        };
        let Some((endpoint, protocol, remote_uri)) = link_parts else { return false };

        let peer = self.registry.ensure(remote);
        if let Ok(address) = RemoteAddress::new(protocol, remote_uri, dialed) {
            peer.register_address(address);
        }
        peer.set_connected(Link { endpoint: endpoint.clone(), connection, protocol });

        if let Err(error) = peer.authorize(session).await {
            // A second authorized session for the same peer is refused.
            self.logger.emit(
                LogLevel::Warn,
                &format!("refusing duplicate session for {remote}: {error}"),
            );
            lock(&self.links).remove(&connection);
            endpoint.disconnect(connection);
            return false;
        }

        self.emit_event(Event::PeerConnected { identifier: remote, protocol });
        true
    }

    fn abort_handshake(
        self: &Arc<Self>,
        connection: ConnectionId,
        remote: Option<NodeIdentifier>,
        cause: Error,
    ) {
        let removed = lock(&self.links).remove(&connection);
        let Some(link) = removed else { return };

        // Tell the other side why before dropping the transport, so an
        // initiator can report `not_supported` rather than a bare timeout.
        let goodbye = Goodbye { cause: error_name(cause) };
        if let Ok(payload) = goodbye.to_bytes() {
            let parcel = Parcel::control(self.local_identifier(), BYE_ROUTE, payload);
            if let Ok(body) = parcel.encode() {
                if let Ok(framed) = frame::encode_frame(&body) {
                    let _ = link.endpoint.send(connection, framed);
                }
            }
        }
        link.endpoint.disconnect(connection);

        if let Some(identifier) = remote {
            if let Some(peer) = self.registry.get(&identifier) {
                peer.set_disconnected();
            }
            self.emit_event(Event::PeerDisconnected {
                identifier,
                protocol: link.protocol,
                cause,
            });
        }
    }

    async fn handle_rekey(self: &Arc<Self>, connection: ConnectionId, parcel: Parcel) {
        let peer = lock(&self.links)
            .get(&connection)
            .and_then(|link| link.peer)
            .and_then(|identifier| self.registry.get(&identifier));
        let Some(peer) = peer else { return };
        if !peer.is_authorized() {
            peer.statistics().increment_invalid_frames();
            return;
        }

        // The exchange shares a route; the payload schema tells the two
        // messages apart.
        if let Ok(init) = RekeyInit::from_bytes(&parcel.payload) {
            let reply = {
                let mut guard = peer.session().lock().await;
                guard.as_mut().map(|session| session.apply_rekey_init(&init))
            };
            match reply {
                Some(Ok(reply)) => {
                    if let Ok(payload) = reply.to_bytes() {
                        let parcel =
                            Parcel::handshake(self.local_identifier(), REKEY_ROUTE, payload);
                        let _ = peer.send_plain(&parcel);
                    }
                }
                Some(Err(error)) => {
                    self.logger.emit(
                        LogLevel::Warn,
                        &format!("rejecting rekey from {}: {error}", peer.identifier()),
                    );
                    peer.statistics().increment_invalid_frames();
                }
                None => {}
            }
            return;
        }

        if let Ok(reply) = RekeyReply::from_bytes(&parcel.payload) {
            let flushed = {
                let mut guard = peer.session().lock().await;
                guard.as_mut().map(|session| session.apply_rekey_reply(&reply))
            };
            match flushed {
                Some(Ok(queued)) => {
                    for parcel in queued {
                        if peer.send_parcel(parcel).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Err(error)) => {
                    self.logger.emit(
                        LogLevel::Warn,
                        &format!("rekey with {} failed: {error}", peer.identifier()),
                    );
                    peer.statistics().increment_invalid_frames();
                }
                None => {}
            }
            return;
        }

        peer.statistics().increment_invalid_frames();
    }

    fn handle_bye(self: &Arc<Self>, connection: ConnectionId, parcel: Parcel) {
        let cause = Goodbye::from_bytes(&parcel.payload)
            .map(|goodbye| error_from_name(&goodbye.cause))
            .unwrap_or(Error::SessionClosed);

        let removed = lock(&self.links).remove(&connection);
        let Some(link) = removed else { return };
        link.endpoint.disconnect(connection);

        let identifier = link.peer.unwrap_or(parcel.source);
        if let Some(peer) = self.registry.get(&identifier) {
            peer.set_disconnected();
        }
        self.emit_event(Event::PeerDisconnected {
            identifier,
            protocol: link.protocol,
            cause,
        });
    }

    // -----------------------------------------------------------------
    // Application dispatch
    // -----------------------------------------------------------------

    async fn dispatch_application(self: &Arc<Self>, peer: Arc<PeerProxy>, parcel: Parcel) {
        let source = peer.identifier();
        if parcel.source != source {
            // The session authenticates the link; a mismatched source
            // claim is a forgery attempt.
            peer.statistics().increment_invalid_frames();
            return;
        }

        if parcel.flags.reply {
            let Some(key) = parcel.request_key else {
                peer.statistics().increment_invalid_frames();
                return;
            };
            let status = parcel.status.unwrap_or(StatusCode::Unknown);
            if !self.tracker.handle_reply(source, key, status, parcel.payload) {
                peer.statistics().increment_invalid_frames();
            }
            return;
        }

        let Some(handler) = self.router.resolve(&parcel.route) else {
            tracing::debug!(route = %parcel.route, "no handler registered");
            if let Some(key) = parcel.request_key {
                let reply = Parcel::reply(
                    self.local_identifier(),
                    &parcel.route,
                    key,
                    StatusCode::NotFound,
                    Vec::new(),
                );
                let _ = peer.send_parcel(reply).await;
            }
            return;
        };

        let cancellation = CancellationToken::new();
        if let Some(key) = parcel.request_key {
            lock(&self.cancellations).insert(key, cancellation.clone());
        }
        let backend: Arc<dyn NextBackend> = self.clone();
        let next = Next::new(
            backend,
            source,
            parcel.route.clone(),
            parcel.request_key,
            cancellation,
        );

        let outcome = handler.handle(&source, &parcel.payload, next.clone());

        // A request the handler neither answered, deferred, nor suspended
        // closes with an automatic reply.
        if let Some(key) = next.request_key() {
            if next.needs_automatic_reply() {
                let status = match &outcome {
                    Ok(()) => StatusCode::NoContent,
                    Err(_) => StatusCode::InternalServerError,
                };
                lock(&self.cancellations).remove(&key);
                let reply = Parcel::reply(
                    self.local_identifier(),
                    &parcel.route,
                    key,
                    status,
                    Vec::new(),
                );
                let _ = peer.send_parcel(reply).await;
            }
        }
        if let Err(error) = outcome {
            self.logger.emit(
                LogLevel::Warn,
                &format!("handler for {} returned {error}", parcel.route),
            );
        }

        // The send path is the natural rekey trigger point.
        self.maybe_rekey(&peer).await;
    }

    async fn maybe_rekey(self: &Arc<Self>, peer: &Arc<PeerProxy>) {
        let init = {
            let mut guard = peer.session().lock().await;
            match guard.as_mut() {
                Some(session) if session.needs_rekey() => session.initiate_rekey().ok(),
                _ => None,
            }
        };
        if let Some(init) = init {
            if let Ok(payload) = init.to_bytes() {
                let parcel = Parcel::handshake(self.local_identifier(), REKEY_ROUTE, payload);
                let _ = peer.send_plain(&parcel);
            }
        }
    }

    // -----------------------------------------------------------------
    // Outbound requests
    // -----------------------------------------------------------------

    fn send_tracked(self: &Arc<Self>, peer: Arc<PeerProxy>, parcel: Parcel, key: RequestKey) {
        let inner = self.clone();
        self.spawn(async move {
            if let Err(error) = peer.send_parcel(parcel).await {
                if let Some(closed) = inner.tracker.remove(&key) {
                    for unresponded in closed.unresponded {
                        (closed.on_error)(unresponded, error);
                    }
                }
            } else {
                inner.maybe_rekey(&peer).await;
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn issue_fanout(
        self: &Arc<Self>,
        route: &str,
        payload: Vec<u8>,
        peers: Vec<Arc<PeerProxy>>,
        flavor: RequestFlavor,
        deadline: Duration,
        on_response: ResponseCallback,
        on_error: ErrorCallback,
    ) {
        let expected: Vec<NodeIdentifier> =
            peers.iter().map(|peer| peer.identifier()).collect();
        let key = self.tracker.track(
            route,
            flavor,
            expected,
            Instant::now() + deadline,
            on_response,
            on_error,
        );
        let mut parcel = Parcel::request(self.local_identifier(), route, key, payload);
        parcel.flags.broadcast = flavor != RequestFlavor::Directed;
        for peer in peers {
            let parcel = parcel.clone();
            let inner = self.clone();
            self.spawn(async move {
                let _ = peer.send_parcel(parcel).await;
                inner.maybe_rekey(&peer).await;
            });
        }
    }

    fn expire_requests(self: &Arc<Self>) {
        for closed in self.tracker.expire(Instant::now()) {
            for identifier in &closed.unresponded {
                (closed.on_error)(*identifier, Error::Timeout);
            }
            // Abandoning a directed request tells the responder so its
            // handler's cancellation token trips.
            if closed.flavor == RequestFlavor::Directed {
                if let Some(identifier) = closed.unresponded.first() {
                    if let Some(peer) = self.registry.get(identifier) {
                        let cancel = CancelRequest { request_key: closed.key };
                        if let Ok(payload) = cancel.to_bytes() {
                            let parcel = Parcel::control(
                                self.local_identifier(),
                                CANCEL_ROUTE,
                                payload,
                            );
                            let _ = peer.send_plain(&parcel);
                        }
                    }
                }
            }
        }
    }

    fn spawn_send(self: &Arc<Self>, peer: Arc<PeerProxy>, parcel: Parcel) {
        let inner = self.clone();
        self.spawn(async move {
            if let Err(error) = peer.send_parcel(parcel).await {
                tracing::debug!(peer = %peer.identifier(), %error, "notice dropped");
            } else {
                inner.maybe_rekey(&peer).await;
            }
        });
    }

    fn disconnect_peer(self: &Arc<Self>, peer: &Arc<PeerProxy>, cause: Error, say_goodbye: bool) {
        let link = peer.link();
        if say_goodbye {
            let goodbye = Goodbye { cause: error_name(cause) };
            if let Ok(payload) = goodbye.to_bytes() {
                let parcel = Parcel::control(self.local_identifier(), BYE_ROUTE, payload);
                let _ = peer.send_plain(&parcel);
            }
        }
        peer.set_disconnected();
        let mut protocol = Protocol::Tcp;
        if let Some(link) = link {
            protocol = link.protocol;
            lock(&self.links).remove(&link.connection);
            link.endpoint.disconnect(link.connection);
        }
        self.emit_event(Event::PeerDisconnected {
            identifier: peer.identifier(),
            protocol,
            cause,
        });
    }
}

impl NextBackend for ServiceInner {
    fn respond(
        &self,
        to: &NodeIdentifier,
        route: &str,
        key: RequestKey,
        status: StatusCode,
        payload: &[u8],
    ) -> Result<()> {
        let peer = self.registry.get(to).ok_or(Error::NotConnected)?;
        if !peer.is_authorized() {
            return Err(Error::NotConnected);
        }
        lock(&self.cancellations).remove(&key);
        let parcel =
            Parcel::reply(self.local_identifier(), route, key, status, payload.to_vec());
        let inner = self.clone_arc()?;
        inner.spawn(async move {
            let _ = peer.send_parcel(parcel).await;
        });
        Ok(())
    }

    fn dispatch(&self, exclude: &NodeIdentifier, route: &str, payload: &[u8]) -> Result<()> {
        validate_outbound(route, payload)?;
        let inner = self.clone_arc()?;
        let mut parcel = Parcel::notice(self.local_identifier(), route, payload.to_vec());
        parcel.flags.broadcast = true;
        for peer in self.registry.authorized() {
            if peer.identifier() == *exclude {
                continue;
            }
            inner.spawn_send(peer, parcel.clone());
        }
        Ok(())
    }

    fn defer(
        &self,
        requester: &NodeIdentifier,
        request_key: RequestKey,
        origin_route: &str,
        notice_route: &str,
        notice_payload: &[u8],
        placeholder: &[u8],
    ) -> Result<()> {
        validate_outbound(notice_route, notice_payload)?;
        let inner = self.clone_arc()?;
        let slot =
            DeferredSlot::new(*requester, request_key, origin_route, placeholder.to_vec());

        // The downstream fan-out excludes the original requester.
        let peers: Vec<Arc<PeerProxy>> = self
            .registry
            .authorized()
            .into_iter()
            .filter(|peer| peer.identifier() != *requester)
            .collect();

        if peers.is_empty() {
            // Nothing to ask; the placeholder is the answer.
            slot.claim()?;
            return self.respond(
                requester,
                origin_route,
                request_key,
                StatusCode::Ok,
                placeholder,
            );
        }

        let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(peers.len()));

        let respond_inner = inner.clone();
        let respond_slot = slot.clone();
        let on_response: ResponseCallback = Arc::new(move |response: Response| {
            if respond_slot.claim().is_ok() {
                let _ = respond_inner.respond(
                    &respond_slot.requester(),
                    respond_slot.route(),
                    respond_slot.request_key(),
                    StatusCode::Ok,
                    &response.payload,
                );
            }
        });

        let error_inner = inner.clone();
        let error_slot = slot.clone();
        let error_remaining = remaining.clone();
        let on_error: ErrorCallback = Arc::new(move |_peer, _error| {
            let left = error_remaining.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            if left == 1 && error_slot.claim().is_ok() {
                // Every downstream responder failed; fall back to the
                // recorded placeholder.
                let _ = error_inner.respond(
                    &error_slot.requester(),
                    error_slot.route(),
                    error_slot.request_key(),
                    StatusCode::Ok,
                    error_slot.placeholder(),
                );
            }
        });

        inner.issue_fanout(
            notice_route,
            notice_payload.to_vec(),
            peers,
            RequestFlavor::Broadcast,
            DEFAULT_REQUEST_DEADLINE,
            on_response,
            on_error,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_service_is_configured() {
        let service = Service::new();
        assert!(!service.is_running());
        assert_eq!(service.identifier_persistence(), IdentifierPersistence::Ephemeral);
    }

    #[test]
    fn test_options_round_trip_through_surface() {
        let service = Service::new();
        service.set_option(OptionKey::NetworkToken, "brypt").expect("set");
        assert_eq!(
            service.get_option(OptionKey::NetworkToken),
            OptionValue::Text("brypt".into())
        );
    }

    #[test]
    fn test_route_registration_conflicts() {
        let service = Service::new();
        service
            .route("/ping", |_: &NodeIdentifier, _: &[u8], next: Next| {
                next.respond(b"pong!", StatusCode::Ok)
            })
            .expect("register");
        let duplicate = service.route("/ping", |_: &NodeIdentifier, _: &[u8], _: Next| Ok(()));
        assert_eq!(duplicate, Err(Error::Conflict));
    }

    #[test]
    fn test_set_supported_algorithms_validates_names() {
        let service = Service::new();
        let bogus = vec![AlgorithmsPackage {
            level: brypt_crypto::suite::ConfidentialityLevel::High,
            key_agreements: vec!["kem-unknown".to_string()],
            ciphers: vec!["aes-256-ctr".to_string()],
            digests: vec!["blake3".to_string()],
        }];
        assert_eq!(service.set_supported_algorithms(bogus), Err(Error::NotSupported));
    }

    #[test]
    fn test_messaging_requires_running() {
        let service = Service::new();
        let target = NodeIdentifier::generate();
        let result = service.request(
            &target,
            "/ping",
            b"ping!".to_vec(),
            Arc::new(|_| {}),
            Arc::new(|_, _| {}),
        );
        assert_eq!(result, Err(Error::NotStarted));
    }

    #[tokio::test]
    async fn test_configuration_locked_after_startup() {
        let service = Service::new();
        service.startup().expect("startup");
        assert!(service.is_running());

        assert_eq!(
            service.set_option(OptionKey::NetworkToken, "late"),
            Err(Error::AlreadyStarted)
        );
        assert_eq!(
            service.route("/late", |_: &NodeIdentifier, _: &[u8], _: Next| Ok(())),
            Err(Error::AlreadyStarted)
        );
        assert_eq!(
            service.attach_endpoint(Protocol::Tcp, "lo", "127.0.0.1:0", None),
            Err(Error::AlreadyStarted)
        );

        service.shutdown().expect("shutdown");
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_requests() {
        let service = Service::new();
        service.startup().expect("startup");

        // Track a request directly; no peer will ever answer it.
        let cancelled = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let observed = cancelled.clone();
        let responder = NodeIdentifier::generate();
        service.inner.tracker.track(
            "/slow",
            RequestFlavor::Directed,
            vec![responder],
            Instant::now() + Duration::from_secs(60),
            Arc::new(|_| {}),
            Arc::new(move |_, error| {
                assert_eq!(error, Error::ShutdownRequested);
                observed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        );

        service.shutdown().expect("shutdown");
        assert_eq!(cancelled.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_runtime_events_fire_in_order() {
        let service = Service::new();
        let log: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = log.clone();
        service
            .subscribe_all(move |event| {
                lock(&sink).push(format!("{:?}", event.tag()));
            })
            .expect("subscribe");

        service.startup().expect("startup");
        service.shutdown().expect("shutdown");

        let observed = lock(&log).clone();
        assert_eq!(observed.first().map(String::as_str), Some("RuntimeStarted"));
        assert_eq!(observed.last().map(String::as_str), Some("RuntimeStopped"));
    }

    #[test]
    fn test_error_name_round_trip() {
        assert_eq!(error_name(Error::NotSupported), "not_supported");
        assert_eq!(error_from_name("not_supported"), Error::NotSupported);
        assert_eq!(error_from_name("gibberish"), Error::SessionClosed);
    }
}
