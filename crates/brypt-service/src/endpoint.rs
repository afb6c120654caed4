//! The endpoint contract.
//!
//! The core consumes transports through this interface: an endpoint binds a
//! listen address, dials remote URIs, and streams length-prefixed frames in
//! both directions. Results of asynchronous work (accepted connections,
//! inbound frames, disconnects, dial failures) flow back over a single
//! event channel into the service's receive pump. The core provides the
//! framing; endpoints move already-framed bytes.

use std::fmt;
use std::sync::Arc;

use brypt_types::{Error, Protocol, Result};
use tokio::sync::mpsc;

/// Opaque handle for one transport connection.
///
/// Identifiers are unique across every endpoint in the process, so the
/// service can key its link table by connection alone.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate the next process-unique identifier.
    pub fn next() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection-{}", self.0)
    }
}

/// Notifications an endpoint delivers to the service.
#[derive(Debug)]
pub enum EndpointEvent {
    /// A transport link came up.
    Connected {
        protocol: Protocol,
        connection: ConnectionId,
        remote_uri: String,
        /// True when we dialed; false for accepted connections.
        dialed: bool,
    },
    /// A complete frame body arrived (length prefix already stripped).
    Frame { connection: ConnectionId, bytes: Vec<u8> },
    /// A zero-length keepalive arrived.
    Keepalive { connection: ConnectionId },
    /// A transport link went down.
    Disconnected { connection: ConnectionId, cause: Error },
    /// An outbound dial could not be completed.
    DialFailed { uri: String, cause: Error },
    /// The endpoint shut down and will deliver no further events.
    Stopped { protocol: Protocol, uri: String },
}

/// Sender half of the endpoint event channel.
pub type EventSender = mpsc::UnboundedSender<EndpointEvent>;

/// Receiver half of the endpoint event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<EndpointEvent>;

/// A transport the service can attach.
///
/// `start` must bind synchronously so a startup-time binding failure can
/// surface from `Service::startup` itself; everything afterwards is
/// asynchronous and reported through the event channel.
pub trait Endpoint: Send + Sync {
    /// The protocol this endpoint speaks.
    fn protocol(&self) -> Protocol;

    /// The listen URI this endpoint binds.
    fn uri(&self) -> String;

    /// Bind the listen address and begin accepting connections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressInUse`] or [`Error::BindingFailed`] when the
    /// listen address cannot be bound.
    fn start(&self, events: EventSender) -> Result<()>;

    /// Begin dialing a remote URI. Completion arrives as a
    /// [`EndpointEvent::Connected`] or [`EndpointEvent::DialFailed`] event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] when the URI does not parse and
    /// [`Error::NotStarted`] before `start`.
    fn dial(&self, uri: &str) -> Result<()>;

    /// Queue an already-framed byte sequence on a connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] for an unknown connection.
    fn send(&self, connection: ConnectionId, framed: Vec<u8>) -> Result<()>;

    /// Drop one connection.
    fn disconnect(&self, connection: ConnectionId);

    /// Stop accepting, drop every connection, and emit `Stopped`.
    fn shutdown(&self);
}

/// Shared alias for attached endpoints.
pub type SharedEndpoint = Arc<dyn Endpoint>;
