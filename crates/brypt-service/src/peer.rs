//! Peer proxies.
//!
//! A proxy is the service's record of one remote node: its identifier, the
//! addresses it is reachable at, the connection and authorization state
//! machines, the owned cryptographic session, and atomic traffic counters.
//! Proxies live in the registry arena and are referenced by identifier;
//! nothing else owns them, so there are no reference cycles back through
//! the message sinks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use brypt_message::frame;
use brypt_message::Parcel;
use brypt_types::{Error, NodeIdentifier, Protocol, RemoteAddress, Result};
use tokio::sync::Mutex;

use crate::endpoint::{ConnectionId, Endpoint};
use crate::session::{ProtectOutcome, Session};
use crate::sync::lock;

/// Connection progress of a peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// A dial is in progress.
    Resolving,
    /// A transport link is up.
    Connected,
    /// No link exists.
    Disconnected,
}

/// Trust standing of a peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AuthorizationState {
    /// No active session yet.
    Unauthorized,
    /// The handshake completed and a session is active.
    Authorized,
    /// The peer misbehaved; sticky until the operator clears it.
    Flagged,
}

/// Atomic per-peer traffic counters. They survive disconnects for as long
/// as the proxy itself is registered.
#[derive(Default)]
pub struct Statistics {
    sent: AtomicU64,
    received: AtomicU64,
    invalid_frames: AtomicU64,
}

impl Statistics {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn invalid_frames(&self) -> u64 {
        self.invalid_frames.load(Ordering::Relaxed)
    }

    pub fn increment_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_invalid_frames(&self) {
        self.invalid_frames.fetch_add(1, Ordering::Relaxed);
    }
}

/// The transport attachment of a connected peer.
#[derive(Clone)]
pub struct Link {
    pub endpoint: Arc<dyn Endpoint>,
    pub connection: ConnectionId,
    pub protocol: Protocol,
}

/// The service's record of one remote node.
pub struct PeerProxy {
    identifier: NodeIdentifier,
    addresses: StdMutex<Vec<RemoteAddress>>,
    connection: StdMutex<ConnectionState>,
    authorization: StdMutex<AuthorizationState>,
    link: StdMutex<Option<Link>>,
    session: Mutex<Option<Session>>,
    statistics: Statistics,
}

impl PeerProxy {
    /// A fresh proxy in the resolving state.
    pub fn new(identifier: NodeIdentifier) -> Arc<Self> {
        Arc::new(Self {
            identifier,
            addresses: StdMutex::new(Vec::new()),
            connection: StdMutex::new(ConnectionState::Resolving),
            authorization: StdMutex::new(AuthorizationState::Unauthorized),
            link: StdMutex::new(None),
            session: Mutex::new(None),
            statistics: Statistics::default(),
        })
    }

    pub fn identifier(&self) -> NodeIdentifier {
        self.identifier
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn connection_state(&self) -> ConnectionState {
        *lock(&self.connection)
    }

    pub fn authorization_state(&self) -> AuthorizationState {
        *lock(&self.authorization)
    }

    /// The active transport link, if any.
    pub fn link(&self) -> Option<Link> {
        lock(&self.link).clone()
    }

    /// The protocol of the active link.
    pub fn protocol(&self) -> Option<Protocol> {
        lock(&self.link).as_ref().map(|link| link.protocol)
    }

    /// Addresses this peer has been observed at.
    pub fn addresses(&self) -> Vec<RemoteAddress> {
        lock(&self.addresses).clone()
    }

    /// Record an address, ignoring duplicates.
    pub fn register_address(&self, address: RemoteAddress) {
        let mut addresses = lock(&self.addresses);
        if !addresses.contains(&address) {
            addresses.push(address);
        }
    }

    /// Transition to connected over the given link.
    pub fn set_connected(&self, link: Link) {
        *lock(&self.connection) = ConnectionState::Connected;
        *lock(&self.link) = Some(link);
    }

    /// Transition to disconnected, dropping the link.
    pub fn set_disconnected(&self) {
        *lock(&self.connection) = ConnectionState::Disconnected;
        *lock(&self.link) = None;
        let mut authorization = lock(&self.authorization);
        if *authorization == AuthorizationState::Authorized {
            *authorization = AuthorizationState::Unauthorized;
        }
    }

    /// Install the session produced by a completed handshake and authorize.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if the peer already holds an authorized
    /// session, preserving the at-most-one-authorized invariant, and
    /// [`Error::AccessDenied`] while the peer is flagged.
    pub async fn authorize(&self, session: Session) -> Result<()> {
        {
            let authorization = lock(&self.authorization);
            match *authorization {
                AuthorizationState::Flagged => return Err(Error::AccessDenied),
                AuthorizationState::Authorized => return Err(Error::Conflict),
                AuthorizationState::Unauthorized => {}
            }
        }
        *self.session.lock().await = Some(session);
        *lock(&self.authorization) = AuthorizationState::Authorized;
        Ok(())
    }

    /// Mark the peer flagged and tear down its session. Sticky until
    /// [`PeerProxy::unflag`].
    pub async fn flag(&self) {
        *lock(&self.authorization) = AuthorizationState::Flagged;
        if let Some(session) = self.session.lock().await.as_mut() {
            session.teardown();
        }
    }

    /// Operator clearance of a flagged peer.
    pub fn unflag(&self) {
        let mut authorization = lock(&self.authorization);
        if *authorization == AuthorizationState::Flagged {
            *authorization = AuthorizationState::Unauthorized;
        }
    }

    /// Tear down the session, if any.
    pub async fn teardown_session(&self) {
        if let Some(session) = self.session.lock().await.as_mut() {
            session.teardown();
        }
        *self.session.lock().await = None;
    }

    /// True when the peer can carry encrypted application traffic.
    pub fn is_authorized(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
            && self.authorization_state() == AuthorizationState::Authorized
    }

    /// Exclusive access to the owned session. Per-peer frame handling
    /// serializes through this lock, preserving nonce order.
    pub fn session(&self) -> &Mutex<Option<Session>> {
        &self.session
    }

    /// Encrypt and transmit an application parcel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] unless the peer is connected and
    /// authorized.
    pub async fn send_parcel(&self, parcel: Parcel) -> Result<()> {
        if !self.is_authorized() {
            return Err(Error::NotConnected);
        }
        let link = self.link().ok_or(Error::NotConnected)?;

        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(Error::NotConnected)?;
        match session.protect(parcel).map_err(|_| Error::SessionClosed)? {
            ProtectOutcome::Frame(body) => {
                let framed = frame::encode_frame(&body).map_err(|_| Error::PayloadTooLarge)?;
                link.endpoint.send(link.connection, framed)?;
                self.statistics.increment_sent();
            }
            ProtectOutcome::Queued => {
                // A rekey is in flight; the parcel drains when it completes.
            }
        }
        Ok(())
    }

    /// Transmit an unencrypted handshake or control parcel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without a live link.
    pub fn send_plain(&self, parcel: &Parcel) -> Result<()> {
        let link = self.link().ok_or(Error::NotConnected)?;
        let body = parcel.encode().map_err(|_| Error::InvalidArgument)?;
        let framed = frame::encode_frame(&body).map_err(|_| Error::PayloadTooLarge)?;
        link.endpoint.send(link.connection, framed)?;
        Ok(())
    }
}
