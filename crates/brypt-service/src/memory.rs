//! The in-process endpoint fabric.
//!
//! Tests and embedded deployments wire services together without sockets:
//! a [`MemoryFabric`] is a namespace of listen URIs, and every
//! [`MemoryEndpoint`] created from it can dial any other by URI. Frames
//! travel over unbounded channels but pass through the same
//! [`FrameDecoder`] path as the TCP transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use brypt_message::frame::{FrameDecoder, FrameEvent};
use brypt_types::{Error, Protocol, Result};
use tokio::sync::{mpsc, Notify};

use crate::endpoint::{ConnectionId, Endpoint, EndpointEvent, EventSender};
use crate::sync::lock;

/// A dial request delivered to a listening endpoint.
struct FabricDial {
    dialer_uri: String,
    to_dialer: mpsc::UnboundedSender<Vec<u8>>,
    from_dialer: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[derive(Default)]
struct FabricInner {
    listeners: HashMap<String, mpsc::UnboundedSender<FabricDial>>,
}

/// A namespace of in-process listen URIs.
#[derive(Clone, Default)]
pub struct MemoryFabric {
    inner: Arc<StdMutex<FabricInner>>,
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// An endpoint that will listen at `uri` on this fabric once started.
    pub fn endpoint(&self, uri: impl Into<String>) -> Arc<MemoryEndpoint> {
        let uri = uri.into();
        Arc::new_cyclic(|this| MemoryEndpoint {
            fabric: self.clone(),
            uri,
            inner: StdMutex::new(MemoryInner::default()),
            this: this.clone(),
        })
    }

    fn register_listener(
        &self,
        uri: &str,
        accept: mpsc::UnboundedSender<FabricDial>,
    ) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.listeners.contains_key(uri) {
            return Err(Error::AddressInUse);
        }
        inner.listeners.insert(uri.to_string(), accept);
        Ok(())
    }

    fn release_listener(&self, uri: &str) {
        lock(&self.inner).listeners.remove(uri);
    }

    fn listener(&self, uri: &str) -> Option<mpsc::UnboundedSender<FabricDial>> {
        lock(&self.inner).listeners.get(uri).cloned()
    }
}

struct ConnectionHandle {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closer: Arc<Notify>,
}

#[derive(Default)]
struct MemoryInner {
    events: Option<EventSender>,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    stopping: bool,
}

/// One in-process transport endpoint.
pub struct MemoryEndpoint {
    fabric: MemoryFabric,
    uri: String,
    inner: StdMutex<MemoryInner>,
    this: Weak<MemoryEndpoint>,
}

impl MemoryEndpoint {
    fn events(&self) -> Option<EventSender> {
        lock(&self.inner).events.clone()
    }

    fn register_link(
        self: &Arc<Self>,
        remote_uri: String,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        dialed: bool,
    ) -> Option<ConnectionId> {
        let closer = Arc::new(Notify::new());
        let connection = {
            let mut inner = lock(&self.inner);
            if inner.stopping || inner.events.is_none() {
                return None;
            }
            let connection = ConnectionId::next();
            inner.connections.insert(
                connection,
                ConnectionHandle { outbound, closer: closer.clone() },
            );
            connection
        };

        // Announce the connection before the reader can surface frames, so
        // the pump observes `Connected` first.
        if let Some(events) = self.events() {
            let _ = events.send(EndpointEvent::Connected {
                protocol: Protocol::Memory,
                connection,
                remote_uri,
                dialed,
            });
        }

        let endpoint = self.clone();
        tokio::spawn(async move {
            endpoint.run_reader(connection, inbound, closer).await;
        });
        Some(connection)
    }

    async fn run_reader(
        self: Arc<Self>,
        connection: ConnectionId,
        mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        closer: Arc<Notify>,
    ) {
        let mut decoder = FrameDecoder::new();
        loop {
            tokio::select! {
                _ = closer.notified() => {
                    self.close_connection(connection, Error::Canceled);
                    return;
                }
                received = inbound.recv() => match received {
                    Some(bytes) => {
                        decoder.extend(&bytes);
                        loop {
                            match decoder.next() {
                                Ok(Some(FrameEvent::Frame(bytes))) => {
                                    if let Some(events) = self.events() {
                                        let _ = events
                                            .send(EndpointEvent::Frame { connection, bytes });
                                    }
                                }
                                Ok(Some(FrameEvent::Keepalive)) => {
                                    if let Some(events) = self.events() {
                                        let _ =
                                            events.send(EndpointEvent::Keepalive { connection });
                                    }
                                }
                                Ok(None) => break,
                                Err(_) => {
                                    self.close_connection(connection, Error::InvalidArgument);
                                    return;
                                }
                            }
                        }
                    }
                    None => {
                        self.close_connection(connection, Error::NetworkReset);
                        return;
                    }
                },
            }
        }
    }

    fn close_connection(&self, connection: ConnectionId, cause: Error) {
        let removed = lock(&self.inner).connections.remove(&connection);
        if let Some(handle) = removed {
            handle.closer.notify_one();
            if let Some(events) = self.events() {
                let _ = events.send(EndpointEvent::Disconnected { connection, cause });
            }
        }
    }
}

impl Endpoint for MemoryEndpoint {
    fn protocol(&self) -> Protocol {
        Protocol::Memory
    }

    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn start(&self, events: EventSender) -> Result<()> {
        let (accept_tx, mut accept_rx) = mpsc::unbounded_channel();
        self.fabric.register_listener(&self.uri, accept_tx)?;
        {
            let mut inner = lock(&self.inner);
            inner.events = Some(events);
            inner.stopping = false;
        }

        let endpoint = self.this.upgrade().ok_or(Error::InitializationFailure)?;
        tokio::spawn(async move {
            while let Some(dial) = accept_rx.recv().await {
                endpoint.register_link(
                    dial.dialer_uri,
                    dial.to_dialer,
                    dial.from_dialer,
                    false,
                );
            }
        });
        Ok(())
    }

    fn dial(&self, uri: &str) -> Result<()> {
        let events = self.events().ok_or(Error::NotStarted)?;
        let endpoint = self.this.upgrade().ok_or(Error::NotStarted)?;

        let Some(listener) = self.fabric.listener(uri) else {
            let _ = events.send(EndpointEvent::DialFailed {
                uri: uri.to_string(),
                cause: Error::ConnectionRefused,
            });
            return Ok(());
        };

        let (to_remote, from_local) = mpsc::unbounded_channel();
        let (to_local, from_remote) = mpsc::unbounded_channel();
        let delivered = listener.send(FabricDial {
            dialer_uri: self.uri.clone(),
            to_dialer: to_local,
            from_dialer: from_local,
        });
        if delivered.is_err() {
            let _ = events.send(EndpointEvent::DialFailed {
                uri: uri.to_string(),
                cause: Error::ConnectionRefused,
            });
            return Ok(());
        }

        endpoint.register_link(uri.to_string(), to_remote, from_remote, true);
        Ok(())
    }

    fn send(&self, connection: ConnectionId, framed: Vec<u8>) -> Result<()> {
        let inner = lock(&self.inner);
        let handle = inner.connections.get(&connection).ok_or(Error::NotConnected)?;
        handle.outbound.send(framed).map_err(|_| Error::NotConnected)
    }

    fn disconnect(&self, connection: ConnectionId) {
        let handle = lock(&self.inner).connections.remove(&connection);
        if let Some(handle) = handle {
            handle.closer.notify_one();
            if let Some(events) = self.events() {
                let _ = events.send(EndpointEvent::Disconnected {
                    connection,
                    cause: Error::Canceled,
                });
            }
        }
    }

    fn shutdown(&self) {
        self.fabric.release_listener(&self.uri);
        let (handles, events) = {
            let mut inner = lock(&self.inner);
            inner.stopping = true;
            let handles: Vec<_> = inner.connections.drain().collect();
            (handles, inner.events.clone())
        };
        for (_, handle) in handles {
            handle.closer.notify_one();
        }
        if let Some(events) = events {
            let _ = events.send(EndpointEvent::Stopped {
                protocol: Protocol::Memory,
                uri: self.uri.clone(),
            });
        }
    }
}
