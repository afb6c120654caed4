//! The TCP endpoint.
//!
//! Binds synchronously (so startup can surface binding failures directly),
//! then accepts, dials, and pumps length-prefixed frames with tokio tasks.
//! Each connection owns a reader task feeding the service's event channel
//! through a [`FrameDecoder`], and a writer task draining an outbound queue.

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::{Arc, Mutex as StdMutex};

use brypt_message::frame::{FrameDecoder, FrameEvent};
use brypt_types::{Error, Protocol, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};

use crate::endpoint::{ConnectionId, Endpoint, EndpointEvent, EventSender};
use crate::sync::lock;

const READ_BUFFER_SIZE: usize = 16 * 1024;

struct ConnectionHandle {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closer: Arc<Notify>,
}

#[derive(Default)]
struct TcpInner {
    events: Option<EventSender>,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    stopping: bool,
}

/// A TCP transport speaking the length-prefixed frame protocol.
pub struct TcpEndpoint {
    uri: String,
    inner: StdMutex<TcpInner>,
    stop: Notify,
    this: std::sync::Weak<TcpEndpoint>,
}

impl TcpEndpoint {
    /// An endpoint that will listen on `uri` (`host:port`) once started.
    pub fn new(uri: impl Into<String>) -> Arc<Self> {
        let uri = uri.into();
        Arc::new_cyclic(|this| Self {
            uri,
            inner: StdMutex::new(TcpInner::default()),
            stop: Notify::new(),
            this: this.clone(),
        })
    }

    fn events(&self) -> Option<EventSender> {
        lock(&self.inner).events.clone()
    }

    fn register_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        remote_uri: String,
        dialed: bool,
    ) -> Option<ConnectionId> {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closer = Arc::new(Notify::new());

        let connection = {
            let mut inner = lock(&self.inner);
            if inner.stopping || inner.events.is_none() {
                return None;
            }
            let connection = ConnectionId::next();
            inner.connections.insert(
                connection,
                ConnectionHandle { outbound: outbound_tx, closer: closer.clone() },
            );
            connection
        };

        // Announce the connection before the reader can surface frames, so
        // the pump observes `Connected` first.
        if let Some(events) = self.events() {
            let _ = events.send(EndpointEvent::Connected {
                protocol: Protocol::Tcp,
                connection,
                remote_uri,
                dialed,
            });
        }

        let endpoint = self.clone();
        tokio::spawn(async move {
            endpoint.run_writer(connection, writer, outbound_rx).await;
        });
        let endpoint = self.clone();
        tokio::spawn(async move {
            endpoint.run_reader(connection, reader, closer).await;
        });
        Some(connection)
    }

    async fn run_writer(
        self: Arc<Self>,
        connection: ConnectionId,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        while let Some(framed) = outbound.recv().await {
            if let Err(error) = writer.write_all(&framed).await {
                self.close_connection(connection, Error::from_io(&error));
                return;
            }
        }
        let _ = writer.shutdown().await;
    }

    async fn run_reader(
        self: Arc<Self>,
        connection: ConnectionId,
        mut reader: OwnedReadHalf,
        closer: Arc<Notify>,
    ) {
        let mut decoder = FrameDecoder::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = closer.notified() => {
                    self.close_connection(connection, Error::Canceled);
                    return;
                }
                read = reader.read(&mut buffer) => match read {
                    Ok(0) => {
                        self.close_connection(connection, Error::NetworkReset);
                        return;
                    }
                    Ok(count) => {
                        decoder.extend(&buffer[..count]);
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
                                    // Malformed framing drops the connection.
                                    self.close_connection(connection, Error::InvalidArgument);
                                    return;
                                }
                            }
                        }
                    }
                    Err(error) => {
                        self.close_connection(connection, Error::from_io(&error));
                        return;
                    }
                },
            }
        }
    }

    /// Tear down a connection once, emitting a single `Disconnected`.
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

impl Endpoint for TcpEndpoint {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn start(&self, events: EventSender) -> Result<()> {
        let address = self
            .uri
            .to_socket_addrs()
            .map_err(|_| Error::InvalidAddress)?
            .next()
            .ok_or(Error::InvalidAddress)?;

        let listener = std::net::TcpListener::bind(address).map_err(|error| {
            if error.kind() == std::io::ErrorKind::AddrInUse {
                Error::AddressInUse
            } else {
                Error::BindingFailed
            }
        })?;
        listener.set_nonblocking(true).map_err(|_| Error::BindingFailed)?;
        let listener = TcpListener::from_std(listener).map_err(|_| Error::BindingFailed)?;

        {
            let mut inner = lock(&self.inner);
            inner.events = Some(events);
            inner.stopping = false;
        }

        let endpoint = self.this.upgrade().ok_or(Error::InitializationFailure)?;
        tokio::spawn(async move {
            loop {
                if lock(&endpoint.inner).stopping {
                    break;
                }
                tokio::select! {
                    _ = endpoint.stop.notified() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            endpoint.register_connection(stream, remote.to_string(), false);
                        }
                        Err(error) => {
                            tracing::debug!(%error, "accept failed");
                            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
                        }
                    },
                }
            }
        });
        Ok(())
    }

    fn dial(&self, uri: &str) -> Result<()> {
        let address = uri
            .to_socket_addrs()
            .map_err(|_| Error::InvalidAddress)?
            .next()
            .ok_or(Error::InvalidAddress)?;
        let events = self.events().ok_or(Error::NotStarted)?;
        let endpoint = self.this.upgrade().ok_or(Error::NotStarted)?;
        let uri = uri.to_string();

        tokio::spawn(async move {
            match TcpStream::connect(address).await {
                Ok(stream) => {
                    endpoint.register_connection(stream, uri, true);
                }
                Err(error) => {
                    let _ = events.send(EndpointEvent::DialFailed {
                        uri,
                        cause: Error::from_io(&error),
                    });
                }
            }
        });
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
        let (handles, events) = {
            let mut inner = lock(&self.inner);
            inner.stopping = true;
            let handles: Vec<_> = inner.connections.drain().collect();
            (handles, inner.events.clone())
        };
        for (_, handle) in handles {
            handle.closer.notify_one();
        }
        self.stop.notify_waiters();
        if let Some(events) = events {
            let _ = events.send(EndpointEvent::Stopped {
                protocol: Protocol::Tcp,
                uri: self.uri.clone(),
            });
        }
    }
}
