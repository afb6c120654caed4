//! The embedder-facing error taxonomy.
//!
//! Every operation on the service surface resolves to one of these kinds.
//! The enum is fieldless so causes can ride inside events by value; the
//! richer internal errors of the crypto and message crates are mapped onto
//! this taxonomy at the service boundary.

use serde::{Deserialize, Serialize};

/// Result alias over the runtime error taxonomy.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced to the embedding application.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum Error {
    /// The operation was accepted but has not completed yet.
    #[error("accepted")]
    Accepted,

    /// The operation was canceled before completion.
    #[error("canceled")]
    Canceled,

    /// The runtime is shutting down.
    #[error("shutdown requested")]
    ShutdownRequested,

    /// A provided argument was malformed.
    #[error("invalid argument")]
    InvalidArgument,

    /// The remote rejected our credentials or handshake proof.
    #[error("access denied")]
    AccessDenied,

    /// A deadline elapsed before the operation completed.
    #[error("timeout")]
    Timeout,

    /// The operation conflicts with existing state.
    #[error("conflict")]
    Conflict,

    /// A required field was absent.
    #[error("missing field")]
    MissingField,

    /// The payload exceeds the maximum allowed size.
    #[error("payload too large")]
    PayloadTooLarge,

    /// The requested resource is not currently available.
    #[error("not available")]
    NotAvailable,

    /// No mutually supported option exists.
    #[error("not supported")]
    NotSupported,

    /// The operation is recognized but unimplemented.
    #[error("not implemented")]
    NotImplemented,

    /// The service could not be initialized.
    #[error("initialization failure")]
    InitializationFailure,

    /// The service is already running.
    #[error("already started")]
    AlreadyStarted,

    /// The service has not been started.
    #[error("not started")]
    NotStarted,

    /// The configuration store is invalid or inconsistent.
    #[error("invalid configuration")]
    InvalidConfiguration,

    /// An endpoint could not bind its listen address.
    #[error("binding failed")]
    BindingFailed,

    /// A connection attempt failed after exhausting retries.
    #[error("connection failed")]
    ConnectionFailed,

    /// A remote address did not match the protocol grammar.
    #[error("invalid address")]
    InvalidAddress,

    /// The requested listen address is already in use.
    #[error("address in use")]
    AddressInUse,

    /// The peer is not connected and authorized.
    #[error("not connected")]
    NotConnected,

    /// A connection to the peer already exists.
    #[error("already connected")]
    AlreadyConnected,

    /// The remote refused the connection.
    #[error("connection refused")]
    ConnectionRefused,

    /// The local network is down.
    #[error("network down")]
    NetworkDown,

    /// The connection was reset by the network.
    #[error("network reset")]
    NetworkReset,

    /// The remote network is unreachable.
    #[error("network unreachable")]
    NetworkUnreachable,

    /// The cryptographic session has been torn down.
    #[error("session closed")]
    SessionClosed,

    /// An allocation failed.
    #[error("out of memory")]
    OutOfMemory,
}

impl Error {
    /// Map an I/O error onto the taxonomy.
    pub fn from_io(error: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::AddrInUse => Error::AddressInUse,
            ErrorKind::AddrNotAvailable => Error::InvalidAddress,
            ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => Error::NetworkReset,
            ErrorKind::TimedOut => Error::Timeout,
            ErrorKind::OutOfMemory => Error::OutOfMemory,
            _ => Error::ConnectionFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::NotSupported.to_string(), "not supported");
        assert_eq!(Error::ShutdownRequested.to_string(), "shutdown requested");
    }

    #[test]
    fn test_error_serde_names() {
        let json = serde_json::to_string(&Error::PayloadTooLarge).expect("serialize");
        assert_eq!(json, "\"payload_too_large\"");
    }

    #[test]
    fn test_from_io_mapping() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(Error::from_io(&refused), Error::ConnectionRefused);

        let in_use = std::io::Error::from(std::io::ErrorKind::AddrInUse);
        assert_eq!(Error::from_io(&in_use), Error::AddressInUse);
    }
}
