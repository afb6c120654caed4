//! Transport protocols and remote endpoint addresses.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Transport protocols an endpoint may speak.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Length-prefixed frames over a TCP stream.
    Tcp,
    /// In-process transport used by tests and embedded deployments.
    Memory,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Memory => f.write_str("memory"),
        }
    }
}

/// The address of a remote endpoint.
///
/// `bootstrapable` marks addresses that are safe to persist and redial as
/// reconnect seeds on a later run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteAddress {
    protocol: Protocol,
    uri: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    bootstrapable: bool,
}

impl RemoteAddress {
    /// Construct an address, validating the URI against the protocol grammar.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] when the URI does not parse.
    pub fn new(protocol: Protocol, uri: impl Into<String>, bootstrapable: bool) -> Result<Self> {
        let uri = uri.into();
        validate_uri(protocol, &uri)?;
        Ok(Self { protocol, uri, bootstrapable })
    }

    /// The transport protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The protocol-specific endpoint string.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Whether this address may be persisted as a reconnect seed.
    pub fn is_bootstrapable(&self) -> bool {
        self.bootstrapable
    }

    /// Copy of this address with the bootstrap marker set.
    pub fn as_bootstrapable(&self) -> Self {
        Self { bootstrapable: true, ..self.clone() }
    }
}

impl PartialEq for RemoteAddress {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol && self.uri == other.uri
    }
}

impl Eq for RemoteAddress {}

impl PartialOrd for RemoteAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RemoteAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.protocol
            .cmp(&other.protocol)
            .then_with(|| self.uri.cmp(&other.uri))
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.uri)
    }
}

/// Check a URI against its protocol grammar.
fn validate_uri(protocol: Protocol, uri: &str) -> Result<()> {
    match protocol {
        Protocol::Tcp => {
            let (host, port) = uri.rsplit_once(':').ok_or(Error::InvalidAddress)?;
            if host.is_empty() {
                return Err(Error::InvalidAddress);
            }
            port.parse::<u16>().map_err(|_| Error::InvalidAddress)?;
            Ok(())
        }
        Protocol::Memory => {
            if uri.is_empty() {
                return Err(Error::InvalidAddress);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_address_accepted() {
        let address = RemoteAddress::new(Protocol::Tcp, "127.0.0.1:35216", true).expect("parse");
        assert_eq!(address.protocol(), Protocol::Tcp);
        assert_eq!(address.uri(), "127.0.0.1:35216");
        assert!(address.is_bootstrapable());
    }

    #[test]
    fn test_tcp_address_rejects_bad_grammar() {
        assert_eq!(
            RemoteAddress::new(Protocol::Tcp, "no-port", false),
            Err(Error::InvalidAddress)
        );
        assert_eq!(
            RemoteAddress::new(Protocol::Tcp, ":35216", false),
            Err(Error::InvalidAddress)
        );
        assert_eq!(
            RemoteAddress::new(Protocol::Tcp, "127.0.0.1:notaport", false),
            Err(Error::InvalidAddress)
        );
        assert_eq!(
            RemoteAddress::new(Protocol::Tcp, "127.0.0.1:70000", false),
            Err(Error::InvalidAddress)
        );
    }

    #[test]
    fn test_equality_ignores_bootstrap_marker() {
        let a = RemoteAddress::new(Protocol::Tcp, "10.0.0.1:1024", true).expect("parse");
        let b = RemoteAddress::new(Protocol::Tcp, "10.0.0.1:1024", false).expect("parse");
        assert_eq!(a, b);
    }

    #[test]
    fn test_ordering_protocol_then_uri() {
        let a = RemoteAddress::new(Protocol::Tcp, "a:1", false).expect("parse");
        let b = RemoteAddress::new(Protocol::Tcp, "b:1", false).expect("parse");
        let c = RemoteAddress::new(Protocol::Memory, "a", false).expect("parse");
        assert!(a < b);
        assert!(a < c);
    }

    #[test]
    fn test_persisted_form() {
        let address = RemoteAddress::new(Protocol::Tcp, "127.0.0.1:35216", true).expect("parse");
        let json = serde_json::to_string(&address).expect("serialize");
        assert!(json.contains("\"protocol\":\"tcp\""));
        assert!(json.contains("\"uri\":\"127.0.0.1:35216\""));
    }
}
