//! Lifecycle events emitted by the service.
//!
//! Subscribers register against an [`EventTag`] and receive matching
//! [`Event`]s serially, in emit order.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::identifier::NodeIdentifier;
use crate::network::Protocol;

/// An event emitted by the running service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// The runtime finished starting and endpoints are live.
    RuntimeStarted,
    /// The runtime stopped; `cause` is `shutdown_requested` for a clean stop.
    RuntimeStopped { cause: Error },
    /// A peer completed the handshake and is authorized.
    PeerConnected {
        identifier: NodeIdentifier,
        protocol: Protocol,
    },
    /// A peer left the network or failed its session.
    PeerDisconnected {
        identifier: NodeIdentifier,
        protocol: Protocol,
        cause: Error,
    },
    /// An endpoint bound its listen address.
    EndpointStarted { protocol: Protocol, uri: String },
    /// An endpoint shut down.
    EndpointStopped { protocol: Protocol, uri: String },
    /// An endpoint failed to bind its listen address.
    BindingFailed {
        protocol: Protocol,
        uri: String,
        cause: Error,
    },
}

/// Subscription keys for the event catalog.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTag {
    RuntimeStarted,
    RuntimeStopped,
    PeerConnected,
    PeerDisconnected,
    EndpointStarted,
    EndpointStopped,
    BindingFailed,
}

impl Event {
    /// The subscription tag this event matches.
    pub fn tag(&self) -> EventTag {
        match self {
            Event::RuntimeStarted => EventTag::RuntimeStarted,
            Event::RuntimeStopped { .. } => EventTag::RuntimeStopped,
            Event::PeerConnected { .. } => EventTag::PeerConnected,
            Event::PeerDisconnected { .. } => EventTag::PeerDisconnected,
            Event::EndpointStarted { .. } => EventTag::EndpointStarted,
            Event::EndpointStopped { .. } => EventTag::EndpointStopped,
            Event::BindingFailed { .. } => EventTag::BindingFailed,
        }
    }
}
