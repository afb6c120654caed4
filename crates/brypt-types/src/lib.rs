//! # brypt-types
//!
//! Shared vocabulary types for the Brypt node runtime.
//!
//! This crate defines the types every other Brypt crate speaks in:
//!
//! - [`identifier`] — stable node identifiers with a canonical text form
//! - [`network`] — transport protocols and remote endpoint addresses
//! - [`error`] — the embedder-facing error taxonomy
//! - [`status`] — reply status codes carried on response parcels
//! - [`options`] — the service option catalog
//! - [`events`] — lifecycle events emitted by the service
//! - [`request`] — 128-bit request correlation keys

pub mod error;
pub mod events;
pub mod identifier;
pub mod network;
pub mod options;
pub mod request;
pub mod status;

pub use error::{Error, Result};
pub use events::{Event, EventTag};
pub use identifier::{IdentifierPersistence, NodeIdentifier};
pub use network::{Protocol, RemoteAddress};
pub use options::{LogLevel, OptionKey, OptionValue, Options};
pub use request::RequestKey;
pub use status::StatusCode;
