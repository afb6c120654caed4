//! # brypt-service
//!
//! The Brypt node runtime: peer lifecycle, per-link cryptographic sessions,
//! route dispatch, and request/response correlation.
//!
//! A [`Service`] embeds into an application. The host configures options,
//! registers route handlers, subscribes to lifecycle events, attaches
//! endpoints, and then starts the runtime:
//!
//! ```no_run
//! use brypt_service::{Next, Service};
//! use brypt_types::{NodeIdentifier, OptionKey, Protocol, StatusCode};
//!
//! # fn main() -> brypt_types::Result<()> {
//! let service = Service::new();
//! service.set_option(OptionKey::NetworkToken, "brypt")?;
//! service.route("/ping", |_source: &NodeIdentifier, _payload: &[u8], next: Next| {
//!     next.respond(b"pong!", StatusCode::Ok)
//! })?;
//! service.attach_endpoint(Protocol::Tcp, "lo", "127.0.0.1:35217", Some("127.0.0.1:35216"))?;
//! service.startup()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`service`] — the orchestrator and embedding surface
//! - [`session`] — handshake, encryption, replay protection, rekeying
//! - [`peer`] / [`registry`] — peer proxies and the identifier-keyed arena
//! - [`router`] — route table and the `Next` reply capabilities
//! - [`tracker`] — pending requests, deadlines, deferred replies
//! - [`endpoint`] — the transport contract
//! - [`tcp`] / [`memory`] — the bundled transports
//! - [`persistence`] — bootstrap and configuration files
//! - [`logger`] — the service-owned logger slot

pub mod endpoint;
pub mod logger;
pub mod memory;
pub mod peer;
pub mod persistence;
pub mod registry;
pub mod router;
pub mod service;
pub mod session;
mod sync;
pub mod tcp;
pub mod tracker;

pub use endpoint::{ConnectionId, Endpoint, EndpointEvent, SharedEndpoint};
pub use memory::{MemoryEndpoint, MemoryFabric};
pub use peer::{AuthorizationState, ConnectionState, PeerProxy, Statistics};
pub use router::{CancellationToken, Next, RouteHandler};
pub use service::{Lifecycle, Service, HANDSHAKE_DEADLINE};
pub use session::{Session, SessionState};
pub use tcp::TcpEndpoint;
pub use tracker::{Response, DEFAULT_REQUEST_DEADLINE};
