//! # brypt-message
//!
//! The Brypt message model: typed parcels, their binary wire encoding, the
//! stream framing that carries them, and the CBOR payloads of the built-in
//! handshake and control routes.
//!
//! ## Wire format
//!
//! ```text
//! Parcel {
//!     version:     u8,            // Protocol version (1)
//!     type:        u8,            // 0 handshake, 1 application, 2 control
//!     flags:       u8,            // request | reply | broadcast | encrypted
//!     reserved:    u8,            // 0
//!     source_len:  u8,            // identifier length
//!     source:      [u8],
//!     route_len:   u16,           // big-endian
//!     route:       [u8],          // UTF-8, begins with '/'
//!     request_key: [u8; 16],      // present iff request or reply
//!     status:      u16,           // big-endian, present iff reply
//!     payload_len: u32,           // big-endian
//!     payload:     [u8],
//! }
//! ```
//!
//! The trailer MAC of the session layer is appended after this layout and
//! stripped before decode, so `decode(encode(p)) = p` for every well-formed
//! parcel. All integers are big-endian.

pub mod cbor;
pub mod frame;
pub mod handshake;
pub mod parcel;

pub use frame::{FrameDecoder, FrameEvent, MAX_FRAME_SIZE};
pub use parcel::{Parcel, ParcelFlags, ParcelType, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};

/// Error types for message encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// A structural rule of the wire format was violated.
    #[error("malformed parcel: {0}")]
    Malformed(&'static str),

    /// The payload exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// The frame length prefix exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// The parcel's version byte is not ours.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// A field required by the parcel's flags was absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// CBOR serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// CBOR deserialization failed.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

/// Result type alias for message operations.
pub type Result<T> = std::result::Result<T, MessageError>;
