//! Payloads of the built-in handshake and control routes.
//!
//! These structs are CBOR-encoded into the payload field of handshake- and
//! control-typed parcels:
//!
//! | route | payload |
//! |-------|---------|
//! | `/brypt/handshake` | [`HandshakeInit`] / [`HandshakeReply`] |
//! | `/brypt/rekey` | [`RekeyInit`] / [`RekeyReply`] |
//! | `/brypt/bye` | [`Goodbye`] |
//! | `/brypt/cancel` | [`CancelRequest`] |

use brypt_crypto::suite::{AlgorithmsPackage, CipherSuite};
use brypt_types::RequestKey;
use serde::{Deserialize, Serialize};

use crate::{cbor, Result};

/// One KEM public component offered by the initiator.
///
/// The initiator attaches a component for every KEM it advertises, so the
/// responder can encapsulate for whichever mechanism selection picks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KemPublicEntry {
    /// Registry name of the mechanism.
    pub kem: String,
    /// Raw public bytes.
    pub public: Vec<u8>,
}

/// First handshake message, initiator to responder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeInit {
    /// The initiator's advertised algorithm preference, per tier.
    pub advertised: Vec<AlgorithmsPackage>,
    /// One public component per advertised KEM.
    pub key_agreements: Vec<KemPublicEntry>,
    /// Initiator random contribution to the transcript.
    pub nonce: [u8; 32],
}

/// Second handshake message, responder to initiator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandshakeReply {
    /// The suite the responder selected.
    pub suite: CipherSuite,
    /// KEM ciphertext encapsulated to the initiator's public component.
    pub ciphertext: Vec<u8>,
    /// Responder random contribution to the transcript.
    pub nonce: [u8; 32],
    /// MAC of the handshake transcript under the derived MAC key. Empty
    /// while the MAC is being computed or verified.
    pub transcript_mac: Vec<u8>,
}

/// First rekey message: propose the next epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyInit {
    /// The epoch the initiator wants to advance to.
    pub epoch: u16,
    /// Random contribution bound into the confirmation MAC.
    pub nonce: [u8; 32],
}

/// Second rekey message: confirm the next epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyReply {
    /// The confirmed epoch.
    pub epoch: u16,
    /// MAC of the rekey nonce under the new epoch's MAC key, proving both
    /// sides derived the same sub-keys.
    pub confirm_mac: Vec<u8>,
}

/// Best-effort teardown notice sent on `/brypt/bye`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    /// Human-readable teardown reason.
    pub cause: String,
}

/// Notice that the issuer abandoned a pending request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    /// The abandoned request's key.
    pub request_key: RequestKey,
}

macro_rules! cbor_payload {
    ($name:ident) => {
        impl $name {
            /// Encode to CBOR for a parcel payload.
            pub fn to_bytes(&self) -> Result<Vec<u8>> {
                cbor::to_vec(self)
            }

            /// Decode from a parcel payload.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
                cbor::from_slice(bytes)
            }
        }
    };
}

cbor_payload!(HandshakeInit);
cbor_payload!(HandshakeReply);
cbor_payload!(RekeyInit);
cbor_payload!(RekeyReply);
cbor_payload!(Goodbye);
cbor_payload!(CancelRequest);
