//! Hashing and keyed MACs.
//!
//! Two digests are registered: keyed BLAKE3 (32-byte MAC) and BLAKE2b-512 in
//! its native keyed mode (64-byte MAC). The suite digest authenticates every
//! parcel on the wire as the trailer MAC and the handshake transcript.

use blake2::digest::{KeyInit, Mac};
use blake2::Blake2bMac512;

use crate::{CryptoError, Result};

/// A registered digest / MAC algorithm.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Blake3,
    Blake2b512,
}

impl DigestAlgorithm {
    /// The registry name.
    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Blake3 => "blake3",
            DigestAlgorithm::Blake2b512 => "blake2b512",
        }
    }

    /// Look up a registry name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "blake3" => Some(DigestAlgorithm::Blake3),
            "blake2b512" => Some(DigestAlgorithm::Blake2b512),
            _ => None,
        }
    }

    /// Length of the MAC this digest produces.
    pub fn mac_size(self) -> usize {
        match self {
            DigestAlgorithm::Blake3 => 32,
            DigestAlgorithm::Blake2b512 => 64,
        }
    }

    /// Compute the keyed MAC of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the key cannot be used
    /// by the underlying algorithm.
    pub fn mac(self, key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
        match self {
            DigestAlgorithm::Blake3 => Ok(blake3::keyed_hash(key, data).as_bytes().to_vec()),
            DigestAlgorithm::Blake2b512 => {
                let mut mac = <Blake2bMac512 as KeyInit>::new_from_slice(key)
                    .map_err(|_| CryptoError::InvalidKeyLength { expected: 32, actual: key.len() })?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
        }
    }

    /// Verify a MAC in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MacVerification`] when the tag does not match.
    pub fn verify(self, key: &[u8; 32], data: &[u8], tag: &[u8]) -> Result<()> {
        match self {
            DigestAlgorithm::Blake3 => {
                let expected = blake3::keyed_hash(key, data);
                let provided: [u8; 32] =
                    tag.try_into().map_err(|_| CryptoError::MacVerification)?;
                // blake3::Hash equality is constant-time.
                if expected == blake3::Hash::from(provided) {
                    Ok(())
                } else {
                    Err(CryptoError::MacVerification)
                }
            }
            DigestAlgorithm::Blake2b512 => {
                let mut mac = <Blake2bMac512 as KeyInit>::new_from_slice(key)
                    .map_err(|_| CryptoError::MacVerification)?;
                mac.update(data);
                mac.verify_slice(tag).map_err(|_| CryptoError::MacVerification)
            }
        }
    }
}
