//! Key encapsulation mechanisms.
//!
//! Two KEMs are registered: `kem-x25519`, where encapsulation is an
//! ephemeral Diffie-Hellman exchange (the ciphertext is the ephemeral public
//! key), and `kem-kyber768` (ML-KEM-768). Both produce a 32-byte shared
//! secret; secret material is zeroized on drop.

use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::{CryptoError, Result};

/// A registered key encapsulation mechanism.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KemAlgorithm {
    X25519,
    Kyber768,
}

/// A KEM public component, safe to place on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KemPublicKey {
    algorithm: KemAlgorithm,
    bytes: Vec<u8>,
}

/// A KEM secret component. Zeroized on drop.
pub struct KemSecretKey {
    algorithm: KemAlgorithm,
    bytes: Zeroizing<Vec<u8>>,
}

/// The encapsulated shared secret. Zeroized on drop.
pub struct SharedSecret {
    bytes: Zeroizing<[u8; 32]>,
}

impl KemAlgorithm {
    /// The registry name.
    pub fn name(self) -> &'static str {
        match self {
            KemAlgorithm::X25519 => "kem-x25519",
            KemAlgorithm::Kyber768 => "kem-kyber768",
        }
    }

    /// Look up a registry name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "kem-x25519" => Some(KemAlgorithm::X25519),
            "kem-kyber768" => Some(KemAlgorithm::Kyber768),
            _ => None,
        }
    }

    /// Generate a keypair for this mechanism.
    pub fn generate_keypair(self) -> (KemPublicKey, KemSecretKey) {
        match self {
            KemAlgorithm::X25519 => {
                let secret = StaticSecret::random_from_rng(OsRng);
                let public = PublicKey::from(&secret);
                (
                    KemPublicKey { algorithm: self, bytes: public.to_bytes().to_vec() },
                    KemSecretKey {
                        algorithm: self,
                        bytes: Zeroizing::new(secret.to_bytes().to_vec()),
                    },
                )
            }
            KemAlgorithm::Kyber768 => {
                let (public, secret) = kyber768::keypair();
                (
                    KemPublicKey { algorithm: self, bytes: public.as_bytes().to_vec() },
                    KemSecretKey {
                        algorithm: self,
                        bytes: Zeroizing::new(secret.as_bytes().to_vec()),
                    },
                )
            }
        }
    }

    /// Encapsulate to a remote public component.
    ///
    /// Returns the ciphertext to transmit and the shared secret.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Kem`] if the public component is malformed.
    pub fn encapsulate(self, public: &[u8]) -> Result<(Vec<u8>, SharedSecret)> {
        match self {
            KemAlgorithm::X25519 => {
                let their_public = PublicKey::from(to_array32(public)?);
                let ephemeral = StaticSecret::random_from_rng(OsRng);
                let ciphertext = PublicKey::from(&ephemeral).to_bytes().to_vec();
                let shared = ephemeral.diffie_hellman(&their_public);
                Ok((
                    ciphertext,
                    SharedSecret { bytes: Zeroizing::new(*shared.as_bytes()) },
                ))
            }
            KemAlgorithm::Kyber768 => {
                let public = kyber768::PublicKey::from_bytes(public)
                    .map_err(|e| CryptoError::Kem(format!("malformed public key: {e}")))?;
                let (shared, ciphertext) = kyber768::encapsulate(&public);
                Ok((
                    ciphertext.as_bytes().to_vec(),
                    SharedSecret { bytes: Zeroizing::new(to_array32(shared.as_bytes())?) },
                ))
            }
        }
    }

    /// Recover the shared secret from a ciphertext with our secret component.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Kem`] if the ciphertext is malformed or does
    /// not match this mechanism.
    pub fn decapsulate(self, secret: &KemSecretKey, ciphertext: &[u8]) -> Result<SharedSecret> {
        if secret.algorithm != self {
            return Err(CryptoError::Kem("secret key algorithm mismatch".to_string()));
        }
        match self {
            KemAlgorithm::X25519 => {
                let our_secret = StaticSecret::from(to_array32(&secret.bytes)?);
                let their_public = PublicKey::from(to_array32(ciphertext)?);
                let shared = our_secret.diffie_hellman(&their_public);
                Ok(SharedSecret { bytes: Zeroizing::new(*shared.as_bytes()) })
            }
            KemAlgorithm::Kyber768 => {
                let secret = kyber768::SecretKey::from_bytes(&secret.bytes)
                    .map_err(|e| CryptoError::Kem(format!("malformed secret key: {e}")))?;
                let ciphertext = kyber768::Ciphertext::from_bytes(ciphertext)
                    .map_err(|e| CryptoError::Kem(format!("malformed ciphertext: {e}")))?;
                let shared = kyber768::decapsulate(&ciphertext, &secret);
                Ok(SharedSecret { bytes: Zeroizing::new(to_array32(shared.as_bytes())?) })
            }
        }
    }
}

impl KemPublicKey {
    /// The mechanism this component belongs to.
    pub fn algorithm(&self) -> KemAlgorithm {
        self.algorithm
    }

    /// The raw public bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl KemSecretKey {
    /// The mechanism this component belongs to.
    pub fn algorithm(&self) -> KemAlgorithm {
        self.algorithm
    }
}

impl SharedSecret {
    /// The raw shared secret.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

fn to_array32(bytes: &[u8]) -> Result<[u8; 32]> {
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
        expected: 32,
        actual: bytes.len(),
    })
}
