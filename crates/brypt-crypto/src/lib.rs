//! # brypt-crypto
//!
//! Cryptographic primitives and the negotiable cipher-suite catalog for the
//! Brypt node runtime.
//!
//! Unlike a fixed-suite protocol, Brypt negotiates its per-link algorithms:
//! every node advertises an ordered preference of key-encapsulation,
//! symmetric-cipher, and digest algorithms per confidentiality tier, and two
//! peers deterministically agree on one [`suite::CipherSuite`] during the
//! handshake.
//!
//! ## Modules
//!
//! - [`suite`] — algorithm registry, tier table, and suite selection
//! - [`kem`] — key encapsulation (X25519, Kyber768)
//! - [`cipher`] — symmetric ciphers (AES-CTR, ChaCha20-Poly1305)
//! - [`digest`] — hashing and keyed MACs (BLAKE3, BLAKE2b-512)
//! - [`kdf`] — domain-separated BLAKE3 key derivation

pub mod cipher;
pub mod digest;
pub mod kdf;
pub mod kem;
pub mod suite;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// An algorithm name is absent from the registry.
    #[error("unknown algorithm: {0}")]
    UnknownAlgorithm(String),

    /// No mutually supported suite exists between two catalogs.
    #[error("suite negotiation failed")]
    NegotiationFailed,

    /// KEM operation failed (malformed public key or ciphertext).
    #[error("key encapsulation error: {0}")]
    Kem(String),

    /// Symmetric decryption failed (authentication tag mismatch).
    #[error("decryption failed")]
    Decryption,

    /// MAC verification failed.
    #[error("MAC verification failed")]
    MacVerification,

    /// A key or nonce had the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
