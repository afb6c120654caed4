//! Symmetric ciphers.
//!
//! Three ciphers are registered: AES-128-CTR, AES-256-CTR, and
//! ChaCha20-Poly1305. CTR ciphers transform the buffer in place; the AEAD
//! appends its 16-byte tag. Message authenticity for CTR suites comes from
//! the parcel trailer MAC applied by the session layer, so a CTR suite is
//! always paired with a digest there.
//!
//! The per-message nonce is a 64-bit value `(epoch << 48) | counter`; it is
//! mapped big-endian into the trailing 8 bytes of the cipher IV/nonce.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::{CryptoError, Result};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// A registered symmetric cipher.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CipherAlgorithm {
    Aes128Ctr,
    Aes256Ctr,
    ChaCha20Poly1305,
}

impl CipherAlgorithm {
    /// The registry name.
    pub fn name(self) -> &'static str {
        match self {
            CipherAlgorithm::Aes128Ctr => "aes-128-ctr",
            CipherAlgorithm::Aes256Ctr => "aes-256-ctr",
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    /// Look up a registry name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes-128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes-256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            "chacha20-poly1305" => Some(CipherAlgorithm::ChaCha20Poly1305),
            _ => None,
        }
    }

    /// Required key length in bytes.
    pub fn key_size(self) -> usize {
        match self {
            CipherAlgorithm::Aes128Ctr => 16,
            CipherAlgorithm::Aes256Ctr | CipherAlgorithm::ChaCha20Poly1305 => 32,
        }
    }

    /// Encrypt `data` in place under `key` and the 64-bit wire nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] on a wrong-sized key.
    pub fn encrypt(self, key: &[u8], nonce: u64, data: &mut Vec<u8>) -> Result<()> {
        self.check_key(key)?;
        match self {
            CipherAlgorithm::Aes128Ctr => {
                let mut cipher = Aes128Ctr::new_from_slices(key, &ctr_iv(nonce))
                    .map_err(|_| self.key_error(key))?;
                cipher.apply_keystream(data);
                Ok(())
            }
            CipherAlgorithm::Aes256Ctr => {
                let mut cipher = Aes256Ctr::new_from_slices(key, &ctr_iv(nonce))
                    .map_err(|_| self.key_error(key))?;
                cipher.apply_keystream(data);
                Ok(())
            }
            CipherAlgorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
                let sealed = cipher
                    .encrypt(Nonce::from_slice(&aead_nonce(nonce)), data.as_slice())
                    .map_err(|_| CryptoError::Decryption)?;
                *data = sealed;
                Ok(())
            }
        }
    }

    /// Decrypt `data` in place under `key` and the 64-bit wire nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decryption`] when the AEAD tag does not
    /// verify, and [`CryptoError::InvalidKeyLength`] on a wrong-sized key.
    pub fn decrypt(self, key: &[u8], nonce: u64, data: &mut Vec<u8>) -> Result<()> {
        self.check_key(key)?;
        match self {
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => {
                // CTR mode is its own inverse.
                self.encrypt(key, nonce, data)
            }
            CipherAlgorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
                let opened = cipher
                    .decrypt(Nonce::from_slice(&aead_nonce(nonce)), data.as_slice())
                    .map_err(|_| CryptoError::Decryption)?;
                *data = opened;
                Ok(())
            }
        }
    }

    fn check_key(self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size() {
            return Err(self.key_error(key));
        }
        Ok(())
    }

    fn key_error(self, key: &[u8]) -> CryptoError {
        CryptoError::InvalidKeyLength { expected: self.key_size(), actual: key.len() }
    }
}

/// 16-byte CTR IV with the wire nonce in the trailing 8 bytes.
fn ctr_iv(nonce: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&nonce.to_be_bytes());
    iv
}

/// 12-byte AEAD nonce with the wire nonce in the trailing 8 bytes.
fn aead_nonce(nonce: u64) -> [u8; 12] {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&nonce.to_be_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ctr_round_trip() {
        for algorithm in [CipherAlgorithm::Aes128Ctr, CipherAlgorithm::Aes256Ctr] {
            let key = vec![0x42u8; algorithm.key_size()];
            let mut data = b"an application payload".to_vec();

            algorithm.encrypt(&key, 7, &mut data).expect("encrypt");
            assert_ne!(data, b"an application payload");

            algorithm.decrypt(&key, 7, &mut data).expect("decrypt");
            assert_eq!(data, b"an application payload");
        }
    }

    #[test]
    fn test_aead_round_trip_and_tag() {
        let algorithm = CipherAlgorithm::ChaCha20Poly1305;
        let key = vec![0x42u8; 32];
        let mut data = b"payload".to_vec();

        algorithm.encrypt(&key, 1, &mut data).expect("encrypt");
        assert_eq!(data.len(), b"payload".len() + 16);

        algorithm.decrypt(&key, 1, &mut data).expect("decrypt");
        assert_eq!(data, b"payload");
    }

    #[test]
    fn test_aead_rejects_wrong_nonce() {
        let algorithm = CipherAlgorithm::ChaCha20Poly1305;
        let key = vec![0x42u8; 32];
        let mut data = b"payload".to_vec();

        algorithm.encrypt(&key, 1, &mut data).expect("encrypt");
        assert!(algorithm.decrypt(&key, 2, &mut data).is_err());
    }

    #[test]
    fn test_nonce_changes_keystream() {
        let algorithm = CipherAlgorithm::Aes256Ctr;
        let key = vec![0x42u8; 32];

        let mut one = b"payload".to_vec();
        let mut two = b"payload".to_vec();
        algorithm.encrypt(&key, 1, &mut one).expect("encrypt");
        algorithm.encrypt(&key, 2, &mut two).expect("encrypt");
        assert_ne!(one, two);
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        let mut data = b"payload".to_vec();
        assert!(CipherAlgorithm::Aes256Ctr.encrypt(&[0u8; 16], 1, &mut data).is_err());
    }

    #[test]
    fn test_name_round_trip() {
        for algorithm in [
            CipherAlgorithm::Aes128Ctr,
            CipherAlgorithm::Aes256Ctr,
            CipherAlgorithm::ChaCha20Poly1305,
        ] {
            assert_eq!(CipherAlgorithm::from_name(algorithm.name()), Some(algorithm));
        }
    }
}
