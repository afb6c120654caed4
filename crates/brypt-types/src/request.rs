//! Request correlation keys.
//!
//! A request key is a 128-bit value (two 64-bit limbs) stamped on every
//! request parcel and echoed on its replies. Keys are drawn from a CSPRNG
//! by the request tracker; the zero key is reserved as "no key".

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Size of a request key on the wire.
pub const REQUEST_KEY_SIZE: usize = 16;

/// A 128-bit request correlator.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    high: u64,
    low: u64,
}

impl RequestKey {
    /// Construct from the two limbs.
    pub fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    /// Draw a fresh key from the operating system CSPRNG.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self { high: rng.next_u64(), low: rng.next_u64() }
    }

    /// The reserved "no key" value.
    pub fn zero() -> Self {
        Self::default()
    }

    /// True unless this is the reserved zero key.
    pub fn is_valid(&self) -> bool {
        self.high != 0 || self.low != 0
    }

    /// Big-endian wire form, high limb first.
    pub fn to_bytes(self) -> [u8; REQUEST_KEY_SIZE] {
        let mut bytes = [0u8; REQUEST_KEY_SIZE];
        bytes[..8].copy_from_slice(&self.high.to_be_bytes());
        bytes[8..].copy_from_slice(&self.low.to_be_bytes());
        bytes
    }

    /// Decode the big-endian wire form.
    pub fn from_bytes(bytes: [u8; REQUEST_KEY_SIZE]) -> Self {
        let high = u64::from_be_bytes(bytes[..8].try_into().unwrap_or_default());
        let low = u64::from_be_bytes(bytes[8..].try_into().unwrap_or_default());
        Self { high, low }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.high, self.low)
    }
}

impl fmt::Debug for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestKey({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_valid_and_unique() {
        let a = RequestKey::generate();
        let b = RequestKey::generate();
        assert!(a.is_valid());
        assert_ne!(a, b);
    }

    #[test]
    fn test_zero_is_invalid() {
        assert!(!RequestKey::zero().is_valid());
    }

    #[test]
    fn test_bytes_round_trip() {
        let key = RequestKey::new(0x0102030405060708, 0x1112131415161718);
        let bytes = key.to_bytes();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[8], 0x11);
        assert_eq!(RequestKey::from_bytes(bytes), key);
    }

    #[test]
    fn test_ordering_high_limb_first() {
        let a = RequestKey::new(1, 0);
        let b = RequestKey::new(0, u64::MAX);
        assert!(a > b);
    }
}
