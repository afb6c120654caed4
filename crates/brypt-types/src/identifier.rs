//! Node identifiers.
//!
//! Every running service owns exactly one identifier. The identifier is an
//! opaque 16-byte string with a lowercase-hex canonical form; equality and
//! total order are defined over the raw bytes.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Number of raw bytes in a node identifier.
pub const IDENTIFIER_SIZE: usize = 16;

/// Whether an identifier was generated for this run or loaded from storage.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierPersistence {
    /// Generated at startup and discarded on shutdown.
    Ephemeral,
    /// Loaded from (and written back to) the configuration store.
    Persistent,
}

/// A stable node identifier.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIdentifier {
    bytes: [u8; IDENTIFIER_SIZE],
}

impl NodeIdentifier {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        let mut bytes = [0u8; IDENTIFIER_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; IDENTIFIER_SIZE]) -> Self {
        Self { bytes }
    }

    /// Construct from a byte slice of exactly [`IDENTIFIER_SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on any other length.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; IDENTIFIER_SIZE] =
            slice.try_into().map_err(|_| Error::InvalidArgument)?;
        Ok(Self { bytes })
    }

    /// Parse the canonical lowercase-hex text form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the text is not 32 hex chars.
    pub fn from_text(text: &str) -> Result<Self> {
        let decoded = hex::decode(text).map_err(|_| Error::InvalidArgument)?;
        Self::from_slice(&decoded)
    }

    /// The raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; IDENTIFIER_SIZE] {
        &self.bytes
    }

    /// The canonical text form (lowercase hex).
    pub fn to_text(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl fmt::Display for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl fmt::Debug for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeIdentifier({})", self.to_text())
    }
}

impl Serialize for NodeIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_text())
    }
}

impl<'de> Deserialize<'de> for NodeIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        NodeIdentifier::from_text(&text).map_err(serde::de::Error::custom)
    }
}
