//! The cipher-suite catalog and negotiation rules.
//!
//! A suite is a `(kem, cipher, digest)` tuple drawn from the static
//! algorithm registry. Nodes configure an ordered preference of algorithms
//! per confidentiality tier; during the handshake the initiator's and
//! responder's catalogs are intersected per tier and per component,
//! preserving the initiator's order, and the highest tier with a complete
//! candidate wins. Selection is a pure function of the two catalogs.

use serde::{Deserialize, Serialize};

use crate::cipher::CipherAlgorithm;
use crate::digest::DigestAlgorithm;
use crate::kem::KemAlgorithm;
use crate::{CryptoError, Result};

/// Confidentiality tiers, strongest first.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidentialityLevel {
    High,
    Medium,
    Low,
}

impl ConfidentialityLevel {
    /// Tiers in descending strength, the order selection walks them.
    pub const DESCENDING: [ConfidentialityLevel; 3] = [
        ConfidentialityLevel::High,
        ConfidentialityLevel::Medium,
        ConfidentialityLevel::Low,
    ];
}

/// A negotiated cipher suite.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "SuiteWire", try_from = "SuiteWire")]
pub struct CipherSuite {
    pub level: ConfidentialityLevel,
    pub kem: KemAlgorithm,
    pub cipher: CipherAlgorithm,
    pub digest: DigestAlgorithm,
}

/// Serialized form of a suite: the registry names.
#[derive(Clone, Serialize, Deserialize)]
struct SuiteWire {
    level: ConfidentialityLevel,
    kem: String,
    cipher: String,
    digest: String,
}

impl From<CipherSuite> for SuiteWire {
    fn from(suite: CipherSuite) -> Self {
        Self {
            level: suite.level,
            kem: suite.kem.name().to_string(),
            cipher: suite.cipher.name().to_string(),
            digest: suite.digest.name().to_string(),
        }
    }
}

impl TryFrom<SuiteWire> for CipherSuite {
    type Error = CryptoError;

    fn try_from(wire: SuiteWire) -> Result<Self> {
        Ok(Self {
            level: wire.level,
            kem: KemAlgorithm::from_name(&wire.kem)
                .ok_or_else(|| CryptoError::UnknownAlgorithm(wire.kem.clone()))?,
            cipher: CipherAlgorithm::from_name(&wire.cipher)
                .ok_or_else(|| CryptoError::UnknownAlgorithm(wire.cipher.clone()))?,
            digest: DigestAlgorithm::from_name(&wire.digest)
                .ok_or_else(|| CryptoError::UnknownAlgorithm(wire.digest.clone()))?,
        })
    }
}

/// The ordered algorithm preference for one confidentiality tier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmsPackage {
    pub level: ConfidentialityLevel,
    pub key_agreements: Vec<String>,
    pub ciphers: Vec<String>,
    pub digests: Vec<String>,
}

/// A node's configured suite preferences across tiers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuiteCatalog {
    packages: Vec<AlgorithmsPackage>,
}

impl SuiteCatalog {
    /// Build a catalog, validating every name against the registry.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownAlgorithm`] for any unregistered name
    /// and [`CryptoError::InvalidInput`] for a duplicate tier.
    pub fn new(packages: Vec<AlgorithmsPackage>) -> Result<Self> {
        let mut seen = Vec::new();
        for package in &packages {
            if seen.contains(&package.level) {
                return Err(CryptoError::InvalidInput(format!(
                    "duplicate tier {:?}",
                    package.level
                )));
            }
            seen.push(package.level);

            for name in &package.key_agreements {
                if KemAlgorithm::from_name(name).is_none() {
                    return Err(CryptoError::UnknownAlgorithm(name.clone()));
                }
            }
            for name in &package.ciphers {
                if CipherAlgorithm::from_name(name).is_none() {
                    return Err(CryptoError::UnknownAlgorithm(name.clone()));
                }
            }
            for name in &package.digests {
                if DigestAlgorithm::from_name(name).is_none() {
                    return Err(CryptoError::UnknownAlgorithm(name.clone()));
                }
            }
        }
        Ok(Self { packages })
    }

    /// The default preference: the full high-tier registry with Kyber768
    /// favored, plus a medium tier for classical-only peers.
    pub fn standard() -> Self {
        Self {
            packages: vec![
                AlgorithmsPackage {
                    level: ConfidentialityLevel::High,
                    key_agreements: vec![
                        "kem-kyber768".to_string(),
                        "kem-x25519".to_string(),
                    ],
                    ciphers: vec![
                        "aes-256-ctr".to_string(),
                        "chacha20-poly1305".to_string(),
                    ],
                    digests: vec!["blake2b512".to_string(), "blake3".to_string()],
                },
                AlgorithmsPackage {
                    level: ConfidentialityLevel::Medium,
                    key_agreements: vec!["kem-x25519".to_string()],
                    ciphers: vec!["aes-128-ctr".to_string()],
                    digests: vec!["blake3".to_string()],
                },
            ],
        }
    }

    /// The configured packages, in advertisement form.
    pub fn packages(&self) -> &[AlgorithmsPackage] {
        &self.packages
    }

    /// Every KEM named anywhere in the catalog, first occurrence order.
    pub fn key_agreements(&self) -> Vec<KemAlgorithm> {
        let mut kems = Vec::new();
        for package in &self.packages {
            for name in &package.key_agreements {
                if let Some(kem) = KemAlgorithm::from_name(name) {
                    if !kems.contains(&kem) {
                        kems.push(kem);
                    }
                }
            }
        }
        kems
    }

    fn package(&self, level: ConfidentialityLevel) -> Option<&AlgorithmsPackage> {
        self.packages.iter().find(|package| package.level == level)
    }

    /// Select the suite this catalog (as initiator) agrees on with a
    /// responder's advertised packages.
    ///
    /// Walks the tiers strongest-first; within a tier each component list is
    /// intersected preserving the initiator's order, and the first complete
    /// candidate wins.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NegotiationFailed`] when no tier yields a
    /// complete intersection.
    pub fn select(&self, responder: &[AlgorithmsPackage]) -> Result<CipherSuite> {
        for level in ConfidentialityLevel::DESCENDING {
            let Some(ours) = self.package(level) else { continue };
            let Some(theirs) = responder.iter().find(|package| package.level == level) else {
                continue;
            };

            let kem = first_common(&ours.key_agreements, &theirs.key_agreements);
            let cipher = first_common(&ours.ciphers, &theirs.ciphers);
            let digest = first_common(&ours.digests, &theirs.digests);

            if let (Some(kem), Some(cipher), Some(digest)) = (kem, cipher, digest) {
                let kem =
                    KemAlgorithm::from_name(kem).ok_or(CryptoError::NegotiationFailed)?;
                let cipher =
                    CipherAlgorithm::from_name(cipher).ok_or(CryptoError::NegotiationFailed)?;
                let digest =
                    DigestAlgorithm::from_name(digest).ok_or(CryptoError::NegotiationFailed)?;
                return Ok(CipherSuite { level, kem, cipher, digest });
            }
        }
        Err(CryptoError::NegotiationFailed)
    }

    /// Whether a suite is expressible from this catalog's configuration.
    pub fn contains(&self, suite: &CipherSuite) -> bool {
        self.package(suite.level).is_some_and(|package| {
            package.key_agreements.iter().any(|name| name == suite.kem.name())
                && package.ciphers.iter().any(|name| name == suite.cipher.name())
                && package.digests.iter().any(|name| name == suite.digest.name())
        })
    }
}

/// First entry of `preferred` that also appears in `available`.
fn first_common<'a>(preferred: &'a [String], available: &[String]) -> Option<&'a str> {
    preferred
        .iter()
        .find(|name| available.contains(name))
        .map(String::as_str)
}
