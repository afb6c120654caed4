//! Domain-separated BLAKE3 key derivation.
//!
//! All session keys derive from the handshake's encapsulated secret through
//! BLAKE3's `derive_key` mode. Cross-purpose collisions are prevented by
//! mandatory domain separation: every derivation site uses one of the
//! registered context strings below.

/// Registered KDF context strings. Using an unregistered context string is a
/// protocol violation.
pub mod contexts {
    pub const SESSION_MASTER: &str = "brypt v1 session-master";
    pub const SESSION_EPOCH: &str = "brypt v1 session-epoch";
    pub const SESSION_TX_KEY: &str = "brypt v1 session-tx-key";
    pub const SESSION_RX_KEY: &str = "brypt v1 session-rx-key";
    pub const SESSION_MAC_KEY: &str = "brypt v1 session-mac-key";
    pub const TOKEN_BINDING: &str = "brypt v1 network-token-binding";

    /// All registered context strings. Used for validation.
    pub const ALL_CONTEXTS: &[&str] = &[
        SESSION_MASTER,
        SESSION_EPOCH,
        SESSION_TX_KEY,
        SESSION_RX_KEY,
        SESSION_MAC_KEY,
        TOKEN_BINDING,
    ];
}

/// Derive a 32-byte key from `material` under the given context.
pub fn derive_key(context: &str, material: &[u8]) -> [u8; 32] {
    blake3::derive_key(context, material)
}

/// Keyed BLAKE3 (MAC/PRF mode).
pub fn keyed_hash(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    *blake3::keyed_hash(key, data).as_bytes()
}

/// Plain BLAKE3 hash.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Length-prefix and concatenate fields so that multi-field KDF inputs are
/// unambiguous regardless of field contents.
pub fn encode_fields(fields: &[&[u8]]) -> Vec<u8> {
    let total: usize = fields.iter().map(|f| 4 + f.len()).sum();
    let mut out = Vec::with_capacity(total);
    for field in fields {
        out.extend_from_slice(&(field.len() as u32).to_be_bytes());
        out.extend_from_slice(field);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        let a = derive_key(contexts::SESSION_TX_KEY, b"secret");
        let b = derive_key(contexts::SESSION_TX_KEY, b"secret");
        assert_eq!(a, b);
    }

    #[test]
    fn test_contexts_separate_domains() {
        let tx = derive_key(contexts::SESSION_TX_KEY, b"secret");
        let rx = derive_key(contexts::SESSION_RX_KEY, b"secret");
        assert_ne!(tx, rx);
    }

    #[test]
    fn test_contexts_unique() {
        for (i, a) in contexts::ALL_CONTEXTS.iter().enumerate() {
            for b in &contexts::ALL_CONTEXTS[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_encode_fields_unambiguous() {
        let joined = encode_fields(&[b"ab", b"c"]);
        let shifted = encode_fields(&[b"a", b"bc"]);
        assert_ne!(joined, shifted);
    }

    #[test]
    fn test_keyed_hash_depends_on_key() {
        let one = keyed_hash(&[1u8; 32], b"data");
        let two = keyed_hash(&[2u8; 32], b"data");
        assert_ne!(one, two);
    }
}
