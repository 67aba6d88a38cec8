//! Key material and the content-hash identity derived from it.

use hex::encode as hex_encode;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Raw bytes read from a marker file.
///
/// Cheap to clone; every clone shares the same immutable buffer, which is wiped
/// when the last reference is dropped.
#[derive(Clone)]
pub struct KeyMaterial(Arc<Zeroizing<Vec<u8>>>);

impl KeyMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::new(Zeroizing::new(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for KeyMaterial {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for KeyMaterial {}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial({} bytes)", self.len())
    }
}

/// SHA-256 digest of a key's marker bytes; the join key into configuration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyIdentity([u8; 32]);

impl KeyIdentity {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering used for display, matching, and command templates.
    pub fn to_hex(&self) -> String {
        hex_encode(self.0)
    }

    /// Compare against an identity string as an operator may have recorded it.
    ///
    /// Case, `-` separators, and whitespace are ignored, so both `ab01..` and the
    /// older `AB-01-..` rendering match.
    pub fn matches(&self, recorded: &str) -> bool {
        normalize_identity(recorded).is_some_and(|normalized| normalized == self.to_hex())
    }
}

impl fmt::Display for KeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for KeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyIdentity({})", self.to_hex())
    }
}

/// Derive the identity for `material`.
pub fn resolve(material: &KeyMaterial) -> KeyIdentity {
    KeyIdentity(Sha256::digest(material.as_bytes()).into())
}

/// Canonicalise a recorded identity to 64 lowercase hex digits.
///
/// Returns `None` when the input does not describe a 32-byte digest.
pub fn normalize_identity(recorded: &str) -> Option<String> {
    let cleaned: String = recorded
        .chars()
        .filter(|ch| *ch != '-' && !ch.is_whitespace())
        .map(|ch| ch.to_ascii_lowercase())
        .collect();
    if cleaned.len() == 64 && cleaned.chars().all(|ch| ch.is_ascii_hexdigit()) {
        Some(cleaned)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_deterministic() {
        let material = KeyMaterial::new(vec![0x42; 64]);
        let copy = KeyMaterial::new(vec![0x42; 64]);
        assert_eq!(resolve(&material), resolve(&material));
        assert_eq!(resolve(&material), resolve(&copy));
    }

    #[test]
    fn distinct_material_yields_distinct_identity() {
        let a = KeyMaterial::new(vec![0x01; 512]);
        let mut flipped = vec![0x01; 512];
        flipped[511] = 0x02;
        let b = KeyMaterial::new(flipped);
        assert_ne!(resolve(&a), resolve(&b));
    }

    #[test]
    fn identity_of_empty_material_is_sha256_of_nothing() {
        let id = resolve(&KeyMaterial::new(Vec::new()));
        assert_eq!(
            id.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn matches_accepts_dashed_uppercase_form() {
        let id = resolve(&KeyMaterial::new(b"marker".to_vec()));
        let dashed = id
            .as_bytes()
            .iter()
            .map(|byte| format!("{byte:02X}"))
            .collect::<Vec<_>>()
            .join("-");
        assert!(id.matches(&dashed));
        assert!(id.matches(&id.to_hex().to_uppercase()));
        assert!(!id.matches("not-an-identity"));
    }

    #[test]
    fn normalize_rejects_wrong_length() {
        assert_eq!(normalize_identity("abcd"), None);
        assert!(normalize_identity(&"0f".repeat(32)).is_some());
    }

    #[test]
    fn debug_output_redacts_material() {
        let material = KeyMaterial::new(vec![0xAA; 4]);
        assert_eq!(format!("{material:?}"), "KeyMaterial(4 bytes)");
    }
}
