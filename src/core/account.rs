//! Account identity and amounts.

use std::fmt;

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

/// Credit amount in the smallest indivisible unit. Never fractional.
pub type Amount = u128;

/// Opaque account identifier (UUID as bytes).
///
/// Implements Ord for deterministic BTreeMap ordering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub [u8; 16]);

impl AccountId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Derive a stable account id from an external subject string.
    pub fn derive(subject: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"even-odd-account:");
        hasher.update(subject.as_bytes());
        let hash = hasher.finalize();

        let mut id = [0u8; 16];
        id.copy_from_slice(&hash[..16]);
        Self(id)
    }

    /// Stable id for an account the system itself holds, such as the pool.
    ///
    /// Uses a separate domain from [`AccountId::derive`], so no external
    /// subject can map onto it.
    pub fn system(label: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"even-odd-system:");
        hasher.update(label.as_bytes());
        let hash = hasher.finalize();

        let mut id = [0u8; 16];
        id.copy_from_slice(&hash[..16]);
        Self(id)
    }

    /// Create from a hyphenated UUID string, for ids minted elsewhere.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s)
            .ok()
            .map(|u| Self(*u.as_bytes()))
    }

    /// Parse from a 32-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Hex encoding, as used on the wire.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough for logs
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_stable() {
        assert_eq!(AccountId::derive("alice"), AccountId::derive("alice"));
        assert_ne!(AccountId::derive("alice"), AccountId::derive("bob"));
    }

    #[test]
    fn test_system_ids_are_separate_from_subjects() {
        assert_ne!(AccountId::system("pool"), AccountId::derive("pool"));
        assert_eq!(AccountId::system("pool"), AccountId::system("pool"));
    }

    #[test]
    fn test_hex_roundtrip_and_rejects_bad_length() {
        let id = AccountId::new([0xab; 16]);
        assert_eq!(AccountId::from_hex(&id.to_hex()), Some(id));
        assert_eq!(AccountId::from_hex("abcd"), None);
        assert_eq!(AccountId::from_hex("not hex"), None);
    }

    #[test]
    fn test_uuid_parse() {
        let id = AccountId::from_uuid_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        assert_eq!(id.0[0], 0x67);
        assert!(AccountId::from_uuid_str("garbage").is_none());
    }
}
