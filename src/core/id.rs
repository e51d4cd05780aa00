//! Typed Identifiers
//!
//! All row identifiers are 16-byte values (UUID-compatible).
//! Implements Ord for deterministic BTreeMap ordering.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Unique user identifier, derived from the identity gateway's subject claim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct UserId(pub [u8; 16]);

impl UserId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Derive a deterministic UserId from an opaque subject string.
    /// Uses SHA256 to create a 16-byte ID, so the same subject always maps
    /// to the same user.
    pub fn from_subject(subject: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"snapduel-user:");
        hasher.update(subject.as_bytes());
        let hash = hasher.finalize();

        let mut id = [0u8; 16];
        id.copy_from_slice(&hash[..16]);
        Self(id)
    }

    /// Parse from a UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(|u| Self(*u.as_bytes()))
    }

    /// Render as a UUID string.
    pub fn to_uuid_string(&self) -> String {
        uuid::Uuid::from_bytes(self.0).to_string()
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

/// Unique duel (match row) identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct DuelId(pub [u8; 16]);

impl DuelId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    /// Parse from a UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(|u| Self(*u.as_bytes()))
    }

    /// Render as a UUID string.
    pub fn to_uuid_string(&self) -> String {
        uuid::Uuid::from_bytes(self.0).to_string()
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

/// Unique matchmaking queue entry identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct EntryId(pub [u8; 16]);

impl EntryId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    /// Render as a UUID string.
    pub fn to_uuid_string(&self) -> String {
        uuid::Uuid::from_bytes(self.0).to_string()
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_derivation_is_stable() {
        let id1 = UserId::from_subject("user123");
        let id2 = UserId::from_subject("user123");
        assert_eq!(id1, id2);

        let id3 = UserId::from_subject("user456");
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_id_ordering() {
        let id1 = UserId::new([0; 16]);
        let id2 = UserId::new([1; 16]);
        let id3 = UserId::new([0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);

        assert!(id1 < id2);
        assert!(id1 < id3);
        assert!(id3 < id2);
    }

    #[test]
    fn test_uuid_round_trip() {
        let id = DuelId::generate();
        let parsed = DuelId::from_uuid_str(&id.to_uuid_string()).unwrap();
        assert_eq!(id, parsed);
    }
}
