//! Snapshot file: a named, timestamped reference to a root tree.
//!
//! Snapshots are stored as their own top-level files under `snapshots/`,
//! not packed alongside blobs — they are small, infrequent, and need to be
//! listable without touching the pack/index machinery at all.

use serde::{Deserialize, Serialize};

use crate::crypto::CryptConfig;
use crate::error::Result;
use crate::id::Id;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Id>,
    pub hostname: String,
    pub username: String,
    /// RFC 3339 start time.
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub paths: Vec<String>,
    pub tree: Id,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program_version: Option<String>,
}

impl Snapshot {
    pub fn new(hostname: &str, username: &str, paths: Vec<String>, tree: Id) -> Self {
        Snapshot {
            parent: None,
            hostname: hostname.to_string(),
            username: username.to_string(),
            time: chrono::Utc::now().to_rfc3339(),
            end_time: None,
            tags: Vec::new(),
            paths,
            tree,
            description: None,
            program_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }

    pub fn encode(&self, crypt: &CryptConfig) -> Result<Vec<u8>> {
        let plaintext = serde_json::to_vec(self)?;
        Ok(crypt.encrypt(&plaintext))
    }

    pub fn decode(ciphertext: &[u8], crypt: &CryptConfig) -> Result<Self> {
        let plaintext = crypt.decrypt_checked(ciphertext, "snapshot")?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Whether this snapshot is a plausible incremental parent for a new
    /// backup of `paths` from `hostname` — the same host and the same path
    /// set, matching the default parent-selection rule.
    pub fn matches_scope(&self, hostname: &str, paths: &[String]) -> bool {
        self.hostname == hostname && self.paths == paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoKey;

    #[test]
    fn encode_decode_roundtrip() {
        let crypt = CryptConfig::new(&CryptoKey::random());
        let snap = Snapshot::new(
            "host1",
            "alice",
            vec!["/data".to_string()],
            Id::hash(b"root tree"),
        );
        let encoded = snap.encode(&crypt).unwrap();
        let decoded = Snapshot::decode(&encoded, &crypt).unwrap();
        assert_eq!(decoded.hostname, "host1");
        assert_eq!(decoded.tree, snap.tree);
    }

    #[test]
    fn matches_scope_requires_host_and_paths() {
        let snap = Snapshot::new(
            "host1",
            "alice",
            vec!["/data".to_string()],
            Id::hash(b"t"),
        );
        assert!(snap.matches_scope("host1", &["/data".to_string()]));
        assert!(!snap.matches_scope("host2", &["/data".to_string()]));
        assert!(!snap.matches_scope("host1", &["/other".to_string()]));
    }
}
