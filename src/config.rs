//! Repository-wide config file.
//!
//! Written once at `init` and never mutated afterward: repository UUID,
//! on-disk format version, and the chunker polynomial that fixes chunk
//! boundaries for the repository's whole lifetime. Unlike every other
//! repository object this one has no hash-derived name — it always lives
//! at the fixed path `config` under the repository root.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunker::Polynomial;
use crate::crypto::CryptConfig;
use crate::error::Result;

/// Repository version 1 never compresses; version 2 zstd-compresses
/// plaintexts before AEAD when doing so shrinks them. Both are read by this
/// engine; `CURRENT` is what a freshly initialized repository writes.
pub const CURRENT_VERSION: u32 = 2;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub version: u32,
    pub id: Uuid,
    pub chunker_polynomial: Polynomial,
}

impl Config {
    pub fn new() -> Self {
        Config {
            version: CURRENT_VERSION,
            id: Uuid::new_v4(),
            chunker_polynomial: Polynomial::random(),
        }
    }

    /// Whether blobs written under this config should attempt zstd
    /// compression before encryption.
    pub fn compression_enabled(&self) -> bool {
        self.version >= 2
    }

    pub fn encode(&self, crypt: &CryptConfig) -> Result<Vec<u8>> {
        let plaintext = serde_json::to_vec(self)?;
        Ok(crypt.encrypt(&plaintext))
    }

    pub fn decode(ciphertext: &[u8], crypt: &CryptConfig) -> Result<Self> {
        let plaintext = crypt.decrypt_checked(ciphertext, "repository config")?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}
