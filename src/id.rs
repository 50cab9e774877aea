//! Content-addressing primitive.
//!
//! An [`Id`] is the SHA-256 digest of a plaintext object (blob, tree,
//! snapshot, index, pack ciphertext...). It is the sole primary key for
//! every content-addressed entity in the repository.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const ID_SIZE: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(#[serde(with = "hex_serde")] pub [u8; ID_SIZE]);

impl Id {
    pub const fn zero() -> Self {
        Id([0u8; ID_SIZE])
    }

    /// Hash `data` and return its `Id`. This is the dedup and integrity key
    /// for every blob, tree, snapshot and index file in the repository.
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut out = [0u8; ID_SIZE];
        out.copy_from_slice(&digest);
        Id(out)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex_serde::encode(&self.0)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.to_hex())
    }
}

#[derive(thiserror::Error, Debug)]
#[error("invalid id: {0}")]
pub struct ParseIdError(String);

impl FromStr for Id {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex_serde::decode(s).map_err(|_| ParseIdError(s.to_string()))?;
        if bytes.len() != ID_SIZE {
            return Err(ParseIdError(s.to_string()));
        }
        let mut out = [0u8; ID_SIZE];
        out.copy_from_slice(&bytes);
        Ok(Id(out))
    }
}

/// Minimal hex codec so the crate does not need a dedicated `hex` dependency
/// beyond what `serde` needs for (de)serializing [`Id`] as a hex string.
mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    const DIGITS: &[u8; 16] = b"0123456789abcdef";

    pub fn encode(bytes: &[u8]) -> String {
        let mut s = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            s.push(DIGITS[(b >> 4) as usize] as char);
            s.push(DIGITS[(b & 0xf) as usize] as char);
        }
        s
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, ()> {
        let s = s.as_bytes();
        if s.len() % 2 != 0 {
            return Err(());
        }
        let mut out = Vec::with_capacity(s.len() / 2);
        for chunk in s.chunks(2) {
            let hi = (chunk[0] as char).to_digit(16).ok_or(())?;
            let lo = (chunk[1] as char).to_digit(16).ok_or(())?;
            out.push(((hi << 4) | lo) as u8);
        }
        Ok(out)
    }

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = decode(&s).map_err(|_| serde::de::Error::custom("invalid hex id"))?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("id must be 32 bytes"));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = Id::hash(b"hello world");
        let b = Id::hash(b"hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn roundtrip_hex() {
        let id = Id::hash(b"some plaintext");
        let hex = id.to_hex();
        let parsed: Id = hex.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn distinct_inputs_distinct_ids() {
        assert_ne!(Id::hash(b"a"), Id::hash(b"b"));
    }
}
