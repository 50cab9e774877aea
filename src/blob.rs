//! Content-addressed blob layer.
//!
//! A blob is `(type ∈ {data, tree}, id = SHA-256(plaintext), ciphertext)`.
//! `id` is the sole key dedup and lookup operate on; it never changes once
//! computed, and blobs themselves are never mutated in place.
//!
//! Modeled on `backup::data_blob::DataBlob`, generalized from a
//! self-contained single-object container (with its own magic-number
//! header) into the payload unit that [`crate::pack`] concatenates many of
//! behind one trailing encrypted header.

use serde::{Deserialize, Serialize};

use crate::crypto::CryptConfig;
use crate::error::{RepositoryError, Result};
use crate::id::Id;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobType {
    Tree,
    Data,
}

impl BlobType {
    /// The pack-header record type byte: `0x00=tree, 0x01=data` for the
    /// uncompressed case.
    pub fn record_type(self, compressed: bool) -> u8 {
        match (self, compressed) {
            (BlobType::Tree, false) => 0x00,
            (BlobType::Data, false) => 0x01,
            (BlobType::Data, true) => 0x02,
            (BlobType::Tree, true) => 0x03,
        }
    }

    pub fn from_record_type(byte: u8) -> Result<(BlobType, bool)> {
        match byte {
            0x00 => Ok((BlobType::Tree, false)),
            0x01 => Ok((BlobType::Data, false)),
            0x02 => Ok((BlobType::Data, true)),
            0x03 => Ok((BlobType::Tree, true)),
            other => Err(RepositoryError::Corrupt(format!(
                "unknown pack record type byte 0x{:02x}",
                other
            ))),
        }
    }
}

/// A blob ready to be appended to a pack: its content-address, whether its
/// plaintext was zstd-compressed before encryption, and its ciphertext
/// (`AEAD(compress?(plaintext))`, ready to write verbatim).
pub struct EncodedBlob {
    pub blob_type: BlobType,
    pub id: Id,
    pub ciphertext: Vec<u8>,
    pub uncompressed_length: Option<u32>,
}

/// Encode `plaintext` as a blob of `blob_type`. `id` is always the hash of
/// the *uncompressed, unencrypted* plaintext, computed before compression
/// or encryption ever touch it.
pub fn encode(
    blob_type: BlobType,
    plaintext: &[u8],
    crypt: &CryptConfig,
    compress: bool,
) -> Result<EncodedBlob> {
    let id = Id::hash(plaintext);

    let (payload, uncompressed_length) = if compress {
        let compressed = zstd::stream::encode_all(plaintext, 0)
            .map_err(|e| RepositoryError::Other(anyhow::anyhow!("zstd compress failed: {}", e)))?;
        // only worth it if it actually shrank the blob
        if compressed.len() < plaintext.len() {
            (compressed, Some(plaintext.len() as u32))
        } else {
            (plaintext.to_vec(), None)
        }
    } else {
        (plaintext.to_vec(), None)
    };

    let ciphertext = crypt.encrypt(&payload);

    Ok(EncodedBlob {
        blob_type,
        id,
        ciphertext,
        uncompressed_length,
    })
}

/// Decode a blob back to plaintext, verifying both AEAD authenticity and
/// content addressing against `expected_id`.
pub fn decode(
    ciphertext: &[u8],
    crypt: &CryptConfig,
    compressed: bool,
    expected_id: &Id,
) -> Result<Vec<u8>> {
    let payload = crypt.decrypt_checked(ciphertext, &format!("blob {}", expected_id))?;

    let plaintext = if compressed {
        zstd::stream::decode_all(&payload[..])
            .map_err(|e| RepositoryError::Corrupt(format!("zstd decompress failed: {}", e)))?
    } else {
        payload
    };

    let actual_id = Id::hash(&plaintext);
    if actual_id != *expected_id {
        return Err(RepositoryError::Corrupt(format!(
            "blob content hash mismatch: expected {}, got {}",
            expected_id, actual_id
        )));
    }

    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoKey;

    fn crypt() -> CryptConfig {
        CryptConfig::new(&CryptoKey::random())
    }

    #[test]
    fn encode_decode_roundtrip_uncompressed() {
        let crypt = crypt();
        let plaintext = b"some file content, not particularly compressible: \x01\x02\x03";
        let encoded = encode(BlobType::Data, plaintext, &crypt, false).unwrap();
        assert_eq!(encoded.id, Id::hash(plaintext));
        let decoded = decode(&encoded.ciphertext, &crypt, false, &encoded.id).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn encode_decode_roundtrip_compressed() {
        let crypt = crypt();
        let plaintext = vec![b'a'; 100_000];
        let encoded = encode(BlobType::Data, &plaintext, &crypt, true).unwrap();
        assert!(encoded.uncompressed_length.is_some());
        assert!(encoded.ciphertext.len() < plaintext.len());
        let decoded = decode(&encoded.ciphertext, &crypt, true, &encoded.id).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn id_is_stable_regardless_of_compression() {
        let crypt = crypt();
        let plaintext = vec![b'z'; 50_000];
        let a = encode(BlobType::Data, &plaintext, &crypt, false).unwrap();
        let b = encode(BlobType::Data, &plaintext, &crypt, true).unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let crypt = crypt();
        let plaintext = b"authenticate me please";
        let mut encoded = encode(BlobType::Data, plaintext, &crypt, false).unwrap();
        let last = encoded.ciphertext.len() - 1;
        encoded.ciphertext[last] ^= 1;
        assert!(decode(&encoded.ciphertext, &crypt, false, &encoded.id).is_err());
    }
}
