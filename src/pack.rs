//! Pack layer: groups many encrypted blobs behind one trailing header.
//!
//! A pack file is the concatenation of its blobs' ciphertexts, followed by
//! a trailing encrypted header describing every blob it holds, followed by
//! a 4-byte little-endian header length:
//!
//! ```text
//! [blob_0_ct][blob_1_ct]...[blob_n_ct][header_ct][header_len: u32 LE]
//! ```
//!
//! A pack's on-backend name is the SHA-256 of its ciphertext bytes — the
//! file is self-describing: a reader holding the key can enumerate and
//! extract any blob from the pack alone.
//!
//! The pack's content-addressed name is computed incrementally while its
//! bytes are assembled, rather than by hashing the finished buffer a
//! second time.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::blob::BlobType;
use crate::crypto::CryptConfig;
use crate::error::{RepositoryError, Result};
use crate::id::Id;

pub const DEFAULT_TARGET_SIZE: u64 = 16 * 1024 * 1024;
pub const MIN_TARGET_SIZE: u64 = 4 * 1024 * 1024;
pub const MAX_TARGET_SIZE: u64 = 128 * 1024 * 1024;

/// One record of a pack's trailing header: where a blob lives inside the
/// pack and how to decode it.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PackedBlob {
    pub blob_type: BlobType,
    pub id: Id,
    pub offset: u32,
    pub length: u32,
    pub uncompressed_length: Option<u32>,
}

/// Accumulates encrypted blobs for a single pack file and finalizes them
/// into the bit-exact on-disk layout above. One `PackWriter` exists per
/// concurrent pack-builder slot.
pub struct PackWriter {
    blob_type_class: BlobTypeClass,
    buf: Vec<u8>,
    entries: Vec<PackedBlob>,
}

/// Data and tree blobs live in disjoint packs; a `PackWriter`
/// is dedicated to one class for its whole lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlobTypeClass {
    Data,
    Tree,
}

impl PackWriter {
    pub fn new(blob_type_class: BlobTypeClass) -> Self {
        PackWriter {
            blob_type_class,
            buf: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn blob_type_class(&self) -> BlobTypeClass {
        self.blob_type_class
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current_size(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn blob_count(&self) -> usize {
        self.entries.len()
    }

    /// Append an already-encrypted blob. Returns its offset within the
    /// pack being built.
    pub fn add(&mut self, encoded: &crate::blob::EncodedBlob) -> Result<u32> {
        let offset: u32 = self
            .buf
            .len()
            .try_into()
            .map_err(|_| RepositoryError::Fatal("pack exceeded 4 GiB".to_string()))?;
        let length: u32 = encoded
            .ciphertext
            .len()
            .try_into()
            .map_err(|_| RepositoryError::Fatal("blob too large for one pack entry".to_string()))?;

        self.buf.extend_from_slice(&encoded.ciphertext);
        self.entries.push(PackedBlob {
            blob_type: encoded.blob_type,
            id: encoded.id,
            offset,
            length,
            uncompressed_length: encoded.uncompressed_length,
        });
        Ok(offset)
    }

    /// Finalize the pack: serialize and encrypt the trailing header, append
    /// its length, hash the whole file for its content-addressed name.
    pub fn finish(self, crypt: &CryptConfig) -> Result<FinishedPack> {
        if self.entries.is_empty() {
            return Err(RepositoryError::Fatal(
                "a pack must hold at least one blob".to_string(),
            ));
        }

        let mut header_plain = Vec::new();
        for entry in &self.entries {
            let compressed = entry.uncompressed_length.is_some();
            header_plain.push(entry.blob_type.record_type(compressed));
            header_plain.extend_from_slice(&entry.length.to_le_bytes());
            header_plain.extend_from_slice(entry.id.as_bytes());
            if let Some(raw_len) = entry.uncompressed_length {
                header_plain.extend_from_slice(&raw_len.to_le_bytes());
            }
        }

        let header_ct = crypt.encrypt(&header_plain);
        let header_len: u32 = header_ct
            .len()
            .try_into()
            .map_err(|_| RepositoryError::Fatal("pack header too large".to_string()))?;

        let mut data = self.buf;
        data.extend_from_slice(&header_ct);
        data.extend_from_slice(&header_len.to_le_bytes());

        let mut hasher = Sha256::new();
        hasher.update(&data);
        let mut id_bytes = [0u8; 32];
        id_bytes.copy_from_slice(&hasher.finalize());
        let id = Id(id_bytes);

        Ok(FinishedPack {
            id,
            data,
            entries: self.entries,
        })
    }
}

pub struct FinishedPack {
    pub id: Id,
    pub data: Vec<u8>,
    pub entries: Vec<PackedBlob>,
}

/// Record size of one header entry, used to bound-check truncated headers.
fn record_len(compressed: bool) -> usize {
    1 + 4 + 32 + if compressed { 4 } else { 0 }
}

/// Parse (and decrypt) a pack's trailing header out of the full pack bytes.
/// Returns the blob records and the pack-internal offset at which the blob
/// payload region ends (i.e. where the header begins).
pub fn parse_header(pack_bytes: &[u8], crypt: &CryptConfig) -> Result<(Vec<PackedBlob>, usize)> {
    if pack_bytes.len() < 4 {
        return Err(RepositoryError::Corrupt(
            "pack file too small to contain a header length".to_string(),
        ));
    }
    let len_offset = pack_bytes.len() - 4;
    let header_len =
        u32::from_le_bytes(pack_bytes[len_offset..].try_into().unwrap()) as usize;
    if header_len > len_offset {
        return Err(RepositoryError::Corrupt(
            "pack header length exceeds file size".to_string(),
        ));
    }
    let header_start = len_offset - header_len;
    let header_ct = &pack_bytes[header_start..len_offset];
    let header_plain = crypt.decrypt_checked(header_ct, "pack header")?;

    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < header_plain.len() {
        if pos + 1 + 4 + 32 > header_plain.len() {
            return Err(RepositoryError::Corrupt(
                "truncated pack header record".to_string(),
            ));
        }
        let (blob_type, compressed) = BlobType::from_record_type(header_plain[pos])?;
        pos += 1;
        let length = u32::from_le_bytes(header_plain[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let mut id_bytes = [0u8; 32];
        id_bytes.copy_from_slice(&header_plain[pos..pos + 32]);
        pos += 32;
        let uncompressed_length = if compressed {
            if pos + 4 > header_plain.len() {
                return Err(RepositoryError::Corrupt(
                    "truncated compressed pack header record".to_string(),
                ));
            }
            let raw_len = u32::from_le_bytes(header_plain[pos..pos + 4].try_into().unwrap());
            pos += 4;
            Some(raw_len)
        } else {
            None
        };
        let _ = record_len(compressed);

        entries.push(PackedBlob {
            blob_type,
            id: Id(id_bytes),
            offset: 0, // filled in below, running offset
            length,
            uncompressed_length,
        });
    }

    // offsets are implicit (each blob immediately follows the last); fill
    // them in now that we've parsed every record
    let mut running = 0u32;
    for entry in &mut entries {
        entry.offset = running;
        running += entry.length;
    }

    Ok((entries, header_start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoKey;

    fn crypt() -> CryptConfig {
        CryptConfig::new(&CryptoKey::random())
    }

    #[test]
    fn pack_addressing_matches_content_hash() {
        let crypt = crypt();
        let mut writer = PackWriter::new(BlobTypeClass::Data);
        let encoded = crate::blob::encode(BlobType::Data, b"chunk one", &crypt, false).unwrap();
        writer.add(&encoded).unwrap();
        let finished = writer.finish(&crypt).unwrap();

        let mut hasher = Sha256::new();
        hasher.update(&finished.data);
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(finished.id.as_bytes(), &expected);
    }

    #[test]
    fn header_roundtrips_multiple_blobs() {
        let crypt = crypt();
        let mut writer = PackWriter::new(BlobTypeClass::Data);
        let a = crate::blob::encode(BlobType::Data, b"first blob", &crypt, false).unwrap();
        let b = crate::blob::encode(BlobType::Data, b"second blob, a bit longer", &crypt, true).unwrap();
        writer.add(&a).unwrap();
        writer.add(&b).unwrap();
        let finished = writer.finish(&crypt).unwrap();

        let (entries, payload_end) = parse_header(&finished.data, &crypt).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, a.id);
        assert_eq!(entries[1].id, b.id);
        assert_eq!(payload_end as u64, a.ciphertext.len() as u64 + b.ciphertext.len() as u64);

        // extract each blob by its parsed offset/length and decode it
        let blob0 = &finished.data[entries[0].offset as usize
            ..entries[0].offset as usize + entries[0].length as usize];
        let decoded0 = crate::blob::decode(blob0, &crypt, false, &entries[0].id).unwrap();
        assert_eq!(decoded0, b"first blob");

        let blob1 = &finished.data[entries[1].offset as usize
            ..entries[1].offset as usize + entries[1].length as usize];
        let decoded1 = crate::blob::decode(blob1, &crypt, true, &entries[1].id).unwrap();
        assert_eq!(decoded1, b"second blob, a bit longer");
    }

    #[test]
    fn empty_pack_is_rejected() {
        let crypt = crypt();
        let writer = PackWriter::new(BlobTypeClass::Data);
        assert!(writer.finish(&crypt).is_err());
    }

    #[test]
    fn truncated_pack_header_is_corrupt() {
        let crypt = crypt();
        let mut writer = PackWriter::new(BlobTypeClass::Data);
        let encoded = crate::blob::encode(BlobType::Data, b"x", &crypt, false).unwrap();
        writer.add(&encoded).unwrap();
        let mut finished = writer.finish(&crypt).unwrap();
        finished.data.truncate(2);
        assert!(parse_header(&finished.data, &crypt).is_err());
    }
}
