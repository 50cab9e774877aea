//! Per-pack index files and the in-memory master index that merges them.
//!
//! An index file is an encrypted JSON document listing, for each pack it
//! describes, the pack ID and the `(type, id, offset, length)` tuples of
//! every blob the pack holds. On open, the facade loads every index file
//! and merges their entries into one [`MasterIndex`] for O(1) lookup.
//!
//! Blob locations store a small integer handle into an interned pack-ID
//! table rather than repeating the 32-byte pack ID per entry, which matters
//! once a repository holds millions of blob locations in memory.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::blob::BlobType;
use crate::crypto::CryptConfig;
use crate::error::Result;
use crate::id::Id;
use crate::pack::PackedBlob;

/// One blob's location for serialization into an index file: always
/// carries the full pack ID since index files stand alone on the backend.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct IndexBlobEntry {
    #[serde(rename = "type")]
    pub blob_type: BlobType,
    pub id: Id,
    pub offset: u32,
    pub length: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uncompressed_length: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexPackEntry {
    pub id: Id,
    pub blobs: Vec<IndexBlobEntry>,
}

/// On-disk shape of one index file, matching the on-disk format:
/// `{supersedes:[ID...]?, packs:[{id, blobs:[...]}]}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IndexFile {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supersedes: Vec<Id>,
    pub packs: Vec<IndexPackEntry>,
}

impl IndexFile {
    pub fn encode(&self, crypt: &CryptConfig) -> Result<Vec<u8>> {
        let plaintext = serde_json::to_vec(self)?;
        Ok(crypt.encrypt(&plaintext))
    }

    pub fn decode(ciphertext: &[u8], crypt: &CryptConfig) -> Result<Self> {
        let plaintext = crypt.decrypt_checked(ciphertext, "index file")?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

/// A blob's location with the owning pack resolved to its full [`Id`] —
/// the shape callers outside this module work with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlobLocation {
    pub pack_id: Id,
    pub offset: u32,
    pub length: u32,
    pub uncompressed_length: Option<u32>,
}

/// Interned location: the pack is referenced by its index into
/// [`MasterIndex::pack_ids`] rather than by its full 32-byte ID.
#[derive(Clone, Copy, Debug)]
struct InternedLocation {
    pack_index: u32,
    offset: u32,
    length: u32,
    uncompressed_length: Option<u32>,
}

#[derive(Default)]
struct MasterIndexInner {
    data_locations: HashMap<Id, Vec<InternedLocation>>,
    tree_locations: HashMap<Id, Vec<InternedLocation>>,
    pack_ids: Vec<Id>,
    pack_index: HashMap<Id, u32>,
    retired: std::collections::HashSet<u32>,
}

impl MasterIndexInner {
    fn intern_pack(&mut self, pack_id: Id) -> u32 {
        if let Some(&idx) = self.pack_index.get(&pack_id) {
            return idx;
        }
        let idx = self.pack_ids.len() as u32;
        self.pack_ids.push(pack_id);
        self.pack_index.insert(pack_id, idx);
        idx
    }

    fn map_for(&mut self, blob_type: BlobType) -> &mut HashMap<Id, Vec<InternedLocation>> {
        match blob_type {
            BlobType::Data => &mut self.data_locations,
            BlobType::Tree => &mut self.tree_locations,
        }
    }

    fn map_for_ref(&self, blob_type: BlobType) -> &HashMap<Id, Vec<InternedLocation>> {
        match blob_type {
            BlobType::Data => &self.data_locations,
            BlobType::Tree => &self.tree_locations,
        }
    }

    /// Drop every location entry referencing `pack_id` — used by prune once
    /// a pack has been fully repacked or found fully unreferenced. The
    /// pack's slot in `pack_ids` is left in place (other entries address
    /// packs by index) but becomes unreachable from any location.
    fn forget_pack(&mut self, pack_id: Id) {
        if let Some(&idx) = self.pack_index.get(&pack_id) {
            self.data_locations.retain(|_, locs| {
                locs.retain(|l| l.pack_index != idx);
                !locs.is_empty()
            });
            self.tree_locations.retain(|_, locs| {
                locs.retain(|l| l.pack_index != idx);
                !locs.is_empty()
            });
            self.retired.insert(idx);
        }
    }
}

/// The union of every loaded index file, guarded by a read-write lock:
/// long reads (restore, lookup) take read locks, merges and inserts take
/// write locks — the same split a concurrent pack-writer pipeline needs.
pub struct MasterIndex {
    inner: RwLock<MasterIndexInner>,
}

impl MasterIndex {
    pub fn new() -> Self {
        MasterIndex {
            inner: RwLock::new(MasterIndexInner::default()),
        }
    }

    /// Merge one index file's entries in. If two indexes describe the same
    /// blob in the same pack, the duplicate is naturally absorbed (lookups
    /// return the list of distinct locations; repeated insertion of an
    /// identical location is idempotent because packs are never rewritten
    /// in place, so the same (pack, offset, length) never recurs under a
    /// conflicting value — index files instead get superseded wholesale by
    /// repack/rebuild, see [`Self::apply_supersedes`]).
    pub fn merge(&self, index_file: &IndexFile) {
        let mut inner = self.inner.write().unwrap();
        for pack in &index_file.packs {
            let pack_index = inner.intern_pack(pack.id);
            for blob in &pack.blobs {
                let loc = InternedLocation {
                    pack_index,
                    offset: blob.offset,
                    length: blob.length,
                    uncompressed_length: blob.uncompressed_length,
                };
                let entries = inner.map_for(blob.blob_type).entry(blob.id).or_default();
                if let Some(existing) = entries.iter_mut().find(|e| e.pack_index == loc.pack_index) {
                    if existing.offset != loc.offset || existing.length != loc.length {
                        log::warn!(
                            "index disagreement for blob {} in pack {}: offset/length {}/{} superseded by {}/{}",
                            blob.id,
                            pack.id,
                            existing.offset,
                            existing.length,
                            loc.offset,
                            loc.length,
                        );
                        *existing = loc;
                    }
                } else {
                    entries.push(loc);
                }
            }
        }
    }

    /// `true` if `id` is already indexed — the dedup decision point the
    /// blob writer consults before encrypting and uploading.
    pub fn contains(&self, blob_type: BlobType, id: &Id) -> bool {
        let inner = self.inner.read().unwrap();
        inner
            .map_for_ref(blob_type)
            .get(id)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    /// O(1) average lookup of every known location for a blob.
    pub fn lookup(&self, blob_type: BlobType, id: &Id) -> Vec<BlobLocation> {
        let inner = self.inner.read().unwrap();
        inner
            .map_for_ref(blob_type)
            .get(id)
            .map(|locs| {
                locs.iter()
                    .map(|l| BlobLocation {
                        pack_id: inner.pack_ids[l.pack_index as usize],
                        offset: l.offset,
                        length: l.length,
                        uncompressed_length: l.uncompressed_length,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fast path used by range-aware readers to learn a blob's length
    /// without materializing every location.
    pub fn lookup_size(&self, blob_type: BlobType, id: &Id) -> Option<u32> {
        let inner = self.inner.read().unwrap();
        inner
            .map_for_ref(blob_type)
            .get(id)
            .and_then(|locs| locs.first())
            .map(|l| l.length)
    }

    /// Every pack ID currently referenced by any indexed blob (excluding
    /// packs [`Self::forget_pack`] has retired) — the "reachable from
    /// index" set prune starts from before sweeping by
    /// reachable-from-tree-traversal.
    pub fn known_pack_ids(&self) -> Vec<Id> {
        let inner = self.inner.read().unwrap();
        inner
            .pack_ids
            .iter()
            .enumerate()
            .filter(|(idx, _)| !inner.retired.contains(&(*idx as u32)))
            .map(|(_, id)| *id)
            .collect()
    }

    /// Number of distinct blobs indexed across both types, for diagnostics.
    pub fn blob_count(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.data_locations.len() + inner.tree_locations.len()
    }

    /// Remove every location referencing `pack_id`, called once prune has
    /// decided that pack is fully unreferenced or has been repacked.
    pub fn forget_pack(&self, pack_id: Id) {
        self.inner.write().unwrap().forget_pack(pack_id);
    }

    /// Rebuild a complete [`IndexFile`] describing every blob location
    /// currently held in memory, grouped back by pack. Used by prune to
    /// write one consolidated index file that supersedes every index file
    /// that existed before the sweep.
    pub fn export_index_file(&self) -> IndexFile {
        let inner = self.inner.read().unwrap();
        let mut by_pack: HashMap<u32, Vec<IndexBlobEntry>> = HashMap::new();

        for (blob_type, map) in [
            (BlobType::Data, &inner.data_locations),
            (BlobType::Tree, &inner.tree_locations),
        ] {
            for (id, locs) in map {
                for loc in locs {
                    by_pack.entry(loc.pack_index).or_default().push(IndexBlobEntry {
                        blob_type,
                        id: *id,
                        offset: loc.offset,
                        length: loc.length,
                        uncompressed_length: loc.uncompressed_length,
                    });
                }
            }
        }

        let packs = by_pack
            .into_iter()
            .map(|(pack_index, blobs)| IndexPackEntry {
                id: inner.pack_ids[pack_index as usize],
                blobs,
            })
            .collect();

        IndexFile {
            supersedes: vec![],
            packs,
        }
    }
}

impl Default for MasterIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconstruct a complete [`IndexFile`] by reading every pack on the backend
/// directly and re-parsing its trailing header, rather than trusting
/// whatever index files are present. Used to recover from a lost or
/// corrupted index: every pack is self-describing (its header lists its
/// own blobs), so the index is redundant information that can always be
/// regenerated from the packs alone.
pub async fn rebuild(
    backend: &dyn crate::backend::Backend,
    crypt: &CryptConfig,
) -> Result<IndexFile> {
    let pack_names = backend.list(crate::backend::FileType::Pack).await?;
    let mut packs = Vec::with_capacity(pack_names.len());

    for (name, _size) in pack_names {
        let pack_id: Id = match name.parse() {
            Ok(id) => id,
            Err(_) => continue,
        };
        let bytes = backend.read(crate::backend::FileType::Pack, &name).await?;
        let (entries, _header_offset) = crate::pack::parse_header(&bytes, crypt)?;
        packs.push(pack_entry(pack_id, &entries));
    }

    Ok(IndexFile {
        supersedes: vec![],
        packs,
    })
}

/// Build an [`IndexPackEntry`] from the records a [`crate::pack::PackWriter`]
/// produced, for writing into a pending index file.
pub fn pack_entry(pack_id: Id, entries: &[PackedBlob]) -> IndexPackEntry {
    IndexPackEntry {
        id: pack_id,
        blobs: entries
            .iter()
            .map(|e| IndexBlobEntry {
                blob_type: e.blob_type,
                id: e.id,
                offset: e.offset,
                length: e.length,
                uncompressed_length: e.uncompressed_length,
            })
            .collect(),
    }
}
