//! Repository facade: opens a backend, unlocks the master key, and exposes
//! the save/load primitives every higher-level operation (archiver,
//! restorer, prune, check) is built from.
//!
//! The facade owns the master index instance and the set of in-progress
//! pack writers, and is the single owner of a repository's mutable state
//! that every other module borrows through.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::backend::{self, Backend, FileType};
use crate::blob::{self, BlobType};
use crate::config::Config;
use crate::crypto::{CryptConfig, CryptoKey, KeyFile};
use crate::error::{RepositoryError, Result};
use crate::id::Id;
use crate::index::{self, IndexFile, MasterIndex};
use crate::lock::{RepositoryLock, DEFAULT_STALE_TIMEOUT};
use crate::pack::{BlobTypeClass, PackWriter, DEFAULT_TARGET_SIZE};
use crate::snapshot::Snapshot;
use crate::tree::Tree;

/// Bound on concurrent index-file fetches during open, matching the
/// backend connection-concurrency default of §5.
const INDEX_LOAD_CONCURRENCY: usize = 5;

fn class_of(blob_type: BlobType) -> BlobTypeClass {
    match blob_type {
        BlobType::Data => BlobTypeClass::Data,
        BlobType::Tree => BlobTypeClass::Tree,
    }
}

pub struct Repository {
    backend: Arc<dyn Backend>,
    crypt: CryptConfig,
    config: Config,
    master_index: Arc<MasterIndex>,
    pack_writers: Mutex<HashMap<BlobTypeClass, PackWriter>>,
    pending_index: Mutex<IndexFile>,
    target_pack_size: u64,
}

impl Repository {
    /// Create a brand-new repository at `location`: directory skeleton,
    /// config file, and a first key file wrapping a freshly generated
    /// master key.
    pub async fn init(location: &str, password: &[u8], username: &str, hostname: &str) -> Result<Self> {
        let local = crate::backend::local::LocalBackend::create(location).await?;
        let backend: Arc<dyn Backend> = Arc::new(local);

        if backend.exists(FileType::Config, backend::config_name()).await? {
            return Err(RepositoryError::AlreadyExists(
                "repository config already exists".to_string(),
            ));
        }

        let master_key = CryptoKey::random();
        let crypt = CryptConfig::new(&master_key);
        let config = Config::new();
        let config_ct = config.encode(&crypt)?;
        backend.write(FileType::Config, backend::config_name(), &config_ct).await?;

        let key_file = KeyFile::create(password, &master_key, username, hostname)?;
        let key_bytes = serde_json::to_vec(&key_file)?;
        let key_id = Id::hash(&key_bytes);
        backend.write(FileType::Key, &key_id.to_hex(), &key_bytes).await?;

        Ok(Repository::new(backend, crypt, config))
    }

    /// Open an existing repository, trying `password` against every key
    /// file present until one unwraps the master key.
    pub async fn open(location: &str, password: &[u8]) -> Result<Self> {
        let local = crate::backend::local::LocalBackend::open(location).await?;
        let backend: Arc<dyn Backend> = Arc::new(local);

        let key_names = backend.list(FileType::Key).await?;
        if key_names.is_empty() {
            return Err(RepositoryError::Fatal("no key files in repository".to_string()));
        }

        let mut master_key = None;
        for (name, _) in &key_names {
            let bytes = backend.read(FileType::Key, name).await?;
            let key_file: KeyFile = serde_json::from_slice(&bytes)?;
            if let Ok(key) = key_file.unlock(password) {
                master_key = Some(key);
                break;
            }
        }
        let master_key = master_key
            .ok_or_else(|| RepositoryError::Fatal("wrong password".to_string()))?;
        let crypt = CryptConfig::new(&master_key);

        let config_ct = backend.read(FileType::Config, backend::config_name()).await?;
        let config = Config::decode(&config_ct, &crypt)?;

        let repo = Repository::new(backend, crypt, config);
        repo.load_indexes().await?;
        Ok(repo)
    }

    fn new(backend: Arc<dyn Backend>, crypt: CryptConfig, config: Config) -> Self {
        Repository {
            backend,
            crypt,
            config,
            master_index: Arc::new(MasterIndex::new()),
            pack_writers: Mutex::new(HashMap::new()),
            pending_index: Mutex::new(IndexFile::default()),
            target_pack_size: DEFAULT_TARGET_SIZE,
        }
    }

    pub fn master_index(&self) -> &Arc<MasterIndex> {
        &self.master_index
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn crypt(&self) -> &CryptConfig {
        &self.crypt
    }

    /// Load every index file on the backend and merge it into the master
    /// index, done once at open time with up to [`INDEX_LOAD_CONCURRENCY`]
    /// fetches in flight so a large repository's open time is dominated by
    /// backend latency rather than serialized round-trips.
    async fn load_indexes(&self) -> Result<()> {
        use futures::stream::{self, StreamExt, TryStreamExt};

        let names = self.backend.list(FileType::Index).await?;
        let index_files: Vec<IndexFile> = stream::iter(names)
            .map(|(name, _)| {
                let backend = self.backend.clone();
                let crypt = self.crypt.clone();
                async move {
                    let ciphertext = backend.read(FileType::Index, &name).await?;
                    IndexFile::decode(&ciphertext, &crypt)
                }
            })
            .buffer_unordered(INDEX_LOAD_CONCURRENCY)
            .try_collect()
            .await?;

        for index_file in &index_files {
            self.master_index.merge(index_file);
        }
        Ok(())
    }

    pub async fn lock_shared(&self, username: &str) -> Result<RepositoryLock> {
        RepositoryLock::acquire(
            self.backend.clone(),
            username,
            false,
            Duration::from_secs(30),
            DEFAULT_STALE_TIMEOUT,
        )
        .await
    }

    pub async fn lock_exclusive(&self, username: &str) -> Result<RepositoryLock> {
        RepositoryLock::acquire(
            self.backend.clone(),
            username,
            true,
            Duration::from_secs(30),
            DEFAULT_STALE_TIMEOUT,
        )
        .await
    }

    /// Save `plaintext` as a blob of `blob_type`, returning its content
    /// address. A blob already present in the master index is not
    /// re-encrypted or re-uploaded — this is the dedup decision point.
    pub async fn save_blob(&self, blob_type: BlobType, plaintext: &[u8]) -> Result<Id> {
        let id = Id::hash(plaintext);
        if self.master_index.contains(blob_type, &id) {
            return Ok(id);
        }

        let encoded = blob::encode(blob_type, plaintext, &self.crypt, self.config.compression_enabled())?;
        let class = class_of(blob_type);

        let should_finalize = {
            let mut writers = self.pack_writers.lock().await;
            let writer = writers.entry(class).or_insert_with(|| PackWriter::new(class));
            writer.add(&encoded)?;
            writer.current_size() >= self.target_pack_size
        };

        if should_finalize {
            self.finalize_pack(class).await?;
        }

        Ok(id)
    }

    async fn finalize_pack(&self, class: BlobTypeClass) -> Result<()> {
        let writer = {
            let mut writers = self.pack_writers.lock().await;
            writers.remove(&class)
        };
        let writer = match writer {
            Some(w) if !w.is_empty() => w,
            _ => return Ok(()),
        };

        let finished = writer.finish(&self.crypt)?;
        self.backend
            .write(FileType::Pack, &finished.id.to_hex(), &finished.data)
            .await?;

        let entry = index::pack_entry(finished.id, &finished.entries);
        let index_file = IndexFile {
            supersedes: vec![],
            packs: vec![entry.clone()],
        };
        self.master_index.merge(&index_file);

        let mut pending = self.pending_index.lock().await;
        pending.packs.push(entry);
        Ok(())
    }

    /// Finalize every in-progress pack and flush the pending index file to
    /// the backend. Called once at the end of a backup, after which the
    /// operation is durable up to (but not including) the snapshot file
    /// itself.
    pub async fn flush(&self) -> Result<()> {
        for class in [BlobTypeClass::Data, BlobTypeClass::Tree] {
            self.finalize_pack(class).await?;
        }

        let mut pending = self.pending_index.lock().await;
        if pending.packs.is_empty() {
            return Ok(());
        }
        let index_file = std::mem::take(&mut *pending);
        let ciphertext = index_file.encode(&self.crypt)?;
        let plaintext_for_name = serde_json::to_vec(&index_file)?;
        let index_id = Id::hash(&plaintext_for_name);
        self.backend
            .write(FileType::Index, &index_id.to_hex(), &ciphertext)
            .await?;
        Ok(())
    }

    pub async fn load_blob(&self, blob_type: BlobType, id: &Id) -> Result<Vec<u8>> {
        let locations = self.master_index.lookup(blob_type, id);
        let location = locations.first().ok_or_else(|| RepositoryError::not_found(id))?;

        let ciphertext = self
            .backend
            .read_range(
                FileType::Pack,
                &location.pack_id.to_hex(),
                location.offset as u64,
                location.length as u64,
            )
            .await?;

        blob::decode(&ciphertext, &self.crypt, location.uncompressed_length.is_some(), id)
    }

    pub async fn save_tree(&self, tree: &Tree) -> Result<Id> {
        let bytes = tree.canonical_bytes()?;
        self.save_blob(BlobType::Tree, &bytes).await
    }

    pub async fn load_tree(&self, id: &Id) -> Result<Tree> {
        let bytes = self.load_blob(BlobType::Tree, id).await?;
        Tree::decode(&bytes)
    }

    pub async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<Id> {
        let plaintext = serde_json::to_vec(snapshot)?;
        let id = Id::hash(&plaintext);
        let ciphertext = self.crypt.encrypt(&plaintext);
        self.backend.write(FileType::Snapshot, &id.to_hex(), &ciphertext).await?;
        Ok(id)
    }

    pub async fn load_snapshot(&self, id: &Id) -> Result<Snapshot> {
        let ciphertext = self
            .backend
            .read(FileType::Snapshot, &id.to_hex())
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound(_) => RepositoryError::not_found(id),
                other => other,
            })?;
        Snapshot::decode(&ciphertext, &self.crypt)
    }

    pub async fn list_snapshots(&self) -> Result<Vec<(Id, Snapshot)>> {
        let mut out = Vec::new();
        for (name, _) in self.backend.list(FileType::Snapshot).await? {
            let id: Id = name.parse().map_err(|_| {
                RepositoryError::Corrupt(format!("invalid snapshot file name {}", name))
            })?;
            let snapshot = self.load_snapshot(&id).await?;
            out.push((id, snapshot));
        }
        Ok(out)
    }

    pub async fn remove_snapshot(&self, id: &Id) -> Result<()> {
        self.backend.remove(FileType::Snapshot, &id.to_hex()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_then_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        Repository::init(path, b"hunter2", "alice", "workstation").await.unwrap();
        let repo = Repository::open(path, b"hunter2").await.unwrap();
        assert_eq!(repo.config().version, crate::config::CURRENT_VERSION);
    }

    #[tokio::test]
    async fn open_rejects_wrong_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        Repository::init(path, b"hunter2", "alice", "workstation").await.unwrap();
        assert!(Repository::open(path, b"wrong").await.is_err());
    }

    #[tokio::test]
    async fn save_and_load_blob_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        Repository::init(path, b"hunter2", "alice", "workstation").await.unwrap();
        let repo = Repository::open(path, b"hunter2").await.unwrap();

        let id = repo.save_blob(BlobType::Data, b"hello world").await.unwrap();
        repo.flush().await.unwrap();
        let loaded = repo.load_blob(BlobType::Data, &id).await.unwrap();
        assert_eq!(loaded, b"hello world");
    }

    #[tokio::test]
    async fn duplicate_blob_does_not_grow_pack_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        Repository::init(path, b"hunter2", "alice", "workstation").await.unwrap();
        let repo = Repository::open(path, b"hunter2").await.unwrap();

        repo.save_blob(BlobType::Data, b"same content").await.unwrap();
        repo.flush().await.unwrap();
        let packs_after_first = repo.backend.list(FileType::Pack).await.unwrap().len();

        repo.save_blob(BlobType::Data, b"same content").await.unwrap();
        repo.flush().await.unwrap();
        let packs_after_second = repo.backend.list(FileType::Pack).await.unwrap().len();

        assert_eq!(packs_after_first, packs_after_second);
    }

    #[tokio::test]
    async fn save_and_load_tree_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        Repository::init(path, b"hunter2", "alice", "workstation").await.unwrap();
        let repo = Repository::open(path, b"hunter2").await.unwrap();

        let mut tree = Tree::new();
        tree.nodes.push(crate::tree::Node::new_file("a.txt", 5, vec![Id::hash(b"a")]));
        let tree_id = repo.save_tree(&tree).await.unwrap();
        repo.flush().await.unwrap();

        let loaded = repo.load_tree(&tree_id).await.unwrap();
        assert_eq!(loaded.nodes.len(), 1);
    }

    #[tokio::test]
    async fn save_and_list_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        Repository::init(path, b"hunter2", "alice", "workstation").await.unwrap();
        let repo = Repository::open(path, b"hunter2").await.unwrap();

        let snapshot = Snapshot::new("host1", "alice", vec!["/data".to_string()], Id::hash(b"tree"));
        let snap_id = repo.save_snapshot(&snapshot).await.unwrap();

        let listed = repo.list_snapshots().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, snap_id);
    }

    #[tokio::test]
    async fn index_reload_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        Repository::init(path, b"hunter2", "alice", "workstation").await.unwrap();
        let id = {
            let repo = Repository::open(path, b"hunter2").await.unwrap();
            let id = repo.save_blob(BlobType::Data, b"persisted across reopen").await.unwrap();
            repo.flush().await.unwrap();
            id
        };

        let repo2 = Repository::open(path, b"hunter2").await.unwrap();
        let loaded = repo2.load_blob(BlobType::Data, &id).await.unwrap();
        assert_eq!(loaded, b"persisted across reopen");
    }
}
