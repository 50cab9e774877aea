//! Local filesystem backend.
//!
//! Writes go to a `mkstemp`-style temporary file in the same directory,
//! then `rename` into place, so a concurrent reader never observes a
//! partially written file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{RepositoryError, Result};

use super::{Backend, FileType};

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Open an existing repository rooted at `path`.
    pub async fn open(path: &str) -> Result<Self> {
        let root = PathBuf::from(path);
        if !root.is_dir() {
            return Err(RepositoryError::NotFound(format!(
                "repository does not exist at {}",
                root.display()
            )));
        }
        Ok(LocalBackend { root })
    }

    /// Create the directory skeleton for a brand-new repository.
    pub async fn create(path: &str) -> Result<Self> {
        let root = PathBuf::from(path);
        tokio::fs::create_dir_all(&root).await?;
        for ty in [
            FileType::Key,
            FileType::Snapshot,
            FileType::Lock,
            FileType::Index,
            FileType::Pack,
        ] {
            tokio::fs::create_dir_all(root.join(ty.dir_name())).await?;
        }
        Ok(LocalBackend { root })
    }

    fn dir_for(&self, file_type: FileType, name: &str) -> PathBuf {
        let base = self.root.join(file_type.dir_name());
        if file_type.is_sharded() && name.len() >= 2 {
            base.join(&name[0..2])
        } else {
            base
        }
    }

    fn path_for(&self, file_type: FileType, name: &str) -> PathBuf {
        if matches!(file_type, FileType::Config) {
            return self.root.join("config");
        }
        self.dir_for(file_type, name).join(name)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn list(&self, file_type: FileType) -> Result<Vec<(String, u64)>> {
        let base = self.root.join(file_type.dir_name());
        let mut out = Vec::new();

        if !tokio::fs::try_exists(&base).await.unwrap_or(false) {
            return Ok(out);
        }

        if file_type.is_sharded() {
            let mut shard_dirs = tokio::fs::read_dir(&base).await?;
            while let Some(shard) = shard_dirs.next_entry().await? {
                if !shard.file_type().await?.is_dir() {
                    continue;
                }
                let mut entries = tokio::fs::read_dir(shard.path()).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let meta = entry.metadata().await?;
                    if meta.is_file() {
                        out.push((entry.file_name().to_string_lossy().to_string(), meta.len()));
                    }
                }
            }
        } else {
            let mut entries = tokio::fs::read_dir(&base).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_file() {
                    out.push((entry.file_name().to_string_lossy().to_string(), meta.len()));
                }
            }
        }

        Ok(out)
    }

    async fn read(&self, file_type: FileType, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(file_type, name);
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RepositoryError::NotFound(format!("{}", path.display()))
            } else {
                RepositoryError::Io(e)
            }
        })
    }

    async fn read_range(
        &self,
        file_type: FileType,
        name: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        let path = self.path_for(file_type, name);
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RepositoryError::NotFound(format!("{}", path.display()))
            } else {
                RepositoryError::Io(e)
            }
        })?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn write(&self, file_type: FileType, name: &str, data: &[u8]) -> Result<()> {
        let dir = if matches!(file_type, FileType::Config) {
            self.root.clone()
        } else {
            self.dir_for(file_type, name)
        };
        tokio::fs::create_dir_all(&dir).await?;

        let target = self.path_for(file_type, name);

        // packs/indexes/snapshots/config are content-addressed or
        // write-once; a matching file already present is an idempotent
        // no-op rather than an error.
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(());
        }

        write_atomic(&dir, &target, data).await
    }

    async fn remove(&self, file_type: FileType, name: &str) -> Result<()> {
        let path = self.path_for(file_type, name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RepositoryError::Io(e)),
        }
    }

    async fn exists(&self, file_type: FileType, name: &str) -> Result<bool> {
        let path = self.path_for(file_type, name);
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }
}

/// Write `data` to `target` without ever exposing a partially-written file:
/// write to a sibling temp file, `fsync`, then `rename` over `target`.
async fn write_atomic(dir: &Path, target: &Path, data: &[u8]) -> Result<()> {
    let tmp_name = format!(".tmp-{}-{}", std::process::id(), tmp_suffix());
    let tmp_path = dir.join(tmp_name);

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    if let Err(e) = file.write_all(data).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(RepositoryError::Io(e));
    }
    if let Err(e) = file.sync_all().await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(RepositoryError::Io(e));
    }
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp_path, target).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(RepositoryError::Io(e));
    }
    Ok(())
}

fn tmp_suffix() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::create(dir.path().to_str().unwrap()).await.unwrap();
        backend.write(FileType::Snapshot, "abc123", b"hello").await.unwrap();
        let data = backend.read(FileType::Snapshot, "abc123").await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn write_is_idempotent_for_existing_name() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::create(dir.path().to_str().unwrap()).await.unwrap();
        backend.write(FileType::Pack, "deadbeef", b"first").await.unwrap();
        backend.write(FileType::Pack, "deadbeef", b"second").await.unwrap();
        let data = backend.read(FileType::Pack, "deadbeef").await.unwrap();
        assert_eq!(data, b"first");
    }

    #[tokio::test]
    async fn pack_names_are_sharded_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::create(dir.path().to_str().unwrap()).await.unwrap();
        backend.write(FileType::Pack, "ab00112233", b"x").await.unwrap();
        assert!(dir.path().join("data").join("ab").join("ab00112233").exists());
    }

    #[tokio::test]
    async fn read_range_returns_requested_slice() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::create(dir.path().to_str().unwrap()).await.unwrap();
        backend.write(FileType::Snapshot, "x", b"0123456789").await.unwrap();
        let slice = backend.read_range(FileType::Snapshot, "x", 3, 4).await.unwrap();
        assert_eq!(slice, b"3456");
    }

    #[tokio::test]
    async fn list_enumerates_written_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::create(dir.path().to_str().unwrap()).await.unwrap();
        backend.write(FileType::Snapshot, "a", b"1").await.unwrap();
        backend.write(FileType::Snapshot, "b", b"22").await.unwrap();
        let mut names: Vec<String> = backend
            .list(FileType::Snapshot)
            .await
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
