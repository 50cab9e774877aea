//! Archiver ingest pipeline: turns a stream of source-file events into
//! packed, indexed, deduplicated blobs and a committed snapshot.
//!
//! The actual filesystem walk is an external collaborator (the scope
//! explicitly leaves the scanner out of the storage engine); this module
//! consumes whatever produces [`SourceItem`]s rather than walking paths
//! itself.

use crate::blob::BlobType;
use crate::chunker::ChunkReader;
use crate::error::Result;
use crate::id::Id;
use crate::repository::Repository;
use crate::snapshot::Snapshot;
use crate::tree::{HardLinkInfo, Node, NodeType, Tree};

/// One entry a file-scanner would hand the archiver: a relative path plus
/// enough stat metadata to decide reuse-from-parent, plus a byte source for
/// file content. Directories carry no reader; their `Tree` is built
/// bottom-up by the caller as `ingest_directory` recurses.
pub struct SourceFile<R> {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
    pub hardlink: Option<HardLinkInfo>,
    pub reader: R,
}

pub struct Archiver<'a> {
    repo: &'a Repository,
    polynomial: crate::chunker::Polynomial,
}

impl<'a> Archiver<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Archiver {
            repo,
            polynomial: repo.config().chunker_polynomial,
        }
    }

    /// Archive a single file: reuse the parent snapshot's content blob IDs
    /// verbatim if `parent_node` matches on size/mtime/ctime (and, when the
    /// caller tracks inodes, on hardlink identity), otherwise stream the
    /// file through the chunker and save each chunk as a data blob.
    pub async fn ingest_file<R: std::io::Read>(
        &self,
        file: SourceFile<R>,
        parent_node: Option<&Node>,
    ) -> Result<Node> {
        if let Some(parent) = parent_node {
            if unchanged_since_parent(&file, parent) {
                return Ok(Node {
                    name: file.name,
                    ..parent.clone()
                });
            }
        }

        let mut content = Vec::new();
        for chunk in ChunkReader::new(file.reader, self.polynomial) {
            let chunk = chunk.map_err(crate::error::RepositoryError::Io)?;
            let id = self.repo.save_blob(BlobType::Data, &chunk).await?;
            content.push(id);
        }

        let mut node = Node::new_file(file.name, file.size, content);
        node.mode = file.mode;
        node.uid = file.uid;
        node.gid = file.gid;
        node.mtime = file.mtime;
        node.atime = file.atime;
        node.ctime = file.ctime;
        node.hardlink = file.hardlink;
        Ok(node)
    }

    /// Save a fully built [`Tree`] (its child nodes already archived) as a
    /// tree blob and wrap it in a directory [`Node`].
    pub async fn ingest_directory(&self, name: impl Into<String>, children: Tree) -> Result<Node> {
        let subtree_id = self.repo.save_tree(&children).await?;
        Ok(Node::new_dir(name, subtree_id))
    }

    /// Flush all pending packs and the pending index, then commit the
    /// snapshot file. The backup is only considered durable once this
    /// returns `Ok` — a crash before this point leaves orphaned packs,
    /// which prune reclaims, but no dangling snapshot.
    pub async fn commit(
        &self,
        hostname: &str,
        username: &str,
        paths: Vec<String>,
        root_tree: Id,
        parent: Option<Id>,
    ) -> Result<Id> {
        self.repo.flush().await?;

        let mut snapshot = Snapshot::new(hostname, username, paths, root_tree);
        snapshot.parent = parent;
        snapshot.end_time = Some(chrono::Utc::now().to_rfc3339());
        self.repo.save_snapshot(&snapshot).await
    }

    /// The default parent: the most recent snapshot matching `hostname`
    /// and `paths` exactly.
    pub async fn select_parent(&self, hostname: &str, paths: &[String]) -> Result<Option<(Id, Snapshot)>> {
        let mut candidates = self.repo.list_snapshots().await?;
        candidates.retain(|(_, s)| s.matches_scope(hostname, paths));
        candidates.sort_by(|a, b| a.1.time.cmp(&b.1.time));
        Ok(candidates.pop())
    }
}

fn unchanged_since_parent<R>(file: &SourceFile<R>, parent: &Node) -> bool {
    if parent.node_type != NodeType::File {
        return false;
    }
    if let Some(hl) = &file.hardlink {
        if parent.hardlink.as_ref() == Some(hl) {
            return true;
        }
    }
    file.size == parent.size && file.mtime == parent.mtime && file.ctime == parent.ctime
}

/// Sorted-by-name directory builder the scanner-facing caller accumulates
/// child nodes into before calling [`Archiver::ingest_directory`].
pub fn build_tree(mut nodes: Vec<Node>) -> Tree {
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    Tree { nodes }
}

/// Resolve a parent tree's immediate child by name, for the file-by-file
/// reuse check during a walk of `dir`.
pub async fn parent_child_node(repo: &Repository, parent_tree_id: Id, name: &str) -> Result<Option<Node>> {
    let tree = repo.load_tree(&parent_tree_id).await?;
    Ok(tree.nodes.into_iter().find(|n| n.name == name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_file(name: &str, content: &[u8]) -> SourceFile<Cursor<Vec<u8>>> {
        SourceFile {
            name: name.to_string(),
            size: content.len() as u64,
            mode: 0o644,
            uid: 0,
            gid: 0,
            mtime: 1000,
            atime: 1000,
            ctime: 1000,
            hardlink: None,
            reader: Cursor::new(content.to_vec()),
        }
    }

    #[tokio::test]
    async fn ingest_file_without_parent_chunks_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        Repository::init(path, b"pw", "alice", "host").await.unwrap();
        let repo = Repository::open(path, b"pw").await.unwrap();
        let archiver = Archiver::new(&repo);

        let file = sample_file("a.txt", b"hello archiver");
        let node = archiver.ingest_file(file, None).await.unwrap();
        assert_eq!(node.name, "a.txt");
        assert!(node.content.is_some());
        assert_eq!(node.content.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ingest_file_reuses_unchanged_parent_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        Repository::init(path, b"pw", "alice", "host").await.unwrap();
        let repo = Repository::open(path, b"pw").await.unwrap();
        let archiver = Archiver::new(&repo);

        let parent_node = Node::new_file("a.txt", 5, vec![Id::hash(b"content")]);
        let mut parent_node = parent_node;
        parent_node.mtime = 1000;
        parent_node.ctime = 1000;
        parent_node.size = 14;

        let file = sample_file("a.txt", b"hello archiver");
        let node = archiver.ingest_file(file, Some(&parent_node)).await.unwrap();
        assert_eq!(node.content, parent_node.content);
    }

    #[tokio::test]
    async fn commit_produces_loadable_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        Repository::init(path, b"pw", "alice", "host").await.unwrap();
        let repo = Repository::open(path, b"pw").await.unwrap();
        let archiver = Archiver::new(&repo);

        let tree = build_tree(vec![Node::new_file("a.txt", 1, vec![Id::hash(b"a")])]);
        let tree_id = repo.save_tree(&tree).await.unwrap();
        let snap_id = archiver
            .commit("host", "alice", vec!["/data".to_string()], tree_id, None)
            .await
            .unwrap();

        let snapshot = repo.load_snapshot(&snap_id).await.unwrap();
        assert_eq!(snapshot.tree, tree_id);
    }
}
