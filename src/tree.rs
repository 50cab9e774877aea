//! Snapshot tree model: directories as lists of nodes, canonically
//! serialized so the serialization itself is the content-addressing
//! preimage.
//!
//! ACL and xattr metadata are `Option` fields, populated on Unix and left
//! `None` elsewhere; `HardLinkInfo { st_dev, st_ino }` pairs an inode with
//! its device to detect hardlinked files during archiving.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::id::Id;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    File,
    Dir,
    Symlink,
    Chardev,
    Blockdev,
    Fifo,
    Socket,
}

/// Extra Unix metadata that doesn't apply uniformly to every node type,
/// carried as optional fields rather than forcing every platform to supply
/// them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedAttrs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub xattrs: Vec<(String, Vec<u8>)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<Vec<u8>>,
    /// `st_rdev` for device nodes; meaningless otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdev: Option<u64>,
}

/// Identifies a hardlinked inode during archiving: files sharing the same
/// `(st_dev, st_ino)` in the source tree share content and are linked,
/// rather than duplicated, on restore.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HardLinkInfo {
    pub st_dev: u64,
    pub st_ino: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
    pub size: u64,

    /// File nodes: ordered list of data-blob IDs whose concatenated
    /// plaintext reproduces the file's bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<Id>>,
    /// Dir nodes: ID of the tree blob describing this directory's children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtree: Option<Id>,
    /// Symlink nodes: the link target path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linktarget: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardlink: Option<HardLinkInfo>,
    #[serde(default, skip_serializing_if = "is_default_extended")]
    pub extended: ExtendedAttrs,
}

fn is_default_extended(e: &ExtendedAttrs) -> bool {
    e.xattrs.is_empty() && e.acl.is_none() && e.rdev.is_none()
}

impl Node {
    pub fn new_file(name: impl Into<String>, size: u64, content: Vec<Id>) -> Self {
        Node {
            name: name.into(),
            node_type: NodeType::File,
            mode: 0o644,
            uid: 0,
            gid: 0,
            mtime: 0,
            atime: 0,
            ctime: 0,
            size,
            content: Some(content),
            subtree: None,
            linktarget: None,
            hardlink: None,
            extended: ExtendedAttrs::default(),
        }
    }

    pub fn new_dir(name: impl Into<String>, subtree: Id) -> Self {
        Node {
            name: name.into(),
            node_type: NodeType::Dir,
            mode: 0o755,
            uid: 0,
            gid: 0,
            mtime: 0,
            atime: 0,
            ctime: 0,
            size: 0,
            content: None,
            subtree: Some(subtree),
            linktarget: None,
            hardlink: None,
            extended: ExtendedAttrs::default(),
        }
    }
}

/// A directory's contents: an ordered list of nodes. Canonically serialized
/// (stable field order from `#[derive(Serialize)]`'s struct order, nodes
/// kept in the order callers build them — the archiver always sorts by
/// name before saving) so that two trees with identical contents hash to
/// the same [`Id`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    pub fn new() -> Self {
        Tree { nodes: Vec::new() }
    }

    /// Canonical plaintext bytes: nodes sorted by name, then compact JSON.
    /// This is the content-addressing preimage — `save_tree` hashes exactly
    /// these bytes.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut sorted = self.clone();
        sorted.nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(serde_json::to_vec(&sorted)?)
    }

    pub fn decode(plaintext: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(plaintext)?)
    }
}

/// Encrypt a tree's canonical bytes for storage as a tree blob's plaintext
/// input (hashing happens in [`crate::blob::encode`] before this, and
/// encryption happens there too — this helper exists only so callers that
/// need the canonical bytes without going through the blob layer, such as
/// `check`, can get them without duplicating the sort).
pub fn canonical_bytes(tree: &Tree) -> Result<Vec<u8>> {
    tree.canonical_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_bytes_independent_of_insertion_order() {
        let id_a = Id::hash(b"a");
        let id_b = Id::hash(b"b");
        let mut t1 = Tree::new();
        t1.nodes.push(Node::new_file("b.txt", 1, vec![id_b]));
        t1.nodes.push(Node::new_file("a.txt", 1, vec![id_a]));

        let mut t2 = Tree::new();
        t2.nodes.push(Node::new_file("a.txt", 1, vec![id_a]));
        t2.nodes.push(Node::new_file("b.txt", 1, vec![id_b]));

        assert_eq!(t1.canonical_bytes().unwrap(), t2.canonical_bytes().unwrap());
    }

    #[test]
    fn roundtrip_through_json() {
        let mut tree = Tree::new();
        tree.nodes.push(Node::new_dir("sub", Id::hash(b"subtree")));
        let bytes = tree.canonical_bytes().unwrap();
        let decoded = Tree::decode(&bytes).unwrap();
        assert_eq!(decoded.nodes.len(), 1);
        assert_eq!(decoded.nodes[0].name, "sub");
    }

    #[test]
    fn extended_attrs_omitted_when_default() {
        let node = Node::new_file("f", 0, vec![]);
        let json = serde_json::to_string(&node).unwrap();
        assert!(!json.contains("xattrs"));
    }
}
