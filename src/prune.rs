//! Prune/repack: reclaim space from blobs no snapshot references any more,
//! and retention-policy selection of which snapshots to keep.
//!
//! The reachable-set sweep walks every snapshot to build the set of still-
//! referenced blobs, then classifies each pack as keep/delete/repack by its
//! unused fraction. Retention selection applies the usual
//! `keep_last/daily/weekly/monthly/yearly` buckets, newest-first within
//! each bucket, under the name "forget".

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, Local, Utc};
use tokio_util::sync::CancellationToken;

use crate::blob::BlobType;
use crate::error::{RepositoryError, Result};
use crate::id::Id;
use crate::repository::Repository;
use crate::snapshot::Snapshot;

/// Fraction of a pack's bytes that must be unreachable before it is
/// rewritten rather than kept as-is, mirroring `--max-unused`.
pub const DEFAULT_MAX_UNUSED_RATIO: f64 = 0.25;

#[derive(Clone, Copy, Debug, Default)]
pub struct PruneOptions {
    pub keep_last: Option<u64>,
    pub keep_daily: Option<u64>,
    pub keep_weekly: Option<u64>,
    pub keep_monthly: Option<u64>,
    pub keep_yearly: Option<u64>,
    pub max_unused_ratio: f64,
}

impl PruneOptions {
    pub fn new() -> Self {
        PruneOptions {
            max_unused_ratio: DEFAULT_MAX_UNUSED_RATIO,
            ..Default::default()
        }
    }

    pub fn keep_last(mut self, value: Option<u64>) -> Self {
        self.keep_last = value;
        self
    }

    pub fn keep_daily(mut self, value: Option<u64>) -> Self {
        self.keep_daily = value;
        self
    }

    pub fn keep_weekly(mut self, value: Option<u64>) -> Self {
        self.keep_weekly = value;
        self
    }

    pub fn keep_monthly(mut self, value: Option<u64>) -> Self {
        self.keep_monthly = value;
        self
    }

    pub fn keep_yearly(mut self, value: Option<u64>) -> Self {
        self.keep_yearly = value;
        self
    }
}

/// One snapshot's retention verdict.
pub struct SnapshotVerdict {
    pub id: Id,
    pub keep: bool,
}

/// Apply the keep-last/daily/weekly/monthly/yearly policy to every snapshot,
/// most recent first. A snapshot already claimed by a finer-grained rule
/// (e.g. `keep_last`) is not double-counted against a coarser one.
pub fn select_snapshots_to_forget(
    mut snapshots: Vec<(Id, Snapshot)>,
    options: &PruneOptions,
) -> Vec<SnapshotVerdict> {
    snapshots.sort_by(|a, b| b.1.time.cmp(&a.1.time));

    let mut mark: HashMap<Id, bool> = HashMap::new();

    if let Some(keep_last) = options.keep_last {
        mark_selections(&mut mark, &snapshots, keep_last as usize, |_local, _s| {
            "last".to_string()
        });
    }
    if let Some(keep_daily) = options.keep_daily {
        mark_selections(&mut mark, &snapshots, keep_daily as usize, |local, _s| {
            format!("{}/{}/{}", local.year(), local.month(), local.day())
        });
    }
    if let Some(keep_weekly) = options.keep_weekly {
        mark_selections(&mut mark, &snapshots, keep_weekly as usize, |local, _s| {
            format!("{}/{}", local.year(), local.iso_week().week())
        });
    }
    if let Some(keep_monthly) = options.keep_monthly {
        mark_selections(&mut mark, &snapshots, keep_monthly as usize, |local, _s| {
            format!("{}/{}", local.year(), local.month())
        });
    }
    if let Some(keep_yearly) = options.keep_yearly {
        mark_selections(&mut mark, &snapshots, keep_yearly as usize, |local, _s| {
            local.year().to_string()
        });
    }

    snapshots
        .into_iter()
        .map(|(id, _)| SnapshotVerdict {
            id,
            keep: mark.get(&id).copied().unwrap_or(false),
        })
        .collect()
}

/// Mirrors `backup::prune::mark_selections`: for each snapshot not already
/// decided, bucket it by `select_id` and keep the first `keep` distinct
/// buckets (list is assumed newest-first), marking everything else in an
/// already-seen bucket for removal.
fn mark_selections<F: Fn(DateTime<Local>, &Snapshot) -> String>(
    mark: &mut HashMap<Id, bool>,
    list: &[(Id, Snapshot)],
    keep: usize,
    select_id: F,
) {
    let mut already_included = HashSet::new();
    for (id, snapshot) in list {
        if mark.get(id) == Some(&true) {
            if let Ok(t) = DateTime::parse_from_rfc3339(&snapshot.time) {
                already_included.insert(select_id(t.with_timezone(&Local), snapshot));
            }
        }
    }

    let mut include_hash = HashSet::new();
    for (id, snapshot) in list {
        if mark.contains_key(id) {
            continue;
        }
        let local_time = match DateTime::parse_from_rfc3339(&snapshot.time) {
            Ok(t) => t.with_timezone(&Local),
            Err(_) => Utc::now().with_timezone(&Local),
        };
        let sel_id = select_id(local_time, snapshot);
        if already_included.contains(&sel_id) {
            continue;
        }
        if !include_hash.contains(&sel_id) {
            if include_hash.len() >= keep {
                break;
            }
            include_hash.insert(sel_id);
            mark.insert(*id, true);
        } else {
            mark.insert(*id, false);
        }
    }
}

/// One pack's repack classification after the reachable-blob sweep.
enum PackVerdict {
    Keep,
    Delete,
    Repack,
}

/// Run the full reachable-set sweep and repack/delete pass. Returns the
/// number of packs deleted and the number repacked.
///
/// A consolidated index superseding every pre-sweep index file is written
/// and the old index files are removed before any pack is deleted, so a
/// concurrent reader never sees a live index pointing at a pack that no
/// longer exists.
pub async fn prune(repo: &Repository, max_unused_ratio: f64) -> Result<PruneStats> {
    prune_cancellable(repo, max_unused_ratio, &CancellationToken::new()).await
}

/// As [`prune`], but honors `cancel` at the top of every pack iteration of
/// the classify/repack/delete pass.
pub async fn prune_cancellable(
    repo: &Repository,
    max_unused_ratio: f64,
    cancel: &CancellationToken,
) -> Result<PruneStats> {
    let old_index_names: Vec<String> = repo
        .backend()
        .list(crate::backend::FileType::Index)
        .await?
        .into_iter()
        .map(|(name, _)| name)
        .collect();

    let snapshots = repo.list_snapshots().await?;
    let used = collect_reachable_blobs(repo, &snapshots).await?;

    let pack_ids = repo.master_index().known_pack_ids();
    let mut stats = PruneStats::default();
    let mut retired_packs = Vec::new();

    for pack_id in pack_ids {
        if cancel.is_cancelled() {
            return Err(RepositoryError::Cancelled);
        }
        let verdict = classify_pack(repo, &pack_id, &used, max_unused_ratio).await?;
        match verdict {
            PackVerdict::Keep => {}
            PackVerdict::Delete => {
                log::info!("prune: pack {} fully unused, deleting", pack_id);
                repo.master_index().forget_pack(pack_id);
                retired_packs.push(pack_id);
                stats.packs_deleted += 1;
            }
            PackVerdict::Repack => {
                log::info!("prune: pack {} above unused threshold, repacking", pack_id);
                repack_pack(repo, &pack_id, &used).await?;
                repo.master_index().forget_pack(pack_id);
                retired_packs.push(pack_id);
                stats.packs_repacked += 1;
            }
        }
    }

    // flush whatever new packs repacking produced before exporting, so the
    // consolidated index includes their locations too
    repo.flush().await?;

    if !retired_packs.is_empty() {
        let consolidated = repo.master_index().export_index_file();
        let ciphertext = consolidated.encode(repo.crypt())?;
        let plaintext_for_name = serde_json::to_vec(&consolidated)?;
        let index_id = Id::hash(&plaintext_for_name);
        repo.backend()
            .write(crate::backend::FileType::Index, &index_id.to_hex(), &ciphertext)
            .await?;

        for name in old_index_names {
            repo.backend()
                .remove(crate::backend::FileType::Index, &name)
                .await?;
        }
        for pack_id in retired_packs {
            repo.backend()
                .remove(crate::backend::FileType::Pack, &pack_id.to_hex())
                .await?;
        }
    }

    Ok(stats)
}

#[derive(Default, Debug)]
pub struct PruneStats {
    pub packs_deleted: usize,
    pub packs_repacked: usize,
}

/// Every blob ID transitively reachable from a snapshot root: the tree
/// blobs along the walk, and every file's content blob IDs.
async fn collect_reachable_blobs(
    repo: &Repository,
    snapshots: &[(Id, Snapshot)],
) -> Result<HashSet<(BlobType, Id)>> {
    let mut used = HashSet::new();
    for (_, snapshot) in snapshots {
        walk_tree_reachable(repo, &snapshot.tree, &mut used).await?;
    }
    Ok(used)
}

fn walk_tree_reachable<'a>(
    repo: &'a Repository,
    tree_id: &'a Id,
    used: &'a mut HashSet<(BlobType, Id)>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        if !used.insert((BlobType::Tree, *tree_id)) {
            return Ok(());
        }
        let tree = repo.load_tree(tree_id).await?;
        for node in &tree.nodes {
            if let Some(content) = &node.content {
                for blob_id in content {
                    used.insert((BlobType::Data, *blob_id));
                }
            }
            if let Some(subtree) = &node.subtree {
                walk_tree_reachable(repo, subtree, used).await?;
            }
        }
        Ok(())
    })
}

async fn classify_pack(
    repo: &Repository,
    pack_id: &Id,
    used: &HashSet<(BlobType, Id)>,
    max_unused_ratio: f64,
) -> Result<PackVerdict> {
    let pack_bytes = repo
        .backend()
        .read(crate::backend::FileType::Pack, &pack_id.to_hex())
        .await?;
    let (entries, _) = crate::pack::parse_header(&pack_bytes, repo.crypt())?;

    if entries.is_empty() {
        return Ok(PackVerdict::Delete);
    }

    let total: u64 = entries.iter().map(|e| e.length as u64).sum();
    let unused: u64 = entries
        .iter()
        .filter(|e| !used.contains(&(e.blob_type, e.id)))
        .map(|e| e.length as u64)
        .sum();

    if unused == total {
        return Ok(PackVerdict::Delete);
    }
    let ratio = unused as f64 / total as f64;
    if ratio >= max_unused_ratio {
        Ok(PackVerdict::Repack)
    } else {
        Ok(PackVerdict::Keep)
    }
}

/// Read every still-used blob out of a mixed pack and re-save it through
/// the ordinary blob writer, then delete the old pack. The new pack(s) and
/// their index entries become visible before the old pack is removed,
/// preserving the same delete-after-supersede ordering as the sweep above.
async fn repack_pack(
    repo: &Repository,
    pack_id: &Id,
    used: &HashSet<(BlobType, Id)>,
) -> Result<()> {
    let pack_bytes = repo
        .backend()
        .read(crate::backend::FileType::Pack, &pack_id.to_hex())
        .await?;
    let (entries, _) = crate::pack::parse_header(&pack_bytes, repo.crypt())?;

    for entry in &entries {
        if !used.contains(&(entry.blob_type, entry.id)) {
            continue;
        }
        let ciphertext = &pack_bytes
            [entry.offset as usize..entry.offset as usize + entry.length as usize];
        let plaintext = crate::blob::decode(
            ciphertext,
            repo.crypt(),
            entry.uncompressed_length.is_some(),
            &entry.id,
        )?;
        repo.save_blob(entry.blob_type, &plaintext).await?;
    }

    repo.flush().await?;
    repo.backend()
        .remove(crate::backend::FileType::Pack, &pack_id.to_hex())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;

    fn snap_at(time: &str) -> Snapshot {
        let mut s = Snapshot::new("host", "alice", vec!["/data".to_string()], Id::hash(b"tree"));
        s.time = time.to_string();
        s
    }

    #[test]
    fn keep_last_retains_only_the_most_recent_n() {
        let snaps = vec![
            (Id::hash(b"1"), snap_at("2024-01-03T00:00:00+00:00")),
            (Id::hash(b"2"), snap_at("2024-01-02T00:00:00+00:00")),
            (Id::hash(b"3"), snap_at("2024-01-01T00:00:00+00:00")),
        ];
        let options = PruneOptions::new().keep_last(Some(2));
        let verdicts = select_snapshots_to_forget(snaps, &options);
        let kept: Vec<bool> = verdicts.iter().map(|v| v.keep).collect();
        assert_eq!(kept, vec![true, true, false]);
    }

    #[test]
    fn keep_daily_collapses_same_day_snapshots() {
        let snaps = vec![
            (Id::hash(b"1"), snap_at("2024-01-01T23:00:00+00:00")),
            (Id::hash(b"2"), snap_at("2024-01-01T10:00:00+00:00")),
            (Id::hash(b"3"), snap_at("2024-01-01T01:00:00+00:00")),
        ];
        let options = PruneOptions::new().keep_daily(Some(1));
        let verdicts = select_snapshots_to_forget(snaps, &options);
        assert_eq!(verdicts.iter().filter(|v| v.keep).count(), 1);
        assert!(verdicts[0].keep);
    }

    #[tokio::test]
    async fn prune_removes_fully_unreferenced_pack() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        Repository::init(path, b"pw", "alice", "host").await.unwrap();
        let repo = Repository::open(path, b"pw").await.unwrap();

        repo.save_blob(BlobType::Data, b"orphaned content").await.unwrap();
        repo.flush().await.unwrap();

        let stats = prune(&repo, DEFAULT_MAX_UNUSED_RATIO).await.unwrap();
        assert_eq!(stats.packs_deleted, 1);
        assert_eq!(repo.master_index().known_pack_ids().len(), 0);
    }

    #[tokio::test]
    async fn prune_keeps_pack_referenced_by_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        Repository::init(path, b"pw", "alice", "host").await.unwrap();
        let repo = Repository::open(path, b"pw").await.unwrap();

        let blob_id = repo.save_blob(BlobType::Data, b"kept content").await.unwrap();
        let mut tree = crate::tree::Tree::new();
        tree.nodes
            .push(crate::tree::Node::new_file("f", 12, vec![blob_id]));
        let tree_id = repo.save_tree(&tree).await.unwrap();
        let snapshot = Snapshot::new("host", "alice", vec!["/data".to_string()], tree_id);
        repo.save_snapshot(&snapshot).await.unwrap();
        repo.flush().await.unwrap();

        let stats = prune(&repo, DEFAULT_MAX_UNUSED_RATIO).await.unwrap();
        assert_eq!(stats.packs_deleted, 0);
        assert_eq!(stats.packs_repacked, 0);
    }
}
