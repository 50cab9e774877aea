//! End-to-end scenarios exercising the engine the way a CLI front end would:
//! init a repository, archive files into it, restore, prune, and check,
//! all against a `tempfile::tempdir()` repository and a `tempfile`-backed
//! source tree.

use std::io::Cursor;

use backuprs::archiver::{build_tree, Archiver, SourceFile};
use backuprs::backend::FileType;
use backuprs::check;
use backuprs::lock::RepositoryLock;
use backuprs::prune::{self, PruneOptions};
use backuprs::restorer::Restorer;
use backuprs::Repository;

fn sample_file(name: &str, content: &[u8]) -> SourceFile<Cursor<Vec<u8>>> {
    SourceFile {
        name: name.to_string(),
        size: content.len() as u64,
        mode: 0o644,
        uid: 0,
        gid: 0,
        mtime: 1_700_000_000,
        atime: 1_700_000_000,
        ctime: 1_700_000_000,
        hardlink: None,
        reader: Cursor::new(content.to_vec()),
    }
}

async fn backup_one_file(repo: &Repository, name: &str, content: &[u8], parent: Option<backuprs::Id>) -> backuprs::Id {
    let archiver = Archiver::new(repo);
    let node = archiver.ingest_file(sample_file(name, content), None).await.unwrap();
    let tree = build_tree(vec![node]);
    let tree_id = repo.save_tree(&tree).await.unwrap();
    archiver
        .commit("host1", "alice", vec!["/data".to_string()], tree_id, parent)
        .await
        .unwrap()
}

/// S1: init, back up one file, list exactly one snapshot, restore it and
/// get the same bytes back.
#[tokio::test]
async fn s1_basic_backup_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let repo_path = dir.path().join("repo");
    let repo_str = repo_path.to_str().unwrap();

    Repository::init(repo_str, b"p", "alice", "host1").await.unwrap();
    let repo = Repository::open(repo_str, b"p").await.unwrap();

    let content = vec![7u8; 300 * 1024];
    let snap_id = backup_one_file(&repo, "payload.bin", &content, None).await;

    let snapshots = repo.list_snapshots().await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].0, snap_id);

    let out_dir = dir.path().join("out");
    std::fs::create_dir_all(&out_dir).unwrap();
    Restorer::new(&repo).restore(&snap_id, &out_dir).await.unwrap();

    let restored = std::fs::read(out_dir.join("payload.bin")).unwrap();
    assert_eq!(restored, content);
}

/// S2: backing up the same tree twice links the second snapshot's parent
/// to the first and keeps repository growth small.
#[tokio::test]
async fn s2_incremental_backup_chains_parent() {
    let dir = tempfile::tempdir().unwrap();
    let repo_path = dir.path().join("repo");
    let repo_str = repo_path.to_str().unwrap();

    Repository::init(repo_str, b"p", "alice", "host1").await.unwrap();
    let repo = Repository::open(repo_str, b"p").await.unwrap();

    let content = vec![1u8; 200 * 1024];
    let first = backup_one_file(&repo, "a.bin", &content, None).await;

    let packs_after_first = repo.backend().list(FileType::Pack).await.unwrap().len();

    let second = backup_one_file(&repo, "a.bin", &content, Some(first)).await;
    let second_snapshot = repo.load_snapshot(&second).await.unwrap();
    assert_eq!(second_snapshot.parent, Some(first));

    let packs_after_second = repo.backend().list(FileType::Pack).await.unwrap().len();
    assert!(
        packs_after_second <= packs_after_first + 1,
        "expected near-zero pack growth on an unchanged re-backup, got {} -> {}",
        packs_after_first,
        packs_after_second
    );
}

/// S3: adding one new file alongside unchanged content only grows the pack
/// count by the new data's own blob(s) plus a tree blob, not by re-uploading
/// what was already there.
#[tokio::test]
async fn s3_dedup_across_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let repo_path = dir.path().join("repo");
    let repo_str = repo_path.to_str().unwrap();

    Repository::init(repo_str, b"p", "alice", "host1").await.unwrap();
    let repo = Repository::open(repo_str, b"p").await.unwrap();
    let archiver = Archiver::new(&repo);

    let shared_content = vec![9u8; 256 * 1024];
    let first_node = archiver
        .ingest_file(sample_file("shared.bin", &shared_content), None)
        .await
        .unwrap();
    let first_tree = build_tree(vec![first_node.clone()]);
    let first_tree_id = repo.save_tree(&first_tree).await.unwrap();
    let first_snap = archiver
        .commit("host1", "alice", vec!["/data".to_string()], first_tree_id, None)
        .await
        .unwrap();

    let packs_after_first = repo.backend().list(FileType::Pack).await.unwrap().len();

    let new_content = vec![3u8; 1024 * 1024];
    let new_node = archiver
        .ingest_file(sample_file("new.bin", &new_content), None)
        .await
        .unwrap();
    let reused_node = archiver
        .ingest_file(sample_file("shared.bin", &shared_content), Some(&first_node))
        .await
        .unwrap();
    let second_tree = build_tree(vec![new_node, reused_node]);
    let second_tree_id = repo.save_tree(&second_tree).await.unwrap();
    archiver
        .commit("host1", "alice", vec!["/data".to_string()], second_tree_id, Some(first_snap))
        .await
        .unwrap();

    let packs_after_second = repo.backend().list(FileType::Pack).await.unwrap().len();
    assert!(
        packs_after_second <= packs_after_first + 2,
        "expected at most one new data pack and one new tree pack, got {} -> {}",
        packs_after_first,
        packs_after_second
    );
}

/// S4: forgetting the first of two snapshots and pruning leaves the
/// remaining snapshot fully restorable and a clean `check`.
#[tokio::test]
async fn s4_prune_after_forget() {
    let dir = tempfile::tempdir().unwrap();
    let repo_path = dir.path().join("repo");
    let repo_str = repo_path.to_str().unwrap();

    Repository::init(repo_str, b"p", "alice", "host1").await.unwrap();
    let repo = Repository::open(repo_str, b"p").await.unwrap();

    let unique_to_first = vec![5u8; 512 * 1024];
    let first = backup_one_file(&repo, "only-in-first.bin", &unique_to_first, None).await;

    let kept_content = vec![6u8; 128 * 1024];
    let second = backup_one_file(&repo, "kept.bin", &kept_content, Some(first)).await;

    repo.remove_snapshot(&first).await.unwrap();

    let packs_before_prune = repo.backend().list(FileType::Pack).await.unwrap().len();
    let stats = prune::prune(&repo, PruneOptions::new().max_unused_ratio).await.unwrap();
    assert!(stats.packs_deleted > 0, "forgotten snapshot's unique pack should be reclaimed");

    let packs_after_prune = repo.backend().list(FileType::Pack).await.unwrap().len();
    assert!(packs_after_prune < packs_before_prune);

    let report = check::check_structure(&repo).await.unwrap();
    assert!(report.is_clean(), "check should pass after prune: {:?}", report);

    let out_dir = dir.path().join("out");
    std::fs::create_dir_all(&out_dir).unwrap();
    Restorer::new(&repo).restore(&second, &out_dir).await.unwrap();
    assert_eq!(std::fs::read(out_dir.join("kept.bin")).unwrap(), kept_content);
}

/// S6: a second shared-lock acquisition succeeds while an exclusive lock is
/// held only after it is released; an exclusive acquisition against an
/// existing exclusive lock fails within its retry window.
#[tokio::test]
async fn s6_exclusive_lock_excludes_concurrent_mutators() {
    let dir = tempfile::tempdir().unwrap();
    let repo_path = dir.path().join("repo");
    let repo_str = repo_path.to_str().unwrap();

    Repository::init(repo_str, b"p", "alice", "host1").await.unwrap();
    let repo = Repository::open(repo_str, b"p").await.unwrap();

    let held = repo.lock_exclusive("alice").await.unwrap();
    assert!(held.is_exclusive());

    let second_backend = repo.backend().clone();
    let conflict = RepositoryLock::acquire(
        second_backend,
        "bob",
        true,
        std::time::Duration::from_millis(200),
        backuprs::lock::DEFAULT_STALE_TIMEOUT,
    )
    .await;
    assert!(conflict.is_err(), "exclusive lock should reject a concurrent exclusive acquire");

    held.release(repo.backend().as_ref()).await.unwrap();

    let after_release = repo.lock_exclusive("bob").await;
    assert!(after_release.is_ok(), "lock should be acquirable once released");
}
