//! Demonstration CLI driving the engine in `backuprs::*` against a local
//! filesystem source tree and a local filesystem repository.
//!
//! Subcommand parsing is deliberately hand-rolled rather than pulled in
//! from a flags crate: the command-line interface and its flag parsing
//! are an external collaborator of the storage engine, not part of it.
//! This binary exists only to exercise the library end to end.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use backuprs::archiver::{build_tree, parent_child_node, Archiver, SourceFile};
use backuprs::backend::FileType;
use backuprs::check::{self, DataSubset};
use backuprs::error::{RepositoryError, Result};
use backuprs::id::Id;
use backuprs::lock::gethostname;
use backuprs::prune::{self, PruneOptions};
use backuprs::restorer::Restorer;
use backuprs::tree::{HardLinkInfo, Node, Tree};
use backuprs::Repository;

fn env_repository() -> Option<String> {
    std::env::var("BACKUPRS_REPOSITORY").ok()
}

fn env_password() -> Result<Vec<u8>> {
    if let Ok(pw) = std::env::var("BACKUPRS_PASSWORD") {
        return Ok(pw.into_bytes());
    }
    if let Ok(path) = std::env::var("BACKUPRS_PASSWORD_FILE") {
        return Ok(std::fs::read_to_string(path)?.trim_end().as_bytes().to_vec());
    }
    Err(RepositoryError::Fatal(
        "no password: set BACKUPRS_PASSWORD or BACKUPRS_PASSWORD_FILE".to_string(),
    ))
}

fn hostname() -> String {
    gethostname()
}

fn username() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let command = args
        .next()
        .ok_or_else(|| RepositoryError::Fatal("usage: backuprs <command> [args...]".to_string()))?;
    let rest: Vec<String> = args.collect();

    match command.as_str() {
        "init" => cmd_init().await,
        "backup" => cmd_backup(&rest).await,
        "snapshots" => cmd_snapshots().await,
        "restore" => cmd_restore(&rest).await,
        "check" => cmd_check(&rest).await,
        "prune" => cmd_prune(&rest).await,
        "forget" => cmd_forget(&rest).await,
        "unlock" => cmd_unlock().await,
        other => Err(RepositoryError::Fatal(format!("unknown command {}", other))),
    }
}

async fn cmd_init() -> Result<()> {
    let repo_path = env_repository()
        .ok_or_else(|| RepositoryError::Fatal("BACKUPRS_REPOSITORY not set".to_string()))?;
    let password = env_password()?;
    Repository::init(&repo_path, &password, &username(), &hostname()).await?;
    println!("created repository at {}", repo_path);
    Ok(())
}

async fn open_repo() -> Result<Repository> {
    let repo_path = env_repository()
        .ok_or_else(|| RepositoryError::Fatal("BACKUPRS_REPOSITORY not set".to_string()))?;
    let password = env_password()?;
    Repository::open(&repo_path, &password).await
}

/// Walk `dir` depth-first, archiving every regular file, symlink and
/// subdirectory it contains, reusing unchanged content from `parent_tree`
/// (the corresponding directory in the declared parent snapshot) where
/// possible.
fn walk_dir<'a>(
    archiver: &'a Archiver<'a>,
    repo: &'a Repository,
    dir: &'a Path,
    parent_tree: Option<Id>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Tree>> + 'a>> {
    Box::pin(async move {
        let mut nodes = Vec::new();
        let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let meta = entry.metadata()?;

            let parent_node = match parent_tree {
                Some(id) => parent_child_node(repo, id, &name).await?,
                None => None,
            };

            if meta.is_dir() {
                let child_parent = parent_node.as_ref().and_then(|n| n.subtree);
                let subtree = walk_dir(archiver, repo, &path, child_parent).await?;
                nodes.push(archiver.ingest_directory(name, subtree).await?);
            } else if meta.file_type().is_symlink() {
                let target = std::fs::read_link(&path)?;
                let mut node = Node::new_file(name, 0, vec![]);
                node.node_type = backuprs::tree::NodeType::Symlink;
                node.content = None;
                node.linktarget = Some(target.to_string_lossy().to_string());
                node.mode = meta.mode();
                node.uid = meta.uid();
                node.gid = meta.gid();
                nodes.push(node);
            } else if meta.is_file() {
                let file = std::fs::File::open(&path)?;
                let hardlink = if meta.nlink() > 1 {
                    Some(HardLinkInfo {
                        st_dev: meta.dev(),
                        st_ino: meta.ino(),
                    })
                } else {
                    None
                };
                let source = SourceFile {
                    name: name.clone(),
                    size: meta.len(),
                    mode: meta.mode(),
                    uid: meta.uid(),
                    gid: meta.gid(),
                    mtime: meta.mtime(),
                    atime: meta.atime(),
                    ctime: meta.ctime(),
                    hardlink,
                    reader: file,
                };
                nodes.push(archiver.ingest_file(source, parent_node.as_ref()).await?);
            }
        }

        Ok(build_tree(nodes))
    })
}

/// Parses `backup [--skip-if-unchanged] <path>`, returning whether the flag
/// was present and the source path. Split out from [`cmd_backup`] so the
/// flag parsing is testable without spinning up a repository.
fn parse_backup_args(args: &[String]) -> Result<(bool, &String)> {
    let skip_if_unchanged = args.iter().any(|a| a == "--skip-if-unchanged");
    let path = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .ok_or_else(|| RepositoryError::Fatal("usage: backuprs backup [--skip-if-unchanged] <path>".to_string()))?;
    Ok((skip_if_unchanged, path))
}

async fn cmd_backup(args: &[String]) -> Result<()> {
    let (skip_if_unchanged, path) = parse_backup_args(args)?;
    let source = PathBuf::from(path);
    let abs_path = source
        .canonicalize()
        .map_err(RepositoryError::Io)?
        .to_string_lossy()
        .to_string();

    let repo = open_repo().await?;
    let _lock = repo.lock_shared(&username()).await?;
    let archiver = Archiver::new(&repo);
    let host = hostname();
    let paths = vec![abs_path];

    let parent = archiver.select_parent(&host, &paths).await?;
    let parent_tree = parent.as_ref().map(|(_, s)| s.tree);

    let root_tree = walk_dir(&archiver, &repo, &source, parent_tree).await?;
    let root_tree_id = repo.save_tree(&root_tree).await?;

    if skip_if_unchanged {
        if let Some((parent_id, parent_snap)) = &parent {
            if parent_snap.tree == root_tree_id {
                println!("unchanged since parent snapshot {}, skipping commit", parent_id);
                return Ok(());
            }
        }
    }

    let snap_id = archiver
        .commit(&host, &username(), paths, root_tree_id, parent.map(|(id, _)| id))
        .await?;
    println!("snapshot {}", snap_id);
    Ok(())
}

async fn cmd_snapshots() -> Result<()> {
    let repo = open_repo().await?;
    let mut snapshots = repo.list_snapshots().await?;
    snapshots.sort_by(|a, b| a.1.time.cmp(&b.1.time));
    for (id, snap) in snapshots {
        println!(
            "{}  {}  {}@{}  {}",
            id,
            snap.time,
            snap.username,
            snap.hostname,
            snap.paths.join(", ")
        );
    }
    Ok(())
}

async fn cmd_restore(args: &[String]) -> Result<()> {
    let id_str = args
        .first()
        .ok_or_else(|| RepositoryError::Fatal("usage: backuprs restore <snapshot-id> <target>".to_string()))?;
    let target = args
        .get(1)
        .ok_or_else(|| RepositoryError::Fatal("usage: backuprs restore <snapshot-id> <target>".to_string()))?;
    let snapshot_id: Id = id_str
        .parse()
        .map_err(|_| RepositoryError::Fatal(format!("invalid snapshot id {}", id_str)))?;

    let repo = open_repo().await?;
    let _lock = repo.lock_shared(&username()).await?;
    let restorer = Restorer::new(&repo);
    std::fs::create_dir_all(target)?;
    restorer.restore(&snapshot_id, Path::new(target)).await?;
    println!("restored {} to {}", snapshot_id, target);
    Ok(())
}

async fn cmd_check(args: &[String]) -> Result<()> {
    let repo = open_repo().await?;
    let _lock = repo.lock_shared(&username()).await?;

    let mut report = check::check_structure(&repo).await?;
    if args.iter().any(|a| a == "--read-data") {
        let data_report = check::check_data(&repo, DataSubset::All).await?;
        report.missing_packs.extend(data_report.missing_packs);
        report.pack_hash_mismatches.extend(data_report.pack_hash_mismatches);
        report.header_mismatches.extend(data_report.header_mismatches);
        report.blob_hash_mismatches.extend(data_report.blob_hash_mismatches);
    }

    if report.is_clean() {
        println!("no errors found");
        Ok(())
    } else {
        println!("{:#?}", report);
        Err(RepositoryError::Corrupt("check found errors".to_string()))
    }
}

async fn cmd_prune(_args: &[String]) -> Result<()> {
    let repo = open_repo().await?;
    let _lock = repo.lock_exclusive(&username()).await?;
    let stats = prune::prune(&repo, PruneOptions::new().max_unused_ratio).await?;
    println!(
        "pruned: {} packs deleted, {} packs repacked",
        stats.packs_deleted, stats.packs_repacked
    );
    Ok(())
}

/// `forget <snapshot-id>...` removes specific snapshots by ID.
/// `forget --keep-last N [--keep-daily N] ...` applies a retention policy
/// across every snapshot instead.
async fn cmd_forget(args: &[String]) -> Result<()> {
    let repo = open_repo().await?;
    let _lock = repo.lock_exclusive(&username()).await?;

    if args.is_empty() {
        return Err(RepositoryError::Fatal(
            "usage: backuprs forget <snapshot-id>... | --keep-last N [--keep-daily N ...]".to_string(),
        ));
    }

    if args[0].starts_with("--") {
        let mut options = PruneOptions::new();
        let mut it = args.iter();
        while let Some(flag) = it.next() {
            let value: u64 = it
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| RepositoryError::Fatal(format!("missing value for {}", flag)))?;
            options = match flag.as_str() {
                "--keep-last" => options.keep_last(Some(value)),
                "--keep-daily" => options.keep_daily(Some(value)),
                "--keep-weekly" => options.keep_weekly(Some(value)),
                "--keep-monthly" => options.keep_monthly(Some(value)),
                "--keep-yearly" => options.keep_yearly(Some(value)),
                other => return Err(RepositoryError::Fatal(format!("unknown flag {}", other))),
            };
        }

        let snapshots = repo.list_snapshots().await?;
        let verdicts = prune::select_snapshots_to_forget(snapshots, &options);
        let mut removed = 0;
        for verdict in verdicts {
            if !verdict.keep {
                repo.remove_snapshot(&verdict.id).await?;
                removed += 1;
            }
        }
        println!("forgot {} snapshot(s)", removed);
    } else {
        for id_str in args {
            let id: Id = id_str
                .parse()
                .map_err(|_| RepositoryError::Fatal(format!("invalid snapshot id {}", id_str)))?;
            repo.remove_snapshot(&id).await?;
        }
        println!("forgot {} snapshot(s)", args.len());
    }
    Ok(())
}

async fn cmd_unlock() -> Result<()> {
    let repo = open_repo().await?;
    for (name, _) in repo.backend().list(FileType::Lock).await? {
        repo.backend().remove(FileType::Lock, &name).await?;
    }
    println!("removed stale locks");
    Ok(())
}
