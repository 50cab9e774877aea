//! Repository locking: shared and exclusive lock files with staleness
//! detection and a background refresh task.
//!
//! Generalized from `tools::lock_file`'s single advisory `flock` (`src/
//! tools.rs`) into the structured, multi-host-visible lock file this
//! engine's design requires: a backend-visible JSON object rather than an
//! OS-level advisory lock, since remote backends have no shared `flock`.
//! The mkstemp-then-rename write pattern is unchanged, reused via
//! [`crate::backend::Backend::write`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{Backend, FileType};
use crate::error::{RepositoryError, Result};
use crate::id::Id;

pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockInfo {
    pub hostname: String,
    pub pid: u32,
    pub username: String,
    /// RFC 3339 timestamp of this lock file's last write — staleness is
    /// judged against this, not against wall-clock creation time.
    pub timestamp: String,
    pub exclusive: bool,
}

impl LockInfo {
    fn new(username: &str, exclusive: bool) -> Self {
        LockInfo {
            hostname: gethostname(),
            pid: std::process::id(),
            username: username.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            exclusive,
        }
    }

    fn age(&self) -> Option<Duration> {
        let written = chrono::DateTime::parse_from_rfc3339(&self.timestamp).ok()?;
        let now = chrono::Utc::now();
        let delta = now.signed_duration_since(written);
        delta.to_std().ok()
    }

    fn is_stale(&self, stale_timeout: Duration) -> bool {
        self.age().map(|a| a > stale_timeout).unwrap_or(true)
    }
}

pub fn gethostname() -> String {
    let mut buf = [0u8; 256];
    match nix::unistd::gethostname(&mut buf) {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(_) => "unknown-host".to_string(),
    }
}

/// A held lock. Dropping it stops the background refresh task (the
/// refresh handle's `JoinHandle` is aborted) but does not itself delete
/// the lock file from the backend — callers release explicitly via
/// [`RepositoryLock::release`] so that release failures are observable.
pub struct RepositoryLock {
    id: Id,
    exclusive: bool,
    cancelled: Arc<AtomicBool>,
    refresh_task: Option<tokio::task::JoinHandle<()>>,
}

impl RepositoryLock {
    /// Attempt to acquire a lock, retrying for up to `retry_window` if a
    /// conflicting, non-stale lock is held. Stale conflicting locks are
    /// removed rather than waited on.
    pub async fn acquire(
        backend: Arc<dyn Backend>,
        username: &str,
        exclusive: bool,
        retry_window: Duration,
        stale_timeout: Duration,
    ) -> Result<Self> {
        let deadline = tokio::time::Instant::now() + retry_window;
        loop {
            match Self::try_acquire_once(&backend, username, exclusive, stale_timeout).await {
                Ok(lock) => return Ok(lock),
                Err(RepositoryError::AlreadyLocked(msg)) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(RepositoryError::AlreadyLocked(msg));
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_acquire_once(
        backend: &Arc<dyn Backend>,
        username: &str,
        exclusive: bool,
        stale_timeout: Duration,
    ) -> Result<Self> {
        let existing = backend.list(FileType::Lock).await?;
        for (name, _) in existing {
            let bytes = backend.read(FileType::Lock, &name).await?;
            let info: LockInfo = serde_json::from_slice(&bytes)?;
            let conflicts = exclusive || info.exclusive;
            if conflicts {
                if info.is_stale(stale_timeout) {
                    let _ = backend.remove(FileType::Lock, &name).await;
                } else {
                    return Err(RepositoryError::AlreadyLocked(format!(
                        "held by {}@{} (pid {})",
                        info.username, info.hostname, info.pid
                    )));
                }
            }
        }

        let info = LockInfo::new(username, exclusive);
        let plaintext = serde_json::to_vec(&info)?;
        let id = Id::hash(&plaintext);
        backend.write(FileType::Lock, &id.to_hex(), &plaintext).await?;

        let cancelled = Arc::new(AtomicBool::new(false));
        let refresh_task = spawn_refresh_task(
            backend.clone(),
            id,
            info,
            cancelled.clone(),
            DEFAULT_REFRESH_INTERVAL,
        );

        Ok(RepositoryLock {
            id,
            exclusive,
            cancelled,
            refresh_task: Some(refresh_task),
        })
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Set once refresh has failed or exceeded its own timeout budget —
    /// callers must check this at every suspension point and abort the
    /// enclosing operation if it ever flips to `true`.
    pub fn is_lost(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub async fn release(mut self, backend: &dyn Backend) -> Result<()> {
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
        backend.remove(FileType::Lock, &self.id.to_hex()).await
    }
}

impl Drop for RepositoryLock {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
    }
}

/// Re-write the lock file every `refresh_interval`. On any write failure,
/// or once the time since the last successful refresh exceeds
/// `refresh_interval` itself (a conservative stand-in for a distinct
/// `refreshability_timeout`, since a single missed interval already means
/// a concurrent holder may no longer see this lock as live), flip
/// `cancelled` and stop — the caller is responsible for noticing and
/// unwinding.
fn spawn_refresh_task(
    backend: Arc<dyn Backend>,
    id: Id,
    mut info: LockInfo,
    cancelled: Arc<AtomicBool>,
    refresh_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(refresh_interval).await;
            info.timestamp = chrono::Utc::now().to_rfc3339();
            let plaintext = match serde_json::to_vec(&info) {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("lock {} refresh failed to serialize, treating as lost: {}", id, e);
                    cancelled.store(true, Ordering::SeqCst);
                    return;
                }
            };
            if let Err(e) = backend.write(FileType::Lock, &id.to_hex(), &plaintext).await {
                log::warn!("lock {} refresh failed, treating lock as lost: {}", id, e);
                cancelled.store(true, Ordering::SeqCst);
                return;
            }
        }
    })
}
