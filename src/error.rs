//! Error taxonomy.
//!
//! Low-level modules never exit the process; they report kinded errors
//! here. [`Repository`](crate::repository::Repository) aggregates these and
//! annotates them with the offending operand (id/path) before bubbling them
//! up to a caller; the demonstration CLI in `src/bin/backuprs.rs` maps kinds
//! to the design's exit codes.

use crate::id::Id;

#[derive(thiserror::Error, Debug)]
pub enum RepositoryError {
    /// Network or filesystem hiccup. The backend's own retry policy has
    /// already given up by the time this surfaces here.
    #[error("transient I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("repository is already locked: {0}")]
    AlreadyLocked(String),

    /// AEAD verification failed. No plaintext is ever returned alongside
    /// this error.
    #[error("authentication failed for {0}")]
    Unauthentic(String),

    /// Content hash mismatch, malformed header, or truncated pack/index.
    #[error("corrupt repository object: {0}")]
    Corrupt(String),

    /// Wrong password, protocol invariant violation, or other misuse that
    /// should abort the current command outright.
    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(e: serde_json::Error) -> Self {
        RepositoryError::Corrupt(format!("malformed JSON: {}", e))
    }
}

impl RepositoryError {
    pub fn not_found(id: &Id) -> Self {
        RepositoryError::NotFound(id.to_hex())
    }

    /// Maps an error to the demonstration CLI's exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            RepositoryError::NotFound(_) => 10,
            RepositoryError::AlreadyLocked(_) => 11,
            RepositoryError::Fatal(msg) if msg.contains("password") => 12,
            RepositoryError::Cancelled => 130,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, RepositoryError>;
