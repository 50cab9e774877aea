//! A deduplicating, encrypted, content-addressed backup repository engine.
//!
//! Plaintext is split into content-defined chunks, deduplicated by content
//! hash, AEAD-encrypted, and packed behind per-pack headers; a master index
//! resolves blob IDs to pack locations; snapshots record a tree of file
//! metadata and the content-blob IDs that reproduce each file's bytes.
//!
//! [`repository::Repository`] is the entry point: open or initialize one,
//! then drive it through [`archiver::Archiver`] (ingest), [`restorer::Restorer`]
//! (extract), [`prune`] (reclaim unreferenced space) and [`check`] (verify
//! structural and data integrity).

pub mod archiver;
pub mod backend;
pub mod blob;
pub mod check;
pub mod chunker;
pub mod config;
pub mod crypto;
pub mod error;
pub mod id;
pub mod index;
pub mod lock;
pub mod pack;
pub mod prune;
pub mod repository;
pub mod restorer;
pub mod snapshot;
pub mod tree;

pub use error::{RepositoryError, Result};
pub use id::Id;
pub use repository::Repository;
