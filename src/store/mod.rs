//! Bulk object store interface
//!
//! The authoritative state of a database is a handful of opaque objects in
//! an untrusted store: one manifest plus content-addressed shard files. This
//! module defines the thin adapter contract over list/get/put/delete with
//! conditional PUT, and ships two reference drivers:
//! - [`MemoryStore`] for tests and ephemeral databases
//! - [`FileSystemStore`] for a local directory tree
//!
//! Remote drivers (S3, WebDAV) implement the same trait out of tree.

mod filesystem;
mod memory;

pub use filesystem::FileSystemStore;
pub use memory::MemoryStore;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DbError, DbResult};

/// Byte range of a partial `get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `len` bytes starting at `offset`
    Span { offset: u64, len: u64 },
    /// The trailing `len` bytes of the object
    Suffix { len: u64 },
}

/// Precondition of a conditional `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional write
    None,
    /// Fail with `Conflict` when the object already exists
    NotExists,
    /// Fail with `Conflict` unless the current content hash matches
    IfMatch(String),
}

/// Self-describing summary of a store, surfaced to embedders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub kind: String,
    /// Whether conditional PUT is evaluated atomically by the driver. When
    /// false the manifest manager falls back to fetch-then-compare.
    pub supports_cas: bool,
    pub location: Option<String>,
}

/// Serializable store selection, kept as plain data so persisting and
/// restoring a backend choice never needs runtime type introspection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    Memory,
    FileSystem { root: PathBuf },
}

impl StoreConfig {
    /// Construct the driver this configuration describes.
    pub fn connect(&self) -> DbResult<Arc<dyn StorageBackend>> {
        match self {
            StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreConfig::FileSystem { root } => {
                Ok(Arc::new(FileSystemStore::new(root.clone())))
            }
        }
    }
}

/// Adapter contract over the bulk object store.
///
/// Guarantees expected from drivers: `list` may be eventually consistent,
/// but get-after-put of a single object is consistent within one session.
/// Errors are reported by kind, never by provider code.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// List object names under a prefix, in lexicographic order.
    async fn list(&self, prefix: &str) -> DbResult<Vec<String>>;

    /// Fetch an object or a byte range of it. `NotFound` when absent.
    async fn get(&self, name: &str, range: Option<ByteRange>) -> DbResult<Vec<u8>>;

    /// Write an object, honoring the precondition. Returns the content hash
    /// of the stored bytes, usable as a later `IfMatch` token.
    async fn put(&self, name: &str, bytes: &[u8], precondition: Precondition)
        -> DbResult<String>;

    /// Delete an object. `NotFound` when it was already gone.
    async fn delete(&self, name: &str) -> DbResult<()>;

    fn metadata(&self) -> StoreMetadata;

    /// The serializable configuration that reconnects to this store.
    fn config(&self) -> StoreConfig;
}

/// Content hash used as the CAS token for conditional writes.
pub fn content_etag(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Slice a full object according to a requested range.
pub(crate) fn apply_range(bytes: &[u8], range: Option<ByteRange>) -> DbResult<Vec<u8>> {
    match range {
        None => Ok(bytes.to_vec()),
        Some(ByteRange::Span { offset, len }) => {
            let start = offset as usize;
            let end = start
                .checked_add(len as usize)
                .ok_or_else(|| DbError::InvariantViolation("byte range overflow".to_string()))?;
            if end > bytes.len() {
                return Err(DbError::InvariantViolation(format!(
                    "byte range {}..{} exceeds object size {}",
                    start,
                    end,
                    bytes.len()
                )));
            }
            Ok(bytes[start..end].to_vec())
        }
        Some(ByteRange::Suffix { len }) => {
            let len = (len as usize).min(bytes.len());
            Ok(bytes[bytes.len() - len..].to_vec())
        }
    }
}
