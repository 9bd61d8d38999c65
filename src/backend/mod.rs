//! Database backend capability
//!
//! The user-facing document store (a local durable cache of documents and
//! their pending-upload state) lives outside the core. The sync engine
//! consumes it through [`DatabaseBackend`]: reads feed shard writes, upserts
//! deliver remotely ingested records, and the pending set drives the
//! `idle → pending` transition of the client state machine.

mod memory;

pub use memory::MemoryBackend;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::document::Document;
use crate::error::DbResult;

/// Notification that local documents changed and await upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeNotice;

#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Bind the backend to a database identity before first use.
    async fn initialize(&self, uuid: &str) -> DbResult<()>;

    /// Read current local representations; `None` for unknown ids.
    async fn read(&self, ids: &[String]) -> DbResult<Vec<Option<Document>>>;

    /// Ids whose local modification has not been confirmed by a committed
    /// manifest yet.
    async fn pending_ids(&self) -> DbResult<Vec<String>>;

    /// Apply documents arriving from remote shards. Never touches the
    /// pending set.
    async fn upsert(&self, docs: Vec<Document>) -> DbResult<()>;

    /// Physically remove ids, used when vacuum drops expired tombstones.
    async fn delete(&self, tombstones: Vec<Document>) -> DbResult<()>;

    /// Mark pending ids as confirmed, recording their committed sequence
    /// numbers.
    async fn confirm(&self, assignments: &[(String, u64)]) -> DbResult<()>;

    /// Subscribe to local-change notifications. Dropping the receiver
    /// unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<ChangeNotice>;
}
