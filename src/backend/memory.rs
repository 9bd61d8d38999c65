use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use super::{ChangeNotice, DatabaseBackend};
use crate::document::{Document, SEQ_UNASSIGNED};
use crate::error::{DbError, DbResult};

/// In-memory [`DatabaseBackend`].
///
/// Doubles as the reference implementation for embedders and as the local
/// store in tests. Application writes go through [`MemoryBackend::stage`]
/// and [`MemoryBackend::stage_delete`], which mark the id pending and fire a
/// change notification; everything else is driven by the sync engine.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<RwLock<Inner>>,
    changes: broadcast::Sender<ChangeNotice>,
}

struct Inner {
    uuid: Option<String>,
    docs: HashMap<String, Document>,
    pending: BTreeSet<String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                uuid: None,
                docs: HashMap::new(),
                pending: BTreeSet::new(),
            })),
            changes,
        }
    }

    /// Record a local write and mark it pending upload.
    pub fn stage(&self, doc: Document) {
        {
            let mut inner = self.inner.write();
            inner.pending.insert(doc.id.clone());
            inner.docs.insert(doc.id.clone(), doc);
        }
        let _ = self.changes.send(ChangeNotice);
    }

    /// Record a local deletion as a pending tombstone.
    pub fn stage_delete(&self, id: impl Into<String>) {
        let tombstone = Document::tombstone(id);
        self.stage(tombstone);
    }

    /// Current local view of one id, tombstones included.
    pub fn document(&self, id: &str) -> Option<Document> {
        self.inner.read().docs.get(id).cloned()
    }

    /// Visible (live, non-tombstone) document count.
    pub fn live_count(&self) -> usize {
        self.inner.read().docs.values().filter(|d| !d.del).count()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseBackend for MemoryBackend {
    async fn initialize(&self, uuid: &str) -> DbResult<()> {
        let mut inner = self.inner.write();
        match &inner.uuid {
            Some(existing) if existing != uuid => Err(DbError::InvariantViolation(format!(
                "backend already bound to database {}, refusing {}",
                existing, uuid
            ))),
            _ => {
                inner.uuid = Some(uuid.to_string());
                Ok(())
            }
        }
    }

    async fn read(&self, ids: &[String]) -> DbResult<Vec<Option<Document>>> {
        let inner = self.inner.read();
        Ok(ids.iter().map(|id| inner.docs.get(id).cloned()).collect())
    }

    async fn pending_ids(&self) -> DbResult<Vec<String>> {
        Ok(self.inner.read().pending.iter().cloned().collect())
    }

    async fn upsert(&self, docs: Vec<Document>) -> DbResult<()> {
        let mut inner = self.inner.write();
        for doc in docs {
            debug!(id = %doc.id, at = doc.at, del = doc.del, "ingesting remote document");
            inner.docs.insert(doc.id.clone(), doc);
        }
        Ok(())
    }

    async fn delete(&self, tombstones: Vec<Document>) -> DbResult<()> {
        let mut inner = self.inner.write();
        for tombstone in tombstones {
            inner.docs.remove(&tombstone.id);
            inner.pending.remove(&tombstone.id);
        }
        Ok(())
    }

    async fn confirm(&self, assignments: &[(String, u64)]) -> DbResult<()> {
        let mut inner = self.inner.write();
        for (id, seq) in assignments {
            if *seq == SEQ_UNASSIGNED {
                return Err(DbError::InvariantViolation(format!(
                    "confirming '{}' with the unassigned sentinel",
                    id
                )));
            }
            if let Some(doc) = inner.docs.get_mut(id) {
                doc.seq = *seq;
            }
            inner.pending.remove(id);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeNotice> {
        self.changes.subscribe()
    }
}
