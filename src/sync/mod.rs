//! Sync engine
//!
//! The sync tick is the system's main transaction:
//! `pull → diff → ingest → gather → write → commit`. Remote shards unseen
//! since the last tick are ingested into the database backend, locally
//! pending documents are gathered into a single new level-0 shard, and the
//! manifest is advanced through the CAS loop. A lost CAS race re-pulls,
//! re-ingests, and reassigns preliminary sequence numbers before retrying.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::backend::DatabaseBackend;
use crate::crypto::CryptoManager;
use crate::document::{batch_order, Document};
use crate::error::DbResult;
use crate::manifest::{ManifestManager, ManifestUpdate, ShardFileInfo};
use crate::options::SealOptions;
use crate::shard::{PreparedShard, ShardReader};
use crate::store::StorageBackend;

/// Handles the sync engine works with, wired once by the client.
pub struct SyncContext {
    pub store: Arc<dyn StorageBackend>,
    pub backend: Arc<dyn DatabaseBackend>,
    pub manifest: Arc<ManifestManager>,
    pub reader: Arc<ShardReader>,
    pub crypto: Arc<CryptoManager>,
    pub options: SealOptions,
}

/// Outcome summary of one tick.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Remote documents delivered to the database backend
    pub ingested: usize,
    /// Local documents committed in a new shard
    pub uploaded: usize,
    /// Whether a manifest commit happened
    pub committed: bool,
    /// CAS attempts the commit took, 0 when nothing was committed
    pub attempts: u32,
    /// `lastSequence` after the tick
    pub last_sequence: u64,
}

pub struct SyncEngine {
    ctx: Arc<SyncContext>,
    /// Shard filenames already diffed and ingested
    last_known: Mutex<HashSet<String>>,
}

impl SyncEngine {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            last_known: Mutex::new(HashSet::new()),
        }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    /// Diff the current manifest snapshot against the shards seen so far
    /// and ingest every new shard's documents. Locally pending ids are
    /// never overwritten; everything else follows last-writer-wins on `at`.
    async fn ingest_new_shards(&self) -> DbResult<usize> {
        let snapshot = self.ctx.manifest.snapshot().await;
        let current: HashSet<String> = snapshot
            .shard_files
            .iter()
            .map(|s| s.filename.clone())
            .collect();
        let known = self.last_known.lock().clone();
        let mut new_shards: Vec<&ShardFileInfo> = snapshot
            .shard_files
            .iter()
            .filter(|s| !known.contains(&s.filename))
            .collect();
        if new_shards.is_empty() {
            *self.last_known.lock() = current;
            return Ok(0);
        }
        // Oldest ranges first so one id's history is applied in order
        new_shards.sort_by(|a, b| {
            (a.range.min, a.filename.as_str()).cmp(&(b.range.min, b.filename.as_str()))
        });

        let pending: HashSet<String> =
            self.ctx.backend.pending_ids().await?.into_iter().collect();

        let mut ingested = 0;
        for info in new_shards {
            let header = self.ctx.reader.open_header(&info.filename).await?;
            let documents = self
                .ctx
                .reader
                .stream_documents(&info.filename, &header)
                .await?;
            let ids: Vec<String> = documents.iter().map(|d| d.id.clone()).collect();
            let locals = self.ctx.backend.read(&ids).await?;

            let mut batch = Vec::with_capacity(documents.len());
            for (doc, local) in documents.into_iter().zip(locals) {
                if pending.contains(&doc.id) {
                    continue;
                }
                let newer = match &local {
                    None => true,
                    Some(local) => doc.at > local.at,
                };
                if newer {
                    batch.push(doc);
                }
            }
            if !batch.is_empty() {
                ingested += batch.len();
                self.ctx.backend.upsert(batch).await?;
            }
        }

        *self.last_known.lock() = current;
        debug!(ingested, "ingested remote shards");
        Ok(ingested)
    }

    /// Pull remote changes into local state; the refetch hook of the CAS
    /// loop.
    async fn pull_and_ingest(&self) -> DbResult<()> {
        self.ctx.manifest.refresh().await?;
        self.ingest_new_shards().await?;
        Ok(())
    }

    fn prune_header_cache(&self, referenced: &HashSet<String>) {
        self.ctx.reader.cache().prune_unreferenced(referenced);
    }

    /// Run one sync tick.
    pub async fn sync_once(&self) -> DbResult<SyncReport> {
        // Pull. A manifest that fails signature verification aborts the
        // tick here and is never overwritten.
        self.ctx.manifest.refresh().await?;

        // Diff + ingest
        let ingested = self.ingest_new_shards().await?;

        // Gather
        let pending_ids = self.ctx.backend.pending_ids().await?;
        let locals = self.ctx.backend.read(&pending_ids).await?;
        let mut gathered: Vec<Document> = locals.into_iter().flatten().collect();
        gathered.sort_by(batch_order);

        if gathered.is_empty() {
            let snapshot = self.ctx.manifest.snapshot().await;
            let referenced = snapshot
                .shard_files
                .iter()
                .map(|s| s.filename.clone())
                .collect();
            self.prune_header_cache(&referenced);
            debug!(ingested, "nothing pending, tick complete");
            return Ok(SyncReport {
                ingested,
                last_sequence: snapshot.last_sequence,
                ..Default::default()
            });
        }

        // Write: one new level-0 shard, preliminary sequences assigned in
        // deterministic (at, id) order from the freshest lastSequence.
        let outcome = self
            .ctx
            .manifest
            .update(
                |m0| {
                    let base = m0.last_sequence;
                    let mut documents = gathered.clone();
                    for (index, doc) in documents.iter_mut().enumerate() {
                        doc.seq = base + 1 + index as u64;
                    }
                    Ok(ManifestUpdate {
                        last_sequence: Some(base + documents.len() as u64),
                        added_shards: vec![PreparedShard::level0(documents)],
                        ..Default::default()
                    })
                },
                || self.pull_and_ingest(),
            )
            .await?;

        // Commit: confirm pending ids with their final sequence numbers and
        // populate the header cache for the fresh shard.
        let base = outcome.manifest.last_sequence - gathered.len() as u64;
        let assignments: Vec<(String, u64)> = gathered
            .iter()
            .enumerate()
            .map(|(index, doc)| (doc.id.clone(), base + 1 + index as u64))
            .collect();
        self.ctx.backend.confirm(&assignments).await?;

        let mut referenced: HashSet<String> = outcome
            .manifest
            .shard_files
            .iter()
            .map(|s| s.filename.clone())
            .collect();
        for written in &outcome.added {
            self.ctx
                .reader
                .cache()
                .insert(written.info.filename.clone(), written.header.clone());
            self.last_known.lock().insert(written.info.filename.clone());
            referenced.insert(written.info.filename.clone());
        }
        self.prune_header_cache(&referenced);

        info!(
            ingested,
            uploaded = gathered.len(),
            attempts = outcome.attempts,
            last_sequence = outcome.manifest.last_sequence,
            "sync tick committed"
        );
        Ok(SyncReport {
            ingested,
            uploaded: gathered.len(),
            committed: true,
            attempts: outcome.attempts,
            last_sequence: outcome.manifest.last_sequence,
        })
    }
}
