//! Vacuum engine
//!
//! Tombstones must survive long enough for every device to observe the
//! deletion, then they are dead weight. Vacuum is a special compaction that
//! rewrites shards with their expired tombstones physically dropped,
//! bounded by `vacuum_count` entries per cycle.

use std::sync::Arc;

use tracing::{debug, info};

use super::MaintenanceContext;
use crate::document::now_millis;
use crate::error::DbResult;
use crate::manifest::ManifestUpdate;
use crate::shard::PreparedShard;

/// Retention horizon for tombstones, in days.
pub const MAX_SYNC_AGE_DAYS: u64 = 365;

/// Timestamp below which a tombstone is past retention.
pub fn retention_cutoff() -> u64 {
    now_millis().saturating_sub(MAX_SYNC_AGE_DAYS * 24 * 60 * 60 * 1000)
}

#[derive(Debug, Clone, Default)]
pub struct VacuumReport {
    pub dropped_tombstones: usize,
    pub rewritten_shards: usize,
    /// Shards removed without replacement because nothing remained
    pub emptied_shards: usize,
}

pub struct VacuumEngine {
    ctx: Arc<MaintenanceContext>,
}

impl VacuumEngine {
    pub fn new(ctx: Arc<MaintenanceContext>) -> Self {
        Self { ctx }
    }

    /// Ratio of tombstones to live documents across all shard headers.
    pub async fn tombstone_ratio(&self) -> DbResult<f64> {
        let manifest = self.ctx.manifest.snapshot().await;
        let mut tombstones = 0usize;
        let mut live = 0usize;
        for info in &manifest.shard_files {
            let header = self.ctx.reader.open_header(&info.filename).await?;
            let dead = header.tombstone_count();
            tombstones += dead;
            live += header.entries.len() - dead;
        }
        if live == 0 {
            return Ok(if tombstones > 0 { f64::INFINITY } else { 0.0 });
        }
        Ok(tombstones as f64 / live as f64)
    }

    /// Whether the tombstone load warrants a cycle.
    pub async fn should_run(&self) -> DbResult<bool> {
        Ok(self.tombstone_ratio().await? > self.ctx.options.vacuum_threshold)
    }

    /// Run one vacuum cycle.
    pub async fn run(&self) -> DbResult<VacuumReport> {
        let cutoff = retention_cutoff();
        let budget = self.ctx.options.vacuum_count;
        let manifest = self.ctx.manifest.snapshot().await;

        // Collect shards holding expired tombstones, within budget
        let mut targets: Vec<(String, u8)> = Vec::new();
        let mut planned = 0usize;
        for info in &manifest.shard_files {
            if planned >= budget {
                break;
            }
            let header = self.ctx.reader.open_header(&info.filename).await?;
            let expired = header
                .entries
                .iter()
                .filter(|e| e.del && e.at < cutoff)
                .count();
            if expired > 0 {
                planned += expired;
                targets.push((info.filename.clone(), info.level));
            }
        }
        if targets.is_empty() {
            debug!("no expired tombstones, vacuum is a no-op");
            return Ok(VacuumReport::default());
        }

        // Rewrite each target at its current level, minus expired tombstones
        let mut report = VacuumReport::default();
        let mut added: Vec<PreparedShard> = Vec::new();
        let mut removed: Vec<String> = Vec::new();
        let mut remaining_budget = budget;
        for (filename, level) in &targets {
            let header = self.ctx.reader.open_header(filename).await?;
            let documents = self.ctx.reader.stream_documents(filename, &header).await?;
            let mut kept = Vec::with_capacity(documents.len());
            for doc in documents {
                if doc.del && doc.at < cutoff && remaining_budget > 0 {
                    remaining_budget -= 1;
                    report.dropped_tombstones += 1;
                } else {
                    kept.push(doc);
                }
            }
            removed.push(filename.clone());
            if kept.is_empty() {
                report.emptied_shards += 1;
            } else {
                report.rewritten_shards += 1;
                added.push(PreparedShard {
                    documents: kept,
                    level: *level,
                });
            }
        }

        let outcome = self
            .ctx
            .manifest
            .update(
                |m0| {
                    if !removed.iter().all(|f| m0.has_shard(f)) {
                        debug!("vacuum targets changed under us, skipping cycle");
                        return Ok(ManifestUpdate::default());
                    }
                    Ok(ManifestUpdate {
                        added_shards: added.clone(),
                        removed_shards: removed.clone(),
                        ..Default::default()
                    })
                },
                || async { Ok(()) },
            )
            .await?;
        if outcome.manifest.has_shard(&removed[0]) {
            return Ok(VacuumReport::default());
        }

        info!(
            dropped = report.dropped_tombstones,
            rewritten = report.rewritten_shards,
            emptied = report.emptied_shards,
            "vacuum cycle complete"
        );
        Ok(report)
    }
}
