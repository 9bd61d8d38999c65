//! Compaction engine
//!
//! Promotes clusters of small level-`L` shards into a single merged shard at
//! level `L+1`, resolving duplicate ids by last-writer-wins and dropping
//! tombstones past the retention horizon along the way. One compaction step
//! runs per cycle; repeated cycles amortize the work.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::vacuum::retention_cutoff;
use super::MaintenanceContext;
use crate::document::{batch_order, compare_versions, Document};
use crate::error::DbResult;
use crate::manifest::{Manifest, ManifestUpdate, ShardFileInfo};
use crate::shard::PreparedShard;

/// Upper bound on inputs merged in one step, to keep a cycle's work bounded.
const MAX_GROUP_SIZE: usize = 8;

#[derive(Debug, Clone)]
pub struct CompactionReport {
    pub from_level: u8,
    pub inputs: Vec<String>,
    /// Filename of the merged output, absent when every record was an
    /// expired tombstone
    pub output: Option<String>,
    pub merged_documents: usize,
    pub dropped_tombstones: usize,
}

pub struct CompactionEngine {
    ctx: Arc<MaintenanceContext>,
}

impl CompactionEngine {
    pub fn new(ctx: Arc<MaintenanceContext>) -> Self {
        Self { ctx }
    }

    /// Pick the level to compact: the lowest level below `max_shard_level`
    /// holding at least `compaction_threshold` shards. Shards already at
    /// `max_shard_level` are never promoted.
    fn select_level(&self, manifest: &Manifest) -> Option<u8> {
        let threshold = self.ctx.options.compaction_threshold;
        (0..self.ctx.options.max_shard_level)
            .find(|level| manifest.shards_at_level(*level).len() >= threshold)
    }

    /// Oldest cluster of shards at `level`, in time order, capped to keep
    /// the step bounded. Oversized shards (estimated above twice the target
    /// size) are left alone; they are already compact.
    async fn select_group(
        &self,
        manifest: &Manifest,
        level: u8,
    ) -> DbResult<Vec<ShardFileInfo>> {
        let size_cap = self.ctx.options.desired_shard_size * 2;
        let mut shards: Vec<ShardFileInfo> = Vec::new();
        for info in manifest.shards_at_level(level) {
            let header = self.ctx.reader.open_header(&info.filename).await?;
            let estimated: usize = header.entries.iter().map(|e| e.len as usize).sum();
            if estimated <= size_cap {
                shards.push(info.clone());
            } else {
                debug!(filename = %info.filename, estimated, "skipping oversized shard");
            }
        }
        shards.sort_by(|a, b| {
            (a.range.min, a.filename.as_str()).cmp(&(b.range.min, b.filename.as_str()))
        });
        shards.truncate(MAX_GROUP_SIZE);
        Ok(shards)
    }

    /// Merge the group's documents: one winner per id, expired tombstones
    /// dropped entirely, live tombstones preserved.
    async fn merge_group(
        &self,
        group: &[ShardFileInfo],
    ) -> DbResult<(Vec<Document>, usize)> {
        let cutoff = retention_cutoff();
        let mut winners: HashMap<String, (Document, String)> = HashMap::new();
        for info in group {
            let header = self.ctx.reader.open_header(&info.filename).await?;
            let documents = self
                .ctx
                .reader
                .stream_documents(&info.filename, &header)
                .await?;
            for doc in documents {
                match winners.get(&doc.id) {
                    Some((current, current_shard))
                        if compare_versions(current, current_shard, &doc, &info.filename)
                            .is_ge() => {}
                    _ => {
                        winners.insert(doc.id.clone(), (doc, info.filename.clone()));
                    }
                }
            }
        }

        let mut dropped = 0;
        let mut merged: Vec<Document> = winners
            .into_values()
            .filter_map(|(doc, _)| {
                if doc.del && doc.at < cutoff {
                    dropped += 1;
                    None
                } else {
                    Some(doc)
                }
            })
            .collect();
        merged.sort_by(batch_order);
        Ok((merged, dropped))
    }

    /// Run at most one compaction step. Returns `None` when no level is
    /// over its threshold.
    pub async fn run_step(&self) -> DbResult<Option<CompactionReport>> {
        let manifest = self.ctx.manifest.snapshot().await;
        let Some(level) = self.select_level(&manifest) else {
            return Ok(None);
        };
        let group = self.select_group(&manifest, level).await?;
        if group.len() < 2 {
            return Ok(None);
        }
        let filenames: Vec<String> = group.iter().map(|s| s.filename.clone()).collect();
        let (merged, dropped) = self.merge_group(&group).await?;

        let target_level = level + 1;
        let outcome = self
            .ctx
            .manifest
            .update(
                |m0| {
                    // The group must survive concurrent commits intact;
                    // otherwise skip this cycle and let the next one retry.
                    if !filenames.iter().all(|f| m0.has_shard(f)) {
                        debug!("compaction group changed under us, skipping step");
                        return Ok(ManifestUpdate::default());
                    }
                    let added = if merged.is_empty() {
                        Vec::new()
                    } else {
                        vec![PreparedShard {
                            documents: merged.clone(),
                            level: target_level,
                        }]
                    };
                    Ok(ManifestUpdate {
                        added_shards: added,
                        removed_shards: filenames.clone(),
                        ..Default::default()
                    })
                },
                || async { Ok(()) },
            )
            .await?;

        if outcome.manifest.has_shard(&filenames[0]) {
            // The mutator found the group changed and skipped the swap.
            return Ok(None);
        }

        let output = outcome.added.first().map(|w| {
            self.ctx
                .reader
                .cache()
                .insert(w.info.filename.clone(), w.header.clone());
            w.info.filename.clone()
        });
        info!(
            from_level = level,
            inputs = filenames.len(),
            merged = merged.len(),
            dropped_tombstones = dropped,
            "compaction step complete"
        );
        Ok(Some(CompactionReport {
            from_level: level,
            inputs: filenames,
            output,
            merged_documents: merged.len(),
            dropped_tombstones: dropped,
        }))
    }
}
