//! Garbage collector
//!
//! Deletes shard objects that no committed manifest references anymore:
//! leftovers of lost CAS races and inputs of past compactions. A candidate
//! is only deleted after it has been observed unreferenced for a grace
//! period, so a sync that just committed a superseding manifest on another
//! device is never raced.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::MaintenanceContext;
use crate::error::{DbError, DbResult};
use crate::manifest::SHARD_PREFIX;

#[derive(Debug, Clone, Default)]
pub struct GcReport {
    /// Objects deleted this run
    pub deleted: Vec<String>,
    /// Unreferenced objects still inside the grace window
    pub pending: usize,
}

pub struct GcEngine {
    ctx: Arc<MaintenanceContext>,
    /// When each unreferenced object was first observed
    first_seen: Mutex<HashMap<String, Instant>>,
}

impl GcEngine {
    pub fn new(ctx: Arc<MaintenanceContext>) -> Self {
        Self {
            ctx,
            first_seen: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(&self) -> DbResult<GcReport> {
        let manifest = self.ctx.manifest.snapshot().await;
        let listed = self.ctx.store.list(SHARD_PREFIX).await?;
        let grace = self.ctx.options.gc_grace;
        let now = Instant::now();

        let mut report = GcReport::default();
        let mut to_delete = Vec::new();
        {
            let mut first_seen = self.first_seen.lock();
            // Forget ledger entries that are referenced again or gone
            first_seen
                .retain(|name, _| listed.contains(name) && !manifest.has_shard(name));

            for name in &listed {
                if manifest.has_shard(name) {
                    continue;
                }
                let seen = *first_seen.entry(name.clone()).or_insert(now);
                if now.duration_since(seen) >= grace {
                    to_delete.push(name.clone());
                    first_seen.remove(name);
                } else {
                    report.pending += 1;
                }
            }
        }

        for name in to_delete {
            match self.ctx.store.delete(&name).await {
                Ok(()) => {
                    debug!(filename = %name, "deleted orphaned shard");
                    report.deleted.push(name);
                }
                // Another device's collector got there first
                Err(DbError::NotFound(_)) => report.deleted.push(name),
                Err(e) => return Err(e),
            }
        }

        if !report.deleted.is_empty() {
            info!(deleted = report.deleted.len(), pending = report.pending, "gc complete");
        }
        Ok(report)
    }
}
