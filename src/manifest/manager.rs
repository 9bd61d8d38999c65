//! Manifest manager
//!
//! Loads the root manifest, hands out snapshots, and funnels every mutation
//! through an optimistic compare-and-swap loop: mutate a snapshot,
//! materialize any new shards, sign, PUT with a precondition, and on
//! conflict let the caller pull remote changes before retrying. The manifest
//! on the store is always a complete predecessor or successor, never a
//! partial write.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{CryptoBlock, Manifest, MANIFEST_NAME};
use crate::crypto::CryptoManager;
use crate::error::{DbError, DbResult};
use crate::shard::{write_shard, PreparedShard, WrittenShard};
use crate::store::{content_etag, Precondition, StorageBackend};

/// Parallelism bound for shard materialization within one update.
const MATERIALIZE_CONCURRENCY: usize = 4;

/// Mutation descriptor produced by an update's mutator.
#[derive(Default)]
pub struct ManifestUpdate {
    /// New `last_sequence`, must be monotonically non-decreasing
    pub last_sequence: Option<u64>,
    /// Replacement crypto block (registry changes, key rotation)
    pub crypto: Option<CryptoBlock>,
    /// Shard batches to materialize and reference
    pub added_shards: Vec<PreparedShard>,
    /// Filenames to drop from the shard list (compaction, vacuum)
    pub removed_shards: Vec<String>,
}

impl ManifestUpdate {
    pub fn is_noop(&self) -> bool {
        self.last_sequence.is_none()
            && self.crypto.is_none()
            && self.added_shards.is_empty()
            && self.removed_shards.is_empty()
    }
}

/// Result of a successful CAS commit.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub manifest: Manifest,
    /// Shards materialized by this update, in `added_shards` order
    pub added: Vec<WrittenShard>,
    pub attempts: u32,
}

struct Snapshot {
    manifest: Manifest,
    /// Content hash of the manifest object on the store; `None` until the
    /// first commit of a fresh database
    etag: Option<String>,
}

pub struct ManifestManager {
    store: Arc<dyn StorageBackend>,
    crypto: Arc<CryptoManager>,
    retry_budget: u32,
    state: RwLock<Snapshot>,
}

impl ManifestManager {
    pub fn new(
        store: Arc<dyn StorageBackend>,
        crypto: Arc<CryptoManager>,
        retry_budget: u32,
    ) -> Self {
        Self {
            store,
            crypto,
            retry_budget: retry_budget.max(1),
            state: RwLock::new(Snapshot {
                manifest: Manifest::empty(),
                etag: None,
            }),
        }
    }

    /// Fetch the manifest from the store, or seed an empty one with a fresh
    /// uuid when the database does not exist yet. Signature verification is
    /// deferred to the caller: the crypto block inside the manifest is what
    /// unlocks the keys needed to verify it.
    pub async fn load(&self) -> DbResult<Manifest> {
        match self.store.get(MANIFEST_NAME, None).await {
            Ok(bytes) => {
                let manifest = Manifest::decode(&bytes)?;
                let mut state = self.state.write().await;
                state.etag = Some(content_etag(&bytes));
                state.manifest = manifest.clone();
                info!(uuid = %manifest.uuid, shards = manifest.shard_files.len(), "loaded manifest");
                Ok(manifest)
            }
            Err(DbError::NotFound(_)) => {
                let manifest = Manifest::empty();
                let mut state = self.state.write().await;
                state.etag = None;
                state.manifest = manifest.clone();
                info!(uuid = %manifest.uuid, "seeded empty manifest");
                Ok(manifest)
            }
            Err(e) => Err(e),
        }
    }

    /// Current local snapshot.
    pub async fn snapshot(&self) -> Manifest {
        self.state.read().await.manifest.clone()
    }

    /// Install the crypto envelope on a freshly seeded database. The block
    /// reaches the store with the first committed manifest.
    pub async fn seed_crypto(&self, block: CryptoBlock) -> DbResult<()> {
        let mut state = self.state.write().await;
        if state.etag.is_some() || state.manifest.crypto.is_some() {
            return Err(DbError::InvariantViolation(
                "crypto can only be seeded on a fresh database".to_string(),
            ));
        }
        state.manifest.crypto = Some(block);
        Ok(())
    }

    /// Re-fetch the remote manifest. Returns `Some` when a newer manifest
    /// was observed and adopted, `None` when unchanged. A manifest failing
    /// signature verification is not adopted and surfaces as an error.
    pub async fn refresh(&self) -> DbResult<Option<Manifest>> {
        let bytes = match self.store.get(MANIFEST_NAME, None).await {
            Ok(bytes) => bytes,
            Err(DbError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let etag = content_etag(&bytes);
        {
            let state = self.state.read().await;
            if state.etag.as_deref() == Some(etag.as_str()) {
                return Ok(None);
            }
        }
        let manifest = Manifest::decode(&bytes)?;
        self.crypto.verify_manifest(&manifest)?;

        let mut state = self.state.write().await;
        // A provisional (never committed) snapshot adopts whatever is
        // remote; a committed one must stay the same database.
        if state.etag.is_some() && manifest.uuid != state.manifest.uuid {
            return Err(DbError::InvariantViolation(format!(
                "remote manifest uuid {} does not match {}",
                manifest.uuid, state.manifest.uuid
            )));
        }
        if manifest.last_sequence < state.manifest.last_sequence {
            return Err(DbError::InvariantViolation(format!(
                "remote lastSequence {} regressed below {}",
                manifest.last_sequence, state.manifest.last_sequence
            )));
        }
        state.etag = Some(etag);
        state.manifest = manifest.clone();
        debug!(uuid = %manifest.uuid, last_sequence = manifest.last_sequence, "adopted remote manifest");
        Ok(Some(manifest))
    }

    /// Conditional PUT honoring the snapshot's etag, with a fetch-then-
    /// compare fallback for stores without native CAS.
    async fn cas_put(&self, bytes: &[u8], expected: &Option<String>) -> DbResult<String> {
        if self.store.metadata().supports_cas {
            let precondition = match expected {
                Some(etag) => Precondition::IfMatch(etag.clone()),
                None => Precondition::NotExists,
            };
            return self.store.put(MANIFEST_NAME, bytes, precondition).await;
        }

        // Fallback: verify the predecessor, write blind, then read back and
        // compare. A lost update shows up as a hash mismatch.
        let current = match self.store.get(MANIFEST_NAME, None).await {
            Ok(current) => Some(content_etag(&current)),
            Err(DbError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        if &current != expected {
            return Err(DbError::Conflict(
                "manifest changed before unconditional put".to_string(),
            ));
        }
        self.store.put(MANIFEST_NAME, bytes, Precondition::None).await?;
        let readback = self.store.get(MANIFEST_NAME, None).await?;
        let etag = content_etag(bytes);
        if content_etag(&readback) != etag {
            return Err(DbError::Conflict(
                "manifest overwritten concurrently after put".to_string(),
            ));
        }
        Ok(etag)
    }

    /// The compare-and-swap loop.
    ///
    /// `mutate` maps the current snapshot to an [`ManifestUpdate`]; it runs
    /// once per attempt against a fresh snapshot. `refetch` is invoked after
    /// a conflict to pull remote changes into local state before the retry.
    pub async fn update<M, R, RFut>(
        &self,
        mut mutate: M,
        mut refetch: R,
    ) -> DbResult<UpdateOutcome>
    where
        M: FnMut(&Manifest) -> DbResult<ManifestUpdate>,
        R: FnMut() -> RFut,
        RFut: Future<Output = DbResult<()>>,
    {
        for attempt in 1..=self.retry_budget {
            let (m0, etag0) = {
                let state = self.state.read().await;
                (state.manifest.clone(), state.etag.clone())
            };
            let update = mutate(&m0)?;
            if update.is_noop() {
                return Ok(UpdateOutcome {
                    manifest: m0,
                    added: Vec::new(),
                    attempts: attempt,
                });
            }

            let written: Vec<WrittenShard> = stream::iter(update.added_shards)
                .map(|prepared| {
                    let store = self.store.clone();
                    let crypto = self.crypto.clone();
                    async move { write_shard(store.as_ref(), crypto.as_ref(), prepared).await }
                })
                .buffered(MATERIALIZE_CONCURRENCY)
                .try_collect()
                .await?;

            let mut m1 = m0.clone();
            if let Some(last_sequence) = update.last_sequence {
                if last_sequence < m0.last_sequence {
                    return Err(DbError::InvariantViolation(format!(
                        "lastSequence must not regress: {} < {}",
                        last_sequence, m0.last_sequence
                    )));
                }
                m1.last_sequence = last_sequence;
            }
            if let Some(crypto_block) = update.crypto {
                m1.crypto = Some(crypto_block);
            }
            if !update.removed_shards.is_empty() {
                m1.shard_files
                    .retain(|s| !update.removed_shards.contains(&s.filename));
            }
            m1.shard_files.extend(written.iter().map(|w| w.info.clone()));

            let m1 = self.crypto.finalize_manifest(m1)?;
            let bytes = m1.encode()?;

            match self.cas_put(&bytes, &etag0).await {
                Ok(etag) => {
                    let mut state = self.state.write().await;
                    state.manifest = m1.clone();
                    state.etag = Some(etag);
                    debug!(attempt, last_sequence = m1.last_sequence, "committed manifest");
                    return Ok(UpdateOutcome {
                        manifest: m1,
                        added: written,
                        attempts: attempt,
                    });
                }
                Err(DbError::Conflict(reason)) => {
                    warn!(attempt, %reason, "manifest CAS conflict, refetching");
                    // The shards written for this attempt are orphans now;
                    // delete them eagerly rather than waiting for GC.
                    for shard in &written {
                        if let Err(e) = self.store.delete(&shard.info.filename).await {
                            if !matches!(e, DbError::NotFound(_)) {
                                warn!(filename = %shard.info.filename, error = %e, "orphan cleanup failed");
                            }
                        }
                    }
                    refetch().await?;
                    self.refresh().await?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(DbError::SyncConflictExhausted {
            attempts: self.retry_budget,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DeviceIdentity;
    use crate::document::Document;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn plaintext_crypto() -> Arc<CryptoManager> {
        Arc::new(CryptoManager::plaintext(DeviceIdentity {
            device_id: "d".to_string(),
            device_name: "d".to_string(),
        }))
    }

    fn manager(store: &MemoryStore) -> ManifestManager {
        ManifestManager::new(Arc::new(store.clone()), plaintext_crypto(), 8)
    }

    #[tokio::test]
    async fn test_load_seeds_empty_manifest() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        let manifest = manager.load().await.unwrap();
        assert_eq!(manifest.last_sequence, 0);
        assert!(manifest.shard_files.is_empty());
        // Nothing was written to the store yet
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_first_commit_uses_not_exists() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        manager.load().await.unwrap();

        let outcome = manager
            .update(
                |_m0| {
                    Ok(ManifestUpdate {
                        last_sequence: Some(1),
                        added_shards: vec![PreparedShard::level0(vec![
                            Document::new("a", json!({"x": 1})).with_at(1).with_seq(1),
                        ])],
                        ..Default::default()
                    })
                },
                || async { Ok(()) },
            )
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.manifest.last_sequence, 1);
        assert_eq!(outcome.manifest.shard_files.len(), 1);
        assert!(store.get(MANIFEST_NAME, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_conflict_triggers_refetch_and_retry() {
        let store = MemoryStore::new();
        let local = manager(&store);
        let remote = manager(&store);
        local.load().await.unwrap();
        remote.load().await.unwrap();

        // Remote commits first; local still holds the empty snapshot.
        remote
            .update(
                |_| {
                    Ok(ManifestUpdate {
                        last_sequence: Some(5),
                        ..Default::default()
                    })
                },
                || async { Ok(()) },
            )
            .await
            .unwrap();

        let refetches = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = refetches.clone();
        let outcome = local
            .update(
                |m0| {
                    Ok(ManifestUpdate {
                        last_sequence: Some(m0.last_sequence + 1),
                        ..Default::default()
                    })
                },
                move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(())
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
        assert_eq!(refetches.load(std::sync::atomic::Ordering::SeqCst), 1);
        // The retry re-based on the remote commit
        assert_eq!(outcome.manifest.last_sequence, 6);
    }

    #[tokio::test]
    async fn test_conflict_cleans_up_orphan_shards() {
        let store = MemoryStore::new();
        let local = manager(&store);
        let remote = manager(&store);
        local.load().await.unwrap();
        remote.load().await.unwrap();

        remote
            .update(
                |_| {
                    Ok(ManifestUpdate {
                        last_sequence: Some(1),
                        ..Default::default()
                    })
                },
                || async { Ok(()) },
            )
            .await
            .unwrap();

        local
            .update(
                |m0| {
                    Ok(ManifestUpdate {
                        last_sequence: Some(m0.last_sequence + 1),
                        added_shards: vec![PreparedShard::level0(vec![
                            Document::new("a", json!({})).with_at(1).with_seq(1),
                        ])],
                        ..Default::default()
                    })
                },
                || async { Ok(()) },
            )
            .await
            .unwrap();

        // Exactly one manifest and one shard remain: the loser's first
        // attempt shard was deleted on conflict.
        let shards = store.list("shards/").await.unwrap();
        assert_eq!(shards.len(), 1);
    }

    /// Store whose writes always lose the race, for exhaustion tests.
    struct AlwaysConflict(MemoryStore);

    #[async_trait::async_trait]
    impl StorageBackend for AlwaysConflict {
        async fn list(&self, prefix: &str) -> DbResult<Vec<String>> {
            self.0.list(prefix).await
        }
        async fn get(
            &self,
            name: &str,
            range: Option<crate::store::ByteRange>,
        ) -> DbResult<Vec<u8>> {
            self.0.get(name, range).await
        }
        async fn put(
            &self,
            name: &str,
            _bytes: &[u8],
            _precondition: Precondition,
        ) -> DbResult<String> {
            Err(DbError::Conflict(format!("simulated race on '{}'", name)))
        }
        async fn delete(&self, name: &str) -> DbResult<()> {
            self.0.delete(name).await
        }
        fn metadata(&self) -> crate::store::StoreMetadata {
            self.0.metadata()
        }
        fn config(&self) -> crate::store::StoreConfig {
            self.0.config()
        }
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface() {
        let store = AlwaysConflict(MemoryStore::new());
        let local = ManifestManager::new(Arc::new(store), plaintext_crypto(), 2);
        local.load().await.unwrap();

        let refetches = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = refetches.clone();
        let outcome = local
            .update(
                |m0| {
                    Ok(ManifestUpdate {
                        last_sequence: Some(m0.last_sequence + 1),
                        ..Default::default()
                    })
                },
                move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(())
                    }
                },
            )
            .await;

        match outcome {
            Err(DbError::SyncConflictExhausted { attempts }) => assert_eq!(attempts, 2),
            other => panic!("expected exhaustion, got {:?}", other.map(|o| o.manifest)),
        }
        assert_eq!(refetches.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_last_sequence_may_not_regress() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        manager.load().await.unwrap();
        manager
            .update(
                |_| {
                    Ok(ManifestUpdate {
                        last_sequence: Some(5),
                        ..Default::default()
                    })
                },
                || async { Ok(()) },
            )
            .await
            .unwrap();

        let err = manager
            .update(
                |_| {
                    Ok(ManifestUpdate {
                        last_sequence: Some(3),
                        ..Default::default()
                    })
                },
                || async { Ok(()) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_removed_shards_leave_the_manifest() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        manager.load().await.unwrap();

        let outcome = manager
            .update(
                |_| {
                    Ok(ManifestUpdate {
                        added_shards: vec![PreparedShard::level0(vec![
                            Document::new("a", json!({})).with_at(1).with_seq(1),
                        ])],
                        ..Default::default()
                    })
                },
                || async { Ok(()) },
            )
            .await
            .unwrap();
        let filename = outcome.added[0].info.filename.clone();

        let outcome = manager
            .update(
                |_| {
                    Ok(ManifestUpdate {
                        removed_shards: vec![filename.clone()],
                        ..Default::default()
                    })
                },
                || async { Ok(()) },
            )
            .await
            .unwrap();
        assert!(outcome.manifest.shard_files.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_detects_remote_commit() {
        let store = MemoryStore::new();
        let a = manager(&store);
        let b = manager(&store);
        a.load().await.unwrap();
        b.load().await.unwrap();

        assert!(a.refresh().await.unwrap().is_none());

        b.update(
            |_| {
                Ok(ManifestUpdate {
                    last_sequence: Some(9),
                    ..Default::default()
                })
            },
            || async { Ok(()) },
        )
        .await
        .unwrap();

        let adopted = a.refresh().await.unwrap().unwrap();
        assert_eq!(adopted.last_sequence, 9);
        // A second refresh with no remote change is a no-op
        assert!(a.refresh().await.unwrap().is_none());
    }
}
