//! Client orchestration
//!
//! [`SealClient`] wires the managers and engines together and drives them
//! through a small state machine: `idle → pending` on local changes,
//! `pending → syncing` when a tick starts, back to `idle` (or `pending`,
//! when more changes queued up meanwhile) when it finishes. A periodic
//! timer can fire ticks; explicit `sync()` calls coalesce onto the
//! in-flight tick.

pub mod events;

pub use events::{ClientEvent, ClientState, EventBus};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::DatabaseBackend;
use crate::crypto::{CryptoManager, DeviceIdentity};
use crate::error::{DbError, DbResult, ErrorKind};
use crate::maintenance::{CompactionEngine, GcEngine, MaintenanceContext, VacuumEngine};
use crate::manifest::{Manifest, ManifestManager, ManifestUpdate, MANIFEST_NAME};
use crate::options::SealOptions;
use crate::shard::{HeaderCache, ShardReader};
use crate::store::StorageBackend;
use crate::sync::{SyncContext, SyncEngine, SyncReport};

/// How a client obtains the master key at `init`.
#[derive(Clone)]
pub enum Unlock {
    /// Unencrypted database
    Plaintext,
    /// Unlock an existing encrypted database with the master password
    Password(String),
    /// Quick-unlock with the local device's registered PIN
    DevicePin(String),
    /// Create a new encrypted database; optionally register this device
    /// for quick-unlock
    Create {
        password: String,
        pin: Option<String>,
    },
}

type SharedSync = Shared<BoxFuture<'static, Result<SyncReport, (ErrorKind, String)>>>;

struct ClientInner {
    options: SealOptions,
    backend: Arc<dyn DatabaseBackend>,
    crypto: Arc<CryptoManager>,
    manifest: Arc<ManifestManager>,
    reader: Arc<ShardReader>,
    sync_engine: SyncEngine,
    compaction: CompactionEngine,
    gc: GcEngine,
    vacuum: VacuumEngine,
    events: EventBus,
    state: Mutex<ClientState>,
    destroyed: AtomicBool,
    in_flight: tokio::sync::Mutex<Option<SharedSync>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientInner {
    fn set_state(&self, next: ClientState) {
        let mut state = self.state.lock();
        if *state != next {
            *state = next;
            self.events.emit(ClientEvent::StateChange(next));
        }
    }

    fn state(&self) -> ClientState {
        *self.state.lock()
    }

    fn mark_pending(&self) {
        let mut state = self.state.lock();
        if *state == ClientState::Idle {
            *state = ClientState::Pending;
            self.events.emit(ClientEvent::StateChange(ClientState::Pending));
        }
    }

    /// One orchestrated tick: events, the sync engine, then maintenance.
    async fn run_sync_tick(self: Arc<Self>) -> Result<SyncReport, (ErrorKind, String)> {
        let was_pending = self.state() == ClientState::Pending;
        self.set_state(ClientState::Syncing);
        self.events.emit(ClientEvent::SyncStart { was_pending });

        match self.sync_engine.sync_once().await {
            Ok(report) => {
                // Maintenance piggybacks on a successful tick: at most one
                // compaction step, and a vacuum cycle when the tombstone
                // load crossed the threshold. Failures are logged, not
                // surfaced; the sync itself succeeded.
                if let Err(e) = self.compaction.run_step().await {
                    warn!(error = %e, "compaction step failed");
                }
                match self.vacuum.should_run().await {
                    Ok(true) => {
                        if let Err(e) = self.vacuum.run().await {
                            warn!(error = %e, "vacuum cycle failed");
                        }
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "vacuum trigger check failed"),
                }

                self.events.emit(ClientEvent::SyncComplete);
                let still_pending = match self.backend.pending_ids().await {
                    Ok(ids) => !ids.is_empty(),
                    Err(_) => false,
                };
                self.set_state(if still_pending {
                    ClientState::Pending
                } else {
                    ClientState::Idle
                });
                Ok(report)
            }
            Err(e) => {
                let kind = e.kind();
                let message = e.to_string();
                self.events.emit(ClientEvent::SyncError {
                    kind,
                    message: message.clone(),
                });
                self.set_state(ClientState::Idle);
                Err((kind, message))
            }
        }
    }
}

/// Replica client of one logical database.
pub struct SealClient {
    inner: Arc<ClientInner>,
}

impl SealClient {
    /// Open (or create) a database on `store`, binding `backend` as the
    /// local document store.
    pub async fn init(
        store: Arc<dyn StorageBackend>,
        backend: Arc<dyn DatabaseBackend>,
        identity: DeviceIdentity,
        unlock: Unlock,
        options: SealOptions,
    ) -> DbResult<Self> {
        let options = options.normalize();

        // Peek at the manifest to pick the crypto mode before the managers
        // exist; the crypto block inside it is what unlocks the keys.
        let existing = match store.get(MANIFEST_NAME, None).await {
            Ok(bytes) => Some(Manifest::decode(&bytes)?),
            Err(DbError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        // Credentials must match what the database actually is
        if let Some(m) = &existing {
            match (&unlock, m.is_encrypted()) {
                (Unlock::Plaintext, true) => {
                    return Err(DbError::AuthFailure(
                        "database is encrypted, credentials required".to_string(),
                    ))
                }
                (Unlock::Password(_), false)
                | (Unlock::DevicePin(_), false)
                | (Unlock::Create { .. }, false) => {
                    return Err(DbError::InvariantViolation(
                        "database is not encrypted".to_string(),
                    ))
                }
                _ => {}
            }
        }

        let encrypted = match &existing {
            Some(m) => m.is_encrypted(),
            None => !matches!(unlock, Unlock::Plaintext),
        };
        let crypto = Arc::new(if encrypted {
            CryptoManager::locked(identity, options.kdf_iterations)
        } else {
            CryptoManager::plaintext(identity)
        });

        // Crypto block to seed into a brand-new encrypted database, and a
        // PIN registration deferred until the client can commit it
        let mut seeded_crypto = None;
        let mut register_pin: Option<String> = None;
        match (&existing, &unlock) {
            (_, Unlock::Plaintext) => {}
            (None, Unlock::Create { password, pin }) => {
                let mut block = crypto.initialize_crypto(password).await?;
                if let Some(pin) = pin {
                    block = crypto.register_device(&block, pin).await?;
                }
                seeded_crypto = Some(block);
            }
            (None, Unlock::Password(_)) | (None, Unlock::DevicePin(_)) => {
                return Err(DbError::NotFound(
                    "database does not exist, use Unlock::Create".to_string(),
                ));
            }
            (Some(m), Unlock::Password(password))
            | (Some(m), Unlock::Create { password, pin: None }) => {
                let block = m.crypto.as_ref().expect("encrypted checked above");
                crypto.unlock_with_master(block, password).await?;
                crypto.verify_manifest(m)?;
            }
            (Some(m), Unlock::Create { password, pin: Some(pin) }) => {
                let block = m.crypto.as_ref().expect("encrypted checked above");
                crypto.unlock_with_master(block, password).await?;
                crypto.verify_manifest(m)?;
                if !block.device_key.contains_key(&crypto.identity().device_id) {
                    register_pin = Some(pin.clone());
                }
            }
            (Some(m), Unlock::DevicePin(pin)) => {
                let block = m.crypto.as_ref().expect("encrypted checked above");
                let device_id = crypto.identity().device_id.clone();
                crypto.unlock_with_device(block, &device_id, pin).await?;
                crypto.verify_manifest(m)?;
            }
        }

        let manifest = Arc::new(ManifestManager::new(
            store.clone(),
            crypto.clone(),
            options.sync_retry_budget,
        ));
        let loaded = manifest.load().await?;
        if loaded.crypto.is_some() {
            // The peeked manifest was verified above; re-check in case the
            // store served a different object between the two reads.
            crypto.verify_manifest(&loaded)?;
        }
        if let Some(block) = seeded_crypto {
            manifest.seed_crypto(block).await?;
        }

        backend.initialize(&loaded.uuid).await?;

        let cache = Arc::new(HeaderCache::new(
            loaded.uuid.clone(),
            options.header_cache_capacity,
        ));
        let reader = Arc::new(ShardReader::new(
            store.clone(),
            crypto.clone(),
            cache,
            options.read_concurrency,
        ));

        let sync_engine = SyncEngine::new(Arc::new(SyncContext {
            store: store.clone(),
            backend: backend.clone(),
            manifest: manifest.clone(),
            reader: reader.clone(),
            crypto: crypto.clone(),
            options: options.clone(),
        }));
        let maintenance = Arc::new(MaintenanceContext {
            store: store.clone(),
            manifest: manifest.clone(),
            reader: reader.clone(),
            options: options.clone(),
        });

        let inner = Arc::new(ClientInner {
            options: options.clone(),
            backend: backend.clone(),
            crypto: crypto.clone(),
            manifest,
            reader,
            sync_engine,
            compaction: CompactionEngine::new(maintenance.clone()),
            gc: GcEngine::new(maintenance.clone()),
            vacuum: VacuumEngine::new(maintenance),
            events: EventBus::new(),
            state: Mutex::new(ClientState::Idle),
            destroyed: AtomicBool::new(false),
            in_flight: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });
        let client = Self { inner };

        // Deferred PIN registration for an existing database
        if let Some(pin) = register_pin {
            client.register_device(&pin).await?;
        }

        // Refresh this device's lastUsedAt, rate-limited; best effort.
        if client.inner.crypto.is_unlocked() && !client.inner.crypto.is_plaintext() {
            if let Err(e) = client.touch_device().await {
                warn!(error = %e, "device touch failed");
            }
        }

        if options.gc_on_start {
            if let Err(e) = client.inner.gc.run().await {
                warn!(error = %e, "startup gc failed");
            }
        }
        if options.vacuum_on_start {
            if let Err(e) = client.inner.vacuum.run().await {
                warn!(error = %e, "startup vacuum failed");
            }
        }

        client.spawn_replication_task();
        if options.timer_enabled() {
            client.spawn_timer_task();
        }

        info!(uuid = %loaded.uuid, "client initialized");
        Ok(client)
    }

    fn spawn_replication_task(&self) {
        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let mut rx = self.inner.backend.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(_) => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.mark_pending();
                    }
                    Err(RecvError::Lagged(_)) => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.mark_pending();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    fn spawn_timer_task(&self) {
        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.options.sync_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.destroyed.load(Ordering::SeqCst)
                    || inner.state() == ClientState::Syncing
                {
                    continue;
                }
                let client = SealClient { inner };
                if let Err(e) = client.sync().await {
                    debug!(error = %e, "periodic sync failed");
                }
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    fn ensure_alive(&self) -> DbResult<()> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(DbError::Destroyed);
        }
        Ok(())
    }

    /// Subscribe to client events; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    /// Current manifest snapshot.
    pub async fn manifest(&self) -> Manifest {
        self.inner.manifest.snapshot().await
    }

    /// Run a sync tick. Re-entrant calls while one is in flight await the
    /// same tick instead of starting another.
    pub async fn sync(&self) -> DbResult<SyncReport> {
        self.ensure_alive()?;
        let shared = {
            let mut guard = self.inner.in_flight.lock().await;
            match &*guard {
                Some(shared) => shared.clone(),
                None => {
                    let inner = self.inner.clone();
                    let shared: SharedSync = inner.run_sync_tick().boxed().shared();
                    *guard = Some(shared.clone());
                    shared
                }
            }
        };
        let result = shared.clone().await;
        {
            // Only clear our own future; a newer tick may already occupy
            // the slot.
            let mut guard = self.inner.in_flight.lock().await;
            if guard.as_ref().is_some_and(|current| current.ptr_eq(&shared)) {
                *guard = None;
            }
        }
        result.map_err(|(kind, message)| DbError::from_parts(kind, message))
    }

    /// Run the garbage collector now.
    pub async fn gc(&self) -> DbResult<crate::maintenance::GcReport> {
        self.ensure_alive()?;
        self.inner.gc.run().await
    }

    /// Run a vacuum cycle now.
    pub async fn vacuum(&self) -> DbResult<crate::maintenance::VacuumReport> {
        self.ensure_alive()?;
        self.inner.vacuum.run().await
    }

    async fn commit_crypto<F>(&self, merge: F) -> DbResult<()>
    where
        F: Fn(&Manifest) -> DbResult<crate::manifest::CryptoBlock>,
    {
        self.inner
            .manifest
            .update(
                |m0| {
                    Ok(ManifestUpdate {
                        crypto: Some(merge(m0)?),
                        ..Default::default()
                    })
                },
                || async { Ok(()) },
            )
            .await
            .map(|_| ())
    }

    fn current_block(manifest: &Manifest) -> DbResult<&crate::manifest::CryptoBlock> {
        manifest.crypto.as_ref().ok_or_else(|| {
            DbError::InvariantViolation("database is not encrypted".to_string())
        })
    }

    /// Register the local device for quick-unlock and commit the registry.
    pub async fn register_device(&self, pin: &str) -> DbResult<()> {
        self.ensure_alive()?;
        let snapshot = self.inner.manifest.snapshot().await;
        let block = Self::current_block(&snapshot)?;
        let updated = self.inner.crypto.register_device(block, pin).await?;
        let device_id = self.inner.crypto.identity().device_id.clone();
        let entry = updated.device_key[&device_id].clone();
        self.commit_crypto(move |m0| {
            let mut block = Self::current_block(m0)?.clone();
            block.device_key.insert(device_id.clone(), entry.clone());
            Ok(block)
        })
        .await
    }

    /// Remove a device from the registry and commit.
    pub async fn remove_device(&self, device_id: &str) -> DbResult<()> {
        self.ensure_alive()?;
        let target = device_id.to_string();
        // Validate against the current snapshot first for a clean error
        let snapshot = self.inner.manifest.snapshot().await;
        self.inner
            .crypto
            .remove_device(Self::current_block(&snapshot)?, &target)?;
        self.commit_crypto(move |m0| {
            let mut block = Self::current_block(m0)?.clone();
            block.device_key.remove(&target);
            Ok(block)
        })
        .await
    }

    /// Change the master password and commit the re-wrapped key.
    pub async fn rotate_master(&self, old_password: &str, new_password: &str) -> DbResult<()> {
        self.ensure_alive()?;
        let snapshot = self.inner.manifest.snapshot().await;
        let block = Self::current_block(&snapshot)?;
        let rotated = self
            .inner
            .crypto
            .rotate_master(block, old_password, new_password)
            .await?;
        self.commit_crypto(move |m0| {
            let mut block = Self::current_block(m0)?.clone();
            block.master_key = rotated.master_key.clone();
            block.master_key_salt = rotated.master_key_salt.clone();
            Ok(block)
        })
        .await
    }

    /// Change the local device's quick-unlock PIN and commit.
    pub async fn rotate_device_pin(
        &self,
        master_password: &str,
        new_pin: &str,
    ) -> DbResult<()> {
        self.ensure_alive()?;
        let snapshot = self.inner.manifest.snapshot().await;
        let block = Self::current_block(&snapshot)?;
        let rotated = self
            .inner
            .crypto
            .rotate_device_pin(block, master_password, new_pin)
            .await?;
        let device_id = self.inner.crypto.identity().device_id.clone();
        let entry = rotated.device_key[&device_id].clone();
        self.commit_crypto(move |m0| {
            let mut block = Self::current_block(m0)?.clone();
            block.device_key.insert(device_id.clone(), entry.clone());
            Ok(block)
        })
        .await
    }

    /// Rate-limited refresh of the local device's `lastUsedAt`.
    async fn touch_device(&self) -> DbResult<()> {
        let snapshot = self.inner.manifest.snapshot().await;
        let Some(block) = snapshot.crypto.as_ref() else {
            return Ok(());
        };
        let Some(touched) = self.inner.crypto.touch_current_device(block) else {
            return Ok(());
        };
        let device_id = self.inner.crypto.identity().device_id.clone();
        let entry = touched.device_key[&device_id].clone();
        self.commit_crypto(move |m0| {
            let mut block = Self::current_block(m0)?.clone();
            block.device_key.insert(device_id.clone(), entry.clone());
            Ok(block)
        })
        .await
    }

    /// Snapshot counters for embedders.
    pub async fn stats(&self) -> DbResult<ClientStats> {
        self.ensure_alive()?;
        let manifest = self.inner.manifest.snapshot().await;
        let mut shards_per_level = BTreeMap::new();
        for shard in &manifest.shard_files {
            *shards_per_level.entry(shard.level).or_insert(0usize) += 1;
        }
        Ok(ClientStats {
            state: self.state(),
            uuid: manifest.uuid.clone(),
            last_sequence: manifest.last_sequence,
            shard_count: manifest.shard_files.len(),
            shards_per_level,
            pending_count: self.inner.backend.pending_ids().await?.len(),
            cached_headers: self.inner.reader.cache().len(),
        })
    }

    /// Stop the timer, detach listeners, and drop key material. An
    /// in-flight sync completes against its already-fetched snapshot;
    /// subsequent operations fail with `Destroyed`.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.crypto.lock();
        self.inner.set_state(ClientState::Idle);
        info!("client destroyed");
    }
}

/// Point-in-time counters of one client.
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub state: ClientState,
    pub uuid: String,
    pub last_sequence: u64,
    pub shard_count: usize,
    pub shards_per_level: BTreeMap<u8, usize>,
    pub pending_count: usize,
    pub cached_headers: usize,
}

impl std::fmt::Display for ClientStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} shards, lastSequence {}, {} pending, {} cached headers",
            self.shard_count, self.last_sequence, self.pending_count, self.cached_headers
        )
    }
}
