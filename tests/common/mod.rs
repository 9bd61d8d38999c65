//! Shared helpers for the integration suites.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use sealdb::{
    ByteRange, DbResult, DeviceIdentity, MemoryBackend, MemoryStore, Precondition,
    SealClient, SealOptions, StorageBackend, StoreConfig, Unlock,
};

/// KDF iterations low enough to keep unlock-heavy tests fast.
pub const TEST_KDF_ITERATIONS: u32 = 1000;

/// Route engine logs through `RUST_LOG` when a test needs them.
pub fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

pub fn test_options() -> SealOptions {
    SealOptions {
        kdf_iterations: TEST_KDF_ITERATIONS,
        gc_grace: std::time::Duration::ZERO,
        ..SealOptions::manual_sync()
    }
}

pub fn identity(device_id: &str) -> DeviceIdentity {
    DeviceIdentity {
        device_id: device_id.to_string(),
        device_name: format!("Device {}", device_id),
    }
}

/// Spin up a client over a shared in-memory store with its own backend.
pub async fn client_on(
    store: &MemoryStore,
    device_id: &str,
    unlock: Unlock,
) -> (SealClient, MemoryBackend) {
    client_with(store, device_id, unlock, test_options()).await
}

/// Like [`client_on`], with explicit options.
pub async fn client_with(
    store: &MemoryStore,
    device_id: &str,
    unlock: Unlock,
    options: SealOptions,
) -> (SealClient, MemoryBackend) {
    init_tracing();
    let backend = MemoryBackend::new();
    let client = SealClient::init(
        Arc::new(store.clone()),
        Arc::new(backend.clone()),
        identity(device_id),
        unlock,
        options,
    )
    .await
    .expect("client init failed");
    (client, backend)
}

/// A brand-new unencrypted database on a fresh store.
pub async fn plaintext_client() -> (MemoryStore, SealClient, MemoryBackend) {
    let store = MemoryStore::new();
    let (client, backend) = client_on(&store, "device-1", Unlock::Plaintext).await;
    (store, client, backend)
}

/// A brand-new encrypted database with master password `pw`.
pub async fn encrypted_client(
    pin: Option<&str>,
) -> (MemoryStore, SealClient, MemoryBackend) {
    let store = MemoryStore::new();
    let (client, backend) = client_on(
        &store,
        "device-1",
        Unlock::Create {
            password: "pw".to_string(),
            pin: pin.map(str::to_string),
        },
    )
    .await;
    (store, client, backend)
}

/// Milliseconds timestamp `days` days in the past.
pub fn days_ago(days: u64) -> u64 {
    sealdb::document::now_millis() - days * 24 * 60 * 60 * 1000
}

/// Store wrapper whose first `count` manifest PUTs report a conflict, as if
/// another writer committed between this client's pull and its put.
pub struct ConflictingStore {
    inner: MemoryStore,
    remaining: AtomicU32,
}

impl ConflictingStore {
    pub fn new(inner: MemoryStore, count: u32) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(count),
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for ConflictingStore {
    async fn list(&self, prefix: &str) -> DbResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn get(&self, name: &str, range: Option<ByteRange>) -> DbResult<Vec<u8>> {
        self.inner.get(name, range).await
    }

    async fn put(
        &self,
        name: &str,
        bytes: &[u8],
        precondition: Precondition,
    ) -> DbResult<String> {
        if name == sealdb::MANIFEST_NAME {
            let remaining = self.remaining.load(Ordering::SeqCst);
            if remaining > 0
                && self
                    .remaining
                    .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                return Err(sealdb::DbError::Conflict("injected race".to_string()));
            }
        }
        self.inner.put(name, bytes, precondition).await
    }

    async fn delete(&self, name: &str) -> DbResult<()> {
        self.inner.delete(name).await
    }

    fn metadata(&self) -> sealdb::store::StoreMetadata {
        self.inner.metadata()
    }

    fn config(&self) -> StoreConfig {
        self.inner.config()
    }
}

/// Spin up a client over an arbitrary storage backend.
pub async fn client_on_store(
    store: Arc<dyn StorageBackend>,
    device_id: &str,
    unlock: Unlock,
) -> (SealClient, MemoryBackend) {
    init_tracing();
    let backend = MemoryBackend::new();
    let client = SealClient::init(
        store,
        Arc::new(backend.clone()),
        identity(device_id),
        unlock,
        test_options(),
    )
    .await
    .expect("client init failed");
    (client, backend)
}
