//! Client lifecycle: state machine, events, timer, destroy, and the
//! filesystem store driver.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{identity, plaintext_client, test_options};
use sealdb::{
    ClientEvent, ClientState, DbError, Document, FileSystemStore, MemoryBackend, SealClient,
    StoreConfig, Unlock,
};
use serde_json::json;

#[tokio::test]
async fn test_local_change_marks_pending_and_sync_emits_events() {
    let (_store, client, backend) = plaintext_client().await;
    let mut events = client.subscribe();
    assert_eq!(client.state(), ClientState::Idle);

    backend.stage(Document::new("a", json!({})).with_at(1));
    // The replication subscription runs on a background task
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.state(), ClientState::Pending);

    client.sync().await.unwrap();
    assert_eq!(client.state(), ClientState::Idle);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            ClientEvent::StateChange(ClientState::Pending),
            ClientEvent::StateChange(ClientState::Syncing),
            ClientEvent::SyncStart { was_pending: true },
            ClientEvent::SyncComplete,
            ClientEvent::StateChange(ClientState::Idle),
        ]
    );
}

#[tokio::test]
async fn test_changes_staged_during_sync_leave_state_pending() {
    let (_store, client, backend) = plaintext_client().await;
    backend.stage(Document::new("a", json!({})).with_at(1));
    client.sync().await.unwrap();

    // Stage another change without syncing: state flips back to pending
    backend.stage(Document::new("b", json!({})).with_at(2));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.state(), ClientState::Pending);

    client.sync().await.unwrap();
    assert_eq!(client.state(), ClientState::Idle);
}

#[tokio::test]
async fn test_destroy_semantics() {
    let (_store, client, backend) = plaintext_client().await;
    backend.stage(Document::new("a", json!({})).with_at(1));
    client.sync().await.unwrap();

    client.destroy().await;
    assert!(matches!(client.sync().await, Err(DbError::Destroyed)));
    assert!(matches!(client.stats().await, Err(DbError::Destroyed)));
    assert!(matches!(client.gc().await, Err(DbError::Destroyed)));

    // Destroy is idempotent
    client.destroy().await;
}

#[tokio::test]
async fn test_periodic_timer_drives_sync() {
    let store = sealdb::MemoryStore::new();
    let options = sealdb::SealOptions {
        sync_interval: Duration::from_millis(100),
        ..test_options()
    };
    let (client, backend) =
        common::client_with(&store, "device-1", Unlock::Plaintext, options).await;

    backend.stage(Document::new("a", json!({})).with_at(1));
    // Wait for the timer to pick the change up
    let mut committed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if client.manifest().await.last_sequence == 1 {
            committed = true;
            break;
        }
    }
    assert!(committed, "timer never synced the pending change");
    client.destroy().await;
}

#[tokio::test]
async fn test_stats_snapshot() {
    let (_store, client, backend) = plaintext_client().await;
    backend.stage(Document::new("a", json!({})).with_at(1));
    backend.stage(Document::new("b", json!({})).with_at(2));
    client.sync().await.unwrap();
    backend.stage(Document::new("c", json!({})).with_at(3));

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.last_sequence, 2);
    assert_eq!(stats.shard_count, 1);
    assert_eq!(stats.shards_per_level.get(&0), Some(&1));
    assert_eq!(stats.pending_count, 1);
    assert!(stats.cached_headers >= 1);
}

#[tokio::test]
async fn test_filesystem_store_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileSystemStore::new(dir.path()));

    let backend = MemoryBackend::new();
    let client = SealClient::init(
        store.clone(),
        Arc::new(backend.clone()),
        identity("device-1"),
        Unlock::Create {
            password: "pw".to_string(),
            pin: None,
        },
        test_options(),
    )
    .await
    .unwrap();
    backend.stage(Document::new("a", json!({"v": 1})).with_at(1));
    client.sync().await.unwrap();
    client.destroy().await;

    // Reconnect through the serialized store configuration
    let config = StoreConfig::FileSystem {
        root: dir.path().to_path_buf(),
    };
    let json = serde_json::to_string(&config).unwrap();
    let restored: StoreConfig = serde_json::from_str(&json).unwrap();
    let reopened_store = restored.connect().unwrap();

    let backend_b = MemoryBackend::new();
    let reopened = SealClient::init(
        reopened_store,
        Arc::new(backend_b.clone()),
        identity("device-2"),
        Unlock::Password("pw".to_string()),
        test_options(),
    )
    .await
    .unwrap();
    reopened.sync().await.unwrap();
    assert_eq!(
        backend_b.document("a").unwrap().data,
        Some(json!({"v": 1}))
    );

    // Objects land under the expected prefixes on disk
    assert!(dir.path().join("manifest.json").exists());
    assert!(dir.path().join("shards").is_dir());
}
