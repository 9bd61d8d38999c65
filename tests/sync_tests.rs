//! End-to-end sync scenarios over a shared in-memory store.

mod common;

use common::{client_on, encrypted_client, plaintext_client};
use sealdb::{Document, Unlock};
use serde_json::json;

#[tokio::test]
async fn test_create_and_first_write() {
    // New encrypted database, master password "pw", PIN "123456"
    let (_store, client, backend) = encrypted_client(Some("123456")).await;

    backend.stage(Document::new("a", json!({"x": 1})).with_at(1));
    let report = client.sync().await.unwrap();

    assert!(report.committed);
    assert_eq!(report.last_sequence, 1);

    let manifest = client.manifest().await;
    assert_eq!(manifest.last_sequence, 1);
    assert_eq!(manifest.shard_files.len(), 1);
    assert_eq!(manifest.shard_files[0].level, 0);
    assert_eq!(manifest.shard_files[0].range.min, 1);
    assert_eq!(manifest.shard_files[0].range.max, 1);
    assert!(manifest.is_encrypted());
}

#[tokio::test]
async fn test_empty_manifest_loads_and_syncs_clean() {
    let (_store, client, _backend) = plaintext_client().await;
    let manifest = client.manifest().await;
    assert_eq!(manifest.last_sequence, 0);
    assert!(manifest.shard_files.is_empty());

    // Nothing pending: the tick is a no-op and commits nothing
    let report = client.sync().await.unwrap();
    assert!(!report.committed);
    assert!(client.manifest().await.shard_files.is_empty());
}

#[tokio::test]
async fn test_repeated_sync_is_idempotent() {
    let (_store, client, backend) = plaintext_client().await;

    backend.stage(Document::new("a", json!({"n": 1})).with_at(5));
    client.sync().await.unwrap();
    let manifest_after_first = client.manifest().await;

    let report = client.sync().await.unwrap();
    assert!(!report.committed);
    assert_eq!(client.manifest().await, manifest_after_first);
}

#[tokio::test]
async fn test_two_device_merge_last_writer_wins() {
    let (store, device_a, backend_a) = plaintext_client().await;
    // B's first manifest PUT loses the race, the way a concurrent commit
    // landing between B's pull and B's put would make it
    let (device_b, backend_b) = common::client_on_store(
        std::sync::Arc::new(common::ConflictingStore::new(store.clone(), 1)),
        "device-2",
        Unlock::Plaintext,
    )
    .await;

    // A commits at=10; B holds the stale manifest and writes at=20
    backend_a.stage(Document::new("a", json!({"writer": "A"})).with_at(10));
    device_a.sync().await.unwrap();

    backend_b.stage(Document::new("a", json!({"writer": "B"})).with_at(20));
    let report = device_b.sync().await.unwrap();
    assert_eq!(report.attempts, 2, "B must have lost the first CAS");

    // Exactly one commit won each round: two shards, lastSequence = 2
    let manifest = device_b.manifest().await;
    assert_eq!(manifest.shard_files.len(), 2);
    assert_eq!(manifest.last_sequence, 2);

    // Both devices converge on at=20
    device_a.sync().await.unwrap();
    let at_a = backend_a.document("a").unwrap();
    let at_b = backend_b.document("a").unwrap();
    assert_eq!(at_a.at, 20);
    assert_eq!(at_a.data, Some(json!({"writer": "B"})));
    assert_eq!(at_b.at, 20);
}

#[tokio::test]
async fn test_encrypted_two_device_round_trip() {
    let (store, device_a, backend_a) = encrypted_client(None).await;

    backend_a.stage(Document::new("note", json!({"body": "secret"})).with_at(7));
    device_a.sync().await.unwrap();

    // Second device joins with the master password and pulls the document
    let (device_b, backend_b) = client_on(
        &store,
        "device-2",
        Unlock::Password("pw".to_string()),
    )
    .await;
    let report = device_b.sync().await.unwrap();
    assert_eq!(report.ingested, 1);
    assert_eq!(
        backend_b.document("note").unwrap().data,
        Some(json!({"body": "secret"}))
    );

    // Wrong password never gets in
    let store_clone = store.clone();
    let result = sealdb::SealClient::init(
        std::sync::Arc::new(store_clone),
        std::sync::Arc::new(sealdb::MemoryBackend::new()),
        common::identity("device-3"),
        Unlock::Password("wrong".to_string()),
        common::test_options(),
    )
    .await;
    assert!(matches!(result, Err(sealdb::DbError::AuthFailure(_))));
}

#[tokio::test]
async fn test_deletion_propagates_as_tombstone() {
    let (store, device_a, backend_a) = plaintext_client().await;
    let (device_b, backend_b) = client_on(&store, "device-2", Unlock::Plaintext).await;

    backend_a.stage(Document::new("a", json!({"v": 1})).with_at(10));
    device_a.sync().await.unwrap();
    device_b.sync().await.unwrap();
    assert!(!backend_b.document("a").unwrap().del);

    backend_a.stage(Document::tombstone("a").with_at(20));
    device_a.sync().await.unwrap();
    device_b.sync().await.unwrap();

    let doc = backend_b.document("a").unwrap();
    assert!(doc.del);
    assert_eq!(doc.data, None);
}

#[tokio::test]
async fn test_sequences_grow_monotonically_across_ticks() {
    let (_store, client, backend) = plaintext_client().await;

    backend.stage(Document::new("a", json!({})).with_at(1));
    let first = client.sync().await.unwrap();
    backend.stage(Document::new("b", json!({})).with_at(2));
    backend.stage(Document::new("c", json!({})).with_at(3));
    let second = client.sync().await.unwrap();

    assert_eq!(first.last_sequence, 1);
    assert_eq!(second.last_sequence, 3);
    assert_eq!(backend.document("b").unwrap().seq, 2);
    assert_eq!(backend.document("c").unwrap().seq, 3);
}

#[tokio::test]
async fn test_concurrent_sync_calls_coalesce() {
    let (_store, client, backend) = plaintext_client().await;
    backend.stage(Document::new("a", json!({})).with_at(1));

    let client = std::sync::Arc::new(client);
    let c1 = client.clone();
    let c2 = client.clone();
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { c1.sync().await }),
        tokio::spawn(async move { c2.sync().await }),
    );
    r1.unwrap().unwrap();
    r2.unwrap().unwrap();

    // Exactly one shard was committed for the single pending document
    assert_eq!(client.manifest().await.shard_files.len(), 1);
    assert_eq!(client.manifest().await.last_sequence, 1);
}
