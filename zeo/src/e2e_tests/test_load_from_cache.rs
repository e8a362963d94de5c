//! Cached objects load without a round trip.

use crate::e2e_tests::helpers::{client_config, commit, oid, open, start};
use crate::server::MemoryStorage;
use crate::types::Tid;

#[tokio::test]
async fn test_cached_load_makes_no_round_trip() {
    let server = start(MemoryStorage::new("1")).await;
    let client = open(client_config(&server)).await;
    let tid = commit(&client, &[(oid(1), Tid::ZERO, b"one")]).await;

    // The committing client caches what it wrote.
    let before = client.rpc_count();
    assert_eq!(client.load(oid(1)).await.unwrap(), (b"one".to_vec(), tid));
    assert_eq!(client.rpc_count(), before);
    assert!(client.cache_stats().hits >= 1);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_miss_loads_once_then_hits() {
    let server = start(MemoryStorage::new("1")).await;
    let writer = open(client_config(&server)).await;
    let tid = commit(&writer, &[(oid(1), Tid::ZERO, b"one")]).await;

    let reader = open(client_config(&server)).await;
    let before = reader.rpc_count();
    assert_eq!(reader.load(oid(1)).await.unwrap(), (b"one".to_vec(), tid));
    assert_eq!(reader.rpc_count(), before + 1);
    assert_eq!(reader.load(oid(1)).await.unwrap(), (b"one".to_vec(), tid));
    assert_eq!(reader.rpc_count(), before + 1);

    writer.close().await;
    reader.close().await;
    server.shutdown().await;
}
