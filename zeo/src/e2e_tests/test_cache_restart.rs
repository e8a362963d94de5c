//! A persistent cache survives a client restart.

use crate::e2e_tests::helpers::{client_config, commit, oid, open, start};
use crate::server::MemoryStorage;
use crate::testing::new_test_dir;
use crate::types::Tid;

#[tokio::test]
async fn test_reopened_cache_serves_without_round_trips() {
    let server = start(MemoryStorage::new("1")).await;
    let var_dir = new_test_dir("cache_restart");
    let config = client_config(&server)
        .with_client_name("restart")
        .with_var_dir(&var_dir);

    let client = open(config.clone()).await;
    let tid = commit(&client, &[(oid(1), Tid::ZERO, b"kept")]).await;
    client.close().await;
    assert!(config.cache_path().unwrap().exists());

    // Nothing committed meanwhile, so the cache is used as is.
    let client = open(config).await;
    assert_eq!(client.last_transaction(), tid);
    let before = client.rpc_count();
    assert_eq!(client.load(oid(1)).await.unwrap(), (b"kept".to_vec(), tid));
    assert_eq!(client.rpc_count(), before);

    client.close().await;
    server.shutdown().await;
    let _ = std::fs::remove_dir_all(&var_dir);
}

#[tokio::test]
async fn test_cache_newer_than_server_is_dropped() {
    let var_dir = new_test_dir("cache_newer");

    let server = start(MemoryStorage::new("1")).await;
    let config = client_config(&server)
        .with_client_name("newer")
        .with_var_dir(&var_dir);
    let client = open(config).await;
    commit(&client, &[(oid(1), Tid::ZERO, b"gone")]).await;
    client.close().await;
    server.shutdown().await;

    // A fresh, empty storage: everything cached is from the future.
    let server = start(MemoryStorage::new("1")).await;
    let config = client_config(&server)
        .with_client_name("newer")
        .with_var_dir(&var_dir);
    let client = open(config).await;
    assert_eq!(client.last_transaction(), Tid::ZERO);
    assert!(client.load(oid(1)).await.is_err());

    client.close().await;
    server.shutdown().await;
    let _ = std::fs::remove_dir_all(&var_dir);
}
