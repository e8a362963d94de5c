//! Read-only clients, read-only storages and the fallback connection.

use std::sync::Arc;
use std::time::Duration;

use crate::client::ClientStorage;
use crate::e2e_tests::helpers::{
    client_config, commit, config_for, eventually, listen, oid, open, start,
};
use crate::error::StorageError;
use crate::server::{HubConfig, MemoryStorage};
use crate::testing::start_server_at;
use crate::types::{Tid, TransactionMeta};
use crate::wire::Address;

#[tokio::test]
async fn test_read_only_client_refuses_writes() {
    let server = start(MemoryStorage::new("1")).await;
    let writer = open(client_config(&server)).await;
    let tid = commit(&writer, &[(oid(1), Tid::ZERO, b"x")]).await;

    let reader = open(client_config(&server).with_read_only(true)).await;
    assert!(reader.is_read_only());
    assert_eq!(reader.load(oid(1)).await.unwrap(), (b"x".to_vec(), tid));
    let txn = TransactionMeta::new("tester", "refused");
    assert!(matches!(reader.tpc_begin(&txn).await, Err(StorageError::ReadOnly)));
    assert!(matches!(reader.new_oid().await, Err(StorageError::ReadOnly)));

    writer.close().await;
    reader.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_writable_client_skips_read_only_storage() {
    let server = start(MemoryStorage::new("1").with_read_only(true)).await;
    let client = ClientStorage::open(client_config(&server).with_wait(false))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!client.is_connected());
    let err = client.load(oid(1)).await.unwrap_err();
    assert!(err.is_disconnected(), "{err}");

    client.close().await;
    server.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_fallback_then_upgrade() {
    let dir = tempfile::tempdir().unwrap();
    let writable = Address::Unix(dir.path().join("writable.sock"));
    let read_only = Address::Unix(dir.path().join("read-only.sock"));

    let ro_server = start_server_at(
        &read_only,
        Arc::new(MemoryStorage::new("1").with_read_only(true)),
        HubConfig::default(),
    )
    .await;
    let config = config_for(vec![writable.clone(), read_only.clone()]).with_read_only_fallback(true);
    let client = open(config).await;
    assert!(client.is_read_only());
    assert!(client.info().read_only);
    let txn = TransactionMeta::new("tester", "on the fallback");
    assert!(matches!(client.tpc_begin(&txn).await, Err(StorageError::ReadOnly)));
    let listener = listen(&client);

    let rw_server = start_server_at(
        &writable,
        Arc::new(MemoryStorage::new("1")),
        HubConfig::default(),
    )
    .await;
    assert!(eventually(|| !client.is_read_only()).await);
    assert!(listener.resets() >= 1);
    assert!(client.sort_key().unwrap().ends_with("writable.sock"));

    let tid = commit(&client, &[(oid(1), Tid::ZERO, b"upgraded")]).await;
    assert_eq!(client.load(oid(1)).await.unwrap(), (b"upgraded".to_vec(), tid));

    client.close().await;
    rw_server.shutdown().await;
    ro_server.shutdown().await;
}
