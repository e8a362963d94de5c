//! Committed data is visible to other clients, with its history.

use crate::e2e_tests::helpers::{client_config, commit, open, start};
use crate::error::StorageError;
use crate::server::MemoryStorage;
use crate::types::Tid;

#[tokio::test]
async fn test_commit_is_visible_to_another_client() {
    let server = start(MemoryStorage::new("1")).await;
    let writer = open(client_config(&server)).await;
    let reader = open(client_config(&server)).await;

    let oid = writer.new_oid().await.unwrap();
    let t1 = commit(&writer, &[(oid, Tid::ZERO, b"first")]).await;
    let t2 = commit(&writer, &[(oid, t1, b"second")]).await;
    assert!(t2 > t1);
    assert_eq!(writer.last_transaction(), t2);

    assert_eq!(reader.load(oid).await.unwrap(), (b"second".to_vec(), t2));
    assert_eq!(reader.load_serial(oid, t1).await.unwrap(), b"first");
    assert_eq!(
        reader.load_before(oid, t2).await.unwrap(),
        Some((b"first".to_vec(), t1, Some(t2)))
    );
    assert_eq!(reader.load_before(oid, t1).await.unwrap(), None);

    writer.close().await;
    reader.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_new_oids_come_in_batches() {
    let server = start(MemoryStorage::new("1")).await;
    let client = open(client_config(&server)).await;

    let first = client.new_oid().await.unwrap();
    let calls = client.rpc_count();
    let second = client.new_oid().await.unwrap();
    assert_ne!(first, second);
    assert_eq!(client.rpc_count(), calls);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_missing_object_is_pos_key() {
    let server = start(MemoryStorage::new("1")).await;
    let client = open(client_config(&server)).await;

    let oid = client.new_oid().await.unwrap();
    let err = client.load(oid).await.unwrap_err();
    assert!(matches!(err, StorageError::PosKey { .. }), "{err}");

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_record_iteration_visits_every_object() {
    let server = start(MemoryStorage::new("1")).await;
    let client = open(client_config(&server)).await;

    let oids = [
        client.new_oid().await.unwrap(),
        client.new_oid().await.unwrap(),
        client.new_oid().await.unwrap(),
    ];
    let tid = commit(
        &client,
        &[
            (oids[0], Tid::ZERO, b"a"),
            (oids[1], Tid::ZERO, b"b"),
            (oids[2], Tid::ZERO, b"c"),
        ],
    )
    .await;

    let mut seen = Vec::new();
    let mut next = None;
    while let Some(item) = client.record_iternext(next).await.unwrap() {
        assert_eq!(item.tid, tid);
        seen.push(item.oid);
        next = item.next;
        if next.is_none() {
            break;
        }
    }
    let mut expected = oids.to_vec();
    expected.sort();
    assert_eq!(seen, expected);

    client.close().await;
    server.shutdown().await;
}
