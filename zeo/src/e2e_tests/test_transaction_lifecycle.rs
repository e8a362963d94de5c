//! Begin, abort and the rules around the active transaction.

use crate::e2e_tests::helpers::{client_config, commit, oid, open, start};
use crate::error::StorageError;
use crate::server::MemoryStorage;
use crate::types::{StoreOutcome, Tid, TransactionMeta};

#[tokio::test]
async fn test_abort_discards_stores() {
    let server = start(MemoryStorage::new("1")).await;
    let client = open(client_config(&server)).await;

    let txn = TransactionMeta::new("tester", "aborted");
    client.tpc_begin(&txn).await.unwrap();
    client.store(oid(7), Tid::ZERO, b"never".to_vec(), &txn).await.unwrap();
    client.tpc_abort(&txn).await.unwrap();

    let err = client.load(oid(7)).await.unwrap_err();
    assert!(matches!(err, StorageError::PosKey { .. }), "{err}");

    // Aborting again is a no-op, and the commit lock is free.
    client.tpc_abort(&txn).await.unwrap();
    commit(&client, &[(oid(7), Tid::ZERO, b"later")]).await;
    assert_eq!(client.load(oid(7)).await.unwrap().0, b"later");

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_begin_twice_is_a_no_op() {
    let server = start(MemoryStorage::new("1")).await;
    let client = open(client_config(&server)).await;

    let txn = TransactionMeta::new("tester", "twice");
    client.tpc_begin(&txn).await.unwrap();
    client.tpc_begin(&txn).await.unwrap();
    client.store(oid(1), Tid::ZERO, b"x".to_vec(), &txn).await.unwrap();
    let outcomes = client.tpc_vote(&txn).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], (o, StoreOutcome::Serial(_)) if o == oid(1)));
    let tid = client.tpc_finish(&txn, |_| {}).await.unwrap();
    assert_eq!(client.load(oid(1)).await.unwrap(), (b"x".to_vec(), tid));

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_store_under_another_transaction_is_refused() {
    let server = start(MemoryStorage::new("1")).await;
    let client = open(client_config(&server)).await;

    let txn = TransactionMeta::new("tester", "active");
    let other = TransactionMeta::new("tester", "stranger");
    client.tpc_begin(&txn).await.unwrap();
    let err = client
        .store(oid(1), Tid::ZERO, b"x".to_vec(), &other)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::StorageTransaction(_)), "{err}");
    assert!(client.tpc_vote(&other).await.is_err());

    // Aborting a transaction that is not active leaves the real one alone.
    client.tpc_abort(&other).await.unwrap();
    client.tpc_vote(&txn).await.unwrap();
    client.tpc_finish(&txn, |_| {}).await.unwrap();

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_finish_callback_sees_commit_tid() {
    let server = start(MemoryStorage::new("1")).await;
    let client = open(client_config(&server)).await;

    let txn = TransactionMeta::new("tester", "callback");
    client.tpc_begin(&txn).await.unwrap();
    client.store(oid(1), Tid::ZERO, b"x".to_vec(), &txn).await.unwrap();
    client.tpc_vote(&txn).await.unwrap();
    let mut seen = None;
    let tid = client.tpc_finish(&txn, |tid| seen = Some(tid)).await.unwrap();
    assert_eq!(seen, Some(tid));

    client.close().await;
    server.shutdown().await;
}
