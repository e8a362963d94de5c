//! Losing the server in the middle of a transaction.

use crate::e2e_tests::helpers::{client_config, commit, eventually, oid, open, start};
use crate::error::StorageError;
use crate::server::MemoryStorage;
use crate::types::{Tid, TransactionMeta};

#[tokio::test]
async fn test_vote_after_disconnect_fails_and_abort_succeeds() {
    let server = start(MemoryStorage::new("1")).await;
    let client = open(client_config(&server)).await;

    let txn = TransactionMeta::new("tester", "interrupted");
    client.tpc_begin(&txn).await.unwrap();
    client.store(oid(1), Tid::ZERO, b"x".to_vec(), &txn).await.unwrap();

    server.shutdown().await;
    assert!(eventually(|| !client.is_connected()).await);

    let err = client.tpc_vote(&txn).await.unwrap_err();
    assert!(err.is_disconnected(), "{err}");
    client.tpc_abort(&txn).await.unwrap();

    // Without a server, new work fails fast instead of hanging.
    let next = TransactionMeta::new("tester", "after");
    let err = client.tpc_begin(&next).await.unwrap_err();
    assert!(matches!(err, StorageError::Disconnected(_)), "{err}");

    client.close().await;
}

#[tokio::test]
async fn test_finish_after_disconnect_fails_and_caches_nothing() {
    let server = start(MemoryStorage::new("1")).await;
    let client = open(client_config(&server)).await;
    let t1 = commit(&client, &[(oid(1), Tid::ZERO, b"old")]).await;
    assert_eq!(client.cache_load(oid(1)), Some((b"old".to_vec(), t1)));

    let txn = TransactionMeta::new("tester", "cut off before finish");
    client.tpc_begin(&txn).await.unwrap();
    client.store(oid(1), t1, b"new".to_vec(), &txn).await.unwrap();
    client.store(oid(2), Tid::ZERO, b"fresh".to_vec(), &txn).await.unwrap();
    client.tpc_vote(&txn).await.unwrap();

    server.shutdown().await;
    assert!(eventually(|| !client.is_connected()).await);

    let mut called = false;
    let err = client.tpc_finish(&txn, |_| called = true).await.unwrap_err();
    assert!(matches!(err, StorageError::Disconnected(_)), "{err}");
    assert!(!called);
    assert!(client.cache_load(oid(2)).is_none());
    assert!(
        client
            .cache_load(oid(1))
            .is_none_or(|(data, tid)| data == b"old" && tid == t1)
    );

    // The transaction is over; a stray abort is harmless.
    client.tpc_abort(&txn).await.unwrap();
    client.close().await;
}
