//! Undo through the client, and the invalidations it causes.

use crate::e2e_tests::helpers::{client_config, commit, eventually, listen, oid, open, start};
use crate::server::MemoryStorage;
use crate::types::{Tid, TransactionMeta};

#[tokio::test]
async fn test_undo_restores_previous_revision() {
    let server = start(MemoryStorage::new("1")).await;
    let client = open(client_config(&server)).await;
    let watcher = open(client_config(&server)).await;
    let listener = listen(&watcher);

    let t1 = commit(&client, &[(oid(1), Tid::ZERO, b"v1")]).await;
    let t2 = commit(&client, &[(oid(1), t1, b"v2")]).await;
    assert_eq!(watcher.load(oid(1)).await.unwrap(), (b"v2".to_vec(), t2));

    let log = client.undo_log(0, 10).await.unwrap();
    assert_eq!(log.iter().map(|d| d.id).collect::<Vec<_>>(), vec![t2, t1]);
    assert_eq!(log[0].user, "tester");
    // A negative `last` counts entries from `first`.
    assert_eq!(client.undo_info(0, -1).await.unwrap().len(), 1);

    let txn = TransactionMeta::new("tester", "undo v2");
    client.tpc_begin(&txn).await.unwrap();
    let (undo_tid, oids) = client.undo(t2, &txn).await.unwrap();
    assert_eq!(oids, vec![oid(1)]);
    client.tpc_vote(&txn).await.unwrap();
    let t3 = client.tpc_finish(&txn, |_| {}).await.unwrap();
    assert_eq!(t3, undo_tid);

    assert_eq!(client.load(oid(1)).await.unwrap(), (b"v1".to_vec(), t3));
    // Watchers hear about the undo once right away and again at commit.
    assert!(eventually(|| listener.saw(None, oid(1))).await);
    assert!(eventually(|| listener.saw(Some(t3), oid(1))).await);
    assert_eq!(watcher.load(oid(1)).await.unwrap(), (b"v1".to_vec(), t3));

    client.close().await;
    watcher.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_undo_of_overwritten_change_fails() {
    let server = start(MemoryStorage::new("1")).await;
    let client = open(client_config(&server)).await;

    let t1 = commit(&client, &[(oid(1), Tid::ZERO, b"v1")]).await;
    let t2 = commit(&client, &[(oid(1), t1, b"v2")]).await;
    commit(&client, &[(oid(1), t2, b"v3")]).await;

    let txn = TransactionMeta::new("tester", "too late");
    client.tpc_begin(&txn).await.unwrap();
    assert!(client.undo(t2, &txn).await.is_err());
    client.tpc_abort(&txn).await.unwrap();
    assert_eq!(client.load(oid(1)).await.unwrap().0, b"v3");

    client.close().await;
    server.shutdown().await;
}
