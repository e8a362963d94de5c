//! Only one transaction per storage commits at a time.

use std::time::Duration;

use crate::e2e_tests::helpers::{WAIT, client_config, commit, eventually, oid, open, start};
use crate::server::MemoryStorage;
use crate::types::{Tid, TransactionMeta};

#[tokio::test]
async fn test_second_begin_waits_for_first_finish() {
    let server = start(MemoryStorage::new("1")).await;
    let hub = server.hub("1").unwrap();
    let first = open(client_config(&server)).await;
    let second = open(client_config(&server)).await;

    let txn_a = TransactionMeta::new("first", "holds the lock");
    first.tpc_begin(&txn_a).await.unwrap();
    first.store(oid(1), Tid::ZERO, b"a".to_vec(), &txn_a).await.unwrap();

    let txn_b = TransactionMeta::new("second", "waits");
    let begin = second.tpc_begin(&txn_b);
    tokio::pin!(begin);
    assert!(
        tokio::time::timeout(Duration::from_millis(300), &mut begin)
            .await
            .is_err()
    );
    assert!(eventually(|| hub.waiting_count() == 1).await);

    first.tpc_vote(&txn_a).await.unwrap();
    let t1 = first.tpc_finish(&txn_a, |_| {}).await.unwrap();
    begin.await.unwrap();
    assert_eq!(hub.waiting_count(), 0);

    second.store(oid(1), t1, b"b".to_vec(), &txn_b).await.unwrap();
    second.tpc_vote(&txn_b).await.unwrap();
    let t2 = second.tpc_finish(&txn_b, |_| {}).await.unwrap();
    assert!(t2 > t1);
    assert_eq!(first.load(oid(1)).await.unwrap(), (b"b".to_vec(), t2));

    first.close().await;
    second.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_waiter_that_disconnects_is_skipped() {
    let server = start(MemoryStorage::new("1")).await;
    let hub = server.hub("1").unwrap();
    let holder = open(client_config(&server)).await;
    let quitter = open(client_config(&server)).await;
    let patient = open(client_config(&server)).await;

    let txn = TransactionMeta::new("holder", "first");
    holder.tpc_begin(&txn).await.unwrap();

    let quit_txn = TransactionMeta::new("quitter", "gives up");
    let quit_begin = quitter.tpc_begin(&quit_txn);
    tokio::pin!(quit_begin);
    assert!(
        tokio::time::timeout(Duration::from_millis(200), &mut quit_begin)
            .await
            .is_err()
    );
    let patient_txn = TransactionMeta::new("patient", "waits");
    let patient_begin = patient.tpc_begin(&patient_txn);
    tokio::pin!(patient_begin);
    assert!(
        tokio::time::timeout(Duration::from_millis(200), &mut patient_begin)
            .await
            .is_err()
    );
    assert!(eventually(|| hub.waiting_count() == 2).await);

    quitter.close().await;
    assert!(eventually(|| hub.session_count() == 2).await);

    holder.tpc_abort(&txn).await.unwrap();
    patient_begin.await.unwrap();
    assert!(eventually(|| hub.waiting_count() == 0).await);
    patient.tpc_abort(&patient_txn).await.unwrap();

    holder.close().await;
    patient.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_client_waiting_for_lock_can_still_load() {
    let server = start(MemoryStorage::new("1")).await;
    let hub = server.hub("1").unwrap();
    let writer = open(client_config(&server)).await;
    let holder = open(client_config(&server)).await;
    let waiter = open(client_config(&server)).await;
    let t1 = commit(&writer, &[(oid(2), Tid::ZERO, b"committed")]).await;

    let txn = TransactionMeta::new("holder", "holds the lock");
    holder.tpc_begin(&txn).await.unwrap();

    let waiting_txn = TransactionMeta::new("waiter", "queued");
    let begin = waiter.tpc_begin(&waiting_txn);
    tokio::pin!(begin);
    assert!(
        tokio::time::timeout(Duration::from_millis(300), &mut begin)
            .await
            .is_err()
    );
    assert!(eventually(|| hub.waiting_count() == 1).await);

    let loaded = tokio::time::timeout(WAIT, waiter.load(oid(2)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded, (b"committed".to_vec(), t1));

    holder.tpc_abort(&txn).await.unwrap();
    begin.await.unwrap();
    waiter.tpc_abort(&waiting_txn).await.unwrap();

    writer.close().await;
    holder.close().await;
    waiter.close().await;
    server.shutdown().await;
}
