//! The server takes the commit lock back from a stalled transaction.

use std::sync::Arc;
use std::time::Duration;

use crate::e2e_tests::helpers::{client_config, commit, eventually, oid, open};
use crate::server::{HubConfig, MemoryStorage};
use crate::testing::start_server;
use crate::types::{Tid, TransactionMeta};

#[tokio::test]
async fn test_stalled_transaction_is_disconnected() {
    let config = HubConfig {
        transaction_timeout: Some(Duration::from_millis(200)),
        ..HubConfig::default()
    };
    let server = start_server(Arc::new(MemoryStorage::new("1")), config).await;
    let slow = open(client_config(&server)).await;
    let other = open(client_config(&server)).await;

    let txn = TransactionMeta::new("slow", "never votes");
    slow.tpc_begin(&txn).await.unwrap();
    slow.store(oid(1), Tid::ZERO, b"stalled".to_vec(), &txn).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let err = slow.tpc_vote(&txn).await.unwrap_err();
    assert!(err.is_disconnected(), "{err}");
    slow.tpc_abort(&txn).await.unwrap();

    // The lock is free and the stalled store never happened.
    let tid = commit(&other, &[(oid(1), Tid::ZERO, b"other")]).await;
    assert_eq!(other.load(oid(1)).await.unwrap(), (b"other".to_vec(), tid));

    // The stalled client reconnects on its own.
    assert!(eventually(|| slow.is_connected()).await);
    assert_eq!(slow.load(oid(1)).await.unwrap(), (b"other".to_vec(), tid));

    slow.close().await;
    other.close().await;
    server.shutdown().await;
}
