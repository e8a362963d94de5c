//! Write conflicts: resolved by the server, or reported at vote.

use std::sync::Arc;

use crate::e2e_tests::helpers::{client_config, commit, eventually, oid, open, start};
use crate::error::StorageError;
use crate::server::{ConflictResolver, MemoryStorage};
use crate::types::{Oid, StoreOutcome, Tid, TransactionMeta};

/// Appends the rejected write to the committed data.
struct Append;

impl ConflictResolver for Append {
    fn resolve(&self, _oid: Oid, _old: Option<&[u8]>, committed: &[u8], new: &[u8]) -> Option<Vec<u8>> {
        Some([committed, new].concat())
    }
}

#[tokio::test]
async fn test_resolved_conflict_is_not_cached_as_sent() {
    let server = start(MemoryStorage::new("1").with_resolver(Arc::new(Append))).await;
    let first = open(client_config(&server)).await;
    let second = open(client_config(&server)).await;

    let t1 = commit(&first, &[(oid(1), Tid::ZERO, b"a")]).await;
    assert_eq!(second.load(oid(1)).await.unwrap(), (b"a".to_vec(), t1));
    let t2 = commit(&first, &[(oid(1), t1, b"b")]).await;
    assert!(eventually(|| second.last_transaction() == t2).await);

    // Still written against t1.
    let txn = TransactionMeta::new("tester", "stale write");
    second.tpc_begin(&txn).await.unwrap();
    second.store(oid(1), t1, b"c".to_vec(), &txn).await.unwrap();
    let outcomes = second.tpc_vote(&txn).await.unwrap();
    assert_eq!(outcomes, vec![(oid(1), StoreOutcome::Resolved)]);
    let t3 = second.tpc_finish(&txn, |_| {}).await.unwrap();

    assert_eq!(second.load(oid(1)).await.unwrap(), (b"bc".to_vec(), t3));
    assert!(eventually(|| first.last_transaction() == t3).await);
    assert_eq!(first.load(oid(1)).await.unwrap(), (b"bc".to_vec(), t3));

    first.close().await;
    second.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_unresolved_conflict_fails_the_vote() {
    let server = start(MemoryStorage::new("1")).await;
    let first = open(client_config(&server)).await;
    let second = open(client_config(&server)).await;

    let t1 = commit(&first, &[(oid(1), Tid::ZERO, b"a")]).await;
    let t2 = commit(&first, &[(oid(1), t1, b"b")]).await;

    let txn = TransactionMeta::new("tester", "stale write");
    second.tpc_begin(&txn).await.unwrap();
    second.store(oid(1), t1, b"c".to_vec(), &txn).await.unwrap();
    let err = second.tpc_vote(&txn).await.unwrap_err();
    let StorageError::Conflict { oid: Some(conflicted), serials, .. } = &err else {
        panic!("expected a conflict, got {err}");
    };
    assert_eq!(*conflicted, oid(1));
    assert_eq!(*serials, Some((t2, t1)));
    second.tpc_abort(&txn).await.unwrap();

    // The commit lock was released by the abort.
    let t3 = commit(&second, &[(oid(1), t2, b"c")]).await;
    assert_eq!(first.load_serial(oid(1), t3).await.unwrap(), b"c");

    first.close().await;
    second.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_check_current_serial_conflicts_at_vote() {
    let server = start(MemoryStorage::new("1")).await;
    let first = open(client_config(&server)).await;
    let second = open(client_config(&server)).await;

    let t1 = commit(&first, &[(oid(1), Tid::ZERO, b"a")]).await;
    commit(&first, &[(oid(1), t1, b"b")]).await;

    let txn = TransactionMeta::new("tester", "read check");
    second.tpc_begin(&txn).await.unwrap();
    second.store(oid(2), Tid::ZERO, b"depends on 1".to_vec(), &txn).await.unwrap();
    second
        .check_current_serial_in_transaction(oid(1), t1, &txn)
        .await
        .unwrap();
    let err = second.tpc_vote(&txn).await.unwrap_err();
    assert!(matches!(err, StorageError::Conflict { .. }), "{err}");
    second.tpc_abort(&txn).await.unwrap();

    let missing = second.load(oid(2)).await.unwrap_err();
    assert!(matches!(missing, StorageError::PosKey { .. }), "{missing}");

    first.close().await;
    second.close().await;
    server.shutdown().await;
}
