//! Commits by one client invalidate the caches of the others.

use std::sync::Arc;

use crate::e2e_tests::helpers::{client_config, commit, eventually, listen, oid, open, start};
use crate::server::{HubConfig, MemoryStorage, Storage};
use crate::testing::{PausingStorage, start_server};
use crate::types::Tid;

#[tokio::test]
async fn test_commit_invalidates_other_clients() {
    let server = start(MemoryStorage::new("1")).await;
    let writer = open(client_config(&server)).await;
    let reader = open(client_config(&server)).await;
    let listener = listen(&reader);

    let t1 = commit(&writer, &[(oid(1), Tid::ZERO, b"old")]).await;
    assert_eq!(reader.load(oid(1)).await.unwrap(), (b"old".to_vec(), t1));

    let t2 = commit(&writer, &[(oid(1), t1, b"new")]).await;
    assert!(eventually(|| listener.saw(Some(t2), oid(1))).await);
    assert!(eventually(|| reader.last_transaction() == t2).await);

    // The stale copy is gone, so this goes to the server.
    let before = reader.rpc_count();
    assert_eq!(reader.load(oid(1)).await.unwrap(), (b"new".to_vec(), t2));
    assert_eq!(reader.rpc_count(), before + 1);
    // The old revision is still served from history.
    assert_eq!(
        reader.load_before(oid(1), t2).await.unwrap(),
        Some((b"old".to_vec(), t1, Some(t2)))
    );

    writer.close().await;
    reader.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_committer_is_not_told_about_its_own_commit() {
    let server = start(MemoryStorage::new("1")).await;
    let writer = open(client_config(&server)).await;
    let other = open(client_config(&server)).await;
    let own = listen(&writer);
    let theirs = listen(&other);

    let tid = commit(&writer, &[(oid(3), Tid::ZERO, b"x")]).await;
    assert!(eventually(|| theirs.saw(Some(tid), oid(3))).await);
    assert!(!own.saw(Some(tid), oid(3)));

    writer.close().await;
    other.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_load_invalidated_in_flight_is_not_cached() {
    let storage = Arc::new(PausingStorage::new(MemoryStorage::new("1")));
    #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
    let shared: Arc<dyn Storage> = Arc::clone(&storage) as _;
    let server = start_server(shared, HubConfig::default()).await;
    let writer = open(client_config(&server)).await;
    let reader = open(client_config(&server)).await;
    let listener = listen(&reader);

    let t1 = commit(&writer, &[(oid(1), Tid::ZERO, b"old")]).await;
    assert!(eventually(|| listener.saw(Some(t1), oid(1))).await);

    let mut pause = storage.pause_load(oid(1));
    let (loaded, t2) = tokio::join!(reader.load(oid(1)), async {
        assert!(pause.reached().await);
        let t2 = commit(&writer, &[(oid(1), t1, b"new")]).await;
        assert!(eventually(|| listener.saw(Some(t2), oid(1))).await);
        pause.release();
        t2
    });

    // The reply was read before the commit, so it is returned but must not
    // become the cached current revision.
    assert_eq!(loaded.unwrap(), (b"old".to_vec(), t1));
    assert_ne!(reader.cache_load(oid(1)), Some((b"old".to_vec(), t1)));
    assert_eq!(reader.load(oid(1)).await.unwrap(), (b"new".to_vec(), t2));

    writer.close().await;
    reader.close().await;
    server.shutdown().await;
}
