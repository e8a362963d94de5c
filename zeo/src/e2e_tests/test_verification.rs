//! Cache verification when a client comes back after missing commits.

use std::sync::Arc;

use crate::e2e_tests::helpers::{client_config, commit, eventually, oid, open, start};
use crate::server::{HubConfig, MemoryStorage, Storage};
use crate::testing::{PausingStorage, new_test_dir, start_server};
use crate::types::Tid;

#[tokio::test]
async fn test_quick_verification_replays_missed_commits() {
    let server = start(MemoryStorage::new("1")).await;
    let var_dir = new_test_dir("quick_verify");
    let config = client_config(&server)
        .with_client_name("quick")
        .with_var_dir(&var_dir);

    let client = open(config.clone()).await;
    let t1 = commit(&client, &[(oid(1), Tid::ZERO, b"one")]).await;
    let t2 = commit(&client, &[(oid(2), Tid::ZERO, b"two")]).await;
    client.close().await;

    let other = open(client_config(&server)).await;
    let t3 = commit(&other, &[(oid(1), t1, b"one, changed")]).await;

    let client = open(config).await;
    assert_eq!(client.last_transaction(), t3);
    let before = client.rpc_count();
    assert_eq!(client.load(oid(2)).await.unwrap(), (b"two".to_vec(), t2));
    assert_eq!(client.rpc_count(), before);
    assert_eq!(client.load(oid(1)).await.unwrap(), (b"one, changed".to_vec(), t3));
    assert_eq!(client.rpc_count(), before + 1);

    client.close().await;
    other.close().await;
    server.shutdown().await;
    let _ = std::fs::remove_dir_all(&var_dir);
}

#[tokio::test]
async fn test_full_verification_when_queue_is_too_short() {
    let config = HubConfig {
        invalidation_queue_size: 1,
        ..HubConfig::default()
    };
    let server = start_server(Arc::new(MemoryStorage::new("1")), config).await;
    let var_dir = new_test_dir("full_verify");
    let client_cfg = client_config(&server)
        .with_client_name("full")
        .with_var_dir(&var_dir);

    let client = open(client_cfg.clone()).await;
    let t1 = commit(&client, &[(oid(1), Tid::ZERO, b"one")]).await;
    let t2 = commit(&client, &[(oid(2), Tid::ZERO, b"two")]).await;
    client.close().await;

    let other = open(client_config(&server)).await;
    let t3 = commit(&other, &[(oid(1), t1, b"one, changed")]).await;
    let t4 = commit(&other, &[(oid(3), Tid::ZERO, b"three")]).await;
    assert!(t4 > t3);

    let client = open(client_cfg).await;
    assert_eq!(client.last_transaction(), t4);
    let before = client.rpc_count();
    assert_eq!(client.load(oid(2)).await.unwrap(), (b"two".to_vec(), t2));
    assert_eq!(client.rpc_count(), before);
    assert_eq!(client.load(oid(1)).await.unwrap(), (b"one, changed".to_vec(), t3));
    assert_eq!(client.rpc_count(), before + 1);

    client.close().await;
    other.close().await;
    server.shutdown().await;
    let _ = std::fs::remove_dir_all(&var_dir);
}

#[tokio::test]
async fn test_drop_cache_rather_verify_starts_cold() {
    let config = HubConfig {
        invalidation_queue_size: 1,
        ..HubConfig::default()
    };
    let server = start_server(Arc::new(MemoryStorage::new("1")), config).await;
    let var_dir = new_test_dir("drop_cache");
    let client_cfg = client_config(&server)
        .with_client_name("cold")
        .with_var_dir(&var_dir)
        .with_drop_cache_rather_verify(true);

    let client = open(client_cfg.clone()).await;
    let t1 = commit(&client, &[(oid(1), Tid::ZERO, b"one")]).await;
    client.close().await;

    let other = open(client_config(&server)).await;
    commit(&other, &[(oid(2), Tid::ZERO, b"two")]).await;
    commit(&other, &[(oid(3), Tid::ZERO, b"three")]).await;

    let client = open(client_cfg).await;
    let before = client.rpc_count();
    assert_eq!(client.load(oid(1)).await.unwrap(), (b"one".to_vec(), t1));
    assert_eq!(client.rpc_count(), before + 1);

    client.close().await;
    other.close().await;
    server.shutdown().await;
    let _ = std::fs::remove_dir_all(&var_dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_commit_during_full_verification_is_not_lost() {
    let config = HubConfig {
        invalidation_queue_size: 1,
        ..HubConfig::default()
    };
    let storage = Arc::new(PausingStorage::new(MemoryStorage::new("1")));
    #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
    let shared: Arc<dyn Storage> = Arc::clone(&storage) as _;
    let server = start_server(shared, config).await;
    let var_dir = new_test_dir("verify_race");
    let client_cfg = client_config(&server)
        .with_client_name("race")
        .with_var_dir(&var_dir);

    let client = open(client_cfg.clone()).await;
    let t1 = commit(&client, &[(oid(1), Tid::ZERO, b"one")]).await;
    let t2 = commit(&client, &[(oid(2), Tid::ZERO, b"two")]).await;
    client.close().await;

    let other = open(client_config(&server)).await;
    commit(&other, &[(oid(3), Tid::ZERO, b"three")]).await;
    commit(&other, &[(oid(4), Tid::ZERO, b"four")]).await;

    // Hold the server's check of oid 2 until another client has replaced
    // it, so the check answers "still current" for a stale revision.
    let mut pause = storage.pause_load(oid(2));
    let (client, t5) = tokio::join!(open(client_cfg), async {
        assert!(pause.reached().await);
        let t5 = commit(&other, &[(oid(2), t2, b"two, raced")]).await;
        pause.release();
        t5
    });

    assert!(eventually(|| client.last_transaction() == t5).await);
    assert_eq!(client.load(oid(2)).await.unwrap(), (b"two, raced".to_vec(), t5));
    assert_eq!(client.load(oid(1)).await.unwrap(), (b"one".to_vec(), t1));

    client.close().await;
    other.close().await;
    server.shutdown().await;
    let _ = std::fs::remove_dir_all(&var_dir);
}
