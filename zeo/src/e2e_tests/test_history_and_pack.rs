//! Revision history, and what packing leaves of it.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::e2e_tests::helpers::{client_config, commit, oid, open, start};
use crate::error::StorageError;
use crate::server::MemoryStorage;
use crate::types::Tid;

#[tokio::test]
async fn test_pack_drops_old_revisions() {
    let server = start(MemoryStorage::new("1")).await;
    let client = open(client_config(&server)).await;

    let t1 = commit(&client, &[(oid(1), Tid::ZERO, b"v1")]).await;
    let t2 = commit(&client, &[(oid(1), t1, b"v2")]).await;

    let history = client.history(oid(1), 10).await.unwrap();
    assert_eq!(history.iter().map(|h| h.tid).collect::<Vec<_>>(), vec![t2, t1]);
    assert_eq!(history[0].user, "tester");
    assert_eq!(history[0].size, 2);
    assert_eq!(client.history(oid(1), 1).await.unwrap().len(), 1);

    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs_f64() + 1.0;
    client.pack(now, true).await.unwrap();

    let history = client.history(oid(1), 10).await.unwrap();
    assert_eq!(history.iter().map(|h| h.tid).collect::<Vec<_>>(), vec![t2]);
    let err = client.load_serial(oid(1), t1).await.unwrap_err();
    assert!(matches!(err, StorageError::PosKey { .. }), "{err}");
    assert_eq!(client.load(oid(1)).await.unwrap(), (b"v2".to_vec(), t2));

    client.close().await;
    server.shutdown().await;
}
