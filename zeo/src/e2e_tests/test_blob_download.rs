//! Blobs are uploaded in chunks and downloaded once per client.

use crate::blob::BlobLayout;
use crate::e2e_tests::helpers::{client_config, open, start};
use crate::error::StorageError;
use crate::server::MemoryStorage;
use crate::types::{Tid, TransactionMeta};

fn blob_data() -> Vec<u8> {
    (0..200_000u32).map(|i| u8::try_from(i % 251).unwrap()).collect()
}

#[tokio::test]
async fn test_concurrent_loads_share_one_download() {
    let server_dir = tempfile::tempdir().unwrap();
    let storage = MemoryStorage::new("1").with_blobs(BlobLayout::open(server_dir.path()).unwrap());
    let server = start(storage).await;

    let writer_dir = tempfile::tempdir().unwrap();
    let writer = open(client_config(&server).with_blob_dir(writer_dir.path())).await;
    let oid = writer.new_oid().await.unwrap();
    let data = blob_data();
    let upload = writer.temporary_directory().unwrap().join("upload.bin");
    std::fs::write(&upload, &data).unwrap();

    let txn = TransactionMeta::new("tester", "blob");
    writer.tpc_begin(&txn).await.unwrap();
    writer
        .store_blob(oid, Tid::ZERO, b"record".to_vec(), &upload, &txn)
        .await
        .unwrap();
    writer.tpc_vote(&txn).await.unwrap();
    let tid = writer.tpc_finish(&txn, |_| {}).await.unwrap();

    // The writer keeps its own copy without asking the server.
    let before = writer.rpc_count();
    let local = writer.load_blob(oid, tid).await.unwrap();
    assert_eq!(std::fs::read(&local).unwrap(), data);
    assert_eq!(writer.rpc_count(), before);

    let reader_dir = tempfile::tempdir().unwrap();
    let reader = open(client_config(&server).with_blob_dir(reader_dir.path())).await;
    let before = reader.rpc_count();
    let (first, second) = tokio::join!(reader.load_blob(oid, tid), reader.load_blob(oid, tid));
    let first = first.unwrap();
    assert_eq!(first, second.unwrap());
    assert_eq!(reader.rpc_count(), before + 1);
    assert_eq!(std::fs::read(&first).unwrap(), data);
    assert_eq!(reader.load(oid).await.unwrap(), (b"record".to_vec(), tid));

    writer.close().await;
    reader.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_missing_blob_is_pos_key() {
    let server_dir = tempfile::tempdir().unwrap();
    let storage = MemoryStorage::new("1").with_blobs(BlobLayout::open(server_dir.path()).unwrap());
    let server = start(storage).await;
    let client_dir = tempfile::tempdir().unwrap();
    let client = open(client_config(&server).with_blob_dir(client_dir.path())).await;

    let oid = client.new_oid().await.unwrap();
    let tid = Tid::from_u64(1);
    let err = client.load_blob(oid, tid).await.unwrap_err();
    assert!(matches!(err, StorageError::PosKey { .. }), "{err}");
    // A failed download leaves nothing behind.
    let layout = BlobLayout::open(client_dir.path()).unwrap();
    assert!(!layout.exists(oid, tid));

    client.close().await;
    server.shutdown().await;
}
