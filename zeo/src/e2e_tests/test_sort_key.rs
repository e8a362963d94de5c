//! The sort key names the storage and the server it is connected to.

use std::time::Duration;

use crate::client::ClientStorage;
use crate::e2e_tests::helpers::{client_config, config_for, open, start};
use crate::server::MemoryStorage;
use crate::wire::Address;

#[tokio::test]
async fn test_sort_key_before_connecting_is_an_error() {
    // Nothing listens on the discard port.
    let config = config_for(vec![Address::Tcp("127.0.0.1:9".to_string())]).with_wait(false);
    let client = ClientStorage::open(config).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = client.sort_key().unwrap_err();
    assert!(err.is_disconnected(), "{err}");
    client.close().await;
}

#[tokio::test]
async fn test_sort_key_names_storage_and_server() {
    let server = start(MemoryStorage::new("1")).await;
    let client = open(client_config(&server)).await;
    assert_eq!(client.sort_key().unwrap(), format!("1:{}", server.address()));
    assert_eq!(client.name(), "1");

    client.close().await;
    server.shutdown().await;
}
