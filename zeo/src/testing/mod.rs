use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::server::{HubConfig, RunningServer, Storage, StorageServer};
use crate::wire::Address;

mod pausing;

pub use pausing::{LoadPause, PausingStorage};

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create a fresh, empty directory under the system temp directory.
///
/// Each call returns a unique path. The directory is not automatically
/// cleaned up; callers that care remove it themselves.
pub fn new_test_dir(prefix: &str) -> PathBuf {
    let counter = TEST_DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = std::env::temp_dir().join(format!(
        "zeo_test_{prefix}_{}_{counter}",
        std::process::id()
    ));

    // Remove if it exists from a previous run
    let _ = std::fs::remove_dir_all(&path);
    std::fs::create_dir_all(&path).unwrap();
    path
}

/// Serve `storage` as storage `"1"` on a free loopback port.
pub async fn start_server(storage: Arc<dyn Storage>, config: HubConfig) -> RunningServer {
    start_server_at(&Address::Tcp("127.0.0.1:0".to_string()), storage, config).await
}

/// Serve `storage` as storage `"1"` on `address`.
pub async fn start_server_at(
    address: &Address,
    storage: Arc<dyn Storage>,
    config: HubConfig,
) -> RunningServer {
    let mut server = StorageServer::new(config);
    server.add_storage("1", storage);
    server.bind(address).await.unwrap()
}
