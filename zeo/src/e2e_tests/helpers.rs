//! Common helpers for end-to-end tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::client::{ClientStorage, InvalidationListener};
use crate::config::ClientConfig;
use crate::server::{HubConfig, MemoryStorage, RunningServer};
use crate::testing::start_server;
use crate::types::{Oid, Tid, TransactionMeta};
use crate::wire::Address;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

pub const fn oid(n: u64) -> Oid {
    Oid::from_u64(n)
}

/// Serve `storage` with default hub settings.
pub async fn start(storage: MemoryStorage) -> RunningServer {
    start_server(Arc::new(storage), HubConfig::default()).await
}

/// Client settings for `server` with timings short enough for tests.
pub fn client_config(server: &RunningServer) -> ClientConfig {
    config_for(vec![server.address().clone()])
}

pub fn config_for(addresses: Vec<Address>) -> ClientConfig {
    ClientConfig::new(addresses)
        .with_disconnect_poll(Duration::from_millis(20), Duration::from_millis(200))
        .with_wait_timeout(WAIT)
        .with_heartbeat(Duration::from_millis(500), Duration::from_secs(10))
        .with_upgrade_interval(Duration::from_millis(100))
}

/// Open a client and make sure it connected.
pub async fn open(config: ClientConfig) -> ClientStorage {
    let client = ClientStorage::open(config).await.unwrap();
    assert!(client.wait_connected(WAIT).await, "client did not connect");
    client
}

/// Commit `writes` as one transaction and return its tid.
pub async fn commit(client: &ClientStorage, writes: &[(Oid, Tid, &[u8])]) -> Tid {
    let txn = TransactionMeta::new("tester", "e2e commit");
    client.tpc_begin(&txn).await.unwrap();
    for (oid, prev, data) in writes {
        client.store(*oid, *prev, data.to_vec(), &txn).await.unwrap();
    }
    client.tpc_vote(&txn).await.unwrap();
    client.tpc_finish(&txn, |_| {}).await.unwrap()
}

/// Attach a fresh [`RecordingListener`] to `client`.
pub fn listen(client: &ClientStorage) -> Arc<RecordingListener> {
    let listener = Arc::new(RecordingListener::default());
    #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
    let shared: Arc<dyn InvalidationListener> = Arc::clone(&listener) as _;
    client.register_listener(shared);
    listener
}

/// Poll `condition` every 10ms until it holds or [`WAIT`] passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Records every invalidation a client reports.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<(Option<Tid>, Vec<Oid>)>>,
    resets: AtomicUsize,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<(Option<Tid>, Vec<Oid>)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn saw(&self, tid: Option<Tid>, oid: Oid) -> bool {
        self.events()
            .iter()
            .any(|(t, oids)| *t == tid && oids.contains(&oid))
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl InvalidationListener for RecordingListener {
    fn invalidate(&self, tid: Option<Tid>, oids: &[Oid]) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((tid, oids.to_vec()));
    }

    fn invalidate_cache(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}
