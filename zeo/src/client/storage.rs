//! Client storage: the local face of a remote storage.
//!
//! [`ClientStorage`] answers loads from the persistent cache when it can and
//! goes to the server otherwise, runs two-phase commit over the active
//! connection and keeps the cache consistent with the invalidations the
//! server pushes. The connection itself is looked after by the manager task
//! in [`super::manager`].
//!
//! The synchronous locks nest only as `txn`, then `cache`, then `server`.
//! None of them is held across an await.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;

use super::connection::{ConnId, Connection, Push, PushHandler};
use super::manager;
use super::tbuf::{DEFAULT_SPILL_THRESHOLD, TransactionBuffer};
use super::verify::{InvalidationSpill, replay_spill};
use super::wait_for;
use crate::blob::{BlobDigest, BlobLayout, for_each_chunk};
use crate::cache::{CacheStats, ClientCache};
use crate::config::ClientConfig;
use crate::error::StorageError;
use crate::proto;
use crate::types::{
    HistoryEntry, Oid, ProtoDeserializable, RecordItem, StorageInfo, StoreOutcome, Tid,
    TransactionMeta, UndoDescriptor, decode_oids,
};
use crate::wire::Method;

/// How many oids `new_oid` fetches per round trip.
const OID_BATCH: u32 = 100;

/// How long `tpc_begin` sleeps between checks while another transaction
/// holds the client.
const TPC_BEGIN_POLL: Duration = Duration::from_secs(30);

/// Told about objects that changed on the server, so object caches above
/// the storage can drop their copies.
pub trait InvalidationListener: Send + Sync {
    /// `tid` is `None` when the server sent the null tid.
    fn invalidate(&self, tid: Option<Tid>, oids: &[Oid]);

    /// Everything may have changed; called after every (re)connection.
    fn invalidate_cache(&self);
}

#[derive(Debug, Clone, Default)]
pub(super) enum ServerSlot {
    Connected(Arc<Connection>),
    #[default]
    Disconnected,
}

/// Everything guarded by the cache lock.
pub(crate) struct CacheState {
    pub(crate) cache: ClientCache,
    /// The oid a `load` is fetching from the server right now.
    load_oid: Option<Oid>,
    /// Set when `load_oid` was invalidated while its load was in flight.
    load_stale: bool,
    /// Invalidations for connections that are still verifying.
    pub(crate) spills: HashMap<ConnId, InvalidationSpill>,
    pub(crate) verify_waiters: HashMap<ConnId, oneshot::Sender<()>>,
    pub(crate) active: Option<ConnId>,
}

impl CacheState {
    pub(crate) fn new(cache: ClientCache) -> Self {
        Self {
            cache,
            load_oid: None,
            load_stale: false,
            spills: HashMap::new(),
            verify_waiters: HashMap::new(),
            active: None,
        }
    }

    /// Invalidate `oids` at `tid` and advance the cache watermark.
    pub(crate) fn apply_invalidations(&mut self, tid: Option<Tid>, oids: &[Oid]) {
        for &oid in oids {
            if self.load_oid == Some(oid) {
                self.load_stale = true;
            }
            if let Err(e) = self.cache.invalidate(oid, tid) {
                tracing::warn!("could not invalidate {oid}: {e}");
            }
        }
        if let Some(tid) = tid {
            if tid > self.cache.last_tid() {
                if let Err(e) = self.cache.set_last_tid(tid) {
                    tracing::warn!("could not advance cache to {tid}: {e}");
                }
            }
        }
    }
}

struct TxnState {
    /// Id of the transaction between `tpc_begin` and finish or abort.
    active: Option<u64>,
    /// The connection the transaction began on.
    conn: Option<ConnId>,
    midtxn_disconnect: bool,
    /// Serials pushed by the server, not yet looked at.
    serials: Vec<(Oid, Result<StoreOutcome, StorageError>)>,
    seriald: HashMap<Oid, StoreOutcome>,
    tbuf: TransactionBuffer,
}

impl TxnState {
    fn reset(&mut self) {
        self.active = None;
        self.conn = None;
        self.midtxn_disconnect = false;
        self.serials.clear();
        self.seriald.clear();
        self.tbuf.clear();
    }
}

type Download = Shared<BoxFuture<'static, Result<PathBuf, StorageError>>>;

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    server: RwLock<ServerSlot>,
    pub(crate) connected: watch::Sender<bool>,
    /// Set while the manager is verifying a connection after a disconnect.
    pub(crate) verifying: AtomicBool,
    /// The active connection is a read-only fallback.
    fallback: AtomicBool,
    txn: Mutex<TxnState>,
    txn_freed: Notify,
    load_lock: tokio::sync::Mutex<()>,
    cache: Mutex<CacheState>,
    oids: tokio::sync::Mutex<Vec<Oid>>,
    blobs: Option<BlobLayout>,
    downloads: Mutex<HashMap<(Oid, Tid), Download>>,
    info: Mutex<StorageInfo>,
    listener: RwLock<Option<Arc<dyn InvalidationListener>>>,
    peer: Mutex<Option<String>>,
    pub(crate) rpc_count: Arc<AtomicU64>,
    pub(crate) closed: watch::Sender<bool>,
}

impl ClientInner {
    pub(crate) fn lock_cache(&self) -> MutexGuard<'_, CacheState> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_txn(&self) -> MutexGuard<'_, TxnState> {
        self.txn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_downloads(&self) -> MutexGuard<'_, HashMap<(Oid, Tid), Download>> {
        self.downloads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_info(&self, info: StorageInfo) {
        *self.info.lock().unwrap_or_else(PoisonError::into_inner) = info;
    }

    pub(crate) fn current_connection(&self) -> Option<Arc<Connection>> {
        match &*self.server.read().unwrap_or_else(PoisonError::into_inner) {
            ServerSlot::Connected(conn) if !conn.is_closed() => Some(Arc::clone(conn)),
            _ => None,
        }
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.lock_txn().active.is_some()
    }

    pub(crate) fn is_fallback(&self) -> bool {
        self.fallback.load(Ordering::SeqCst)
    }

    /// The active connection. While the manager is verifying a new one,
    /// waits for it up to the configured wait timeout.
    async fn server(&self) -> Result<Arc<Connection>, StorageError> {
        if let Some(conn) = self.current_connection() {
            return Ok(conn);
        }
        if self.verifying.load(Ordering::SeqCst) {
            let mut connected = self.connected.subscribe();
            let _ = tokio::time::timeout(self.config.wait_timeout, wait_for(&mut connected, true)).await;
            if let Some(conn) = self.current_connection() {
                return Ok(conn);
            }
        }
        Err(StorageError::Disconnected(format!(
            "storage {} is not connected",
            self.config.storage
        )))
    }

    /// Register a spill for a connection that is about to register, so no
    /// invalidation sent from then on is lost.
    pub(crate) fn open_spill(&self, conn: ConnId) -> Result<(), StorageError> {
        let spill = InvalidationSpill::create()?;
        self.lock_cache().spills.insert(conn, spill);
        Ok(())
    }

    pub(crate) fn discard_spill(&self, conn: ConnId) {
        let mut state = self.lock_cache();
        state.spills.remove(&conn);
        state.verify_waiters.remove(&conn);
    }

    /// Make a verified connection the active one. Invalidations spilled
    /// during verification are applied first, atomically with the switch.
    pub(crate) fn install_connection(
        &self,
        conn: &Arc<Connection>,
        read_only: bool,
    ) -> Result<Vec<(Option<Tid>, Vec<Oid>)>, StorageError> {
        let mut state = self.lock_cache();
        let Some(mut spill) = state.spills.remove(&conn.id()) else {
            return Err(StorageError::Disconnected(format!(
                "{} closed during verification",
                conn.address()
            )));
        };
        let applied = replay_spill(&mut state, &mut spill)?;
        state.active = Some(conn.id());
        *self.server.write().unwrap_or_else(PoisonError::into_inner) =
            ServerSlot::Connected(Arc::clone(conn));
        self.fallback.store(read_only, Ordering::SeqCst);
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn.peer().to_string());
        self.connected.send_replace(true);
        Ok(applied)
    }

    fn listener(&self) -> Option<Arc<dyn InvalidationListener>> {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn notify_listener(&self, tid: Option<Tid>, oids: &[Oid]) {
        if let Some(listener) = self.listener() {
            listener.invalidate(tid, oids);
        }
    }

    pub(crate) fn notify_listener_reset(&self) {
        if let Some(listener) = self.listener() {
            listener.invalidate_cache();
        }
    }

    fn receive_invalidation(&self, conn: ConnId, tid: Option<Tid>, oids: &[Oid]) {
        {
            let mut state = self.lock_cache();
            if let Some(spill) = state.spills.get_mut(&conn) {
                if let Err(e) = spill.record(tid, oids) {
                    tracing::warn!("could not spill invalidations from connection {conn}: {e}");
                }
                return;
            }
            if state.active != Some(conn) {
                tracing::trace!("ignoring invalidation from inactive connection {conn}");
                return;
            }
            state.apply_invalidations(tid, oids);
        }
        self.notify_listener(tid, oids);
    }

    fn check_transaction(&self, txn: &TransactionMeta) -> Result<(), StorageError> {
        if self.lock_txn().active == Some(txn.id) {
            Ok(())
        } else {
            Err(StorageError::StorageTransaction(format!(
                "transaction {} is not the active transaction",
                txn.id
            )))
        }
    }

    /// The connection the active transaction began on.
    fn transaction_connection(&self) -> Result<Arc<Connection>, StorageError> {
        let began_on = {
            let txn = self.lock_txn();
            if txn.midtxn_disconnect {
                return Err(StorageError::Disconnected(
                    "connection lost during the transaction".to_string(),
                ));
            }
            txn.conn
        };
        match self.current_connection() {
            Some(conn) if Some(conn.id()) == began_on => Ok(conn),
            _ => Err(StorageError::Disconnected(
                "connection lost during the transaction".to_string(),
            )),
        }
    }

    /// Claim the transaction slot for `txn_id`. Returns false if it is
    /// already ours.
    async fn acquire_transaction(&self, txn_id: u64) -> bool {
        loop {
            let freed = self.txn_freed.notified();
            {
                let mut txn = self.lock_txn();
                match txn.active {
                    None => {
                        txn.reset();
                        txn.active = Some(txn_id);
                        return true;
                    }
                    Some(active) if active == txn_id => return false,
                    Some(active) => {
                        tracing::debug!("transaction {txn_id} waiting for {active} to finish");
                    }
                }
            }
            let _ = tokio::time::timeout(TPC_BEGIN_POLL, freed).await;
        }
    }

    fn end_transaction(&self) {
        self.lock_txn().reset();
        self.txn_freed.notify_waiters();
    }

    /// Move pushed serials into `seriald`. Returns the first store error.
    fn drain_serials(&self) -> Result<Vec<(Oid, StoreOutcome)>, StorageError> {
        let mut txn = self.lock_txn();
        let mut first_error = None;
        let mut outcomes = Vec::new();
        for (oid, outcome) in std::mem::take(&mut txn.serials) {
            match outcome {
                Ok(outcome) => {
                    txn.seriald.insert(oid, outcome);
                    outcomes.push((oid, outcome));
                }
                Err(e) => {
                    tracing::debug!("store of {oid} failed: {e}");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        first_error.map_or(Ok(outcomes), Err)
    }

    async fn finish<F: FnOnce(Tid)>(&self, txn: &TransactionMeta, f: F) -> Result<Tid, StorageError> {
        let _load = self.load_lock.lock().await;
        let conn = self.transaction_connection()?;
        let reply: proto::TidResult = conn
            .call(Method::TpcFinish, &proto::TxnArgs { txn_id: txn.id })
            .await?;
        let tid = Tid::try_from(reply.tid.as_slice())?;
        // Serials of stores that raced the vote.
        if let Err(e) = self.drain_serials() {
            tracing::warn!("store failure reported after vote: {e}");
        }
        self.apply_commit(tid, f)?;
        Ok(tid)
    }

    /// Copy a committed transaction into the cache and blob directory.
    fn apply_commit<F: FnOnce(Tid)>(&self, tid: Tid, f: F) -> Result<(), StorageError> {
        let mut txn = self.lock_txn();
        let entries = txn.tbuf.entries()?;
        {
            let mut state = self.lock_cache();
            for &oid in txn.seriald.keys() {
                if let Err(e) = state.cache.invalidate(oid, Some(tid)) {
                    tracing::warn!("could not invalidate {oid}: {e}");
                }
            }
            for entry in &entries {
                if let Err(e) = state.cache.invalidate(entry.oid, Some(tid)) {
                    tracing::warn!("could not invalidate {}: {e}", entry.oid);
                }
                let Some(data) = &entry.data else {
                    continue;
                };
                if txn.seriald.get(&entry.oid) == Some(&StoreOutcome::Resolved) {
                    continue;
                }
                if let Err(e) = state.cache.store(entry.oid, tid, None, data) {
                    tracing::warn!("could not cache {}@{tid}: {e}", entry.oid);
                }
            }
            f(tid);
            if let Err(e) = state.cache.set_last_tid(tid) {
                tracing::warn!("could not advance cache to {tid}: {e}");
            }
        }

        if let Some(layout) = &self.blobs {
            for (oid, path) in txn.tbuf.blobs() {
                if let Err(e) = layout.install(path, *oid, tid) {
                    tracing::warn!("could not install blob {oid}@{tid}: {e}");
                }
            }
        }
        Ok(())
    }

    fn blob_layout(&self) -> Result<&BlobLayout, StorageError> {
        self.blobs
            .as_ref()
            .ok_or_else(|| StorageError::Unsupported("blobs are not configured".to_string()))
    }

    async fn download_blob(&self, oid: Oid, tid: Tid) -> Result<PathBuf, StorageError> {
        let layout = self.blob_layout()?;
        if layout.exists(oid, tid) {
            return Ok(layout.path(oid, tid));
        }
        if self.config.shared_blob_dir {
            return Err(StorageError::PosKey { oid, tid: Some(tid) });
        }
        let conn = self.server().await?;
        let temp = layout.temp_path(oid, tid)?;
        let result = async {
            receive_blob(&conn, oid, tid, &temp).await?;
            Ok::<_, StorageError>(layout.install(&temp, oid, tid)?)
        }
        .await;
        if result.is_err() {
            let _ = std::fs::remove_file(&temp);
        }
        result
    }
}

async fn receive_blob(
    conn: &Connection,
    oid: Oid,
    tid: Tid,
    temp: &std::path::Path,
) -> Result<(), StorageError> {
    let mut call = conn.call_streaming(
        Method::LoadBlob,
        &proto::OidTidArgs {
            oid: oid.0.to_vec(),
            tid: tid.0.to_vec(),
        },
    )?;
    let mut file = tokio::fs::File::create(temp).await?;
    let mut digest = BlobDigest::new();
    while let Some(chunk) = call.chunks.recv().await {
        digest.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.sync_all().await?;
    drop(file);

    let trailer: proto::BlobTrailer = call.reply().await?;
    let (crc32, length) = digest.finish();
    if crc32 != trailer.crc32 || length != trailer.length {
        return Err(StorageError::StorageSystem(format!(
            "blob {oid}@{tid} arrived damaged: {length} bytes crc {crc32:08x}, expected {} bytes crc {:08x}",
            trailer.length, trailer.crc32
        )));
    }
    Ok(())
}

impl PushHandler for ClientInner {
    fn on_push(&self, conn: ConnId, push: Push) {
        match push {
            Push::Serial { oid, outcome } => {
                let mut txn = self.lock_txn();
                if txn.conn == Some(conn) {
                    txn.serials.push((oid, outcome));
                } else {
                    tracing::debug!("dropping serial for {oid} outside a transaction");
                }
            }
            Push::Invalidation { tid, oids } => self.receive_invalidation(conn, tid, &oids),
            Push::VerifyInvalidation(oid) => {
                if let Some(spill) = self.lock_cache().spills.get_mut(&conn) {
                    spill.record_verify(oid);
                }
            }
            Push::BeginVerify => tracing::trace!("connection {conn}: verification started"),
            Push::EndVerify => {
                let done = self.lock_cache().verify_waiters.remove(&conn);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Push::Info(info) => {
                let active = self.lock_cache().active == Some(conn);
                if active {
                    self.set_info(info);
                }
            }
            Push::Unlock => tracing::debug!("connection {conn}: commit lock granted"),
        }
    }

    fn on_disconnect(&self, conn: ConnId) {
        {
            let mut state = self.lock_cache();
            state.spills.remove(&conn);
            state.verify_waiters.remove(&conn);
            if state.active != Some(conn) {
                return;
            }
            state.active = None;
            *self.server.write().unwrap_or_else(PoisonError::into_inner) = ServerSlot::Disconnected;
            self.connected.send_replace(false);
        }
        let mut txn = self.lock_txn();
        if txn.active.is_some() && txn.conn == Some(conn) {
            tracing::warn!("disconnected in the middle of transaction {:?}", txn.active);
            txn.midtxn_disconnect = true;
        }
        tracing::info!("storage {} disconnected", self.config.storage);
    }
}

/// A storage served by one of the configured servers.
pub struct ClientStorage {
    inner: Arc<ClientInner>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ClientStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStorage")
            .field("storage", &self.inner.config.storage)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl ClientStorage {
    /// Open the cache and start connecting.
    ///
    /// With `wait` set, returns once connected or after `wait_timeout`,
    /// whichever comes first; a storage that is still disconnected keeps
    /// trying in the background.
    pub async fn open(config: ClientConfig) -> Result<Self, StorageError> {
        config.validate()?;
        let cache_path = config.cache_path();
        let cache = ClientCache::open(cache_path.as_deref(), config.cache_size)?;
        let blobs = match &config.blob_dir {
            Some(dir) => Some(BlobLayout::open(dir.clone())?),
            None => None,
        };
        let (connected, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            server: RwLock::new(ServerSlot::Disconnected),
            connected,
            verifying: AtomicBool::new(false),
            fallback: AtomicBool::new(false),
            txn: Mutex::new(TxnState {
                active: None,
                conn: None,
                midtxn_disconnect: false,
                serials: Vec::new(),
                seriald: HashMap::new(),
                tbuf: TransactionBuffer::new(Some(std::env::temp_dir()), DEFAULT_SPILL_THRESHOLD),
            }),
            txn_freed: Notify::new(),
            load_lock: tokio::sync::Mutex::new(()),
            cache: Mutex::new(CacheState::new(cache)),
            oids: tokio::sync::Mutex::new(Vec::new()),
            blobs,
            downloads: Mutex::new(HashMap::new()),
            info: Mutex::new(StorageInfo::default()),
            listener: RwLock::new(None),
            peer: Mutex::new(None),
            rpc_count: Arc::new(AtomicU64::new(0)),
            closed,
            config,
        });

        let manager = manager::spawn(Arc::downgrade(&inner));
        let storage = Self {
            inner,
            manager: Mutex::new(Some(manager)),
        };
        let config = &storage.inner.config;
        if config.wait && !storage.wait_connected(config.wait_timeout).await {
            tracing::warn!(
                "storage {} not connected after {:?}, continuing without a server",
                config.storage,
                config.wait_timeout
            );
        }
        Ok(storage)
    }

    /// Wait until connected. Returns false on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut connected = self.inner.connected.subscribe();
        tokio::time::timeout(timeout, wait_for(&mut connected, true))
            .await
            .is_ok()
    }

    pub fn register_listener(&self, listener: Arc<dyn InvalidationListener>) {
        *self
            .inner
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Read-only by configuration or because the active connection is a
    /// fallback.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inner.config.read_only || self.inner.is_fallback()
    }

    /// `"<storage>:<server address>"`, for ordering storages in a
    /// multi-storage commit.
    pub fn sort_key(&self) -> Result<String, StorageError> {
        self.inner
            .peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|peer| format!("{}:{peer}", self.inner.config.storage))
            .ok_or_else(|| StorageError::Disconnected("never connected".to_string()))
    }

    /// The last transaction the cache knows about.
    #[must_use]
    pub fn last_transaction(&self) -> Tid {
        self.inner.lock_cache().cache.last_tid()
    }

    /// Storage description as of the last `register`, `get_info` or info
    /// push.
    #[must_use]
    pub fn info(&self) -> StorageInfo {
        self.inner
            .info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.storage
    }

    /// Synchronous calls sent so far.
    #[must_use]
    pub fn rpc_count(&self) -> u64 {
        self.inner.rpc_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.lock_cache().cache.stats()
    }

    pub async fn get_info(&self) -> Result<StorageInfo, StorageError> {
        let conn = self.inner.server().await?;
        let reply: proto::StorageInfo = conn.call(Method::GetInfo, &proto::Empty {}).await?;
        let info = StorageInfo::from_proto(reply).map_err(StorageError::Protocol)?;
        self.inner.set_info(info.clone());
        Ok(info)
    }

    pub async fn load(&self, oid: Oid) -> Result<(Vec<u8>, Tid), StorageError> {
        if let Some(hit) = self.cache_load(oid) {
            return Ok(hit);
        }
        let conn = self.inner.server().await?;
        let _load = self.inner.load_lock.lock().await;
        if let Some(hit) = self.cache_load(oid) {
            return Ok(hit);
        }
        {
            let mut state = self.inner.lock_cache();
            state.load_oid = Some(oid);
            state.load_stale = false;
        }
        let result: Result<proto::LoadResult, StorageError> = conn
            .call(Method::LoadEx, &proto::OidArgs { oid: oid.0.to_vec() })
            .await;

        let mut state = self.inner.lock_cache();
        let stale = std::mem::take(&mut state.load_stale);
        state.load_oid = None;
        let reply = result?;
        let tid = Tid::try_from(reply.tid.as_slice())?;
        if stale {
            tracing::debug!("not caching {oid}@{tid}: invalidated while loading");
        } else if let Err(e) = state.cache.store(oid, tid, None, &reply.data) {
            tracing::debug!("could not cache {oid}@{tid}: {e}");
        }
        Ok((reply.data, tid))
    }

    pub(crate) fn cache_load(&self, oid: Oid) -> Option<(Vec<u8>, Tid)> {
        match self.inner.lock_cache().cache.load(oid) {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!("cache read of {oid} failed: {e}");
                None
            }
        }
    }

    /// The revision of `oid` current just before `tid`, with its validity
    /// range. `None` if the object did not exist yet.
    pub async fn load_before(
        &self,
        oid: Oid,
        tid: Tid,
    ) -> Result<Option<(Vec<u8>, Tid, Option<Tid>)>, StorageError> {
        let cached = self.inner.lock_cache().cache.load_before(oid, tid);
        match cached {
            Ok(Some(record)) => return Ok(Some((record.data, record.start, record.end))),
            Ok(None) => {}
            Err(e) => tracing::warn!("cache read of {oid} before {tid} failed: {e}"),
        }

        let conn = self.inner.server().await?;
        let reply: proto::LoadBeforeResult = conn
            .call(
                Method::LoadBefore,
                &proto::OidTidArgs {
                    oid: oid.0.to_vec(),
                    tid: tid.0.to_vec(),
                },
            )
            .await?;
        if !reply.found {
            return Ok(None);
        }
        let start = Tid::try_from(reply.start.as_slice())?;
        let end = reply
            .end
            .as_deref()
            .map(Tid::try_from)
            .transpose()?;
        if let Some(end) = end {
            if let Err(e) = self.inner.lock_cache().cache.store(oid, start, Some(end), &reply.data) {
                tracing::debug!("could not cache {oid}@{start}: {e}");
            }
        }
        Ok(Some((reply.data, start, end)))
    }

    pub async fn load_serial(&self, oid: Oid, serial: Tid) -> Result<Vec<u8>, StorageError> {
        let conn = self.inner.server().await?;
        let reply: proto::DataResult = conn
            .call(
                Method::LoadSerial,
                &proto::OidTidArgs {
                    oid: oid.0.to_vec(),
                    tid: serial.0.to_vec(),
                },
            )
            .await?;
        Ok(reply.data)
    }

    /// A fresh oid. Oids are fetched from the server in batches.
    pub async fn new_oid(&self) -> Result<Oid, StorageError> {
        if self.is_read_only() {
            return Err(StorageError::ReadOnly);
        }
        let mut oids = self.inner.oids.lock().await;
        if oids.is_empty() {
            let conn = self.inner.server().await?;
            let reply: proto::OidList = conn
                .call(Method::NewOids, &proto::NewOidsArgs { count: OID_BATCH })
                .await?;
            let mut fresh = decode_oids(&reply.oids)?;
            fresh.reverse();
            *oids = fresh;
        }
        oids.pop()
            .ok_or_else(|| StorageError::StorageSystem("server returned no oids".to_string()))
    }

    /// Pack away revisions no longer needed as of `time` (seconds since the
    /// epoch).
    pub async fn pack(&self, time: f64, wait: bool) -> Result<(), StorageError> {
        let conn = self.inner.server().await?;
        let _: proto::Empty = conn
            .call(Method::Pack, &proto::PackArgs { time, wait })
            .await?;
        Ok(())
    }

    pub async fn tpc_begin(&self, txn: &TransactionMeta) -> Result<(), StorageError> {
        if self.is_read_only() {
            return Err(StorageError::ReadOnly);
        }
        if !self.inner.acquire_transaction(txn.id).await {
            return Ok(());
        }
        let result = async {
            let conn = self.inner.server().await?;
            let args = proto::TpcBeginArgs {
                txn_id: txn.id,
                user: txn.user.clone(),
                description: txn.description.clone(),
                extension: txn.extension.clone(),
                tid: None,
            };
            let _: proto::Empty = conn.call(Method::TpcBegin, &args).await?;
            Ok::<_, StorageError>(conn.id())
        }
        .await;
        match result {
            Ok(conn) => {
                self.inner.lock_txn().conn = Some(conn);
                Ok(())
            }
            Err(e) => {
                self.inner.end_transaction();
                Err(e)
            }
        }
    }

    /// Store a revision of `oid` written against `prev_tid`. Returns before
    /// the server has looked at it; problems surface from `tpc_vote`.
    pub async fn store(
        &self,
        oid: Oid,
        prev_tid: Tid,
        data: Vec<u8>,
        txn: &TransactionMeta,
    ) -> Result<(), StorageError> {
        self.inner.check_transaction(txn)?;
        let conn = self.inner.transaction_connection()?;
        let args = proto::StoreArgs {
            oid: oid.0.to_vec(),
            serial: prev_tid.0.to_vec(),
            data,
            txn_id: txn.id,
        };
        conn.call_async(Method::Storea, &args)?;
        self.inner.lock_txn().tbuf.store(oid, args.data)?;
        Ok(())
    }

    /// Store a revision together with the blob file at `blob_path`. The file
    /// is consumed.
    pub async fn store_blob(
        &self,
        oid: Oid,
        prev_tid: Tid,
        data: Vec<u8>,
        blob_path: &std::path::Path,
        txn: &TransactionMeta,
    ) -> Result<(), StorageError> {
        self.inner.blob_layout()?;
        self.inner.check_transaction(txn)?;
        let conn = self.inner.transaction_connection()?;
        let record = proto::StoreArgs {
            oid: oid.0.to_vec(),
            serial: prev_tid.0.to_vec(),
            data,
            txn_id: txn.id,
        };

        if self.inner.config.shared_blob_dir {
            let args = proto::StoreBlobSharedArgs {
                record: Some(record),
                filename: blob_path.display().to_string(),
            };
            conn.call_async(Method::StoreBlobShared, &args)?;
            let data = args.record.map(|r| r.data).unwrap_or_default();
            self.inner.lock_txn().tbuf.store(oid, data)?;
            return Ok(());
        }

        let mut send_error = None;
        let (crc32, length) = for_each_chunk(blob_path, |chunk| {
            let args = proto::StoreBlobChunkArgs {
                oid: oid.0.to_vec(),
                chunk: chunk.to_vec(),
                txn_id: txn.id,
            };
            conn.call_async(Method::StoreBlob, &args).map_err(|e| {
                send_error = Some(e);
                std::io::Error::other("connection closed while sending blob")
            })
        })
        .map_err(|e| send_error.take().unwrap_or_else(|| e.into()))?;
        let args = proto::StoreBlobEndArgs {
            record: Some(record),
            trailer: Some(proto::BlobTrailer { length, crc32 }),
        };
        conn.call_async(Method::StoreBlobEnd, &args)?;

        let data = args.record.map(|r| r.data).unwrap_or_default();
        let mut state = self.inner.lock_txn();
        state.tbuf.store(oid, data)?;
        state.tbuf.stage_blob(oid, blob_path.to_path_buf());
        Ok(())
    }

    pub async fn delete_object(
        &self,
        oid: Oid,
        serial: Tid,
        txn: &TransactionMeta,
    ) -> Result<(), StorageError> {
        self.inner.check_transaction(txn)?;
        let conn = self.inner.transaction_connection()?;
        conn.call_async(
            Method::DeleteObject,
            &proto::StoreArgs {
                oid: oid.0.to_vec(),
                serial: serial.0.to_vec(),
                data: Vec::new(),
                txn_id: txn.id,
            },
        )?;
        self.inner.lock_txn().tbuf.invalidate(oid)?;
        Ok(())
    }

    /// Ask the server to confirm, at vote time, that `oid` is still at
    /// `serial`.
    pub async fn check_current_serial_in_transaction(
        &self,
        oid: Oid,
        serial: Tid,
        txn: &TransactionMeta,
    ) -> Result<(), StorageError> {
        self.inner.check_transaction(txn)?;
        let conn = self.inner.transaction_connection()?;
        conn.call_async(
            Method::CheckCurrentSerialInTransaction,
            &proto::StoreArgs {
                oid: oid.0.to_vec(),
                serial: serial.0.to_vec(),
                data: Vec::new(),
                txn_id: txn.id,
            },
        )
    }

    /// Vote. Returns the outcome of every store so far; the first store
    /// failure is returned as the error.
    pub async fn tpc_vote(
        &self,
        txn: &TransactionMeta,
    ) -> Result<Vec<(Oid, StoreOutcome)>, StorageError> {
        self.inner.check_transaction(txn)?;
        let conn = self.inner.transaction_connection()?;
        let vote: Result<proto::Empty, StorageError> = conn
            .call(Method::Vote, &proto::TxnArgs { txn_id: txn.id })
            .await;
        let outcomes = self.inner.drain_serials()?;
        vote?;
        Ok(outcomes)
    }

    /// Commit. `f` runs with the commit tid while the cache is locked, so no
    /// load can observe the cache half-updated.
    pub async fn tpc_finish<F>(&self, txn: &TransactionMeta, f: F) -> Result<Tid, StorageError>
    where
        F: FnOnce(Tid) + Send,
    {
        self.inner.check_transaction(txn)?;
        let result = self.inner.finish(txn, f).await;
        self.inner.end_transaction();
        result
    }

    /// Abort. A transaction that is not active is ignored, and so is a lost
    /// connection.
    pub async fn tpc_abort(&self, txn: &TransactionMeta) -> Result<(), StorageError> {
        if self.inner.check_transaction(txn).is_err() {
            return Ok(());
        }
        let result = match self.inner.transaction_connection() {
            Ok(conn) => conn
                .call::<_, proto::Empty>(Method::TpcAbort, &proto::TxnArgs { txn_id: txn.id })
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        self.inner.end_transaction();
        match result {
            Err(e) if e.is_disconnected() => {
                tracing::debug!("abort of transaction {} without a server: {e}", txn.id);
                Ok(())
            }
            other => other,
        }
    }

    pub async fn history(&self, oid: Oid, length: u32) -> Result<Vec<HistoryEntry>, StorageError> {
        let conn = self.inner.server().await?;
        let reply: proto::HistoryResult = conn
            .call(
                Method::History,
                &proto::HistoryArgs {
                    oid: oid.0.to_vec(),
                    length,
                },
            )
            .await?;
        reply
            .entries
            .into_iter()
            .map(|entry| HistoryEntry::from_proto(entry).map_err(StorageError::Protocol))
            .collect()
    }

    /// Undo transaction `undo_id` inside `txn`. Returns the server's tid for
    /// the undo and the oids it touches.
    pub async fn undo(
        &self,
        undo_id: Tid,
        txn: &TransactionMeta,
    ) -> Result<(Tid, Vec<Oid>), StorageError> {
        self.inner.check_transaction(txn)?;
        let conn = self.inner.transaction_connection()?;
        let reply: proto::UndoResult = conn
            .call(
                Method::Undo,
                &proto::UndoArgs {
                    undo_id: undo_id.0.to_vec(),
                    txn_id: txn.id,
                },
            )
            .await?;
        let tid = Tid::try_from(reply.tid.as_slice())?;
        let oids = decode_oids(&reply.oids)?;
        let mut state = self.inner.lock_txn();
        for &oid in &oids {
            state.tbuf.invalidate(oid)?;
        }
        Ok((tid, oids))
    }

    /// Undoable transactions, newest first. A negative `last` means
    /// `first - last` entries.
    pub async fn undo_log(&self, first: i64, last: i64) -> Result<Vec<UndoDescriptor>, StorageError> {
        self.undo_entries(Method::UndoLog, first, last).await
    }

    pub async fn undo_info(&self, first: i64, last: i64) -> Result<Vec<UndoDescriptor>, StorageError> {
        self.undo_entries(Method::UndoInfo, first, last).await
    }

    async fn undo_entries(
        &self,
        method: Method,
        first: i64,
        last: i64,
    ) -> Result<Vec<UndoDescriptor>, StorageError> {
        let conn = self.inner.server().await?;
        let reply: proto::UndoLogResult = conn
            .call(method, &proto::RangeArgs { first, last })
            .await?;
        reply
            .entries
            .into_iter()
            .map(|entry| UndoDescriptor::from_proto(entry).map_err(StorageError::Protocol))
            .collect()
    }

    /// One step of a scan over current records. Pass the previous item's
    /// `next` to continue.
    pub async fn record_iternext(&self, next: Option<Oid>) -> Result<Option<RecordItem>, StorageError> {
        let conn = self.inner.server().await?;
        let reply: proto::IterResult = conn
            .call(
                Method::RecordIternext,
                &proto::IterArgs {
                    next: next.map(|oid| oid.0.to_vec()),
                },
            )
            .await?;
        Option::<RecordItem>::from_proto(reply).map_err(StorageError::Protocol)
    }

    /// Path of the cached blob file for `oid@tid`, downloading it if needed.
    /// Concurrent calls for the same revision share one download.
    pub async fn load_blob(&self, oid: Oid, tid: Tid) -> Result<PathBuf, StorageError> {
        let layout = self.inner.blob_layout()?;
        if layout.exists(oid, tid) {
            return Ok(layout.path(oid, tid));
        }
        let download = {
            let mut downloads = self.inner.lock_downloads();
            if let Some(download) = downloads.get(&(oid, tid)) {
                download.clone()
            } else {
                let inner = Arc::clone(&self.inner);
                let download = async move {
                    let result = inner.download_blob(oid, tid).await;
                    inner.lock_downloads().remove(&(oid, tid));
                    result
                }
                .boxed()
                .shared();
                downloads.insert((oid, tid), download.clone());
                download
            }
        };
        download.await
    }

    pub async fn open_committed_blob_file(
        &self,
        oid: Oid,
        tid: Tid,
    ) -> Result<std::fs::File, StorageError> {
        let path = self.load_blob(oid, tid).await?;
        Ok(std::fs::File::open(path)?)
    }

    /// Where callers should create blob files to pass to `store_blob`.
    pub fn temporary_directory(&self) -> Result<PathBuf, StorageError> {
        Ok(self.inner.blob_layout()?.temporary_directory())
    }

    /// Stop the manager, drop the connection and flush the cache.
    pub async fn close(&self) {
        self.inner.closed.send_replace(true);
        let manager = self
            .manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(manager) = manager {
            manager.abort();
            let _ = manager.await;
        }
        if let Some(conn) = self.inner.current_connection() {
            conn.close();
        }
        self.inner.lock_txn().tbuf.close();
        if let Err(e) = self.inner.lock_cache().cache.close() {
            tracing::warn!("could not close cache: {e}");
        }
        self.inner.connected.send_replace(false);
        tracing::debug!("storage {} closed", self.inner.config.storage);
    }
}

impl Drop for ClientStorage {
    fn drop(&mut self) {
        self.inner.closed.send_replace(true);
        if let Some(manager) = self
            .manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            manager.abort();
        }
        if let Some(conn) = self.inner.current_connection() {
            conn.close();
        }
    }
}
