//! A storage that can hold a `load` mid-call, for exercising races between
//! a read on one session and commits on another.

use std::path::Path;
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::blob::BlobLayout;
use crate::error::StorageError;
use crate::server::{HistoricalRevision, MemoryStorage, Storage};
use crate::types::{
    HistoryEntry, Oid, RecordItem, StorageInfo, StoreOutcome, Tid, TransactionMeta,
    UndoDescriptor,
};

/// Longest a paused load waits to be released.
const PAUSE_LIMIT: Duration = Duration::from_secs(5);

struct Pause {
    oid: Oid,
    reached: oneshot::Sender<()>,
    release: mpsc::Receiver<()>,
}

/// Handle to a pause set with [`PausingStorage::pause_load`].
pub struct LoadPause {
    reached: oneshot::Receiver<()>,
    release: mpsc::Sender<()>,
}

impl LoadPause {
    /// Wait until the paused load has read its data. False if it never
    /// came.
    pub async fn reached(&mut self) -> bool {
        matches!(
            tokio::time::timeout(PAUSE_LIMIT, &mut self.reached).await,
            Ok(Ok(()))
        )
    }

    pub fn release(self) {
        let _ = self.release.send(());
    }
}

/// [`MemoryStorage`] whose next `load` of a chosen oid blocks after reading,
/// until released.
pub struct PausingStorage {
    inner: MemoryStorage,
    pause: Mutex<Option<Pause>>,
}

impl PausingStorage {
    pub const fn new(inner: MemoryStorage) -> Self {
        Self {
            inner,
            pause: Mutex::new(None),
        }
    }

    pub fn pause_load(&self, oid: Oid) -> LoadPause {
        let (reached_tx, reached) = oneshot::channel();
        let (release, release_rx) = mpsc::channel();
        *self.pause.lock().unwrap_or_else(PoisonError::into_inner) = Some(Pause {
            oid,
            reached: reached_tx,
            release: release_rx,
        });
        LoadPause { reached, release }
    }

    fn take_pause(&self, oid: Oid) -> Option<Pause> {
        let mut pause = self.pause.lock().unwrap_or_else(PoisonError::into_inner);
        if pause.as_ref().is_some_and(|p| p.oid == oid) {
            pause.take()
        } else {
            None
        }
    }
}

impl Storage for PausingStorage {
    fn info(&self) -> StorageInfo {
        self.inner.info()
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    fn last_transaction(&self) -> Tid {
        self.inner.last_transaction()
    }

    fn load(&self, oid: Oid) -> Result<(Vec<u8>, Tid), StorageError> {
        let result = self.inner.load(oid);
        if let Some(pause) = self.take_pause(oid) {
            let _ = pause.reached.send(());
            if pause.release.recv_timeout(PAUSE_LIMIT).is_err() {
                tracing::warn!("paused load of {oid} was never released");
            }
        }
        result
    }

    fn load_before(&self, oid: Oid, tid: Tid) -> Result<Option<HistoricalRevision>, StorageError> {
        self.inner.load_before(oid, tid)
    }

    fn load_serial(&self, oid: Oid, serial: Tid) -> Result<Vec<u8>, StorageError> {
        self.inner.load_serial(oid, serial)
    }

    fn new_oids(&self, count: u32) -> Result<Vec<Oid>, StorageError> {
        self.inner.new_oids(count)
    }

    fn tpc_begin(&self, txn: &TransactionMeta, tid: Option<Tid>) -> Result<(), StorageError> {
        self.inner.tpc_begin(txn, tid)
    }

    fn store(
        &self,
        txn_id: u64,
        oid: Oid,
        prev_tid: Tid,
        data: Vec<u8>,
    ) -> Result<StoreOutcome, StorageError> {
        self.inner.store(txn_id, oid, prev_tid, data)
    }

    fn store_blob(
        &self,
        txn_id: u64,
        oid: Oid,
        prev_tid: Tid,
        data: Vec<u8>,
        blob: &Path,
    ) -> Result<StoreOutcome, StorageError> {
        self.inner.store_blob(txn_id, oid, prev_tid, data, blob)
    }

    fn delete_object(&self, txn_id: u64, oid: Oid, prev_tid: Tid) -> Result<StoreOutcome, StorageError> {
        self.inner.delete_object(txn_id, oid, prev_tid)
    }

    fn check_current_serial(&self, txn_id: u64, oid: Oid, serial: Tid) -> Result<(), StorageError> {
        self.inner.check_current_serial(txn_id, oid, serial)
    }

    fn tpc_vote(&self, txn_id: u64) -> Result<(), StorageError> {
        self.inner.tpc_vote(txn_id)
    }

    fn tpc_finish(&self, txn_id: u64) -> Result<Tid, StorageError> {
        self.inner.tpc_finish(txn_id)
    }

    fn tpc_abort(&self, txn_id: u64) {
        self.inner.tpc_abort(txn_id);
    }

    fn undo(&self, undo_id: Tid, txn_id: u64) -> Result<(Tid, Vec<Oid>), StorageError> {
        self.inner.undo(undo_id, txn_id)
    }

    fn undo_log(&self, first: usize, last: usize) -> Vec<UndoDescriptor> {
        self.inner.undo_log(first, last)
    }

    fn history(&self, oid: Oid, length: usize) -> Result<Vec<HistoryEntry>, StorageError> {
        self.inner.history(oid, length)
    }

    fn pack(&self, time: f64) -> Result<(), StorageError> {
        self.inner.pack(time)
    }

    fn record_iternext(&self, next: Option<Oid>) -> Result<Option<RecordItem>, StorageError> {
        self.inner.record_iternext(next)
    }

    fn transactions_since(&self, tid: Tid, max_age: Duration) -> Option<(Tid, Vec<Oid>)> {
        self.inner.transactions_since(tid, max_age)
    }

    fn blob_layout(&self) -> Option<&BlobLayout> {
        self.inner.blob_layout()
    }
}
