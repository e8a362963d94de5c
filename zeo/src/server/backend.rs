//! The storage a server exposes.
//!
//! Sessions talk to their storage only through [`Storage`]. The hub's commit
//! lock guarantees that at most one transaction is between `tpc_begin` and
//! `tpc_finish`/`tpc_abort` at a time, so implementations may keep a single
//! pending transaction.

use std::path::Path;
use std::time::Duration;

use crate::blob::BlobLayout;
use crate::error::StorageError;
use crate::types::{
    HistoryEntry, Oid, RecordItem, StorageInfo, StoreOutcome, Tid, TransactionMeta,
    UndoDescriptor,
};

/// A revision returned by `load_before`: data, start tid and, unless it is
/// still current, the tid that replaced it.
pub type HistoricalRevision = (Vec<u8>, Tid, Option<Tid>);

pub trait Storage: Send + Sync {
    fn info(&self) -> StorageInfo;

    fn is_read_only(&self) -> bool;

    /// Tid of the last committed transaction, zero for an empty storage.
    fn last_transaction(&self) -> Tid;

    fn load(&self, oid: Oid) -> Result<(Vec<u8>, Tid), StorageError>;

    /// The revision current just before `tid`. `None` if the object did
    /// not exist yet.
    fn load_before(&self, oid: Oid, tid: Tid) -> Result<Option<HistoricalRevision>, StorageError>;

    fn load_serial(&self, oid: Oid, serial: Tid) -> Result<Vec<u8>, StorageError>;

    fn new_oids(&self, count: u32) -> Result<Vec<Oid>, StorageError>;

    /// Start a transaction, committing at `tid` if given.
    fn tpc_begin(&self, txn: &TransactionMeta, tid: Option<Tid>) -> Result<(), StorageError>;

    /// Store `data` as the next revision of `oid`, written against
    /// `prev_tid`.
    fn store(
        &self,
        txn_id: u64,
        oid: Oid,
        prev_tid: Tid,
        data: Vec<u8>,
    ) -> Result<StoreOutcome, StorageError>;

    /// Like `store`, taking ownership of the blob file at `blob`.
    fn store_blob(
        &self,
        txn_id: u64,
        oid: Oid,
        prev_tid: Tid,
        data: Vec<u8>,
        blob: &Path,
    ) -> Result<StoreOutcome, StorageError>;

    fn delete_object(&self, txn_id: u64, oid: Oid, prev_tid: Tid) -> Result<StoreOutcome, StorageError>;

    /// Fail with a conflict unless `oid` is still at `serial`.
    fn check_current_serial(&self, txn_id: u64, oid: Oid, serial: Tid) -> Result<(), StorageError>;

    fn tpc_vote(&self, txn_id: u64) -> Result<(), StorageError>;

    /// Make the transaction durable and return its tid.
    fn tpc_finish(&self, txn_id: u64) -> Result<Tid, StorageError>;

    fn tpc_abort(&self, txn_id: u64);

    /// Revert transaction `undo_id` as part of transaction `txn_id`. Returns
    /// the tid the undo will commit under and the oids it reverts.
    fn undo(&self, undo_id: Tid, txn_id: u64) -> Result<(Tid, Vec<Oid>), StorageError>;

    /// Undoable transactions, newest first, positions `first..last`.
    fn undo_log(&self, first: usize, last: usize) -> Vec<UndoDescriptor>;

    fn history(&self, oid: Oid, length: usize) -> Result<Vec<HistoryEntry>, StorageError>;

    /// Drop revisions that stopped being current before `time` (seconds
    /// since the epoch).
    fn pack(&self, time: f64) -> Result<(), StorageError>;

    /// The first live record at or after `next` (from the start when
    /// `None`).
    fn record_iternext(&self, next: Option<Oid>) -> Result<Option<RecordItem>, StorageError>;

    /// Oids changed after `tid` together with the last tid, if the storage
    /// still knows and `tid` is no older than `max_age`.
    fn transactions_since(&self, tid: Tid, max_age: Duration) -> Option<(Tid, Vec<Oid>)>;

    fn blob_layout(&self) -> Option<&BlobLayout>;

    /// Path of the committed blob for `oid@tid`.
    fn load_blob(&self, oid: Oid, tid: Tid) -> Result<std::path::PathBuf, StorageError> {
        let layout = self
            .blob_layout()
            .ok_or_else(|| StorageError::Unsupported("blobs".to_string()))?;
        if layout.exists(oid, tid) {
            Ok(layout.path(oid, tid))
        } else {
            Err(StorageError::PosKey { oid, tid: Some(tid) })
        }
    }
}

/// Merges a write that lost a `prev_tid` race with what was committed.
pub trait ConflictResolver: Send + Sync {
    /// `old` is the revision the writer started from (if the storage still
    /// has it), `committed` the current one, `new` the rejected write.
    /// Returns the merged data or `None` if they cannot be merged.
    fn resolve(&self, oid: Oid, old: Option<&[u8]>, committed: &[u8], new: &[u8]) -> Option<Vec<u8>>;
}
