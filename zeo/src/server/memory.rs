//! In-memory multi-version storage.
//!
//! Every object keeps its full revision chain until packed. Tids come from a
//! [`TidClock`] at `tpc_begin`, so the tid returned by `tpc_vote`/`store` is
//! the one `tpc_finish` commits under.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::blob::BlobLayout;
use crate::error::StorageError;
use crate::server::backend::{ConflictResolver, HistoricalRevision, Storage};
use crate::types::tid_clock::{tid_from_unix_ms, tid_to_unix_ms, tid_to_unix_secs};
use crate::types::{
    HistoryEntry, Oid, RecordItem, StorageInfo, StoreOutcome, SystemTimeSource, Tid, TidClock,
    TimeSource, TransactionMeta, UndoDescriptor,
};

type SharedTimeSource = Arc<dyn TimeSource + Send + Sync>;

#[derive(Debug, Clone)]
struct Revision {
    tid: Tid,
    /// `None` marks a deletion.
    data: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct TransactionRecord {
    tid: Tid,
    user: String,
    description: String,
    oids: Vec<Oid>,
}

#[derive(Debug)]
struct Write {
    oid: Oid,
    data: Option<Vec<u8>>,
    blob: Option<PathBuf>,
}

#[derive(Debug)]
struct PendingTransaction {
    id: u64,
    tid: Tid,
    user: String,
    description: String,
    writes: Vec<Write>,
    voted: bool,
}

struct State {
    objects: BTreeMap<Oid, Vec<Revision>>,
    transactions: Vec<TransactionRecord>,
    next_oid: u64,
    clock: TidClock<SharedTimeSource>,
    pending: Option<PendingTransaction>,
    /// Transactions at or before this tid were packed away.
    packed_to: Tid,
}

impl State {
    fn pending(&mut self, txn_id: u64) -> Result<&mut PendingTransaction, StorageError> {
        match &mut self.pending {
            Some(pending) if pending.id == txn_id => Ok(pending),
            _ => Err(StorageError::StorageTransaction(format!(
                "transaction {txn_id} is not in progress"
            ))),
        }
    }

    fn current(&self, oid: Oid) -> Option<&Revision> {
        self.objects.get(&oid).and_then(|revisions| revisions.last())
    }

    fn current_tid(&self, oid: Oid) -> Tid {
        self.current(oid).map_or(Tid::ZERO, |revision| revision.tid)
    }
}

pub struct MemoryStorage {
    name: String,
    read_only: bool,
    blobs: Option<BlobLayout>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    state: Mutex<State>,
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("name", &self.name)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl MemoryStorage {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_time_source(name, Arc::new(SystemTimeSource))
    }

    #[must_use]
    pub fn with_time_source(name: impl Into<String>, time_source: SharedTimeSource) -> Self {
        Self {
            name: name.into(),
            read_only: false,
            blobs: None,
            resolver: None,
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                transactions: Vec::new(),
                next_oid: 1,
                clock: TidClock::new(time_source),
                pending: None,
                packed_to: Tid::ZERO,
            }),
        }
    }

    #[must_use]
    pub const fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    #[must_use]
    pub fn with_blobs(mut self, layout: BlobLayout) -> Self {
        self.blobs = Some(layout);
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.read_only {
            Err(StorageError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Queue a write, resolving a `prev_tid` mismatch if possible.
    fn stage(
        &self,
        txn_id: u64,
        oid: Oid,
        prev_tid: Tid,
        data: Option<Vec<u8>>,
        blob: Option<PathBuf>,
    ) -> Result<StoreOutcome, StorageError> {
        self.check_writable()?;
        let mut state = self.lock();
        let current = state.current(oid).cloned();
        let current_tid = current.as_ref().map_or(Tid::ZERO, |revision| revision.tid);

        let mut outcome = None;
        let mut data = data;
        if current_tid != prev_tid {
            let merged = match (&self.resolver, &current, &data) {
                (Some(resolver), Some(Revision { data: Some(committed), .. }), Some(new)) if blob.is_none() => {
                    let old = state
                        .objects
                        .get(&oid)
                        .and_then(|revisions| revisions.iter().find(|r| r.tid == prev_tid))
                        .and_then(|r| r.data.as_deref());
                    resolver.resolve(oid, old, committed, new)
                }
                _ => None,
            };
            let Some(merged) = merged else {
                return Err(StorageError::conflict(oid, current_tid, prev_tid));
            };
            tracing::debug!("resolved conflict on {oid}: committed {current_tid}, expected {prev_tid}");
            data = Some(merged);
            outcome = Some(StoreOutcome::Resolved);
        }

        let pending = state.pending(txn_id)?;
        pending.writes.push(Write { oid, data, blob });
        Ok(outcome.unwrap_or(StoreOutcome::Serial(pending.tid)))
    }

    fn remove_blob_files(&self, oid: Oid, tid: Tid) {
        if let Some(layout) = &self.blobs {
            let path = layout.path(oid, tid);
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!("could not remove packed blob {}: {e}", path.display());
                }
            }
        }
    }
}

impl Storage for MemoryStorage {
    fn info(&self) -> StorageInfo {
        let state = self.lock();
        let length = state
            .objects
            .values()
            .filter(|revisions| revisions.last().is_some_and(|r| r.data.is_some()))
            .count();
        let size: usize = state
            .objects
            .values()
            .flatten()
            .map(|r| r.data.as_ref().map_or(0, Vec::len))
            .sum();
        StorageInfo {
            name: self.name.clone(),
            length: u64::try_from(length).unwrap_or(u64::MAX),
            size: u64::try_from(size).unwrap_or(u64::MAX),
            supports_undo: true,
            supports_versions: false,
            supports_blobs: self.blobs.is_some(),
            read_only: self.read_only,
            extension_methods: Vec::new(),
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn last_transaction(&self) -> Tid {
        self.lock()
            .transactions
            .last()
            .map_or(Tid::ZERO, |txn| txn.tid)
    }

    fn load(&self, oid: Oid) -> Result<(Vec<u8>, Tid), StorageError> {
        match self.lock().current(oid) {
            Some(Revision {
                tid,
                data: Some(data),
            }) => Ok((data.clone(), *tid)),
            _ => Err(StorageError::PosKey { oid, tid: None }),
        }
    }

    fn load_before(&self, oid: Oid, tid: Tid) -> Result<Option<HistoricalRevision>, StorageError> {
        let state = self.lock();
        let Some(revisions) = state.objects.get(&oid) else {
            return Err(StorageError::PosKey { oid, tid: None });
        };
        let Some(index) = revisions.iter().rposition(|r| r.tid < tid) else {
            return Ok(None);
        };
        let revision = &revisions[index];
        let Some(data) = &revision.data else {
            return Ok(None);
        };
        let end = revisions.get(index + 1).map(|next| next.tid);
        Ok(Some((data.clone(), revision.tid, end)))
    }

    fn load_serial(&self, oid: Oid, serial: Tid) -> Result<Vec<u8>, StorageError> {
        self.lock()
            .objects
            .get(&oid)
            .and_then(|revisions| revisions.iter().find(|r| r.tid == serial))
            .and_then(|r| r.data.clone())
            .ok_or(StorageError::PosKey {
                oid,
                tid: Some(serial),
            })
    }

    fn new_oids(&self, count: u32) -> Result<Vec<Oid>, StorageError> {
        self.check_writable()?;
        let mut state = self.lock();
        let first = state.next_oid;
        state.next_oid += u64::from(count);
        Ok((first..state.next_oid).map(Oid::from_u64).collect())
    }

    fn tpc_begin(&self, txn: &TransactionMeta, tid: Option<Tid>) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut state = self.lock();
        if let Some(pending) = &state.pending {
            return Err(StorageError::StorageTransaction(format!(
                "transaction {} already in progress",
                pending.id
            )));
        }
        let tid = match tid {
            Some(tid) => {
                state.clock.observe(tid);
                tid
            }
            None => state.clock.tick(),
        };
        state.pending = Some(PendingTransaction {
            id: txn.id,
            tid,
            user: txn.user.clone(),
            description: txn.description.clone(),
            writes: Vec::new(),
            voted: false,
        });
        Ok(())
    }

    fn store(
        &self,
        txn_id: u64,
        oid: Oid,
        prev_tid: Tid,
        data: Vec<u8>,
    ) -> Result<StoreOutcome, StorageError> {
        self.stage(txn_id, oid, prev_tid, Some(data), None)
    }

    fn store_blob(
        &self,
        txn_id: u64,
        oid: Oid,
        prev_tid: Tid,
        data: Vec<u8>,
        blob: &Path,
    ) -> Result<StoreOutcome, StorageError> {
        if self.blobs.is_none() {
            return Err(StorageError::Unsupported("blobs".to_string()));
        }
        self.stage(txn_id, oid, prev_tid, Some(data), Some(blob.to_path_buf()))
    }

    fn delete_object(&self, txn_id: u64, oid: Oid, prev_tid: Tid) -> Result<StoreOutcome, StorageError> {
        if self.lock().current(oid).is_none() {
            return Err(StorageError::PosKey { oid, tid: None });
        }
        self.stage(txn_id, oid, prev_tid, None, None)
    }

    fn check_current_serial(&self, txn_id: u64, oid: Oid, serial: Tid) -> Result<(), StorageError> {
        let mut state = self.lock();
        let current = state.current_tid(oid);
        state.pending(txn_id)?;
        if current == serial {
            Ok(())
        } else {
            Err(StorageError::conflict(oid, current, serial))
        }
    }

    fn tpc_vote(&self, txn_id: u64) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.pending(txn_id)?.voted = true;
        Ok(())
    }

    fn tpc_finish(&self, txn_id: u64) -> Result<Tid, StorageError> {
        let mut state = self.lock();
        let staged = state.pending(txn_id)?;
        let tid = staged.tid;
        // Blob files move first so a failed rename leaves nothing committed.
        if let Some(layout) = &self.blobs {
            let blobs: Vec<(Oid, PathBuf)> = staged
                .writes
                .iter()
                .filter_map(|w| w.blob.clone().map(|blob| (w.oid, blob)))
                .collect();
            install_blobs(layout, &blobs, tid)?;
        }
        let Some(pending) = state.pending.take() else {
            return Err(StorageError::StorageTransaction(format!(
                "transaction {txn_id} is not in progress"
            )));
        };
        if !pending.voted {
            tracing::debug!("finishing transaction {txn_id} without a vote");
        }

        let mut oids = Vec::with_capacity(pending.writes.len());
        for write in pending.writes {
            let revisions = state.objects.entry(write.oid).or_default();
            match revisions.last_mut() {
                Some(last) if last.tid == tid => last.data = write.data,
                _ => revisions.push(Revision {
                    tid,
                    data: write.data,
                }),
            }
            if !oids.contains(&write.oid) {
                oids.push(write.oid);
            }
        }
        state.clock.observe(tid);
        state.transactions.push(TransactionRecord {
            tid,
            user: pending.user,
            description: pending.description,
            oids,
        });
        Ok(tid)
    }

    fn tpc_abort(&self, txn_id: u64) {
        let mut state = self.lock();
        if state.pending.as_ref().is_some_and(|p| p.id == txn_id) {
            if let Some(pending) = state.pending.take() {
                for blob in pending.writes.iter().filter_map(|w| w.blob.as_ref()) {
                    let _ = std::fs::remove_file(blob);
                }
            }
        }
    }

    fn undo(&self, undo_id: Tid, txn_id: u64) -> Result<(Tid, Vec<Oid>), StorageError> {
        self.check_writable()?;
        let mut state = self.lock();
        let Some(record) = state.transactions.iter().find(|t| t.tid == undo_id).cloned() else {
            return Err(StorageError::StorageSystem(format!("no transaction {undo_id} to undo")));
        };

        let mut writes = Vec::with_capacity(record.oids.len());
        for &oid in &record.oids {
            let revisions = state.objects.get(&oid).map(Vec::as_slice).unwrap_or_default();
            let Some((last, earlier)) = revisions.split_last() else {
                return Err(StorageError::PosKey { oid, tid: Some(undo_id) });
            };
            if last.tid != undo_id {
                return Err(StorageError::Conflict {
                    oid: Some(oid),
                    serials: None,
                    message: "some data were modified by a later transaction".to_string(),
                });
            }
            writes.push(Write {
                oid,
                data: earlier.last().and_then(|r| r.data.clone()),
                blob: None,
            });
        }

        let pending = state.pending(txn_id)?;
        pending.writes.extend(writes);
        Ok((pending.tid, record.oids))
    }

    fn undo_log(&self, first: usize, last: usize) -> Vec<UndoDescriptor> {
        self.lock()
            .transactions
            .iter()
            .rev()
            .skip(first)
            .take(last.saturating_sub(first))
            .map(|txn| UndoDescriptor {
                id: txn.tid,
                time: tid_to_unix_secs(txn.tid),
                user: txn.user.clone(),
                description: txn.description.clone(),
            })
            .collect()
    }

    fn history(&self, oid: Oid, length: usize) -> Result<Vec<HistoryEntry>, StorageError> {
        let state = self.lock();
        let Some(revisions) = state.objects.get(&oid) else {
            return Err(StorageError::PosKey { oid, tid: None });
        };
        Ok(revisions
            .iter()
            .rev()
            .take(length)
            .map(|revision| {
                let txn = state.transactions.iter().find(|t| t.tid == revision.tid);
                HistoryEntry {
                    tid: revision.tid,
                    time: tid_to_unix_secs(revision.tid),
                    user: txn.map(|t| t.user.clone()).unwrap_or_default(),
                    description: txn.map(|t| t.description.clone()).unwrap_or_default(),
                    size: revision
                        .data
                        .as_ref()
                        .map_or(0, |d| u64::try_from(d.len()).unwrap_or(u64::MAX)),
                }
            })
            .collect())
    }

    fn pack(&self, time: f64) -> Result<(), StorageError> {
        let ms = Duration::try_from_secs_f64(time)
            .map_err(|e| StorageError::StorageSystem(format!("bad pack time {time}: {e}")))?
            .as_millis();
        let pack_tid = tid_from_unix_ms(u64::try_from(ms).unwrap_or(u64::MAX));

        let mut removed = Vec::new();
        let mut state = self.lock();
        for (&oid, revisions) in &mut state.objects {
            // Keep everything after the pack time plus the revision current at it.
            let keep_from = revisions
                .iter()
                .rposition(|r| r.tid <= pack_tid)
                .unwrap_or(0);
            removed.extend(revisions.drain(..keep_from).map(|r| (oid, r.tid)));
            if revisions.len() == 1 && revisions[0].data.is_none() && revisions[0].tid <= pack_tid {
                removed.extend(revisions.drain(..).map(|r| (oid, r.tid)));
            }
        }
        state.objects.retain(|_, revisions| !revisions.is_empty());
        state.transactions.retain(|txn| txn.tid > pack_tid);
        state.packed_to = state.packed_to.later_than(pack_tid);
        drop(state);

        for (oid, tid) in &removed {
            self.remove_blob_files(*oid, *tid);
        }
        tracing::info!(
            "packed {} to {pack_tid}: {} revisions removed",
            self.name,
            removed.len()
        );
        Ok(())
    }

    fn record_iternext(&self, next: Option<Oid>) -> Result<Option<RecordItem>, StorageError> {
        let state = self.lock();
        let start = next.unwrap_or(Oid::ZERO);
        let mut live = state.objects.range(start..).filter_map(|(&oid, revisions)| {
            revisions
                .last()
                .and_then(|r| r.data.as_ref().map(|data| (oid, r.tid, data)))
        });
        let Some((oid, tid, data)) = live.next() else {
            return Ok(None);
        };
        Ok(Some(RecordItem {
            oid,
            tid,
            data: data.clone(),
            next: live.next().map(|(oid, _, _)| oid),
        }))
    }

    fn transactions_since(&self, tid: Tid, max_age: Duration) -> Option<(Tid, Vec<Oid>)> {
        let state = self.lock();
        if tid < state.packed_to {
            return None;
        }
        let now = state.clock.time_source().now_ms();
        let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        if tid_to_unix_ms(tid) < now.saturating_sub(max_age_ms) {
            return None;
        }
        let last = state.transactions.last().map_or(tid, |t| t.tid);
        let mut seen = HashSet::new();
        let oids = state
            .transactions
            .iter()
            .filter(|t| t.tid > tid)
            .flat_map(|t| t.oids.iter().copied())
            .filter(|oid| seen.insert(*oid))
            .collect();
        Some((last, oids))
    }

    fn blob_layout(&self) -> Option<&BlobLayout> {
        self.blobs.as_ref()
    }
}

/// Move each staged blob into place. On failure the ones already moved go
/// back to their staging paths.
fn install_blobs(layout: &BlobLayout, blobs: &[(Oid, PathBuf)], tid: Tid) -> Result<(), StorageError> {
    let mut installed = Vec::with_capacity(blobs.len());
    for (oid, source) in blobs {
        match layout.install(source, *oid, tid) {
            Ok(target) => installed.push((target, source)),
            Err(e) => {
                for (target, source) in installed.into_iter().rev() {
                    if let Err(e) = std::fs::rename(&target, source) {
                        tracing::warn!("could not restore blob {}: {e}", source.display());
                    }
                }
                return Err(e.into());
            }
        }
    }
    Ok(())
}
