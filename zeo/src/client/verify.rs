//! Cache verification after (re)connecting.
//!
//! While a new connection registers and verifies, the server keeps pushing
//! invalidations. Those land in an [`InvalidationSpill`] owned by the
//! connection instead of the live cache, and are replayed once verification
//! is done so nothing committed in the meantime is lost.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use prost::Message;
use rand::Rng;
use tokio::sync::oneshot;

use super::connection::Connection;
use super::storage::{CacheState, ClientInner};
use crate::error::StorageError;
use crate::proto;
use crate::types::{Oid, Tid, decode_oids, encode_oids};
use crate::wire::Method;

/// Invalidations received on a connection that is not active yet.
///
/// Stored on disk as length-delimited [`proto::SpilledInvalidation`]
/// records; an empty tid stands for the null tid.
#[derive(Debug)]
pub struct InvalidationSpill {
    path: PathBuf,
    file: File,
    records: usize,
    /// Oids the server reported stale during full verification.
    verify_oids: Vec<Oid>,
}

impl InvalidationSpill {
    pub fn create() -> io::Result<Self> {
        let nonce: u64 = rand::rng().random();
        let path = std::env::temp_dir().join(format!("zeo-spill-{nonce:016x}.inv"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            records: 0,
            verify_oids: Vec::new(),
        })
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.records
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.records == 0
    }

    pub fn record(&mut self, tid: Option<Tid>, oids: &[Oid]) -> io::Result<()> {
        let record = proto::SpilledInvalidation {
            tid: tid.map(|t| t.0.to_vec()).unwrap_or_default(),
            oids: encode_oids(oids),
        };
        self.file
            .write_all(&record.encode_length_delimited_to_vec())?;
        self.records += 1;
        Ok(())
    }

    pub fn record_verify(&mut self, oid: Oid) {
        self.verify_oids.push(oid);
    }

    pub fn start_verification(&mut self) {
        self.verify_oids.clear();
    }

    pub fn take_verify_oids(&mut self) -> Vec<Oid> {
        std::mem::take(&mut self.verify_oids)
    }

    /// Everything recorded so far, oldest first. The spill is empty
    /// afterwards.
    pub fn drain(&mut self) -> io::Result<Vec<(Option<Tid>, Vec<Oid>)>> {
        self.file.flush()?;
        self.file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        self.file.read_to_end(&mut bytes)?;
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.records = 0;

        let mut drained = Vec::new();
        let mut rest = bytes.as_slice();
        while !rest.is_empty() {
            let record = proto::SpilledInvalidation::decode_length_delimited(&mut rest)
                .map_err(io::Error::other)?;
            let tid = if record.tid.is_empty() {
                None
            } else {
                Some(Tid::try_from(record.tid.as_slice()).map_err(io::Error::other)?)
            };
            let oids = decode_oids(&record.oids).map_err(io::Error::other)?;
            drained.push((tid, oids));
        }
        Ok(drained)
    }
}

impl Drop for InvalidationSpill {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!("could not remove {}: {e}", self.path.display());
        }
    }
}

/// How the cache was brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationKind {
    /// Cache and server agree on the last transaction.
    NotNeeded,
    EmptyCache,
    /// The cache had seen transactions the server has not; it was dropped.
    NewerCache,
    /// The server replayed what changed since the cache's last transaction.
    Quick { invalidated: usize },
    /// Configured to drop the cache rather than verify it.
    Cleared,
    Full { checked: usize, invalidated: usize },
}

impl std::fmt::Display for VerificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotNeeded => write!(f, "cache up to date"),
            Self::EmptyCache => write!(f, "cache empty"),
            Self::NewerCache => write!(f, "cache newer than server, cleared"),
            Self::Quick { invalidated } => write!(f, "quick verification, {invalidated} invalidated"),
            Self::Cleared => write!(f, "cache cleared"),
            Self::Full {
                checked,
                invalidated,
            } => write!(f, "full verification of {checked} objects, {invalidated} invalidated"),
        }
    }
}

/// Bring the cache in line with the server behind `conn`.
///
/// Invalidations pushed meanwhile keep going to the connection's spill.
pub(super) async fn verify_cache(
    inner: &ClientInner,
    conn: &Connection,
) -> Result<VerificationKind, StorageError> {
    let reply: proto::TidResult = conn.call(Method::LastTransaction, &proto::Empty {}).await?;
    let server_tid = Tid::try_from(reply.tid.as_slice())?;

    let cache_tid = {
        let mut state = inner.lock_cache();
        let cache_tid = state.cache.last_tid();
        if state.cache.is_empty() {
            if cache_tid != server_tid {
                state.cache.clear()?;
                state.cache.set_last_tid(server_tid)?;
            }
            return Ok(VerificationKind::EmptyCache);
        }
        if cache_tid == server_tid {
            return Ok(VerificationKind::NotNeeded);
        }
        if cache_tid > server_tid {
            tracing::warn!(
                "cache last transaction {cache_tid} is newer than the server's {server_tid}, clearing it"
            );
            state.cache.clear()?;
            state.cache.set_last_tid(server_tid)?;
            return Ok(VerificationKind::NewerCache);
        }
        cache_tid
    };

    let reply: proto::InvalidationsResult = conn
        .call(
            Method::GetInvalidations,
            &proto::TidArgs {
                tid: cache_tid.0.to_vec(),
            },
        )
        .await?;
    if reply.available {
        let tid = Tid::try_from(reply.tid.as_slice())?;
        let oids = decode_oids(&reply.oids)?;
        let mut state = inner.lock_cache();
        state.apply_invalidations(Some(tid), &oids);
        return Ok(VerificationKind::Quick {
            invalidated: oids.len(),
        });
    }

    if inner.config.drop_cache_rather_verify {
        let mut state = inner.lock_cache();
        state.cache.clear()?;
        state.cache.set_last_tid(server_tid)?;
        return Ok(VerificationKind::Cleared);
    }

    full_verification(inner, conn, server_tid).await
}

async fn full_verification(
    inner: &ClientInner,
    conn: &Connection,
    server_tid: Tid,
) -> Result<VerificationKind, StorageError> {
    let (done, done_rx) = oneshot::channel();
    let entries = {
        let mut state = inner.lock_cache();
        let Some(spill) = state.spills.get_mut(&conn.id()) else {
            return Err(StorageError::Disconnected(format!(
                "{} closed before verification",
                conn.address()
            )));
        };
        spill.start_verification();
        state.verify_waiters.insert(conn.id(), done);
        state.cache.current_entries()
    };

    tracing::info!("verifying {} cached objects with {}", entries.len(), conn.address());
    conn.call_async(Method::BeginZeoVerify, &proto::Empty {})?;
    for (oid, tid) in &entries {
        conn.call_async(
            Method::ZeoVerify,
            &proto::OidTidArgs {
                oid: oid.0.to_vec(),
                tid: tid.0.to_vec(),
            },
        )?;
    }
    conn.call_async(Method::EndZeoVerify, &proto::Empty {})?;
    done_rx.await.map_err(|_| {
        StorageError::Disconnected(format!("{} closed during verification", conn.address()))
    })?;

    let mut state = inner.lock_cache();
    let stale = state
        .spills
        .get_mut(&conn.id())
        .map(InvalidationSpill::take_verify_oids)
        .unwrap_or_default();
    for oid in &stale {
        state.cache.invalidate(*oid, None)?;
    }
    state.cache.set_last_tid(server_tid)?;
    Ok(VerificationKind::Full {
        checked: entries.len(),
        invalidated: stale.len(),
    })
}

/// Apply what `spill` collected during verification. Entries the cache has
/// already seen are skipped; null-tid entries always apply. Returns the
/// applied entries so listeners can be told.
pub(super) fn replay_spill(
    state: &mut CacheState,
    spill: &mut InvalidationSpill,
) -> io::Result<Vec<(Option<Tid>, Vec<Oid>)>> {
    let mut applied = Vec::new();
    for (tid, oids) in spill.drain()? {
        if let Some(tid) = tid {
            if tid <= state.cache.last_tid() {
                continue;
            }
        }
        state.apply_invalidations(tid, &oids);
        applied.push((tid, oids));
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ClientCache;

    fn oid(n: u64) -> Oid {
        Oid::from_u64(n)
    }

    fn tid(n: u64) -> Tid {
        Tid::from_u64(n)
    }

    #[test]
    fn test_spill_drains_in_order_and_empties() {
        let mut spill = InvalidationSpill::create().unwrap();
        spill.record(Some(tid(9)), &[oid(5)]).unwrap();
        spill.record(None, &[oid(6), oid(7)]).unwrap();
        assert_eq!(spill.len(), 2);

        let drained = spill.drain().unwrap();
        assert_eq!(
            drained,
            vec![(Some(tid(9)), vec![oid(5)]), (None, vec![oid(6), oid(7)])]
        );
        assert!(spill.is_empty());
        assert!(spill.drain().unwrap().is_empty());

        spill.record(Some(tid(10)), &[oid(1)]).unwrap();
        assert_eq!(spill.drain().unwrap(), vec![(Some(tid(10)), vec![oid(1)])]);
    }

    #[test]
    fn test_spill_file_removed_on_drop() {
        let spill = InvalidationSpill::create().unwrap();
        let path = spill.path.clone();
        assert!(path.exists());
        drop(spill);
        assert!(!path.exists());
    }

    #[test]
    fn test_full_verification_then_replay() {
        let mut cache = ClientCache::open(None, 1 << 20).unwrap();
        cache.store(oid(1), tid(3), None, b"one").unwrap();
        cache.store(oid(5), tid(4), None, b"five").unwrap();
        cache.set_last_tid(tid(5)).unwrap();
        let mut state = CacheState::new(cache);

        let mut spill = InvalidationSpill::create().unwrap();
        spill.start_verification();
        // Committed while verifying.
        spill.record(Some(tid(9)), &[oid(5)]).unwrap();
        // Already covered by the server's last transaction.
        spill.record(Some(tid(8)), &[oid(2)]).unwrap();
        spill.record_verify(oid(1));

        for stale in spill.take_verify_oids() {
            state.cache.invalidate(stale, None).unwrap();
        }
        state.cache.set_last_tid(tid(8)).unwrap();
        let applied = replay_spill(&mut state, &mut spill).unwrap();

        assert_eq!(applied, vec![(Some(tid(9)), vec![oid(5)])]);
        assert_eq!(state.cache.load(oid(1)).unwrap(), None);
        assert_eq!(state.cache.load(oid(5)).unwrap(), None);
        assert_eq!(state.cache.last_tid(), tid(9));
        let old = state.cache.load_before(oid(5), tid(9)).unwrap().unwrap();
        assert_eq!(old.data, b"five");
        assert_eq!(old.end, Some(tid(9)));
    }
}
