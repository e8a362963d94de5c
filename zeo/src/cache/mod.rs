//! Persistent client cache.
//!
//! A fixed-size circular arena of `(oid, tid)` revisions with an in-memory
//! index rebuilt by scanning the file on open. See [`arena`] for the file
//! format.
//!
//! # Allocation
//!
//! New records go at the write cursor. If the record would run past the end
//! of the file the cursor first wraps to the end of the header. The cache
//! then walks forward from the cursor, evicting every block that overlaps
//! the bytes needed, writes the record, and marks whatever the walk freed
//! beyond the record as a free block. The cursor ends up right after the new
//! record.
//!
//! # Invariants
//!
//! - Every index entry points at an allocated block with the same key.
//! - An oid's current revision never shares its start tid with one of the
//!   oid's non-current revisions.
//! - Blocks tile the file from the header to its configured size.
//!
//! The cache is not internally synchronized; the client storage keeps it
//! behind its cache lock.

pub mod arena;
pub mod trace;

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::cache::arena::{Arena, Block, HEADER_SIZE, RECORD_OVERHEAD};
use crate::cache::trace::{CacheTrace, TraceEvent};
use crate::error::StorageError;
use crate::types::{Oid, Tid};

/// Default arena size: 20 MiB.
pub const DEFAULT_CACHE_SIZE: u64 = 20 * 1024 * 1024;

/// Smallest arena the cache accepts.
pub const MIN_CACHE_SIZE: u64 = 64;

/// Errors from cache operations.
#[derive(Debug)]
pub enum CacheError {
    Io(std::io::Error),
    /// Storing a current revision while a different one is current.
    AlreadyCurrent { oid: Oid, current: Tid, new: Tid },
    /// Moving `last_tid` backwards on a non-empty cache.
    TidRegression { current: Tid, new: Tid },
    /// Bytes in the arena that do not decode.
    Corrupt { offset: u64, message: String },
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "cache I/O error: {e}"),
            Self::AlreadyCurrent { oid, current, new } => write!(
                f,
                "already have current data {current} for {oid}, refusing {new}"
            ),
            Self::TidRegression { current, new } => write!(
                f,
                "new last tid {new} must not be older than {current}"
            ),
            Self::Corrupt { offset, message } => {
                write!(f, "corrupt cache at offset {offset}: {message}")
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CacheError> for StorageError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Io(e) => Self::from(e),
            other => Self::StorageSystem(other.to_string()),
        }
    }
}

/// Counters since the cache was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub evicted_bytes: u64,
}

/// One revision held by the cache. `end` is `None` for the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheEntry {
    pub oid: Oid,
    pub start: Tid,
    pub end: Option<Tid>,
}

/// Result of [`ClientCache::load_before`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoricalRecord {
    pub data: Vec<u8>,
    pub start: Tid,
    /// `None` when the record is the current revision.
    pub end: Option<Tid>,
}

#[derive(Debug)]
pub struct ClientCache {
    path: Option<PathBuf>,
    arena: Arena,
    maxsize: u64,
    cursor: u64,
    last_tid: Tid,
    current: HashMap<Oid, Tid>,
    noncurrent: HashMap<Oid, BTreeMap<Tid, Tid>>,
    index: HashMap<(Oid, Tid), u64>,
    stats: CacheStats,
    trace: Option<CacheTrace>,
}

impl ClientCache {
    /// Open the cache at `path`, or an in-memory scratch cache if `path` is
    /// `None`.
    ///
    /// An existing file is scanned and its index rebuilt. A file that is not
    /// a cache file is moved aside to `<path>.bad` (or deleted, if a `.bad`
    /// file is already there) and a file that does not scan cleanly is
    /// discarded. Either way a fresh cache takes its place.
    pub fn open(path: Option<&Path>, size: u64) -> Result<Self, CacheError> {
        let maxsize = size.max(MIN_CACHE_SIZE);
        let Some(path) = path else {
            let mut cache = Self::with_arena(None, Arena::in_memory(), maxsize);
            cache.initialize()?;
            return Ok(cache);
        };

        let trace = if trace::enabled_by_env() {
            match CacheTrace::open(path) {
                Ok(trace) => Some(trace),
                Err(e) => {
                    tracing::warn!("cannot open cache trace for {}: {e}", path.display());
                    None
                }
            }
        } else {
            None
        };

        let mut cache = if path.exists() {
            Self::open_existing(path, maxsize)?
        } else {
            Self::create(path, maxsize)?
        };
        cache.trace = trace;
        Ok(cache)
    }

    fn with_arena(path: Option<PathBuf>, arena: Arena, maxsize: u64) -> Self {
        Self {
            path,
            arena,
            maxsize,
            cursor: HEADER_SIZE,
            last_tid: Tid::ZERO,
            current: HashMap::new(),
            noncurrent: HashMap::new(),
            index: HashMap::new(),
            stats: CacheStats::default(),
            trace: None,
        }
    }

    fn create(path: &Path, maxsize: u64) -> Result<Self, CacheError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut cache = Self::with_arena(Some(path.to_path_buf()), Arena::new(Box::new(file)), maxsize);
        cache.initialize()?;
        Ok(cache)
    }

    fn open_existing(path: &Path, maxsize: u64) -> Result<Self, CacheError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut cache = Self::with_arena(Some(path.to_path_buf()), Arena::new(Box::new(file)), maxsize);

        let Some(last_tid) = cache.arena.read_header()? else {
            drop(cache);
            set_aside(path)?;
            return Self::create(path, maxsize);
        };
        cache.last_tid = last_tid;

        match cache.rebuild() {
            Ok(()) => {
                tracing::debug!(
                    "opened cache {} with {} records, last tid {}",
                    path.display(),
                    cache.index.len(),
                    cache.last_tid
                );
                Ok(cache)
            }
            Err(e) => {
                tracing::warn!("discarding unreadable cache {}: {e}", path.display());
                drop(cache);
                Self::create(path, maxsize)
            }
        }
    }

    /// Lay out an empty arena: header plus one free block.
    fn initialize(&mut self) -> Result<(), CacheError> {
        self.arena.resize(self.maxsize)?;
        self.arena.write_header(self.last_tid)?;
        self.arena.write_free(HEADER_SIZE, self.maxsize - HEADER_SIZE)?;
        self.cursor = HEADER_SIZE;
        Ok(())
    }

    /// Rebuild the index by walking every block. Blocks that do not fit in
    /// the configured size are dropped and the file is resized to it.
    fn rebuild(&mut self) -> Result<(), CacheError> {
        let file_len = self.arena.len()?;
        let mut offset = HEADER_SIZE;
        while offset < file_len {
            let block = self.arena.read_block(offset)?;
            let end = offset + block.size();
            if end > file_len {
                return Err(CacheError::Corrupt {
                    offset,
                    message: "block runs past the end of the file".to_string(),
                });
            }
            if end > self.maxsize {
                break;
            }
            if let Block::Record {
                size,
                oid,
                start,
                end: end_tid,
            } = block
            {
                self.adopt_scanned(offset, size, oid, start, end_tid.non_zero())?;
            }
            offset = end;
        }
        if offset < self.maxsize {
            self.arena.write_free(offset, self.maxsize - offset)?;
        }
        if file_len != self.maxsize {
            tracing::info!("resizing cache from {file_len} to {} bytes", self.maxsize);
            self.arena.resize(self.maxsize)?;
        }
        self.cursor = HEADER_SIZE;
        Ok(())
    }

    fn adopt_scanned(
        &mut self,
        offset: u64,
        size: u64,
        oid: Oid,
        start: Tid,
        end: Option<Tid>,
    ) -> Result<(), CacheError> {
        if self.index.contains_key(&(oid, start)) {
            self.arena.write_free(offset, size)?;
            return Ok(());
        }
        match end {
            None => {
                if self.noncurrent.get(&oid).is_some_and(|m| m.contains_key(&start)) {
                    self.arena.write_free(offset, size)?;
                    return Ok(());
                }
                // Keep the newer of two current revisions.
                if let Some(&existing) = self.current.get(&oid) {
                    if existing > start {
                        self.arena.write_free(offset, size)?;
                        return Ok(());
                    }
                    if let Some(stale_offset) = self.index.remove(&(oid, existing)) {
                        let stale = self.arena.read_block(stale_offset)?;
                        self.arena.write_free(stale_offset, stale.size())?;
                    }
                }
                self.current.insert(oid, start);
            }
            Some(end) => {
                if self.current.get(&oid) == Some(&start) {
                    self.arena.write_free(offset, size)?;
                    return Ok(());
                }
                self.noncurrent.entry(oid).or_default().insert(start, end);
            }
        }
        self.index.insert((oid, start), offset);
        Ok(())
    }

    fn trace(&mut self, event: TraceEvent, oid: Oid, tid: Tid, end: Option<Tid>, len: usize) {
        if let Some(trace) = self.trace.as_mut() {
            trace.record(event, oid, tid, end, len);
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Configured arena size in bytes, header included.
    #[must_use]
    pub const fn maxsize(&self) -> u64 {
        self.maxsize
    }

    #[must_use]
    pub const fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Number of revisions held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The tid of the current revision of `oid` held, if any.
    #[must_use]
    pub fn current_tid(&self, oid: Oid) -> Option<Tid> {
        self.current.get(&oid).copied()
    }

    #[must_use]
    pub const fn last_tid(&self) -> Tid {
        self.last_tid
    }

    /// Advance the watermark.
    ///
    /// The zero tid is ignored and setting the same tid again is allowed.
    /// Moving backwards fails unless the cache is empty.
    pub fn set_last_tid(&mut self, tid: Tid) -> Result<(), CacheError> {
        if tid.is_zero() || tid == self.last_tid {
            return Ok(());
        }
        if tid < self.last_tid && !self.is_empty() {
            return Err(CacheError::TidRegression {
                current: self.last_tid,
                new: tid,
            });
        }
        self.last_tid = tid;
        self.arena.write_last_tid(tid)?;
        Ok(())
    }

    /// The current revision of `oid`, if cached.
    pub fn load(&mut self, oid: Oid) -> Result<Option<(Vec<u8>, Tid)>, CacheError> {
        let Some(&tid) = self.current.get(&oid) else {
            self.stats.misses += 1;
            self.trace(TraceEvent::LoadMiss, oid, Tid::ZERO, None, 0);
            return Ok(None);
        };
        let data = self.read_record(oid, tid)?;
        self.stats.hits += 1;
        self.trace(TraceEvent::LoadHit, oid, tid, None, data.len());
        Ok(Some((data, tid)))
    }

    /// The revision of `oid` that was current just before `before`.
    ///
    /// Returns the current revision (with `end == None`) if it started
    /// before `before`.
    pub fn load_before(
        &mut self,
        oid: Oid,
        before: Tid,
    ) -> Result<Option<HistoricalRecord>, CacheError> {
        let candidate = self
            .noncurrent
            .get(&oid)
            .and_then(|revisions| revisions.range(..before).next_back())
            .map(|(&start, &end)| (start, end));

        if let Some((start, end)) = candidate {
            if end >= before {
                let data = self.read_record(oid, start)?;
                self.stats.hits += 1;
                self.trace(TraceEvent::LoadBeforeHit, oid, start, Some(end), data.len());
                return Ok(Some(HistoricalRecord {
                    data,
                    start,
                    end: Some(end),
                }));
            }
        }

        if let Some(&tid) = self.current.get(&oid) {
            if tid < before {
                let data = self.read_record(oid, tid)?;
                self.stats.hits += 1;
                self.trace(TraceEvent::LoadBeforeHit, oid, tid, None, data.len());
                return Ok(Some(HistoricalRecord {
                    data,
                    start: tid,
                    end: None,
                }));
            }
        }

        self.stats.misses += 1;
        self.trace(TraceEvent::LoadBeforeMiss, oid, before, None, 0);
        Ok(None)
    }

    fn read_record(&mut self, oid: Oid, start: Tid) -> Result<Vec<u8>, CacheError> {
        let Some(&offset) = self.index.get(&(oid, start)) else {
            return Err(CacheError::Corrupt {
                offset: 0,
                message: format!("no index entry for {oid} at {start}"),
            });
        };
        match self.arena.read_block(offset)? {
            Block::Record {
                size,
                oid: found,
                start: found_start,
                ..
            } if found == oid && found_start == start => Ok(self.arena.read_data(offset, size)?),
            other => Err(CacheError::Corrupt {
                offset,
                message: format!("expected {oid} at {start}, found {other:?}"),
            }),
        }
    }

    /// Whether `start..end` intersects a non-current revision of `oid`
    /// already in the cache.
    fn overlaps_noncurrent(&self, oid: Oid, start: Tid, end: Tid) -> bool {
        self.noncurrent.get(&oid).is_some_and(|revisions| {
            revisions
                .range(..end)
                .next_back()
                .is_some_and(|(_, &cached_end)| cached_end > start)
        })
    }

    /// Store a revision. `end == None` stores it as current.
    ///
    /// Storing a current revision when a different one is already current
    /// fails; storing the same one again does nothing. Records too large for
    /// the arena, and non-current ones overlapping a cached range, are
    /// dropped without error.
    pub fn store(
        &mut self,
        oid: Oid,
        start: Tid,
        end: Option<Tid>,
        data: &[u8],
    ) -> Result<(), CacheError> {
        let known_noncurrent = self
            .noncurrent
            .get(&oid)
            .is_some_and(|revisions| revisions.contains_key(&start));
        match end {
            None => {
                if let Some(&current) = self.current.get(&oid) {
                    if current == start {
                        return Ok(());
                    }
                    return Err(CacheError::AlreadyCurrent {
                        oid,
                        current,
                        new: start,
                    });
                }
                if known_noncurrent {
                    return Ok(());
                }
            }
            Some(end) => {
                if known_noncurrent || self.current.get(&oid) == Some(&start) {
                    return Ok(());
                }
                if self.overlaps_noncurrent(oid, start, end) {
                    tracing::debug!("not caching {oid} for {start}..{end}: overlaps a cached revision");
                    self.trace(TraceEvent::StoreDropped, oid, start, Some(end), data.len());
                    return Ok(());
                }
            }
        }

        let size = RECORD_OVERHEAD + data.len() as u64;
        if size > self.maxsize - HEADER_SIZE {
            tracing::debug!("not caching {oid} at {start}: {size} bytes exceeds the arena");
            self.trace(TraceEvent::StoreDropped, oid, start, end, data.len());
            return Ok(());
        }

        if self.cursor + size > self.maxsize {
            self.cursor = HEADER_SIZE;
        }
        let offset = self.cursor;
        let excess = self.make_room(size)?;
        self.arena
            .write_record(offset, oid, start, end.unwrap_or(Tid::ZERO), data)?;
        self.arena.write_free(offset + size, excess)?;
        self.cursor = offset + size;

        self.index.insert((oid, start), offset);
        match end {
            None => {
                self.current.insert(oid, start);
            }
            Some(end) => {
                self.noncurrent.entry(oid).or_default().insert(start, end);
            }
        }
        self.stats.stores += 1;
        self.trace(TraceEvent::Store, oid, start, end, data.len());
        Ok(())
    }

    /// Evict every block overlapping `[cursor, cursor + nbytes)`. Returns how
    /// many bytes past that range the last evicted block reached.
    fn make_room(&mut self, nbytes: u64) -> Result<u64, CacheError> {
        let needed_end = self.cursor + nbytes;
        let mut offset = self.cursor;
        while offset < needed_end {
            let block = self.arena.read_block(offset)?;
            if let Block::Record {
                size, oid, start, ..
            } = block
            {
                self.forget(oid, start);
                self.stats.evictions += 1;
                self.stats.evicted_bytes += size;
            }
            offset += block.size();
        }
        if offset > self.maxsize {
            return Err(CacheError::Corrupt {
                offset,
                message: "block runs past the end of the arena".to_string(),
            });
        }
        Ok(offset - needed_end)
    }

    fn forget(&mut self, oid: Oid, start: Tid) {
        self.index.remove(&(oid, start));
        if self.current.get(&oid) == Some(&start) {
            self.current.remove(&oid);
        } else if let Some(revisions) = self.noncurrent.get_mut(&oid) {
            revisions.remove(&start);
            if revisions.is_empty() {
                self.noncurrent.remove(&oid);
            }
        }
    }

    /// Free the block holding `(oid, start)` and drop it from the index.
    fn discard(&mut self, oid: Oid, start: Tid) -> Result<(), CacheError> {
        if let Some(&offset) = self.index.get(&(oid, start)) {
            let block = self.arena.read_block(offset)?;
            self.arena.write_free(offset, block.size())?;
        }
        self.forget(oid, start);
        Ok(())
    }

    /// Record that `oid` changed in transaction `tid`.
    ///
    /// The current revision becomes non-current, ending at `tid`. A `tid`
    /// that is not later than the current revision is logged and ignored.
    /// `None` drops every revision of `oid`.
    pub fn invalidate(&mut self, oid: Oid, tid: Option<Tid>) -> Result<(), CacheError> {
        let Some(tid) = tid else {
            let mut starts: Vec<Tid> = self
                .noncurrent
                .get(&oid)
                .map(|revisions| revisions.keys().copied().collect())
                .unwrap_or_default();
            starts.extend(self.current.get(&oid).copied());
            for start in starts {
                self.discard(oid, start)?;
            }
            self.trace(TraceEvent::Purge, oid, Tid::ZERO, None, 0);
            return Ok(());
        };

        let Some(&current) = self.current.get(&oid) else {
            self.trace(TraceEvent::InvalidateMiss, oid, tid, None, 0);
            return Ok(());
        };
        if tid <= current {
            tracing::warn!(
                "ignoring invalidation of {oid} at {tid}: cached revision is {current}"
            );
            return Ok(());
        }
        let Some(&offset) = self.index.get(&(oid, current)) else {
            return Err(CacheError::Corrupt {
                offset: 0,
                message: format!("no index entry for current {oid} at {current}"),
            });
        };
        self.arena.set_end_tid(offset, tid)?;
        self.current.remove(&oid);
        self.noncurrent.entry(oid).or_default().insert(current, tid);
        self.trace(TraceEvent::Invalidate, oid, current, Some(tid), 0);
        Ok(())
    }

    /// Every revision held, each exactly once, sorted by oid then tid.
    #[must_use]
    pub fn contents(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self
            .current
            .iter()
            .map(|(&oid, &start)| CacheEntry {
                oid,
                start,
                end: None,
            })
            .chain(self.noncurrent.iter().flat_map(|(&oid, revisions)| {
                revisions.iter().map(move |(&start, &end)| CacheEntry {
                    oid,
                    start,
                    end: Some(end),
                })
            }))
            .collect();
        entries.sort_unstable();
        entries
    }

    /// Current revisions only, as `(oid, tid)`.
    #[must_use]
    pub fn current_entries(&self) -> Vec<(Oid, Tid)> {
        let mut entries: Vec<(Oid, Tid)> = self.current.iter().map(|(&o, &t)| (o, t)).collect();
        entries.sort_unstable();
        entries
    }

    /// Forget everything, keeping the file. The watermark resets to zero.
    pub fn clear(&mut self) -> Result<(), CacheError> {
        self.current.clear();
        self.noncurrent.clear();
        self.index.clear();
        self.last_tid = Tid::ZERO;
        self.initialize()?;
        self.trace(TraceEvent::Clear, Oid::ZERO, Tid::ZERO, None, 0);
        Ok(())
    }

    /// Flush the header and make the file durable.
    pub fn close(&mut self) -> Result<(), CacheError> {
        self.arena.write_last_tid(self.last_tid)?;
        self.arena.sync()?;
        if let Some(trace) = self.trace.as_mut() {
            trace.flush();
        }
        Ok(())
    }
}

/// Move a foreign file out of the way: rename it to `<path>.bad`, or delete
/// it if an earlier bad file already sits there.
fn set_aside(path: &Path) -> std::io::Result<()> {
    let mut bad = path.as_os_str().to_owned();
    bad.push(".bad");
    let bad = PathBuf::from(bad);
    if bad.exists() {
        tracing::warn!("removing invalid cache file {}", path.display());
        std::fs::remove_file(path)
    } else {
        tracing::warn!(
            "cache file {} has a bad header, moving it to {}",
            path.display(),
            bad.display()
        );
        std::fs::rename(path, bad)
    }
}

#[cfg(test)]
impl ClientCache {
    /// Walk the arena and check it against the index.
    fn check_layout(&mut self) -> Result<(), String> {
        let mut offset = HEADER_SIZE;
        let mut seen = 0usize;
        while offset < self.maxsize {
            let block = self.arena.read_block(offset).map_err(|e| e.to_string())?;
            if let Block::Record {
                oid, start, end, ..
            } = block
            {
                if self.index.get(&(oid, start)) == Some(&offset) {
                    seen += 1;
                    let expected_end = if end.is_zero() {
                        (self.current.get(&oid) == Some(&start)).then_some(start)
                    } else {
                        self.noncurrent
                            .get(&oid)
                            .and_then(|r| r.get(&start))
                            .filter(|&&e| e == end)
                            .copied()
                    };
                    if expected_end.is_none() {
                        return Err(format!("block at {offset} disagrees with the index"));
                    }
                }
            }
            offset += block.size();
        }
        if offset != self.maxsize {
            return Err(format!("blocks end at {offset}, arena is {}", self.maxsize));
        }
        if seen != self.index.len() {
            return Err(format!("{seen} indexed blocks found, index has {}", self.index.len()));
        }
        let expected = self.current.len() + self.noncurrent.values().map(BTreeMap::len).sum::<usize>();
        if expected != self.index.len() {
            return Err("current/noncurrent out of step with index".to_string());
        }
        for (oid, start) in &self.current {
            if self.noncurrent.get(oid).is_some_and(|r| r.contains_key(start)) {
                return Err(format!("{oid} at {start} both current and non-current"));
            }
        }
        for revisions in self.noncurrent.values() {
            let mut previous_end: Option<Tid> = None;
            for (&start, &end) in revisions {
                if start >= end || previous_end.is_some_and(|p| p > start) {
                    return Err("non-current intervals overlap".to_string());
                }
                previous_end = Some(end);
            }
        }
        Ok(())
    }
}
