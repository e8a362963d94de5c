//! Optional binary trace of cache operations.
//!
//! Enabled by `ZEO_CACHE_TRACE=yes`; the trace lives next to the cache file
//! as `<cache path>.trace`. Each event is a fixed 33-byte record:
//!
//! ```text
//! +---------+----------------------------------+
//! | 0-3     | unix time, seconds (u32)         |
//! | 4       | event code                       |
//! | 5-12    | oid                              |
//! | 13-20   | tid                              |
//! | 21-28   | end tid, zero if none            |
//! | 29-32   | data length (u32)                |
//! +---------+----------------------------------+
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{ID_LEN, Oid, Tid};

pub const TRACE_ENV: &str = "ZEO_CACHE_TRACE";

const RECORD_SIZE: usize = 33;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TraceEvent {
    Invalidate = 0x10,
    InvalidateMiss = 0x12,
    Purge = 0x1c,
    LoadMiss = 0x20,
    LoadHit = 0x22,
    LoadBeforeMiss = 0x24,
    LoadBeforeHit = 0x26,
    Store = 0x52,
    StoreDropped = 0x54,
    Clear = 0x70,
}

impl TryFrom<u8> for TraceEvent {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0x10 => Self::Invalidate,
            0x12 => Self::InvalidateMiss,
            0x1c => Self::Purge,
            0x20 => Self::LoadMiss,
            0x22 => Self::LoadHit,
            0x24 => Self::LoadBeforeMiss,
            0x26 => Self::LoadBeforeHit,
            0x52 => Self::Store,
            0x54 => Self::StoreDropped,
            0x70 => Self::Clear,
            other => return Err(other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub time: u32,
    pub event: TraceEvent,
    pub oid: Oid,
    pub tid: Tid,
    pub end: Tid,
    pub data_len: u32,
}

#[derive(Debug)]
pub struct CacheTrace {
    out: BufWriter<File>,
}

/// `<cache path>.trace`
#[must_use]
pub fn trace_path(cache_path: &Path) -> PathBuf {
    let mut name = cache_path.as_os_str().to_owned();
    name.push(".trace");
    PathBuf::from(name)
}

/// Whether the environment asks for tracing.
#[must_use]
pub fn enabled_by_env() -> bool {
    std::env::var(TRACE_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("yes"))
}

impl CacheTrace {
    /// Open the trace file for `cache_path`, appending.
    pub fn open(cache_path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(trace_path(cache_path))?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    pub fn record(
        &mut self,
        event: TraceEvent,
        oid: Oid,
        tid: Tid,
        end: Option<Tid>,
        data_len: usize,
    ) {
        #[allow(clippy::cast_possible_truncation)] // seconds fit in u32 until 2106
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as u32);
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(&now.to_be_bytes());
        buf[4] = event as u8;
        buf[5..13].copy_from_slice(oid.as_bytes());
        buf[13..21].copy_from_slice(tid.as_bytes());
        buf[21..29].copy_from_slice(end.unwrap_or(Tid::ZERO).as_bytes());
        buf[29..33].copy_from_slice(&u32::try_from(data_len).unwrap_or(u32::MAX).to_be_bytes());
        if let Err(e) = self.out.write_all(&buf) {
            tracing::warn!("cache trace write failed: {e}");
        }
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.out.flush() {
            tracing::warn!("cache trace flush failed: {e}");
        }
    }
}

impl Drop for CacheTrace {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Read back every complete record of a trace file.
pub fn read_trace(path: &Path) -> io::Result<Vec<TraceRecord>> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    let mut records = Vec::with_capacity(bytes.len() / RECORD_SIZE);
    for chunk in bytes.chunks_exact(RECORD_SIZE) {
        let Ok(event) = TraceEvent::try_from(chunk[4]) else {
            continue;
        };
        let id = |at: usize| {
            let mut b = [0u8; ID_LEN];
            b.copy_from_slice(&chunk[at..at + ID_LEN]);
            b
        };
        records.push(TraceRecord {
            time: u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
            event,
            oid: Oid(id(5)),
            tid: Tid(id(13)),
            end: Tid(id(21)),
            data_len: u32::from_be_bytes([chunk[29], chunk[30], chunk[31], chunk[32]]),
        });
    }
    Ok(records)
}
