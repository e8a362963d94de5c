//! Transaction id generation.
//!
//! A tid packs a GMT timestamp into 8 bytes:
//!
//! ```text
//! +---------+--------------------------------------------------------+
//! | 0-3     | minutes since 1900-01-01 00:00, as y/m/d/h/m fields     |
//! |         | ((((year-1900)*12 + month-1)*31 + day-1)*24 + hour)*60  |
//! |         | + minute                                                |
//! | 4-7     | seconds within the minute, scaled by 2^32 / 60          |
//! +---------+--------------------------------------------------------+
//! ```
//!
//! Because the fields are big-endian and most-significant first, later times
//! compare greater byte-wise. [`TidClock`] adds the guarantee that every tid it
//! issues is strictly greater than the previous one, even if the wall clock
//! stalls or steps backwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::Tid;

/// Abstraction over time operations.
///
/// Production code uses [`SystemTimeSource`]; tests use [`ManualTimeSource`]
/// to get reproducible tids.
pub trait TimeSource {
    /// Get the current time in milliseconds since Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Real time source using the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    #[allow(clippy::cast_possible_truncation)] // Milliseconds won't overflow u64 for billions of years
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }
}

/// A time source that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now_ms: AtomicU64,
}

impl ManualTimeSource {
    #[must_use]
    pub const fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn advance_ms(&self, delta: u64) {
        self.now_ms.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

impl<T: TimeSource + ?Sized> TimeSource for std::sync::Arc<T> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

const MS_PER_MINUTE: u64 = 60_000;
const MS_PER_DAY: u64 = 86_400_000;

/// Encode a Unix timestamp in milliseconds as a tid.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
pub fn tid_from_unix_ms(ms: u64) -> Tid {
    let days = (ms / MS_PER_DAY) as i64;
    let ms_of_day = ms % MS_PER_DAY;
    let (year, month, day) = civil_from_days(days);
    let hour = ms_of_day / 3_600_000;
    let minute = (ms_of_day / MS_PER_MINUTE) % 60;
    let ms_of_minute = ms_of_day % MS_PER_MINUTE;

    let year_index = (year - 1900).max(0) as u64;
    let minutes = ((((year_index * 12 + u64::from(month) - 1) * 31 + u64::from(day) - 1) * 24
        + hour)
        * 60)
        + minute;
    // ms_of_minute / 60_000 * 2^32, kept in integer arithmetic.
    let fraction = (ms_of_minute << 32) / MS_PER_MINUTE;

    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&(minutes as u32).to_be_bytes());
    bytes[4..].copy_from_slice(&(fraction as u32).to_be_bytes());
    Tid(bytes)
}

/// Decode the timestamp part of a tid back to Unix milliseconds.
///
/// Tids made by [`tid_from_unix_ms`] round-trip to the millisecond, except
/// that the sub-minute fraction is truncated.
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub fn tid_to_unix_ms(tid: Tid) -> u64 {
    let b = tid.0;
    let mut v = u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]]));
    let fraction = u64::from(u32::from_be_bytes([b[4], b[5], b[6], b[7]]));

    let minute = v % 60;
    v /= 60;
    let hour = v % 24;
    v /= 24;
    let day = (v % 31) as u32 + 1;
    v /= 31;
    let month = (v % 12) as u32 + 1;
    let year = (v / 12) as i64 + 1900;

    let days = days_from_civil(year, month, day).max(0) as u64;
    let ms_of_minute = (fraction * MS_PER_MINUTE) >> 32;
    days * MS_PER_DAY + hour * 3_600_000 + minute * MS_PER_MINUTE + ms_of_minute
}

/// Seconds since the Unix epoch for a tid, as reported by `history` and `undoLog`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn tid_to_unix_secs(tid: Tid) -> f64 {
    tid_to_unix_ms(tid) as f64 / 1000.0
}

// Howard Hinnant's days <-> civil date algorithms.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
const fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m as u32, d as u32)
}

const fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y.rem_euclid(400);
    let m = m as i64;
    let d = d as i64;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Issues strictly increasing tids derived from a time source.
#[derive(Debug)]
pub struct TidClock<T: TimeSource> {
    time_source: T,
    last: Tid,
}

impl<T: TimeSource> TidClock<T> {
    /// Create a clock that has issued nothing yet.
    #[must_use]
    pub const fn new(time_source: T) -> Self {
        Self {
            time_source,
            last: Tid::ZERO,
        }
    }

    /// Create a clock that will never issue a tid at or below `last`.
    ///
    /// Used when reopening a storage whose last committed tid is known.
    #[must_use]
    pub const fn from_last(time_source: T, last: Tid) -> Self {
        Self { time_source, last }
    }

    /// Issue the next tid.
    pub fn tick(&mut self) -> Tid {
        let now = tid_from_unix_ms(self.time_source.now_ms());
        self.last = now.later_than(self.last);
        self.last
    }

    /// Record a tid issued elsewhere (for example supplied by a client
    /// copying transactions) so later ticks stay above it.
    pub fn observe(&mut self, tid: Tid) {
        if tid > self.last {
            self.last = tid;
        }
    }

    /// The last tid issued or observed.
    #[must_use]
    pub const fn last(&self) -> Tid {
        self.last
    }

    /// Get a reference to the time source.
    #[must_use]
    pub const fn time_source(&self) -> &T {
        &self.time_source
    }
}
