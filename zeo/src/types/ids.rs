//! Identifier types for objects and transactions.
//!
//! Both identifiers are opaque 8-byte values. Ordering is byte-lexicographic,
//! which for big-endian integers is also numeric ordering, so `Oid` and `Tid`
//! can convert to and from `u64` without changing how they sort.

use std::fmt;

/// Length of an oid or tid in bytes.
pub const ID_LEN: usize = 8;

/// An object identifier, unique within a storage.
///
/// # Invariants
///
/// - The ID is exactly 8 bytes.
/// - Comparison is byte-lexicographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Oid(pub [u8; ID_LEN]);

impl Oid {
    /// The zero oid. Storages hand it out first; it names the root object.
    pub const ZERO: Self = Self([0; ID_LEN]);

    /// Create an oid from a `u64`, stored big-endian.
    #[must_use]
    pub const fn from_u64(n: u64) -> Self {
        Self(n.to_be_bytes())
    }

    /// The oid as a big-endian `u64`.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    /// Get the underlying byte array.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Lower-case hex, 16 characters. Used in blob file names.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex(&self.0)
    }

    /// The next oid in sequence.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self::from_u64(self.as_u64().wrapping_add(1))
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.as_u64())
    }
}

impl From<[u8; ID_LEN]> for Oid {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Oid {
    type Error = IdLengthError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        to_array(bytes).map(Self)
    }
}

/// A transaction identifier.
///
/// Tids are derived from a GMT timestamp (see [`crate::types::TidClock`]) and
/// are monotonically non-decreasing per storage. The all-zero tid is a
/// sentinel: as a record's end tid it means "still current", and as a cache
/// watermark it means "nothing seen yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Tid(pub [u8; ID_LEN]);

impl Tid {
    /// The zero sentinel.
    pub const ZERO: Self = Self([0; ID_LEN]);

    /// The largest tid. Used as an open upper bound for range queries.
    pub const MAX: Self = Self([0xff; ID_LEN]);

    /// Create a tid from a `u64`, stored big-endian.
    #[must_use]
    pub const fn from_u64(n: u64) -> Self {
        Self(n.to_be_bytes())
    }

    /// The tid as a big-endian `u64`.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    /// Get the underlying byte array.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Whether this is the zero sentinel.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; ID_LEN]
    }

    /// The smallest tid strictly greater than this one.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self::from_u64(self.as_u64().saturating_add(1))
    }

    /// The largest tid strictly smaller than this one (saturating at zero).
    #[must_use]
    pub const fn prev(&self) -> Self {
        Self::from_u64(self.as_u64().saturating_sub(1))
    }

    /// Return `self` if it is later than `other`, otherwise the tid just
    /// after `other`.
    #[must_use]
    pub fn later_than(self, other: Self) -> Self {
        if self > other { self } else { other.next() }
    }

    /// Lower-case hex, 16 characters. Used in blob file names.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex(&self.0)
    }

    /// Map the zero sentinel to `None`.
    #[must_use]
    pub fn non_zero(self) -> Option<Self> {
        if self.is_zero() { None } else { Some(self) }
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.as_u64())
    }
}

impl From<[u8; ID_LEN]> for Tid {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Tid {
    type Error = IdLengthError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        to_array(bytes).map(Self)
    }
}

/// Returned when a byte slice is not exactly 8 bytes long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdLengthError(pub usize);

impl fmt::Display for IdLengthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "identifier must be {ID_LEN} bytes, got {}", self.0)
    }
}

impl std::error::Error for IdLengthError {}

/// Decode a list of wire oids.
pub fn decode_oids(raw: &[Vec<u8>]) -> Result<Vec<Oid>, IdLengthError> {
    raw.iter().map(|bytes| Oid::try_from(bytes.as_slice())).collect()
}

/// Encode oids for the wire.
#[must_use]
pub fn encode_oids(oids: &[Oid]) -> Vec<Vec<u8>> {
    oids.iter().map(|oid| oid.0.to_vec()).collect()
}

fn to_array(bytes: &[u8]) -> Result<[u8; ID_LEN], IdLengthError> {
    bytes.try_into().map_err(|_| IdLengthError(bytes.len()))
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        // Writing to a String cannot fail.
        let _ = write!(out, "{b:02x}");
    }
    out
}
