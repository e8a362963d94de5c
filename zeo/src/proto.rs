//! Control-frame messages.
//!
//! Every frame payload except handshake tokens and ping/pong is one of the
//! messages below, encoded with prost. Pickles and blob bytes travel as
//! opaque `bytes` fields and are never decoded by the server.
//!
//! Identifiers are 8-byte `bytes` fields; an empty field stands for "none"
//! where a message documents it.

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Payload of a `C` (reply expected) or `A` (no reply) frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Call {
    #[prost(uint64, tag = "1")]
    pub msgid: u64,
    #[prost(string, tag = "2")]
    pub method: String,
    /// Per-method argument message.
    #[prost(bytes = "vec", tag = "3")]
    pub args: Vec<u8>,
}

/// Payload of an `R` frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Reply {
    #[prost(uint64, tag = "1")]
    pub msgid: u64,
    /// Per-method result message.
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

/// Payload of an `E` frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorReply {
    #[prost(uint64, tag = "1")]
    pub msgid: u64,
    #[prost(message, optional, tag = "2")]
    pub error: Option<RemoteError>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorKind {
    StorageSystem = 0,
    Disconnected = 1,
    ReadOnly = 2,
    Conflict = 3,
    PosKey = 4,
    Unsupported = 5,
    Auth = 6,
    StorageTransaction = 7,
    Protocol = 8,
    Timeout = 9,
    Io = 10,
}

/// A server-side error as seen by the client.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoteError {
    #[prost(enumeration = "ErrorKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub oid: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub tid: Option<Vec<u8>>,
    /// Conflict serials: committed first, then the one the client expected.
    #[prost(bytes = "vec", repeated, tag = "5")]
    pub serials: Vec<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Server pushes
// ---------------------------------------------------------------------------

/// `s`: the outcome of one asynchronous store.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoreSerial {
    #[prost(bytes = "vec", tag = "1")]
    pub oid: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub serial: Option<Vec<u8>>,
    #[prost(bool, tag = "3")]
    pub resolved: bool,
    #[prost(message, optional, tag = "4")]
    pub error: Option<RemoteError>,
}

/// `i`: one oid whose cached revision failed verification.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VerifyInvalidation {
    #[prost(bytes = "vec", tag = "1")]
    pub oid: Vec<u8>,
}

/// `I`: a committed transaction's oids. An empty `tid` is the null tid
/// sent after undo.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Invalidation {
    #[prost(bytes = "vec", tag = "1")]
    pub tid: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub oids: Vec<Vec<u8>>,
}

/// `c`: one chunk of a blob download, routed by the call's msgid.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlobChunk {
    #[prost(uint64, tag = "1")]
    pub msgid: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

/// Reply to `loadBlob` and trailer of `storeBlobEnd`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlobTrailer {
    #[prost(uint64, tag = "1")]
    pub length: u64,
    #[prost(uint32, tag = "2")]
    pub crc32: u32,
}

// ---------------------------------------------------------------------------
// Arguments and results
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterArgs {
    #[prost(string, tag = "1")]
    pub storage: String,
    #[prost(bool, tag = "2")]
    pub read_only: bool,
}

/// `S` push payload and the result of `register` and `get_info`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StorageInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint64, tag = "2")]
    pub length: u64,
    #[prost(uint64, tag = "3")]
    pub size: u64,
    #[prost(bool, tag = "4")]
    pub supports_undo: bool,
    #[prost(bool, tag = "5")]
    pub supports_versions: bool,
    #[prost(bool, tag = "6")]
    pub supports_blobs: bool,
    #[prost(bool, tag = "7")]
    pub read_only: bool,
    #[prost(string, repeated, tag = "8")]
    pub extension_methods: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OidArgs {
    #[prost(bytes = "vec", tag = "1")]
    pub oid: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OidTidArgs {
    #[prost(bytes = "vec", tag = "1")]
    pub oid: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub tid: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TidArgs {
    #[prost(bytes = "vec", tag = "1")]
    pub tid: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoadResult {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub tid: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoadBeforeResult {
    #[prost(bool, tag = "1")]
    pub found: bool,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub start: Vec<u8>,
    /// Absent when the revision is current.
    #[prost(bytes = "vec", optional, tag = "4")]
    pub end: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataResult {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TidResult {
    #[prost(bytes = "vec", tag = "1")]
    pub tid: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BoolResult {
    #[prost(bool, tag = "1")]
    pub value: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StringResult {
    #[prost(string, tag = "1")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StringList {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NewOidsArgs {
    #[prost(uint32, tag = "1")]
    pub count: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OidList {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub oids: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PackArgs {
    /// Seconds since the Unix epoch.
    #[prost(double, tag = "1")]
    pub time: f64,
    #[prost(bool, tag = "2")]
    pub wait: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TpcBeginArgs {
    #[prost(uint64, tag = "1")]
    pub txn_id: u64,
    #[prost(string, tag = "2")]
    pub user: String,
    #[prost(string, tag = "3")]
    pub description: String,
    #[prost(bytes = "vec", tag = "4")]
    pub extension: Vec<u8>,
    /// Set when copying transactions with a fixed tid.
    #[prost(bytes = "vec", optional, tag = "5")]
    pub tid: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TxnArgs {
    #[prost(uint64, tag = "1")]
    pub txn_id: u64,
}

/// `store`, `storea`, `deleteObject` and `checkCurrentSerialInTransaction`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoreArgs {
    #[prost(bytes = "vec", tag = "1")]
    pub oid: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub serial: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub txn_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoreBlobChunkArgs {
    #[prost(bytes = "vec", tag = "1")]
    pub oid: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub chunk: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub txn_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoreBlobEndArgs {
    #[prost(message, optional, tag = "1")]
    pub record: Option<StoreArgs>,
    #[prost(message, optional, tag = "2")]
    pub trailer: Option<BlobTrailer>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoreBlobSharedArgs {
    #[prost(message, optional, tag = "1")]
    pub record: Option<StoreArgs>,
    #[prost(string, tag = "2")]
    pub filename: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UndoArgs {
    #[prost(bytes = "vec", tag = "1")]
    pub undo_id: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub txn_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UndoResult {
    #[prost(bytes = "vec", tag = "1")]
    pub tid: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub oids: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RangeArgs {
    #[prost(int64, tag = "1")]
    pub first: i64,
    #[prost(int64, tag = "2")]
    pub last: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UndoEntry {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(double, tag = "2")]
    pub time: f64,
    #[prost(string, tag = "3")]
    pub user: String,
    #[prost(string, tag = "4")]
    pub description: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UndoLogResult {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<UndoEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HistoryArgs {
    #[prost(bytes = "vec", tag = "1")]
    pub oid: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub length: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HistoryEntry {
    #[prost(bytes = "vec", tag = "1")]
    pub tid: Vec<u8>,
    #[prost(double, tag = "2")]
    pub time: f64,
    #[prost(string, tag = "3")]
    pub user: String,
    #[prost(string, tag = "4")]
    pub description: String,
    #[prost(uint64, tag = "5")]
    pub size: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HistoryResult {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<HistoryEntry>,
}

/// `getInvalidations` result. `available == false` means the server cannot
/// enumerate invalidations that far back.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InvalidationsResult {
    #[prost(bool, tag = "1")]
    pub available: bool,
    #[prost(bytes = "vec", tag = "2")]
    pub tid: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub oids: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IterArgs {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub next: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IterResult {
    #[prost(bool, tag = "1")]
    pub found: bool,
    #[prost(bytes = "vec", tag = "2")]
    pub oid: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub tid: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub data: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub next: Option<Vec<u8>>,
}

/// One record of the verification spill file.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SpilledInvalidation {
    #[prost(bytes = "vec", tag = "1")]
    pub tid: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub oids: Vec<Vec<u8>>,
}

/// One entry of a spilled transaction buffer. No `data` means the oid is
/// only invalidated.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BufferedRecord {
    #[prost(bytes = "vec", tag = "1")]
    pub oid: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub data: Option<Vec<u8>>,
}
