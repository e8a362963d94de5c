//! Plain records exchanged between the client, the server and backends.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::proto;
use crate::types::{Oid, ProtoDeserializable, ProtoSerializable, Tid};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// The transaction handle supplied by the transaction manager.
///
/// Storages only care about identity (`id`) and the descriptive metadata
/// recorded with the commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionMeta {
    pub id: u64,
    pub user: String,
    pub description: String,
    /// Opaque extension bytes, recorded verbatim.
    pub extension: Vec<u8>,
}

impl TransactionMeta {
    /// Create a transaction with a process-unique id.
    #[must_use]
    pub fn new(user: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
            user: user.into(),
            description: description.into(),
            extension: Vec::new(),
        }
    }

    /// Replace the extension bytes.
    #[must_use]
    pub fn with_extension(mut self, extension: Vec<u8>) -> Self {
        self.extension = extension;
        self
    }
}

/// Result of storing one object inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Stored as sent. Carries the serial the revision will commit under.
    Serial(Tid),
    /// The server resolved a conflict itself. What commits is not what the
    /// client sent, so the client must not cache its own copy.
    Resolved,
}

/// Storage description returned by `register` and `get_info`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageInfo {
    pub name: String,
    /// Number of objects.
    pub length: u64,
    /// Approximate size in bytes.
    pub size: u64,
    pub supports_undo: bool,
    pub supports_versions: bool,
    pub supports_blobs: bool,
    pub read_only: bool,
    pub extension_methods: Vec<String>,
}

/// One revision reported by `history`.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub tid: Tid,
    /// Commit time, seconds since the Unix epoch.
    pub time: f64,
    pub user: String,
    pub description: String,
    /// Pickle size in bytes.
    pub size: u64,
}

/// One transaction reported by `undoLog`.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoDescriptor {
    /// The id to pass to `undo`.
    pub id: Tid,
    pub time: f64,
    pub user: String,
    pub description: String,
}

/// One step of `record_iternext`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordItem {
    pub oid: Oid,
    pub tid: Tid,
    pub data: Vec<u8>,
    /// The oid to pass to the next call, `None` when the scan is done.
    pub next: Option<Oid>,
}

impl ProtoSerializable<proto::StorageInfo> for StorageInfo {
    fn to_proto(self) -> proto::StorageInfo {
        proto::StorageInfo {
            name: self.name,
            length: self.length,
            size: self.size,
            supports_undo: self.supports_undo,
            supports_versions: self.supports_versions,
            supports_blobs: self.supports_blobs,
            read_only: self.read_only,
            extension_methods: self.extension_methods,
        }
    }
}

impl ProtoDeserializable<proto::StorageInfo> for StorageInfo {
    fn from_proto(proto_obj: proto::StorageInfo) -> Result<Self, String> {
        Ok(Self {
            name: proto_obj.name,
            length: proto_obj.length,
            size: proto_obj.size,
            supports_undo: proto_obj.supports_undo,
            supports_versions: proto_obj.supports_versions,
            supports_blobs: proto_obj.supports_blobs,
            read_only: proto_obj.read_only,
            extension_methods: proto_obj.extension_methods,
        })
    }
}

impl ProtoSerializable<proto::HistoryEntry> for HistoryEntry {
    fn to_proto(self) -> proto::HistoryEntry {
        proto::HistoryEntry {
            tid: self.tid.0.to_vec(),
            time: self.time,
            user: self.user,
            description: self.description,
            size: self.size,
        }
    }
}

impl ProtoDeserializable<proto::HistoryEntry> for HistoryEntry {
    fn from_proto(proto_obj: proto::HistoryEntry) -> Result<Self, String> {
        let tid = Tid::try_from(proto_obj.tid.as_slice()).map_err(|e| format!("tid: {e}"))?;
        Ok(Self {
            tid,
            time: proto_obj.time,
            user: proto_obj.user,
            description: proto_obj.description,
            size: proto_obj.size,
        })
    }
}

impl ProtoSerializable<proto::UndoEntry> for UndoDescriptor {
    fn to_proto(self) -> proto::UndoEntry {
        proto::UndoEntry {
            id: self.id.0.to_vec(),
            time: self.time,
            user: self.user,
            description: self.description,
        }
    }
}

impl ProtoDeserializable<proto::UndoEntry> for UndoDescriptor {
    fn from_proto(proto_obj: proto::UndoEntry) -> Result<Self, String> {
        let id = Tid::try_from(proto_obj.id.as_slice()).map_err(|e| format!("undo id: {e}"))?;
        Ok(Self {
            id,
            time: proto_obj.time,
            user: proto_obj.user,
            description: proto_obj.description,
        })
    }
}

impl ProtoSerializable<proto::IterResult> for Option<RecordItem> {
    fn to_proto(self) -> proto::IterResult {
        match self {
            None => proto::IterResult::default(),
            Some(item) => proto::IterResult {
                found: true,
                oid: item.oid.0.to_vec(),
                tid: item.tid.0.to_vec(),
                data: item.data,
                next: item.next.map(|oid| oid.0.to_vec()),
            },
        }
    }
}

impl ProtoDeserializable<proto::IterResult> for Option<RecordItem> {
    fn from_proto(proto_obj: proto::IterResult) -> Result<Self, String> {
        if !proto_obj.found {
            return Ok(None);
        }
        let oid = Oid::try_from(proto_obj.oid.as_slice()).map_err(|e| format!("oid: {e}"))?;
        let tid = Tid::try_from(proto_obj.tid.as_slice()).map_err(|e| format!("tid: {e}"))?;
        let next = proto_obj
            .next
            .map(|n| Oid::try_from(n.as_slice()).map_err(|e| format!("next: {e}")))
            .transpose()?;
        Ok(Some(RecordItem {
            oid,
            tid,
            data: proto_obj.data,
            next,
        }))
    }
}
