//! Storage error taxonomy.
//!
//! [`StorageError`] is what every public client and backend operation returns.
//! Server-side failures cross the wire as [`proto::RemoteError`] and are rebuilt
//! into the same variant on the client.

use std::sync::Arc;

use crate::proto;
use crate::types::{IdLengthError, Oid, Tid};

/// Errors surfaced to the transaction manager and higher layers.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// No server connection, or the connection dropped mid-transaction.
    Disconnected(String),
    /// A write against a read-only storage or a fallback connection.
    ReadOnly,
    /// A `prev_tid` disagreement that could not be resolved.
    Conflict {
        oid: Option<Oid>,
        /// The committed serial, then the serial the client expected.
        serials: Option<(Tid, Tid)>,
        message: String,
    },
    /// The storage has no such object or revision.
    PosKey { oid: Oid, tid: Option<Tid> },
    /// The backing storage does not implement the requested feature.
    Unsupported(String),
    /// Handshake or authentication refused.
    Auth(String),
    /// The operation names a transaction that is not the active one.
    StorageTransaction(String),
    /// Malformed frame, unknown method or undecodable payload.
    Protocol(String),
    /// The server gave up on a transaction that held the commit lock too long.
    Timeout(String),
    /// Local I/O failure.
    Io(Arc<std::io::Error>),
    /// Any other failure inside a storage.
    StorageSystem(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected(msg) => write!(f, "disconnected: {msg}"),
            Self::ReadOnly => write!(f, "storage is read-only"),
            Self::Conflict {
                oid,
                serials,
                message,
            } => {
                write!(f, "conflict: {message}")?;
                if let Some(oid) = oid {
                    write!(f, " (oid {oid}")?;
                    if let Some((committed, expected)) = serials {
                        write!(f, ", committed {committed}, expected {expected}")?;
                    }
                    write!(f, ")")?;
                }
                Ok(())
            }
            Self::PosKey { oid, tid: Some(tid) } => write!(f, "no revision {tid} of {oid}"),
            Self::PosKey { oid, tid: None } => write!(f, "no object {oid}"),
            Self::Unsupported(what) => write!(f, "unsupported: {what}"),
            Self::Auth(msg) => write!(f, "authentication failed: {msg}"),
            Self::StorageTransaction(msg) => write!(f, "transaction error: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::StorageSystem(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<IdLengthError> for StorageError {
    fn from(e: IdLengthError) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<prost::DecodeError> for StorageError {
    fn from(e: prost::DecodeError) -> Self {
        Self::Protocol(format!("undecodable payload: {e}"))
    }
}

impl StorageError {
    /// Shorthand for a [`StorageError::Conflict`] on one oid.
    #[must_use]
    pub fn conflict(oid: Oid, committed: Tid, expected: Tid) -> Self {
        Self::Conflict {
            oid: Some(oid),
            serials: Some((committed, expected)),
            message: "database conflict".to_string(),
        }
    }

    #[must_use]
    pub const fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }

    /// Encode for an `E` reply or a failed `s` serial.
    #[must_use]
    pub fn to_remote(&self) -> proto::RemoteError {
        let mut remote = proto::RemoteError {
            message: self.to_string(),
            ..Default::default()
        };
        let kind = match self {
            Self::Disconnected(msg) => {
                remote.message.clone_from(msg);
                proto::ErrorKind::Disconnected
            }
            Self::ReadOnly => proto::ErrorKind::ReadOnly,
            Self::Conflict {
                oid,
                serials,
                message,
            } => {
                remote.message.clone_from(message);
                remote.oid = oid.map(|o| o.0.to_vec());
                if let Some((committed, expected)) = serials {
                    remote.serials = vec![committed.0.to_vec(), expected.0.to_vec()];
                }
                proto::ErrorKind::Conflict
            }
            Self::PosKey { oid, tid } => {
                remote.oid = Some(oid.0.to_vec());
                remote.tid = tid.map(|t| t.0.to_vec());
                proto::ErrorKind::PosKey
            }
            Self::Unsupported(msg) => {
                remote.message.clone_from(msg);
                proto::ErrorKind::Unsupported
            }
            Self::Auth(msg) => {
                remote.message.clone_from(msg);
                proto::ErrorKind::Auth
            }
            Self::StorageTransaction(msg) => {
                remote.message.clone_from(msg);
                proto::ErrorKind::StorageTransaction
            }
            Self::Protocol(msg) => {
                remote.message.clone_from(msg);
                proto::ErrorKind::Protocol
            }
            Self::Timeout(msg) => {
                remote.message.clone_from(msg);
                proto::ErrorKind::Timeout
            }
            Self::Io(_) => proto::ErrorKind::Io,
            Self::StorageSystem(msg) => {
                remote.message.clone_from(msg);
                proto::ErrorKind::StorageSystem
            }
        };
        remote.kind = kind.into();
        remote
    }

    /// Rebuild the typed error from its wire form.
    #[must_use]
    pub fn from_remote(remote: proto::RemoteError) -> Self {
        let kind = proto::ErrorKind::try_from(remote.kind).unwrap_or(proto::ErrorKind::StorageSystem);
        let oid = remote
            .oid
            .as_deref()
            .and_then(|b| Oid::try_from(b).ok());
        match kind {
            proto::ErrorKind::Disconnected => Self::Disconnected(remote.message),
            proto::ErrorKind::ReadOnly => Self::ReadOnly,
            proto::ErrorKind::Conflict => {
                let serials = match remote.serials.as_slice() {
                    [committed, expected] => Tid::try_from(committed.as_slice())
                        .ok()
                        .zip(Tid::try_from(expected.as_slice()).ok()),
                    _ => None,
                };
                Self::Conflict {
                    oid,
                    serials,
                    message: remote.message,
                }
            }
            proto::ErrorKind::PosKey => Self::PosKey {
                oid: oid.unwrap_or_default(),
                tid: remote.tid.as_deref().and_then(|b| Tid::try_from(b).ok()),
            },
            proto::ErrorKind::Unsupported => Self::Unsupported(remote.message),
            proto::ErrorKind::Auth => Self::Auth(remote.message),
            proto::ErrorKind::StorageTransaction => Self::StorageTransaction(remote.message),
            proto::ErrorKind::Protocol => Self::Protocol(remote.message),
            proto::ErrorKind::Timeout => Self::Timeout(remote.message),
            proto::ErrorKind::Io | proto::ErrorKind::StorageSystem => {
                Self::StorageSystem(remote.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_survives_the_wire() {
        let err = StorageError::conflict(Oid::from_u64(9), Tid::from_u64(4), Tid::from_u64(3));
        let back = StorageError::from_remote(err.to_remote());
        match back {
            StorageError::Conflict { oid, serials, .. } => {
                assert_eq!(oid, Some(Oid::from_u64(9)));
                assert_eq!(serials, Some((Tid::from_u64(4), Tid::from_u64(3))));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_poskey_and_read_only_survive_the_wire() {
        let err = StorageError::PosKey {
            oid: Oid::from_u64(2),
            tid: Some(Tid::from_u64(7)),
        };
        let back = StorageError::from_remote(err.to_remote());
        assert!(matches!(
            back,
            StorageError::PosKey { oid, tid: Some(tid) } if oid == Oid::from_u64(2) && tid == Tid::from_u64(7)
        ));
        assert!(matches!(
            StorageError::from_remote(StorageError::ReadOnly.to_remote()),
            StorageError::ReadOnly
        ));
    }

    #[test]
    fn test_io_error_becomes_storage_system_remotely() {
        let err = StorageError::from(std::io::Error::other("disk on fire"));
        let back = StorageError::from_remote(err.to_remote());
        match back {
            StorageError::StorageSystem(msg) => assert!(msg.contains("disk on fire")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_falls_back() {
        let remote = proto::RemoteError {
            kind: 99,
            message: "?".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            StorageError::from_remote(remote),
            StorageError::StorageSystem(_)
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(StorageError::ReadOnly.to_string(), "storage is read-only");
        let err = StorageError::PosKey {
            oid: Oid::from_u64(1),
            tid: None,
        };
        assert_eq!(err.to_string(), "no object 0x1");
    }
}
