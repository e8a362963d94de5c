use std::fmt;
use std::str::FromStr;

use crate::wire::WireError;

macro_rules! methods {
    ($($variant:ident => $name:literal,)*) => {
        /// The server's RPC allow-list. Any other name closes the connection.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Method {
            $($variant,)*
        }

        impl Method {
            pub const ALL: &'static [Self] = &[$(Self::$variant,)*];

            /// The name used on the wire.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }
        }

        impl FromStr for Method {
            type Err = WireError;

            fn from_str(s: &str) -> Result<Self, WireError> {
                match s {
                    $($name => Ok(Self::$variant),)*
                    other => Err(WireError::UnknownMethod(other.to_string())),
                }
            }
        }
    };
}

methods! {
    GetInfo => "get_info",
    ZeoLoad => "zeoLoad",
    LoadEx => "loadEx",
    LoadBefore => "loadBefore",
    LoadSerial => "loadSerial",
    LoadBlob => "loadBlob",
    StoreBlob => "storeBlob",
    StoreBlobEnd => "storeBlobEnd",
    StoreBlobShared => "storeBlobShared",
    ModifiedInVersion => "modifiedInVersion",
    NewOid => "new_oid",
    NewOids => "new_oids",
    Pack => "pack",
    Store => "store",
    Storea => "storea",
    TpcAbort => "tpc_abort",
    TpcBegin => "tpc_begin",
    TpcBeginSync => "tpc_begin_sync",
    TpcFinish => "tpc_finish",
    TpcVote => "tpc_vote",
    Vote => "vote",
    Undo => "undo",
    UndoLog => "undoLog",
    UndoInfo => "undoInfo",
    VersionEmpty => "versionEmpty",
    Versions => "versions",
    ZeoVerify => "zeoVerify",
    BeginZeoVerify => "beginZeoVerify",
    EndZeoVerify => "endZeoVerify",
    Register => "register",
    GetAuthProtocol => "getAuthProtocol",
    History => "history",
    RecordIternext => "record_iternext",
    LastTransaction => "lastTransaction",
    GetInvalidations => "getInvalidations",
    DeleteObject => "deleteObject",
    CheckCurrentSerialInTransaction => "checkCurrentSerialInTransaction",
}

impl Method {
    /// Methods that need a writable storage.
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(
            self,
            Self::NewOid
                | Self::NewOids
                | Self::Store
                | Self::Storea
                | Self::StoreBlob
                | Self::StoreBlobEnd
                | Self::StoreBlobShared
                | Self::TpcBegin
                | Self::TpcBeginSync
                | Self::TpcVote
                | Self::Vote
                | Self::TpcFinish
                | Self::Undo
                | Self::DeleteObject
                | Self::CheckCurrentSerialInTransaction
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
