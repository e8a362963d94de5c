pub mod ids;
pub mod records;
pub mod tid_clock;

pub use ids::{ID_LEN, IdLengthError, Oid, Tid, decode_oids, encode_oids};
pub use records::{
    HistoryEntry, RecordItem, StorageInfo, StoreOutcome, TransactionMeta, UndoDescriptor,
};
pub use tid_clock::{ManualTimeSource, SystemTimeSource, TidClock, TimeSource};

pub trait ProtoDeserializable<T> {
    fn from_proto(proto_obj: T) -> Result<Self, String>
    where
        Self: Sized;
}

pub trait ProtoSerializable<T> {
    fn to_proto(self) -> T;
}
