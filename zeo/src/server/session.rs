//! One client connection on the server.
//!
//! Three tasks serve a connection. The reader answers pings itself and
//! forwards calls. The dispatcher runs calls one at a time, in order. The
//! writer drains the outbound queue that the dispatcher and the storage hub
//! (for invalidations) feed.
//!
//! A `tpc_begin` that finds the commit lock taken is parked rather than
//! awaited: the dispatcher keeps serving loads and other reads, and answers
//! the begin once the hub grants the lock.
//!
//! A session belongs to at most one storage. It registers with that
//! storage's hub so it can be reached for invalidations and be closed by
//! the transaction watchdog.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use prost::Message;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};

use super::Hubs;
use super::hub::{Invalidations, LockRequest, SessionHandle, SessionId, StorageHub};
use crate::blob::{BLOB_CHUNK_SIZE, BlobDigest};
use crate::error::StorageError;
use crate::proto;
use crate::types::{
    Oid, ProtoSerializable, StoreOutcome, Tid, TransactionMeta, encode_oids,
};
use crate::wire::{Frame, Method, ProtocolVersion, Stream, Tag, WireError, read_frame, write_frame};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// How long queued frames may take to flush once a session ends.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A blob arriving in chunks.
struct Upload {
    path: PathBuf,
    digest: BlobDigest,
}

impl Upload {
    fn new(dir: &Path, oid: Oid) -> Self {
        let nonce: u64 = rand::rng().random();
        Self {
            path: dir.join(format!("{}-{nonce:016x}.upload", oid.to_hex())),
            digest: BlobDigest::new(),
        }
    }
}

/// The transaction between this session's `tpc_begin` and its finish or
/// abort.
struct ActiveTransaction {
    id: u64,
    /// Oids to announce at finish.
    invalidated: Vec<Oid>,
    /// First store failure, returned by vote.
    store_error: Option<StorageError>,
    uploads: HashMap<Oid, Upload>,
}

impl ActiveTransaction {
    fn new(id: u64) -> Self {
        Self {
            id,
            invalidated: Vec::new(),
            store_error: None,
            uploads: HashMap::new(),
        }
    }

    fn touch(&mut self, oid: Oid) {
        if !self.invalidated.contains(&oid) {
            self.invalidated.push(oid);
        }
    }

    fn discard_uploads(self) {
        for upload in self.uploads.into_values() {
            if let Err(e) = std::fs::remove_file(&upload.path) {
                tracing::debug!("could not remove upload {}: {e}", upload.path.display());
            }
        }
    }
}

/// A `tpc_begin` queued behind another session's commit.
struct PendingBegin {
    msgid: u64,
    reply: bool,
    meta: TransactionMeta,
    tid: Option<Tid>,
    granted: oneshot::Receiver<()>,
}

enum Event {
    Call(Tag, proto::Call),
    LockGranted(bool),
    Stop,
}

/// Resolves when the parked begin gets the lock; never without one.
async fn lock_granted(pending: &mut Option<PendingBegin>) -> bool {
    match pending {
        Some(pending) => (&mut pending.granted).await.is_ok(),
        None => std::future::pending().await,
    }
}

struct Session {
    id: SessionId,
    peer: String,
    hubs: Hubs,
    outbound: mpsc::UnboundedSender<Frame>,
    kill_switch: Arc<watch::Sender<Option<String>>>,
    kill: watch::Receiver<Option<String>>,
    shutdown: watch::Receiver<bool>,
    hub: Option<Arc<StorageHub>>,
    read_only: bool,
    txn: Option<ActiveTransaction>,
    pending_begin: Option<PendingBegin>,
    /// Set when the connection must close after the current call.
    closing: Option<String>,
}

/// Serve one accepted connection until either side closes it.
pub(crate) async fn serve_connection(
    stream: Box<dyn Stream>,
    peer: String,
    hubs: Hubs,
    shutdown: watch::Receiver<bool>,
) -> Result<(), StorageError> {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let protocol = handshake(&mut reader, &mut writer).await?;

    let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
    tracing::debug!("session {id} from {peer} speaks {protocol:?}");

    let (kill_tx, kill) = watch::channel(None);
    let kill_switch = Arc::new(kill_tx);
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let (calls_tx, calls) = mpsc::unbounded_channel();

    let writer_task = tokio::spawn(write_loop(writer, outbound_rx));
    let reader_task = tokio::spawn({
        #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
        let kill_switch = Arc::clone(&kill_switch);
        let outbound = outbound.clone();
        async move {
            let reason = read_loop(reader, calls_tx, outbound).await;
            kill_switch.send_if_modified(|current| {
                if current.is_some() {
                    return false;
                }
                *current = Some(reason);
                true
            });
        }
    });

    let mut session = Session {
        id,
        peer,
        hubs,
        outbound,
        kill_switch,
        kill,
        shutdown,
        hub: None,
        read_only: false,
        txn: None,
        pending_begin: None,
        closing: None,
    };
    session.run(calls).await;
    session.close();
    let reason = session
        .closing
        .take()
        .or_else(|| session.kill.borrow().clone())
        .unwrap_or_else(|| "server shutting down".to_string());
    tracing::debug!("session {id} from {} closed: {reason}", session.peer);
    drop(session);

    reader_task.abort();
    if tokio::time::timeout(DRAIN_TIMEOUT, writer_task).await.is_err() {
        tracing::debug!("session {id}: gave up flushing replies");
    }
    Ok(())
}

/// The server announces its version first and accepts any version it
/// knows in reply.
async fn handshake<R, W>(reader: &mut R, writer: &mut W) -> Result<ProtocolVersion, StorageError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_frame(
        writer,
        &Frame::new(Tag::Handshake, ProtocolVersion::CURRENT.token().to_vec()),
    )
    .await?;
    let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(reader))
        .await
        .map_err(|_| StorageError::Timeout("no handshake from client".to_string()))??
        .ok_or_else(|| StorageError::Disconnected("client closed during handshake".to_string()))?;
    if hello.tag != Tag::Handshake {
        return Err(WireError::UnexpectedTag(hello.tag).into());
    }
    ProtocolVersion::from_token(&hello.payload)
        .ok_or_else(|| WireError::UnsupportedProtocol(hello.payload).into())
}

/// Returns why reading stopped.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    calls: mpsc::UnboundedSender<(Tag, proto::Call)>,
    outbound: mpsc::UnboundedSender<Frame>,
) -> String {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return "client closed the connection".to_string(),
            Err(e) => return e.to_string(),
        };
        match frame.tag {
            Tag::Ping => {
                let _ = outbound.send(Frame::bare(Tag::Pong));
            }
            Tag::Pong => {}
            Tag::Call | Tag::AsyncCall => {
                let call: proto::Call = match frame.decode() {
                    Ok(call) => call,
                    Err(e) => return e.to_string(),
                };
                if calls.send((frame.tag, call)).is_err() {
                    return "session ended".to_string();
                }
            }
            tag => return WireError::UnexpectedTag(tag).to_string(),
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            tracing::debug!("write failed: {e}");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

fn decode<M: Message + Default>(raw: &[u8]) -> Result<M, StorageError> {
    Ok(M::decode(raw)?)
}

fn oid(raw: &[u8]) -> Result<Oid, StorageError> {
    Ok(Oid::try_from(raw)?)
}

fn tid(raw: &[u8]) -> Result<Tid, StorageError> {
    Ok(Tid::try_from(raw)?)
}

/// `undoLog` range: a negative `last` counts entries from `first`.
fn undo_range(first: i64, last: i64) -> (usize, usize) {
    let first = first.max(0);
    let last = if last < 0 { first.saturating_sub(last) } else { last };
    (
        usize::try_from(first).unwrap_or(usize::MAX),
        usize::try_from(last).unwrap_or(usize::MAX),
    )
}

impl Session {
    async fn run(&mut self, mut calls: mpsc::UnboundedReceiver<(Tag, proto::Call)>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.kill.changed() => Event::Stop,
                _ = self.shutdown.changed() => Event::Stop,
                granted = lock_granted(&mut self.pending_begin) => Event::LockGranted(granted),
                next = calls.recv() => next.map_or(Event::Stop, |(tag, call)| Event::Call(tag, call)),
            };
            match event {
                Event::Stop => return,
                Event::LockGranted(granted) => self.resume_begin(granted),
                Event::Call(tag, call) => self.dispatch(tag == Tag::Call, call).await,
            }
            if self.closing.is_some() || self.kill.borrow().is_some() || *self.shutdown.borrow() {
                return;
            }
        }
    }

    fn send(&self, frame: Frame) {
        if self.outbound.send(frame).is_err() {
            tracing::trace!("session {}: writer gone", self.id);
        }
    }

    async fn dispatch(&mut self, reply: bool, call: proto::Call) {
        let msgid = call.msgid;
        let result = match call.method.parse::<Method>() {
            Ok(Method::TpcBegin | Method::TpcBeginSync) => {
                match self.tpc_begin(msgid, reply, &call.args) {
                    // Answered by `resume_begin`.
                    Ok(false) => return,
                    Ok(true) => Ok(proto::Empty {}.encode_to_vec()),
                    Err(e) => Err(e),
                }
            }
            Ok(method) => {
                tracing::trace!("session {} calls {method}", self.id);
                self.handle(method, msgid, &call.args).await
            }
            Err(e) => {
                self.closing = Some(e.to_string());
                Err(e.into())
            }
        };
        self.respond(reply, msgid, &call.method, result);
    }

    fn respond(&mut self, reply: bool, msgid: u64, method: &str, result: Result<Vec<u8>, StorageError>) {
        match result {
            Ok(payload) if reply => {
                self.send(Frame::message(Tag::Reply, &proto::Reply { msgid, payload }));
            }
            Ok(_) => {}
            Err(e) if reply => {
                self.send(Frame::message(
                    Tag::Error,
                    &proto::ErrorReply {
                        msgid,
                        error: Some(e.to_remote()),
                    },
                ));
            }
            Err(e) => {
                tracing::warn!("{method} from {} failed: {e}", self.peer);
                if let Some(txn) = &mut self.txn {
                    txn.store_error.get_or_insert(e);
                }
            }
        }
    }

    fn hub(&self) -> Result<Arc<StorageHub>, StorageError> {
        #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
        self.hub
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| StorageError::Protocol("register a storage first".to_string()))
    }

    fn transaction(&mut self, txn_id: u64) -> Result<&mut ActiveTransaction, StorageError> {
        match &mut self.txn {
            Some(txn) if txn.id == txn_id => Ok(txn),
            _ => Err(StorageError::StorageTransaction(format!(
                "transaction {txn_id} is not active"
            ))),
        }
    }

    /// Report a store's outcome to the client as an `s` push.
    fn record_store(
        &mut self,
        txn_id: u64,
        oid: Oid,
        result: Result<StoreOutcome, StorageError>,
    ) -> Result<(), StorageError> {
        let txn = self.transaction(txn_id)?;
        let serial = match result {
            Ok(outcome) => {
                txn.touch(oid);
                proto::StoreSerial {
                    oid: oid.0.to_vec(),
                    serial: match outcome {
                        StoreOutcome::Serial(tid) => Some(tid.0.to_vec()),
                        StoreOutcome::Resolved => None,
                    },
                    resolved: outcome == StoreOutcome::Resolved,
                    error: None,
                }
            }
            Err(e) => {
                let error = Some(e.to_remote());
                txn.store_error.get_or_insert(e);
                proto::StoreSerial {
                    oid: oid.0.to_vec(),
                    serial: None,
                    resolved: false,
                    error,
                }
            }
        };
        self.send(Frame::message(Tag::Serial, &serial));
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    async fn handle(&mut self, method: Method, msgid: u64, raw: &[u8]) -> Result<Vec<u8>, StorageError> {
        match method {
            Method::Register => return self.register(decode(raw)?),
            Method::GetAuthProtocol => return Ok(proto::StringResult::default().encode_to_vec()),
            _ => {}
        }
        let hub = self.hub()?;
        if method.is_write() && self.read_only {
            return Err(StorageError::ReadOnly);
        }
        let storage = hub.storage();

        let payload = match method {
            // Answered before this match.
            Method::Register | Method::GetAuthProtocol | Method::TpcBegin | Method::TpcBeginSync => {
                Vec::new()
            }
            Method::GetInfo => self.info(&hub).encode_to_vec(),
            Method::LastTransaction => proto::TidResult {
                tid: storage.last_transaction().0.to_vec(),
            }
            .encode_to_vec(),
            Method::ZeoLoad | Method::LoadEx => {
                let args: proto::OidArgs = decode(raw)?;
                let (data, tid) = storage.load(oid(&args.oid)?)?;
                proto::LoadResult {
                    data,
                    tid: tid.0.to_vec(),
                }
                .encode_to_vec()
            }
            Method::LoadBefore => {
                let args: proto::OidTidArgs = decode(raw)?;
                let result = match storage.load_before(oid(&args.oid)?, tid(&args.tid)?)? {
                    Some((data, start, end)) => proto::LoadBeforeResult {
                        found: true,
                        data,
                        start: start.0.to_vec(),
                        end: end.map(|end| end.0.to_vec()),
                    },
                    None => proto::LoadBeforeResult::default(),
                };
                result.encode_to_vec()
            }
            Method::LoadSerial => {
                let args: proto::OidTidArgs = decode(raw)?;
                let data = storage.load_serial(oid(&args.oid)?, tid(&args.tid)?)?;
                proto::DataResult { data }.encode_to_vec()
            }
            Method::LoadBlob => {
                let args: proto::OidTidArgs = decode(raw)?;
                let path = storage.load_blob(oid(&args.oid)?, tid(&args.tid)?)?;
                self.stream_blob(msgid, &path).await?.encode_to_vec()
            }
            Method::ModifiedInVersion => proto::StringResult::default().encode_to_vec(),
            Method::VersionEmpty => proto::BoolResult { value: true }.encode_to_vec(),
            Method::Versions => proto::StringList::default().encode_to_vec(),
            Method::NewOid => proto::OidList {
                oids: encode_oids(&storage.new_oids(1)?),
            }
            .encode_to_vec(),
            Method::NewOids => {
                let args: proto::NewOidsArgs = decode(raw)?;
                proto::OidList {
                    oids: encode_oids(&storage.new_oids(args.count.max(1))?),
                }
                .encode_to_vec()
            }
            Method::Pack => {
                let args: proto::PackArgs = decode(raw)?;
                #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
                let pack = pack(Arc::clone(&hub), args.time);
                if args.wait {
                    pack.await?;
                } else {
                    tokio::spawn(async move {
                        if let Err(e) = pack.await {
                            tracing::warn!("pack failed: {e}");
                        }
                    });
                }
                proto::Empty {}.encode_to_vec()
            }
            Method::Store | Method::Storea => {
                let args: proto::StoreArgs = decode(raw)?;
                let oid = oid(&args.oid)?;
                self.transaction(args.txn_id)?;
                let result = storage.store(args.txn_id, oid, tid(&args.serial)?, args.data);
                self.record_store(args.txn_id, oid, result)?;
                proto::Empty {}.encode_to_vec()
            }
            Method::StoreBlob => {
                let args: proto::StoreBlobChunkArgs = decode(raw)?;
                let oid = oid(&args.oid)?;
                let dir = storage
                    .blob_layout()
                    .ok_or_else(|| StorageError::Unsupported("blobs".to_string()))?
                    .temporary_directory();
                let txn = self.transaction(args.txn_id)?;
                let upload = match txn.uploads.entry(oid) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => entry.insert(Upload::new(&dir, oid)),
                };
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&upload.path)
                    .await?;
                file.write_all(&args.chunk).await?;
                upload.digest.update(&args.chunk);
                proto::Empty {}.encode_to_vec()
            }
            Method::StoreBlobEnd => {
                let args: proto::StoreBlobEndArgs = decode(raw)?;
                let record = args
                    .record
                    .ok_or_else(|| StorageError::Protocol("storeBlobEnd without a record".to_string()))?;
                let trailer = args.trailer.unwrap_or_default();
                let oid = oid(&record.oid)?;
                let prev_tid = tid(&record.serial)?;
                let dir = storage
                    .blob_layout()
                    .ok_or_else(|| StorageError::Unsupported("blobs".to_string()))?
                    .temporary_directory();
                let upload = self.transaction(record.txn_id)?.uploads.remove(&oid);
                let upload = match upload {
                    Some(upload) => upload,
                    None => {
                        let upload = Upload::new(&dir, oid);
                        tokio::fs::write(&upload.path, b"").await?;
                        upload
                    }
                };
                let (crc32, length) = upload.digest.finish();
                let result = if crc32 == trailer.crc32 && length == trailer.length {
                    storage.store_blob(record.txn_id, oid, prev_tid, record.data, &upload.path)
                } else {
                    Err(StorageError::StorageSystem(format!(
                        "blob for {oid} arrived damaged: {length} bytes crc {crc32:08x}, expected {} bytes crc {:08x}",
                        trailer.length, trailer.crc32
                    )))
                };
                if result.is_err() {
                    let _ = std::fs::remove_file(&upload.path);
                }
                self.record_store(record.txn_id, oid, result)?;
                proto::Empty {}.encode_to_vec()
            }
            Method::StoreBlobShared => {
                let args: proto::StoreBlobSharedArgs = decode(raw)?;
                let record = args.record.ok_or_else(|| {
                    StorageError::Protocol("storeBlobShared without a record".to_string())
                })?;
                let oid = oid(&record.oid)?;
                self.transaction(record.txn_id)?;
                let result = storage.store_blob(
                    record.txn_id,
                    oid,
                    tid(&record.serial)?,
                    record.data,
                    Path::new(&args.filename),
                );
                self.record_store(record.txn_id, oid, result)?;
                proto::Empty {}.encode_to_vec()
            }
            Method::DeleteObject => {
                let args: proto::StoreArgs = decode(raw)?;
                let oid = oid(&args.oid)?;
                self.transaction(args.txn_id)?;
                let result = storage.delete_object(args.txn_id, oid, tid(&args.serial)?);
                self.record_store(args.txn_id, oid, result)?;
                proto::Empty {}.encode_to_vec()
            }
            Method::CheckCurrentSerialInTransaction => {
                let args: proto::StoreArgs = decode(raw)?;
                let oid = oid(&args.oid)?;
                self.transaction(args.txn_id)?;
                if let Err(e) = storage.check_current_serial(args.txn_id, oid, tid(&args.serial)?) {
                    self.record_store(args.txn_id, oid, Err(e))?;
                }
                proto::Empty {}.encode_to_vec()
            }
            Method::TpcVote | Method::Vote => {
                let args: proto::TxnArgs = decode(raw)?;
                let txn = self.transaction(args.txn_id)?;
                if let Some(e) = txn.store_error.clone() {
                    return Err(e);
                }
                storage.tpc_vote(args.txn_id)?;
                proto::Empty {}.encode_to_vec()
            }
            Method::TpcFinish => {
                let args: proto::TxnArgs = decode(raw)?;
                self.tpc_finish(&hub, args.txn_id)?.encode_to_vec()
            }
            Method::TpcAbort => {
                let args: proto::TxnArgs = decode(raw)?;
                if self.txn.as_ref().is_some_and(|txn| txn.id == args.txn_id) {
                    self.abort(&hub);
                }
                if self.pending_begin.as_ref().is_some_and(|p| p.meta.id == args.txn_id) {
                    self.cancel_begin(&hub);
                }
                proto::Empty {}.encode_to_vec()
            }
            Method::Undo => {
                let args: proto::UndoArgs = decode(raw)?;
                let undo_id = tid(&args.undo_id)?;
                self.transaction(args.txn_id)?;
                let (tid, oids) = storage.undo(undo_id, args.txn_id)?;
                hub.invalidate_unknown(&oids);
                let txn = self.transaction(args.txn_id)?;
                for &oid in &oids {
                    txn.touch(oid);
                }
                proto::UndoResult {
                    tid: tid.0.to_vec(),
                    oids: encode_oids(&oids),
                }
                .encode_to_vec()
            }
            Method::UndoLog | Method::UndoInfo => {
                let args: proto::RangeArgs = decode(raw)?;
                let (first, last) = undo_range(args.first, args.last);
                proto::UndoLogResult {
                    entries: storage
                        .undo_log(first, last)
                        .into_iter()
                        .map(ProtoSerializable::to_proto)
                        .collect(),
                }
                .encode_to_vec()
            }
            Method::History => {
                let args: proto::HistoryArgs = decode(raw)?;
                let length = usize::try_from(args.length.max(1)).unwrap_or(usize::MAX);
                proto::HistoryResult {
                    entries: storage
                        .history(oid(&args.oid)?, length)?
                        .into_iter()
                        .map(ProtoSerializable::to_proto)
                        .collect(),
                }
                .encode_to_vec()
            }
            Method::RecordIternext => {
                let args: proto::IterArgs = decode(raw)?;
                let next = args.next.as_deref().map(oid).transpose()?;
                storage.record_iternext(next)?.to_proto().encode_to_vec()
            }
            Method::GetInvalidations => {
                let args: proto::TidArgs = decode(raw)?;
                let result = match hub.invalidations_since(tid(&args.tid)?) {
                    Invalidations::Available { tid, oids } => proto::InvalidationsResult {
                        available: true,
                        tid: tid.0.to_vec(),
                        oids: encode_oids(&oids),
                    },
                    Invalidations::Unavailable => proto::InvalidationsResult::default(),
                };
                result.encode_to_vec()
            }
            Method::ZeoVerify => {
                let args: proto::OidTidArgs = decode(raw)?;
                let oid = oid(&args.oid)?;
                let cached = tid(&args.tid)?;
                let current = storage.load(oid).map(|(_, tid)| tid);
                if !matches!(current, Ok(tid) if tid == cached) {
                    self.send(Frame::message(
                        Tag::VerifyInvalidation,
                        &proto::VerifyInvalidation { oid: oid.0.to_vec() },
                    ));
                }
                proto::Empty {}.encode_to_vec()
            }
            Method::BeginZeoVerify => {
                self.send(Frame::bare(Tag::BeginVerify));
                proto::Empty {}.encode_to_vec()
            }
            Method::EndZeoVerify => {
                self.send(Frame::bare(Tag::EndVerify));
                proto::Empty {}.encode_to_vec()
            }
        };
        Ok(payload)
    }

    fn info(&self, hub: &StorageHub) -> proto::StorageInfo {
        let mut info = hub.storage().info();
        info.read_only = info.read_only || self.read_only;
        info.to_proto()
    }

    /// Join a storage. A writable registration against a read-only storage
    /// is refused but leaves the connection open, so the client can retry
    /// read-only.
    fn register(&mut self, args: proto::RegisterArgs) -> Result<Vec<u8>, StorageError> {
        let Some(hub) = self.hubs.get(&args.storage) else {
            let message = format!("no storage named '{}'", args.storage);
            self.closing = Some(message.clone());
            return Err(StorageError::StorageSystem(message));
        };
        #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
        let hub = Arc::clone(hub);
        if !args.read_only && hub.storage().is_read_only() {
            return Err(StorageError::ReadOnly);
        }
        if self.txn.is_some() || self.pending_begin.is_some() {
            return Err(StorageError::StorageTransaction(
                "cannot register during a transaction".to_string(),
            ));
        }
        if let Some(previous) = self.hub.take() {
            previous.unregister(self.id);
        }
        hub.register(
            self.id,
            SessionHandle {
                outbound: self.outbound.clone(),
                #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
                kill: Arc::clone(&self.kill_switch),
            },
        );
        self.read_only = args.read_only || hub.storage().is_read_only();
        tracing::info!(
            "session {} from {} registered with storage {}{}",
            self.id,
            self.peer,
            hub.name(),
            if self.read_only { " (read-only)" } else { "" }
        );
        let info = self.info(&hub);
        self.hub = Some(hub);
        Ok(info.encode_to_vec())
    }

    /// Start a transaction if the commit lock is free. Otherwise park the
    /// begin and return false; `resume_begin` answers it once the lock is
    /// granted, after an `U` push.
    fn tpc_begin(&mut self, msgid: u64, reply: bool, raw: &[u8]) -> Result<bool, StorageError> {
        let hub = self.hub()?;
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        let args: proto::TpcBeginArgs = decode(raw)?;
        if let Some(txn) = &self.txn {
            return Err(StorageError::StorageTransaction(format!(
                "transaction {} already in progress",
                txn.id
            )));
        }
        if let Some(pending) = &self.pending_begin {
            return Err(StorageError::StorageTransaction(format!(
                "transaction {} is already waiting for the commit lock",
                pending.meta.id
            )));
        }
        let tid = args.tid.as_deref().map(tid).transpose()?;
        let meta = TransactionMeta {
            id: args.txn_id,
            user: args.user,
            description: args.description,
            extension: args.extension,
        };
        match hub.request_commit_lock(self.id)? {
            LockRequest::Granted => {
                self.start_transaction(&hub, &meta, tid)?;
                Ok(true)
            }
            LockRequest::Queued(granted) => {
                self.pending_begin = Some(PendingBegin {
                    msgid,
                    reply,
                    meta,
                    tid,
                    granted,
                });
                Ok(false)
            }
        }
    }

    fn resume_begin(&mut self, granted: bool) {
        let Some(pending) = self.pending_begin.take() else {
            return;
        };
        let result = match self.hub() {
            Ok(hub) if granted => {
                self.send(Frame::bare(Tag::Unlock));
                self.start_transaction(&hub, &pending.meta, pending.tid)
            }
            Ok(hub) => Err(StorageError::Disconnected(format!(
                "storage {} is shutting down",
                hub.name()
            ))),
            Err(e) => Err(e),
        };
        self.respond(
            pending.reply,
            pending.msgid,
            Method::TpcBegin.name(),
            result.map(|()| proto::Empty {}.encode_to_vec()),
        );
    }

    /// Give up a parked begin. Its waiter entry in the hub is skipped once
    /// the receiver is gone.
    fn cancel_begin(&mut self, hub: &StorageHub) {
        let Some(pending) = self.pending_begin.take() else {
            return;
        };
        let result = Err(StorageError::StorageTransaction(format!(
            "transaction {} aborted while waiting for the commit lock",
            pending.meta.id
        )));
        drop(pending.granted);
        // The grant may have landed between the select and this call.
        hub.release_commit_lock(self.id);
        self.respond(pending.reply, pending.msgid, Method::TpcBegin.name(), result);
    }

    /// Begin in the backend. The caller holds the commit lock; it is given
    /// back if the backend refuses.
    fn start_transaction(
        &mut self,
        hub: &StorageHub,
        meta: &TransactionMeta,
        tid: Option<Tid>,
    ) -> Result<(), StorageError> {
        if let Err(e) = hub.storage().tpc_begin(meta, tid) {
            hub.release_commit_lock(self.id);
            return Err(e);
        }
        self.txn = Some(ActiveTransaction::new(meta.id));
        Ok(())
    }

    /// Commit, tell the other sessions and hand the lock on.
    fn tpc_finish(&mut self, hub: &StorageHub, txn_id: u64) -> Result<proto::TidResult, StorageError> {
        self.transaction(txn_id)?;
        let tid = match hub.storage().tpc_finish(txn_id) {
            Ok(tid) => tid,
            Err(e) => {
                self.abort(hub);
                return Err(e);
            }
        };
        if let Some(txn) = self.txn.take() {
            hub.invalidate(self.id, tid, &txn.invalidated);
            txn.discard_uploads();
        }
        hub.release_commit_lock(self.id);
        tracing::debug!("session {} committed {tid}", self.id);
        Ok(proto::TidResult { tid: tid.0.to_vec() })
    }

    fn abort(&mut self, hub: &StorageHub) {
        if let Some(txn) = self.txn.take() {
            hub.storage().tpc_abort(txn.id);
            txn.discard_uploads();
        }
        hub.release_commit_lock(self.id);
    }

    async fn stream_blob(&self, msgid: u64, path: &Path) -> Result<proto::BlobTrailer, StorageError> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut digest = BlobDigest::new();
        let mut buf = vec![0u8; BLOB_CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digest.update(&buf[..n]);
            self.send(Frame::message(
                Tag::BlobChunk,
                &proto::BlobChunk {
                    msgid,
                    data: buf[..n].to_vec(),
                },
            ));
        }
        let (crc32, length) = digest.finish();
        Ok(proto::BlobTrailer { length, crc32 })
    }

    /// Abort whatever is in flight and leave the hub.
    fn close(&mut self) {
        let Some(hub) = self.hub.take() else {
            return;
        };
        if let Some(txn) = &self.txn {
            tracing::info!(
                "session {} from {} closed during transaction {}, aborting",
                self.id,
                self.peer,
                txn.id
            );
        }
        self.abort(&hub);
        hub.unregister(self.id);
    }
}

/// Pack on the blocking pool, then push the new storage size to everyone.
async fn pack(hub: Arc<StorageHub>, time: f64) -> Result<(), StorageError> {
    #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
    let storage = Arc::clone(hub.storage());
    tokio::task::spawn_blocking(move || storage.pack(time))
        .await
        .map_err(|e| StorageError::StorageSystem(format!("pack task failed: {e}")))??;
    hub.broadcast_info();
    tracing::info!("packed storage {}", hub.name());
    Ok(())
}
