//! One RPC connection from a client to a server.
//!
//! A connection owns three tasks:
//!
//! - the reader, which routes replies to waiting callers and hands every
//!   server push to the [`PushHandler`] before reading the next frame, so a
//!   store serial always lands before the reply to the vote that follows it;
//! - the writer, draining an unbounded outbound queue onto the socket;
//! - the heartbeat, which pings the server and closes the connection when
//!   nothing has arrived for too long.
//!
//! When the connection ends, for whatever reason, every pending call fails
//! with [`StorageError::Disconnected`] and the handler hears about it once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use prost::Message;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::StorageError;
use crate::proto;
use crate::types::{Oid, ProtoDeserializable, StorageInfo, StoreOutcome, Tid};
use crate::wire::{Address, Frame, Method, ProtocolVersion, Stream, Tag, WireError, read_frame, write_frame};

/// Process-unique connection identifier.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// How long to wait for the server's handshake token.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A decoded server push.
#[derive(Debug, Clone)]
pub enum Push {
    /// Outcome of one asynchronous store.
    Serial {
        oid: Oid,
        outcome: Result<StoreOutcome, StorageError>,
    },
    VerifyInvalidation(Oid),
    /// `tid` is `None` for the null tid sent after undo.
    Invalidation { tid: Option<Tid>, oids: Vec<Oid> },
    Info(StorageInfo),
    BeginVerify,
    EndVerify,
    Unlock,
}

/// Receives pushes and the disconnect event, on the reader task.
///
/// Both methods run inline on the reader, so they must not block on
/// anything the reader itself would have to deliver.
pub trait PushHandler: Send + Sync {
    fn on_push(&self, conn: ConnId, push: Push);
    fn on_disconnect(&self, conn: ConnId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub interval: Duration,
    /// Close when nothing has arrived for this long.
    pub timeout: Duration,
}

type ReplySender = oneshot::Sender<Result<Vec<u8>, StorageError>>;

struct PendingCall {
    reply: ReplySender,
    chunks: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[derive(Default)]
struct Pending {
    calls: HashMap<u64, PendingCall>,
    /// Set once the connection has ended, with the reason.
    closed: Option<String>,
}

/// State shared between the handle and its tasks.
struct ConnShared {
    id: ConnId,
    address: Address,
    pending: Mutex<Pending>,
    shutdown: watch::Sender<bool>,
    started: Instant,
    last_inbound_ms: AtomicU64,
    disconnect_reported: AtomicBool,
    handler: Weak<dyn PushHandler>,
}

impl ConnShared {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn touch(&self) {
        self.last_inbound_ms.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = self.last_inbound_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }

    fn disconnected(&self) -> StorageError {
        let reason = self
            .lock_pending()
            .closed
            .clone()
            .unwrap_or_else(|| "connection closed".to_string());
        StorageError::Disconnected(format!("{}: {reason}", self.address))
    }

    /// End the connection: fail pending calls, stop the tasks, tell the
    /// handler. Only the first call has any effect.
    fn shut(&self, reason: String) {
        let calls = {
            let mut pending = self.lock_pending();
            if pending.closed.is_some() {
                return;
            }
            pending.closed = Some(reason.clone());
            std::mem::take(&mut pending.calls)
        };
        let _ = self.shutdown.send_replace(true);
        tracing::info!("connection {} to {} closed: {reason}", self.id, self.address);
        // The handler hears first, so a caller woken below already sees the
        // client in its disconnected state.
        if !self.disconnect_reported.swap(true, Ordering::SeqCst) {
            if let Some(handler) = self.handler.upgrade() {
                handler.on_disconnect(self.id);
            }
        }
        for (_, call) in calls {
            let _ = call.reply.send(Err(StorageError::Disconnected(format!(
                "{}: {reason}",
                self.address
            ))));
        }
    }

    fn push(&self, push: Push) {
        if let Some(handler) = self.handler.upgrade() {
            handler.on_push(self.id, push);
        }
    }

    fn complete(&self, msgid: u64, result: Result<Vec<u8>, StorageError>) {
        let call = self.lock_pending().calls.remove(&msgid);
        match call {
            Some(call) => {
                let _ = call.reply.send(result);
            }
            None => tracing::debug!("reply for unknown msgid {msgid} on connection {}", self.id),
        }
    }

    fn dispatch(&self, frame: Frame) -> Result<(), WireError> {
        match frame.tag {
            Tag::Reply => {
                let reply: proto::Reply = frame.decode()?;
                self.complete(reply.msgid, Ok(reply.payload));
            }
            Tag::Error => {
                let reply: proto::ErrorReply = frame.decode()?;
                let error = StorageError::from_remote(reply.error.unwrap_or_default());
                self.complete(reply.msgid, Err(error));
            }
            Tag::BlobChunk => {
                let chunk: proto::BlobChunk = frame.decode()?;
                let pending = self.lock_pending();
                if let Some(sink) = pending.calls.get(&chunk.msgid).and_then(|c| c.chunks.as_ref()) {
                    let _ = sink.send(chunk.data);
                }
            }
            Tag::Pong => {}
            Tag::Serial => {
                let serial: proto::StoreSerial = frame.decode()?;
                let Some(oid) = parse_oid(&serial.oid) else {
                    return Ok(());
                };
                let outcome = if let Some(error) = serial.error {
                    Err(StorageError::from_remote(error))
                } else if serial.resolved {
                    Ok(StoreOutcome::Resolved)
                } else {
                    let tid = serial
                        .serial
                        .as_deref()
                        .and_then(|b| Tid::try_from(b).ok())
                        .ok_or_else(|| {
                            WireError::Malformed(format!("serial for {oid}: missing or short tid"))
                        })?;
                    Ok(StoreOutcome::Serial(tid))
                };
                self.push(Push::Serial { oid, outcome });
            }
            Tag::VerifyInvalidation => {
                let msg: proto::VerifyInvalidation = frame.decode()?;
                if let Some(oid) = parse_oid(&msg.oid) {
                    self.push(Push::VerifyInvalidation(oid));
                }
            }
            Tag::Invalidation => {
                let msg: proto::Invalidation = frame.decode()?;
                // Empty is the null tid; anything else must be a whole tid.
                let tid = if msg.tid.is_empty() {
                    None
                } else {
                    Some(Tid::try_from(msg.tid.as_slice()).map_err(|e| {
                        WireError::Malformed(format!("invalidation tid: {e}"))
                    })?)
                };
                let oids = msg.oids.iter().filter_map(|o| parse_oid(o)).collect();
                self.push(Push::Invalidation { tid, oids });
            }
            Tag::Info => {
                let info: proto::StorageInfo = frame.decode()?;
                match StorageInfo::from_proto(info) {
                    Ok(info) => self.push(Push::Info(info)),
                    Err(e) => tracing::warn!("ignoring bad storage info: {e}"),
                }
            }
            Tag::BeginVerify => self.push(Push::BeginVerify),
            Tag::EndVerify => self.push(Push::EndVerify),
            Tag::Unlock => self.push(Push::Unlock),
            tag @ (Tag::Handshake | Tag::Call | Tag::AsyncCall | Tag::Ping) => {
                return Err(WireError::UnexpectedTag(tag));
            }
        }
        Ok(())
    }
}

fn parse_oid(bytes: &[u8]) -> Option<Oid> {
    match Oid::try_from(bytes) {
        Ok(oid) => Some(oid),
        Err(e) => {
            tracing::warn!("ignoring malformed oid: {e}");
            None
        }
    }
}

/// A call whose reply is preceded by a stream of blob chunks.
pub struct StreamingCall {
    pub chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    reply: oneshot::Receiver<Result<Vec<u8>, StorageError>>,
}

impl StreamingCall {
    /// Wait for the reply. Drain `chunks` first.
    pub async fn reply<R: Message + Default>(self) -> Result<R, StorageError> {
        let payload = self
            .reply
            .await
            .map_err(|_| StorageError::Disconnected("connection dropped".to_string()))??;
        Ok(R::decode(payload.as_slice())?)
    }
}

pub struct Connection {
    shared: Arc<ConnShared>,
    peer: String,
    protocol: ProtocolVersion,
    outbound: mpsc::UnboundedSender<Frame>,
    next_msgid: AtomicU64,
    rpc_count: Arc<AtomicU64>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("address", &self.shared.address)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect, agree on a protocol and start the connection tasks.
    ///
    /// `rpc_count` is bumped for every synchronous call sent.
    pub async fn connect(
        address: &Address,
        handler: Weak<dyn PushHandler>,
        heartbeat: Heartbeat,
        rpc_count: Arc<AtomicU64>,
    ) -> Result<Arc<Self>, StorageError> {
        let (stream, peer) = address
            .connect()
            .await
            .map_err(|e| StorageError::Disconnected(format!("{address}: {e}")))?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader))
            .await
            .map_err(|_| StorageError::Timeout(format!("no handshake from {address}")))??
            .ok_or_else(|| StorageError::Disconnected(format!("{address} closed during handshake")))?;
        if hello.tag != Tag::Handshake {
            return Err(WireError::UnexpectedTag(hello.tag).into());
        }
        let protocol = ProtocolVersion::negotiate(&hello.payload)
            .ok_or_else(|| StorageError::from(WireError::UnsupportedProtocol(hello.payload.clone())))?;
        write_frame(&mut writer, &Frame::new(Tag::Handshake, protocol.token().to_vec())).await?;

        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(ConnShared {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            address: address.clone(),
            pending: Mutex::new(Pending::default()),
            shutdown,
            started: Instant::now(),
            last_inbound_ms: AtomicU64::new(0),
            disconnect_reported: AtomicBool::new(false),
            handler,
        });
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(Arc::clone(&shared), reader));
        tokio::spawn(write_loop(Arc::clone(&shared), writer, outbound_rx));
        tokio::spawn(heartbeat_loop(Arc::clone(&shared), outbound.clone(), heartbeat));

        tracing::debug!(
            "connection {} to {address} ({peer}) speaks {:?}",
            shared.id,
            protocol
        );
        Ok(Arc::new(Self {
            shared,
            peer,
            protocol,
            outbound,
            next_msgid: AtomicU64::new(1),
            rpc_count,
        }))
    }

    #[must_use]
    pub fn id(&self) -> ConnId {
        self.shared.id
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        &self.shared.address
    }

    /// Canonical name of the server end.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    #[must_use]
    pub const fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock_pending().closed.is_some() || *self.shared.shutdown.borrow()
    }

    /// Close the connection. Pending calls fail with `Disconnected`.
    pub fn close(&self) {
        self.shared.shut("closed by client".to_string());
    }

    /// Send a call and wait for its reply.
    pub async fn call<A: Message, R: Message + Default>(
        &self,
        method: Method,
        args: &A,
    ) -> Result<R, StorageError> {
        let reply = self.start_call(method, args.encode_to_vec(), None)?;
        let payload = reply
            .await
            .map_err(|_| self.shared.disconnected())??;
        Ok(R::decode(payload.as_slice())?)
    }

    /// Send a call whose reply is preceded by blob chunks.
    pub fn call_streaming<A: Message>(
        &self,
        method: Method,
        args: &A,
    ) -> Result<StreamingCall, StorageError> {
        let (sink, chunks) = mpsc::unbounded_channel();
        let reply = self.start_call(method, args.encode_to_vec(), Some(sink))?;
        Ok(StreamingCall { chunks, reply })
    }

    /// Send a call with no reply. Failures surface later, on the `s`
    /// channel or as an error from the next synchronous call.
    pub fn call_async<A: Message>(&self, method: Method, args: &A) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(self.shared.disconnected());
        }
        let call = proto::Call {
            msgid: 0,
            method: method.name().to_string(),
            args: args.encode_to_vec(),
        };
        tracing::trace!("connection {} async call {method}", self.shared.id);
        self.outbound
            .send(Frame::message(Tag::AsyncCall, &call))
            .map_err(|_| self.shared.disconnected())
    }

    fn start_call(
        &self,
        method: Method,
        args: Vec<u8>,
        chunks: Option<mpsc::UnboundedSender<Vec<u8>>>,
    ) -> Result<oneshot::Receiver<Result<Vec<u8>, StorageError>>, StorageError> {
        let msgid = self.next_msgid.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        {
            let mut pending = self.shared.lock_pending();
            if pending.closed.is_some() {
                drop(pending);
                return Err(self.shared.disconnected());
            }
            pending.calls.insert(msgid, PendingCall { reply, chunks });
        }
        self.rpc_count.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("connection {} call {msgid} {method}", self.shared.id);
        let call = proto::Call {
            msgid,
            method: method.name().to_string(),
            args,
        };
        if self.outbound.send(Frame::message(Tag::Call, &call)).is_err() {
            self.shared.lock_pending().calls.remove(&msgid);
            return Err(self.shared.disconnected());
        }
        Ok(rx)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.shared.shutdown.send_replace(true);
    }
}

async fn read_loop(shared: Arc<ConnShared>, mut reader: ReadHalf<Box<dyn Stream>>) {
    let mut shutdown = shared.shutdown.subscribe();
    let reason = loop {
        if *shutdown.borrow_and_update() {
            break "closed by client".to_string();
        }
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = shutdown.changed() => continue,
        };
        match frame {
            Ok(Some(frame)) => {
                shared.touch();
                if let Err(e) = shared.dispatch(frame) {
                    break e.to_string();
                }
            }
            Ok(None) => break "server closed the connection".to_string(),
            Err(e) => break e.to_string(),
        }
    };
    shared.shut(reason);
}

async fn write_loop(
    shared: Arc<ConnShared>,
    mut writer: WriteHalf<Box<dyn Stream>>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        let frame = tokio::select! {
            frame = outbound.recv() => frame,
            _ = shutdown.changed() => continue,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = write_frame(&mut writer, &frame).await {
            shared.shut(format!("write failed: {e}"));
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn heartbeat_loop(
    shared: Arc<ConnShared>,
    outbound: mpsc::UnboundedSender<Frame>,
    heartbeat: Heartbeat,
) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut ticker = tokio::time::interval(heartbeat.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => continue,
        }
        if shared.idle() > heartbeat.timeout {
            tracing::warn!(
                "connection {} to {}: nothing heard for {:?}",
                shared.id,
                shared.address,
                shared.idle()
            );
            shared.shut("heartbeat timeout".to_string());
            break;
        }
        if outbound.send(Frame::bare(Tag::Ping)).is_err() {
            break;
        }
    }
}
