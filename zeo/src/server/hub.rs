//! Per-storage shared state on the server.
//!
//! A [`StorageHub`] owns the commit lock for one storage, the list of
//! sessions registered against it and the recent-invalidations queue used
//! for quick verification.
//!
//! # Commit lock
//!
//! One session at a time holds the lock, from `tpc_begin` until finish or
//! abort. Others queue in FIFO order. On release, waiters are popped in
//! order and the first one still listening takes the lock; the rest stay
//! queued. A waiter whose session has gone simply no longer listens.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::ServerConfig;
use crate::error::StorageError;
use crate::proto;
use crate::server::backend::Storage;
use crate::types::{Oid, ProtoSerializable, Tid, encode_oids};
use crate::wire::{Frame, Tag};

pub type SessionId = u64;

/// Hub knobs taken from the server configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    pub transaction_timeout: Option<Duration>,
    pub invalidation_queue_size: usize,
    pub invalidation_age: Option<Duration>,
}

impl From<&ServerConfig> for HubConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            transaction_timeout: config.transaction_timeout,
            invalidation_queue_size: config.invalidation_queue_size,
            invalidation_age: config.invalidation_age,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

struct Holder {
    session: SessionId,
    since: Instant,
}

#[derive(Default)]
struct CommitState {
    holder: Option<Holder>,
    waiting: VecDeque<(SessionId, oneshot::Sender<()>)>,
}

/// How the hub reaches a registered session.
pub struct SessionHandle {
    pub outbound: mpsc::UnboundedSender<Frame>,
    /// Set to a reason to make the session close.
    pub kill: Arc<watch::Sender<Option<String>>>,
}

/// Answer to [`StorageHub::request_commit_lock`].
#[derive(Debug)]
pub enum LockRequest {
    Granted,
    Queued(oneshot::Receiver<()>),
}

/// Outcome of a `getInvalidations` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidations {
    /// Everything changed after the requested tid, up to `tid`.
    Available { tid: Tid, oids: Vec<Oid> },
    /// The client has to verify in full.
    Unavailable,
}

pub struct StorageHub {
    name: String,
    storage: Arc<dyn Storage>,
    config: HubConfig,
    commit: Mutex<CommitState>,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    /// Recent committed transactions, oldest first.
    queue: Mutex<VecDeque<(Tid, Vec<Oid>)>>,
}

impl std::fmt::Debug for StorageHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHub")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StorageHub {
    /// Create a hub. With a transaction timeout configured, a watchdog task
    /// is started; it exits when the hub is dropped.
    #[must_use]
    pub fn new(name: impl Into<String>, storage: Arc<dyn Storage>, config: HubConfig) -> Arc<Self> {
        let hub = Arc::new(Self {
            name: name.into(),
            storage,
            config,
            commit: Mutex::new(CommitState::default()),
            sessions: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
        });
        if let Some(timeout) = config.transaction_timeout {
            if tokio::runtime::Handle::try_current().is_ok() {
                let _watchdog = spawn_watchdog(Arc::downgrade(&hub), timeout);
            }
        }
        hub
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn lock_commit(&self) -> MutexGuard<'_, CommitState> {
        self.commit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<SessionId, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, session: SessionId, handle: SessionHandle) {
        self.lock_sessions().insert(session, handle);
        tracing::debug!("session {session} registered with storage {}", self.name);
    }

    /// Forget a session: release the commit lock if it holds it and drop any
    /// waiter it left behind.
    pub fn unregister(&self, session: SessionId) {
        self.lock_sessions().remove(&session);
        self.lock_commit().waiting.retain(|(id, _)| *id != session);
        self.release_commit_lock(session);
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Take the commit lock if it is free, otherwise join the end of the
    /// queue. A queued session is granted the lock when the receiver
    /// resolves; a dropped sender means it never will be.
    pub fn request_commit_lock(&self, session: SessionId) -> Result<LockRequest, StorageError> {
        let mut commit = self.lock_commit();
        match &commit.holder {
            None => {
                commit.holder = Some(Holder {
                    session,
                    since: Instant::now(),
                });
                return Ok(LockRequest::Granted);
            }
            Some(holder) if holder.session == session => {
                return Err(StorageError::StorageTransaction(
                    "session already holds the commit lock".to_string(),
                ));
            }
            Some(holder) => {
                tracing::debug!(
                    "session {session} waiting for commit lock held by {}",
                    holder.session
                );
            }
        }
        let (grant, granted) = oneshot::channel();
        commit.waiting.push_back((session, grant));
        Ok(LockRequest::Queued(granted))
    }

    /// Take the commit lock, waiting behind earlier requests. Returns
    /// whether the session had to wait.
    pub async fn acquire_commit_lock(&self, session: SessionId) -> Result<bool, StorageError> {
        match self.request_commit_lock(session)? {
            LockRequest::Granted => Ok(false),
            LockRequest::Queued(granted) => {
                granted.await.map_err(|_| {
                    StorageError::Disconnected(format!("storage {} is shutting down", self.name))
                })?;
                Ok(true)
            }
        }
    }

    #[must_use]
    pub fn holds_commit_lock(&self, session: SessionId) -> bool {
        self.lock_commit()
            .holder
            .as_ref()
            .is_some_and(|holder| holder.session == session)
    }

    /// Release the lock if `session` holds it and hand it to the first
    /// waiter still listening.
    pub fn release_commit_lock(&self, session: SessionId) {
        let mut commit = self.lock_commit();
        if !commit.holder.as_ref().is_some_and(|h| h.session == session) {
            return;
        }
        commit.holder = None;
        while let Some((next, grant)) = commit.waiting.pop_front() {
            commit.holder = Some(Holder {
                session: next,
                since: Instant::now(),
            });
            if grant.send(()).is_ok() {
                tracing::debug!("commit lock passed from session {session} to {next}");
                return;
            }
            commit.holder = None;
        }
    }

    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.lock_commit().waiting.len()
    }

    /// Record a committed transaction and tell every other session.
    pub fn invalidate(&self, from: SessionId, tid: Tid, oids: &[Oid]) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.push_back((tid, oids.to_vec()));
        while queue.len() > self.config.invalidation_queue_size {
            queue.pop_front();
        }
        let frame = Frame::message(
            Tag::Invalidation,
            &proto::Invalidation {
                tid: tid.0.to_vec(),
                oids: encode_oids(oids),
            },
        );
        self.send_all(&frame, Some(from));
    }

    /// Invalidate `oids` with the null tid on every session, including the
    /// one that asked.
    pub fn invalidate_unknown(&self, oids: &[Oid]) {
        let frame = Frame::message(
            Tag::Invalidation,
            &proto::Invalidation {
                tid: Vec::new(),
                oids: encode_oids(oids),
            },
        );
        self.send_all(&frame, None);
    }

    /// Push fresh storage info to every session.
    pub fn broadcast_info(&self) {
        let frame = Frame::message(Tag::Info, &self.storage.info().to_proto());
        self.send_all(&frame, None);
    }

    fn send_all(&self, frame: &Frame, except: Option<SessionId>) {
        for (id, handle) in self.lock_sessions().iter() {
            if Some(*id) == except {
                continue;
            }
            if handle.outbound.send(frame.clone()).is_err() {
                tracing::trace!("session {id} gone, dropping {:?}", frame.tag);
            }
        }
    }

    /// What changed after `tid`, from the queue if it reaches back that far
    /// and otherwise from the storage within the configured age.
    #[must_use]
    pub fn invalidations_since(&self, tid: Tid) -> Invalidations {
        {
            let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if let (Some((oldest, _)), Some((latest, _))) = (queue.front(), queue.back()) {
                if tid >= *oldest {
                    if tid >= *latest {
                        return Invalidations::Available {
                            tid: *latest,
                            oids: Vec::new(),
                        };
                    }
                    let mut oids: Vec<Oid> = Vec::new();
                    for (_, changed) in queue.iter().filter(|(t, _)| *t > tid) {
                        for oid in changed {
                            if !oids.contains(oid) {
                                oids.push(*oid);
                            }
                        }
                    }
                    return Invalidations::Available { tid: *latest, oids };
                }
            }
        }
        let Some(max_age) = self.config.invalidation_age else {
            return Invalidations::Unavailable;
        };
        match self.storage.transactions_since(tid, max_age) {
            Some((tid, oids)) => Invalidations::Available { tid, oids },
            None => Invalidations::Unavailable,
        }
    }

    /// Ask the session holding the commit lock for longer than `timeout`
    /// to close.
    fn enforce_timeout(&self, timeout: Duration) {
        let expired = {
            let commit = self.lock_commit();
            match &commit.holder {
                Some(holder) if holder.since.elapsed() > timeout => Some(holder.session),
                _ => None,
            }
        };
        let Some(session) = expired else {
            return;
        };
        tracing::warn!(
            "session {session} held the commit lock of storage {} for more than {timeout:?}, closing it",
            self.name
        );
        if let Some(handle) = self.lock_sessions().get(&session) {
            handle
                .kill
                .send_replace(Some("transaction timeout".to_string()));
        }
    }
}

/// Watch the commit lock holder. Exits once the hub is dropped.
fn spawn_watchdog(hub: Weak<StorageHub>, timeout: Duration) -> tokio::task::JoinHandle<()> {
    let tick = (timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            let Some(hub) = hub.upgrade() else {
                break;
            };
            hub.enforce_timeout(timeout);
        }
    })
}
