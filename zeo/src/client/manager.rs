//! Background task that keeps a client storage connected.
//!
//! While disconnected it scans the configured addresses with exponential
//! backoff. A server that accepts writes wins outright; a read-only one is
//! kept as a fallback when the configuration allows it, and the task keeps
//! looking for a writable server every `upgrade_interval`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;

use super::connection::{Connection, Heartbeat, PushHandler};
use super::storage::ClientInner;
use super::verify::verify_cache;
use super::wait_for;
use crate::error::StorageError;
use crate::proto;
use crate::types::{ProtoDeserializable, StorageInfo};
use crate::wire::Method;

/// Spawn the manager. It exits once the storage is closed or dropped.
pub(crate) fn spawn(inner: Weak<ClientInner>) -> JoinHandle<()> {
    tokio::spawn(run(inner))
}

enum Candidate {
    /// Accepts what the storage was configured for.
    Optimal(StorageInfo),
    /// Registered read-only after a writable registration was refused.
    Fallback(StorageInfo),
    Reject,
}

struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    const fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, next: min }
    }

    fn reset(&mut self) {
        self.next = self.min;
    }

    fn pause(&mut self) -> Duration {
        let base = self.next;
        self.next = (self.next * 2).min(self.max);
        base.mul_f64(rand::rng().random_range(0.8..1.2)).min(self.max)
    }
}

async fn run(weak: Weak<ClientInner>) {
    let Some((mut closed, mut backoff)) = weak.upgrade().map(|inner| {
        (
            inner.closed.subscribe(),
            Backoff::new(inner.config.min_disconnect_poll, inner.config.max_disconnect_poll),
        )
    }) else {
        return;
    };

    loop {
        if *closed.borrow() {
            return;
        }
        let Some(inner) = weak.upgrade() else {
            return;
        };

        let pause = match inner.current_connection() {
            None => {
                if connect(&inner, false).await {
                    backoff.reset();
                    None
                } else {
                    let pause = backoff.pause();
                    tracing::debug!(
                        "no server for storage {}, retrying in {pause:?}",
                        inner.config.storage
                    );
                    Some(pause)
                }
            }
            Some(current) if inner.is_fallback() => {
                if !inner.in_transaction() && connect(&inner, true).await {
                    tracing::info!("storage {} upgraded from read-only fallback", inner.config.storage);
                    current.close();
                    continue;
                }
                Some(inner.config.upgrade_interval)
            }
            Some(_) => {
                let mut connected = inner.connected.subscribe();
                drop(inner);
                tokio::select! {
                    () = wait_for(&mut connected, false) => {}
                    _ = closed.changed() => {}
                }
                continue;
            }
        };
        drop(inner);

        if let Some(pause) = pause {
            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                _ = closed.changed() => {}
            }
        }
    }
}

/// Scan every address once and adopt the best server found. With `upgrade`
/// set only writable servers are considered.
async fn connect(inner: &Arc<ClientInner>, upgrade: bool) -> bool {
    let weak: Weak<ClientInner> = Arc::downgrade(inner);
    let handler: Weak<dyn PushHandler> = weak;
    let heartbeat = Heartbeat {
        interval: inner.config.heartbeat_interval,
        timeout: inner.config.heartbeat_timeout,
    };

    let mut chosen = None;
    let mut fallback = None;
    for address in &inner.config.addresses {
        let conn = match Connection::connect(
            address,
            handler.clone(),
            heartbeat,
            Arc::clone(&inner.rpc_count),
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                tracing::debug!("could not connect to {address}: {e}");
                continue;
            }
        };
        match test_connection(inner, &conn, upgrade).await {
            Ok(Candidate::Optimal(info)) => {
                chosen = Some((conn, info, false));
                break;
            }
            Ok(Candidate::Fallback(info)) if fallback.is_none() => {
                fallback = Some((conn, info));
            }
            Ok(Candidate::Fallback(_) | Candidate::Reject) => discard(inner, &conn),
            Err(e) => {
                tracing::warn!("{address} refused storage {}: {e}", inner.config.storage);
                discard(inner, &conn);
            }
        }
    }

    let (conn, info, read_only) = match (chosen, fallback) {
        (Some(chosen), fallback) => {
            if let Some((conn, _)) = fallback {
                discard(inner, &conn);
            }
            chosen
        }
        (None, Some((conn, info))) => (conn, info, true),
        (None, None) => return false,
    };
    adopt(inner, conn, info, read_only, upgrade).await
}

async fn register(
    conn: &Connection,
    storage: &str,
    read_only: bool,
) -> Result<StorageInfo, StorageError> {
    let reply: proto::StorageInfo = conn
        .call(
            Method::Register,
            &proto::RegisterArgs {
                storage: storage.to_string(),
                read_only,
            },
        )
        .await?;
    StorageInfo::from_proto(reply).map_err(StorageError::Protocol)
}

/// Register on `conn` and classify it. The spill is opened first so
/// invalidations sent right after registering are kept.
async fn test_connection(
    inner: &ClientInner,
    conn: &Connection,
    upgrade: bool,
) -> Result<Candidate, StorageError> {
    inner.open_spill(conn.id())?;
    let storage = &inner.config.storage;
    match register(conn, storage, inner.config.read_only).await {
        Ok(info) => Ok(Candidate::Optimal(info)),
        Err(StorageError::ReadOnly) if inner.config.read_only_fallback && !upgrade => {
            let info = register(conn, storage, true).await?;
            Ok(Candidate::Fallback(info))
        }
        Err(StorageError::ReadOnly) => Ok(Candidate::Reject),
        Err(e) => Err(e),
    }
}

fn discard(inner: &ClientInner, conn: &Connection) {
    inner.discard_spill(conn.id());
    conn.close();
}

/// Verify the cache against `conn` and make it the active connection.
async fn adopt(
    inner: &Arc<ClientInner>,
    conn: Arc<Connection>,
    info: StorageInfo,
    read_only: bool,
    upgrade: bool,
) -> bool {
    if !upgrade {
        inner.verifying.store(true, std::sync::atomic::Ordering::SeqCst);
    }
    let result = async {
        let kind = verify_cache(inner, &conn).await?;
        tracing::info!(
            "storage {} connected to {} ({}{kind})",
            inner.config.storage,
            conn.peer(),
            if read_only { "read-only, " } else { "" }
        );
        inner.notify_listener_reset();
        inner.install_connection(&conn, read_only)
    }
    .await;
    inner.verifying.store(false, std::sync::atomic::Ordering::SeqCst);

    let applied = match result {
        Ok(applied) => applied,
        Err(e) => {
            tracing::warn!("could not use {}: {e}", conn.address());
            discard(inner, &conn);
            return false;
        }
    };
    inner.set_info(info);
    match conn.call::<_, proto::StorageInfo>(Method::GetInfo, &proto::Empty {}).await {
        Ok(reply) => match StorageInfo::from_proto(reply) {
            Ok(info) => inner.set_info(info),
            Err(e) => tracing::warn!("bad storage info from {}: {e}", conn.address()),
        },
        Err(e) => tracing::debug!("get_info on {} failed: {e}", conn.address()),
    }
    for (tid, oids) in &applied {
        inner.notify_listener(*tid, oids);
    }
    true
}
