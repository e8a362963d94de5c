//! The storage server.
//!
//! A [`StorageServer`] is a registry of named storages, each wrapped in a
//! [`StorageHub`]. Binding it to an [`Address`] starts the accept loop and
//! returns a [`RunningServer`]; every accepted connection gets its own
//! session tasks.
//!
//! # Invariants
//!
//! - Each storage name maps to exactly one hub.
//! - Storages are only added before binding, so the registry is immutable
//!   while sessions read it.

pub mod backend;
pub mod hub;
pub mod memory;
mod session;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use backend::{ConflictResolver, HistoricalRevision, Storage};
pub use hub::{HubConfig, Invalidations, LockRequest, StorageHub};
pub use memory::MemoryStorage;

use crate::wire::{Address, Stream};

pub(crate) type Hubs = Arc<HashMap<String, Arc<StorageHub>>>;

/// Storages to serve, keyed by the name clients register with.
#[derive(Debug, Default)]
pub struct StorageServer {
    config: HubConfig,
    hubs: HashMap<String, Arc<StorageHub>>,
}

impl StorageServer {
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            hubs: HashMap::new(),
        }
    }

    /// Serve `storage` under `name`, replacing any storage of that name.
    pub fn add_storage(&mut self, name: impl Into<String>, storage: Arc<dyn Storage>) -> Arc<StorageHub> {
        let name = name.into();
        let hub = StorageHub::new(name.clone(), storage, self.config);
        #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
        self.hubs.insert(name, Arc::clone(&hub));
        hub
    }

    #[must_use]
    pub fn hub(&self, name: &str) -> Option<&Arc<StorageHub>> {
        self.hubs.get(name)
    }

    /// Listen on `address` and start accepting connections. For TCP, port
    /// `0` picks a free port; [`RunningServer::address`] has the real one.
    pub async fn bind(self, address: &Address) -> io::Result<RunningServer> {
        let (listener, bound) = Listener::bind(address).await?;
        let hubs: Hubs = Arc::new(self.hubs);
        let (shutdown, shutdown_rx) = watch::channel(false);
        #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&hubs), shutdown_rx));
        tracing::info!("listening on {bound}");
        Ok(RunningServer {
            address: bound,
            hubs,
            shutdown,
            task,
        })
    }
}

/// A server accepting connections.
#[derive(Debug)]
pub struct RunningServer {
    address: Address,
    hubs: Hubs,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RunningServer {
    /// The address clients should connect to.
    #[must_use]
    pub const fn address(&self) -> &Address {
        &self.address
    }

    #[must_use]
    pub fn hub(&self, name: &str) -> Option<&Arc<StorageHub>> {
        self.hubs.get(name)
    }

    /// Stop accepting, close every session and wait for the accept loop.
    /// Transactions in progress are aborted.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            tracing::warn!("accept loop ended abnormally: {e}");
        }
        if let Address::Unix(path) = &self.address {
            let _ = std::fs::remove_file(path);
        }
        tracing::info!("server on {} stopped", self.address);
    }
}

enum Listener {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl Listener {
    async fn bind(address: &Address) -> io::Result<(Self, Address)> {
        match address {
            Address::Tcp(addr) => {
                let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
                let bound = Address::Tcp(listener.local_addr()?.to_string());
                Ok((Self::Tcp(listener), bound))
            }
            #[cfg(unix)]
            Address::Unix(path) => {
                // A socket file left behind by a previous run blocks bind.
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = tokio::net::UnixListener::bind(path)?;
                Ok((Self::Unix(listener), address.clone()))
            }
            #[cfg(not(unix))]
            Address::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
        }
    }

    async fn accept(&self) -> io::Result<(Box<dyn Stream>, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), "unix socket".to_string()))
            }
        }
    }
}

async fn accept_loop(listener: Listener, hubs: Hubs, mut shutdown: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::info!("new client [{peer}] connected");
                #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
                let hubs = Arc::clone(&hubs);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    match session::serve_connection(stream, peer.clone(), hubs, shutdown).await {
                        Ok(()) => tracing::info!("client [{peer}] disconnected"),
                        Err(e) => tracing::info!("client [{peer}] errored: {e}"),
                    }
                });
            }
            Err(e) => tracing::warn!("error accepting connection: {e}"),
        }
    }
}
