// Life of a client load:
// 1. Look in the persistent cache; a hit costs no round trip
// 2. Otherwise ask the server over the active connection
// 3. Cache the answer unless an invalidation for the oid arrived meanwhile
//
// Life of a commit:
// 1. tpc_begin takes the server's per-storage commit lock
// 2. Stores stream to the server and into the transaction buffer
// 3. vote collects store outcomes, finish gets the tid
// 4. The server broadcasts the changed oids to every other client
// 5. The client moves the buffer into its cache under the new tid
//
// System components:
//  - Client cache, transaction buffer, connection manager, client storage
//  - Server sessions, per-storage hubs, storage backends

// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod blob;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod proto;
pub mod server;
pub mod types;
pub mod wire;

#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod testing;

pub use client::ClientStorage;
pub use error::StorageError;
pub use server::{RunningServer, StorageServer};
