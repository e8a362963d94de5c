//! End-to-end tests over real sockets.
//!
//! Each file covers one scenario: a server bound to a loopback port (or a
//! Unix socket) and one or more `ClientStorage` instances talking to it.

#![cfg(test)]

mod helpers;

mod test_blob_download;
mod test_cache_restart;
mod test_commit_lock;
mod test_conflict_resolution;
mod test_disconnect_mid_transaction;
mod test_history_and_pack;
mod test_invalidation;
mod test_load_from_cache;
mod test_read_only_fallback;
mod test_sort_key;
mod test_store_and_load;
mod test_transaction_lifecycle;
mod test_transaction_timeout;
mod test_undo;
mod test_verification;
