pub mod connection;
mod manager;
pub mod storage;
pub mod tbuf;
pub mod verify;

use tokio::sync::watch;

pub use connection::{ConnId, Connection, Heartbeat, Push, PushHandler};
pub use storage::{ClientStorage, InvalidationListener};
pub use tbuf::TransactionBuffer;
pub use verify::VerificationKind;

/// Resolve once the watched flag equals `want`, or its sender is gone.
pub(crate) async fn wait_for(rx: &mut watch::Receiver<bool>, want: bool) {
    loop {
        if *rx.borrow_and_update() == want {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
