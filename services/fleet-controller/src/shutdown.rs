//! Shutdown signal helpers.
//!
//! Every long-running task takes a `watch::Receiver<bool>`; `true` (or a
//! dropped sender) means stop.

use std::time::Duration;

use tokio::sync::watch;

/// Resolves once shutdown has been signalled.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleeps for `duration` unless shutdown arrives first.
///
/// Returns true if shutdown was signalled.
pub async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = wait_for_shutdown(shutdown) => return true,
    }
    *shutdown.borrow()
}
