//! The background task that (re)connects inactive connections.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::dispatch::Dispatcher;
use crate::poller;

/// Back-off between reconnection passes that made no progress.
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Run until shutdown: whenever inactive connections exist, try to bring
/// each one up, run the role's on-connect hook, and promote it into the
/// active set. Failures are logged and retried on the next pass; nothing
/// propagates out of this task.
pub(crate) async fn run(role: Arc<dyn Dispatcher>, cancel: CancellationToken) {
    loop {
        // Wait for an inactive connection to appear, or for shutdown.
        loop {
            if cancel.is_cancelled() || !role.pool().is_running() {
                return;
            }
            let mut notified = std::pin::pin!(role.pool().notified());
            notified.as_mut().enable();
            if role.pool().has_inactive() {
                break;
            }
            debug!("waiting for change in available servers to reconnect");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = notified => {}
            }
        }

        debug!("checking if servers need to be reconnected");
        if role.pool().is_running() && !connect_pass(role.as_ref()).await {
            // Nothing happened; back off before rechecking.
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(RETRY_DELAY) => {}
            }
        }
    }
}

/// Attempt every inactive connection once. Returns whether any connection
/// was promoted to active.
async fn connect_pass(role: &dyn Dispatcher) -> bool {
    let pool = role.pool();
    let mut success = false;

    for conn in pool.snapshot_inactive() {
        debug!(conn = %conn, "trying to reconnect");
        let read = match conn.reconnect().await {
            Ok(read) => read,
            Err(error) => {
                debug!(conn = %conn, %error, "unable to connect");
                continue;
            }
        };

        if let Err(error) = role.on_connect(&conn).await {
            error!(conn = %conn, %error, "error performing on-connect tasks");
            continue;
        }

        let stream = poller::conn_stream(read, conn.admin_queue());
        pool.activate(&conn, stream);
        role.on_active(&conn).await;

        success = true;
    }

    success
}
