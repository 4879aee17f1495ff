use std::time::Duration;

use tokio::net::TcpListener;
use tracing::debug;

/// Check whether a TCP port is free by binding a throwaway listener.
///
/// The listener is dropped as soon as the bind succeeds, so the probe
/// leaves no socket behind. A bind failure (address in use, permission
/// denied) counts as unavailable.
pub async fn port_available(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(err) => {
            debug!(port, error = %err, "port probe failed");
            false
        }
    }
}

/// Poll until `port` becomes free, with a bounded retry budget.
///
/// Used during restart-with-drain: after killing a child process the
/// OS can hold the port for a moment. Returns false once the budget is
/// exhausted; the caller must treat that as a failed restart rather
/// than retrying forever.
pub async fn wait_for_port_free(port: u16, attempts: u32, backoff: Duration) -> bool {
    for attempt in 0..attempts {
        if port_available(port).await {
            return true;
        }
        debug!(port, attempt, "port still bound, backing off");
        tokio::time::sleep(backoff).await;
    }
    port_available(port).await
}
