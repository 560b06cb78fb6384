//! Best-effort "is something already listening here" guard.
//!
//! This is a TOCTOU check: a port can be taken between this probe and the
//! start attempt. The start attempt itself stays the authoritative failure.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Returns `true` only if a connection succeeds on every one of `retries`
/// attempts, sleeping `interval` in between. One refused connection is
/// enough to call the port free, which tolerates an old server that is
/// still shutting down on the first attempt.
pub async fn port_in_use(host: &str, port: u16, retries: u32, interval: Duration) -> bool {
    let address = format!("{host}:{port}");
    for attempt in 0..retries.max(1) {
        let connected = matches!(
            tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await,
            Ok(Ok(_))
        );
        if !connected {
            debug!(%address, attempt, "port is free");
            return false;
        }
        tokio::time::sleep(interval).await;
    }
    debug!(%address, retries, "port is in use");
    true
}
