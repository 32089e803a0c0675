//! Fast TCP reachability check, run before committing to a full login
//! attempt so an unreachable provider fails in seconds instead of burning a
//! whole login time budget.

use std::time::Duration;

use tokio::net::TcpStream;

/// Check that `host:port` accepts a TCP connection within `timeout`.
///
/// The connection is closed immediately after it opens; nothing is sent.
/// This never errors: an unreachable host, a refused connection, a resolver
/// failure and a timeout all come back as `false`.
pub async fn is_reachable(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        Ok(Err(err)) => {
            tracing::debug!(host, port, %err, "reachability probe failed");
            false
        }
        Err(_) => {
            tracing::debug!(host, port, ?timeout, "reachability probe timed out");
            false
        }
    }
}
