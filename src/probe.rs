//! Local TCP port probing

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::trace;

/// Default probe connect timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Whether something on `localhost` accepts connections on `port`.
///
/// Makes a short-lived connection attempt; the probe socket is closed before returning.
/// Any connection error (refused, timeout, resolution failure) counts as "not in use".
pub fn is_port_in_use(port: u16) -> bool {
    is_port_in_use_on("localhost", port, DEFAULT_PROBE_TIMEOUT)
}

/// Blocking probe of `host:port`, trying every resolved address.
pub fn is_port_in_use_on(host: &str, port: u16, timeout: Duration) -> bool {
    let addrs = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            trace!(host, port, error = %e, "Probe address resolution failed");
            return false;
        }
    };

    for addr in addrs {
        if TcpStream::connect_timeout(&addr, timeout).is_ok() {
            trace!(%addr, "Port in use");
            return true;
        }
    }
    false
}

/// Async probe of `host:port`, used on the connect path.
pub async fn port_in_use(host: &str, port: u16, timeout: Duration) -> bool {
    let attempt = tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port))).await;
    let in_use = matches!(attempt, Ok(Ok(_)));
    trace!(host, port, in_use, "Probed port");
    in_use
}
