//! Server plumbing shared by both transports.

use crate::error::ServeError;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener};
use tracing::{debug, info};

/// Maximum number of concurrent connections per server
pub const MAX_CONNECTIONS: usize = 10000;

/// Create a TCP listener with SO_REUSEADDR so a restarted demo server can
/// rebind while old sockets sit in TIME_WAIT.
///
/// `addr` may name a host (`localhost:8080`); the first resolved address wins.
pub async fn bind(addr: &str) -> Result<TcpListener, ServeError> {
    let resolved = match lookup_host(addr).await {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            debug!(addr, error = %e, "Failed to resolve listen address");
            None
        }
    };
    let Some(addr) = resolved else {
        return Err(ServeError::Address(addr.to_string()));
    };

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(|source| ServeError::Bind { addr, source })?;

    let listener = listen(socket, addr).map_err(|source| ServeError::Bind { addr, source })?;
    TcpListener::from_std(listener).map_err(|source| ServeError::Bind { addr, source })
}

fn listen(socket: socket2::Socket, addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

/// Accept errors caused by a single misbehaving peer.
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// The server's stand-in for real backend work: note who asked, then wait.
///
/// Distinct peer ports across calls mean distinct TCP connections.
pub async fn simulate_work(peer: SocketAddr, delay: Duration) {
    info!(peer = %peer, "Received request");
    tokio::time::sleep(delay).await;
}

/// Counters a server keeps about its traffic.
#[derive(Debug, Default)]
pub struct ServerStats {
    connections: AtomicU64,
    calls: AtomicU64,
}

impl ServerStats {
    pub fn connection_accepted(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_served(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Total TCP connections accepted.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Total calls answered successfully.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_resolves_host_name() {
        let listener = bind("localhost:0").await.unwrap();
        assert!(listener.local_addr().unwrap().ip().is_loopback());
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_address() {
        // No port
        assert!(matches!(bind("localhost").await, Err(ServeError::Address(_))));
    }

    #[test]
    fn test_stats_counters() {
        let stats = ServerStats::default();
        stats.connection_accepted();
        stats.call_served();
        stats.call_served();
        assert_eq!(stats.connections(), 1);
        assert_eq!(stats.calls(), 2);
    }
}
