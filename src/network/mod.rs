//! Network module - Carries calculator requests over UDP and TCP
//!
//! Provides:
//! - Transports with a common datagram-shaped interface
//! - Loss simulation applied by the server to inbound datagrams
//! - The client-side exponential-backoff retry engine
//! - Client and server built on top of them

pub mod client;
pub mod loss;
pub mod retry;
pub mod server;
pub mod transport;

#[cfg(test)]
pub(crate) mod memory;

pub use client::{expression_request, Client, ClientError, ClientResult};
pub use loss::{DropProbability, LossSimulator};
pub use retry::{Outcome, RetryPolicy};
pub use server::ServerStats;
pub use transport::{TcpTransport, Transport, UdpTransport};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use crate::protocol::{DEFAULT_CLIENT_PORT, DEFAULT_HOST, DEFAULT_SERVER_PORT};

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Host the server binds to and the client sends to
    pub host: String,
    /// Local host the UDP client binds to
    pub bind_host: String,
    /// Server port
    pub server_port: u16,
    /// Local port the UDP client binds to (0 lets the OS pick)
    pub client_port: u16,
    /// Receive buffer size; larger frames are truncated
    pub buffer_size: usize,
    /// TCP connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            bind_host: DEFAULT_HOST.to_string(),
            server_port: DEFAULT_SERVER_PORT,
            client_port: DEFAULT_CLIENT_PORT,
            buffer_size: 1024,
            connect_timeout_ms: 5000,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub async fn server_addr(&self) -> std::io::Result<SocketAddr> {
        resolve_host(&self.host, self.server_port).await
    }

    /// Local address for a UDP client talking to `server`
    ///
    /// A loopback bind host can't reach a remote server, so in that case the
    /// client binds the unspecified address of the server's family instead.
    pub async fn client_addr(&self, server: SocketAddr) -> std::io::Result<SocketAddr> {
        let local = resolve_host(&self.bind_host, self.client_port).await?;
        if local.ip().is_loopback() && !server.ip().is_loopback() {
            let any = match server.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            return Ok(SocketAddr::new(any, local.port()));
        }
        Ok(local)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_addresses() {
        let config = NetworkConfig::default();

        let server = config.server_addr().await.unwrap();
        assert_eq!(server, "127.0.0.1:50123".parse().unwrap());
        assert_eq!(config.client_addr(server).await.unwrap(), "127.0.0.1:50321".parse().unwrap());
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_client_bind_for_remote_server() {
        let config = NetworkConfig {
            host: "192.0.2.10".to_string(),
            client_port: 0,
            ..Default::default()
        };
        let server = config.server_addr().await.unwrap();

        let local = config.client_addr(server).await.unwrap();
        assert_eq!(local, "0.0.0.0:0".parse().unwrap());

        // the bind must succeed where binding to the remote host would not
        let transport = UdpTransport::bind(local, config.buffer_size).await.unwrap();
        assert_ne!(transport.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_explicit_bind_host_is_kept() {
        let config = NetworkConfig {
            bind_host: "0.0.0.0".to_string(),
            ..Default::default()
        };
        let server: SocketAddr = "127.0.0.1:50123".parse().unwrap();

        assert_eq!(config.client_addr(server).await.unwrap(), "0.0.0.0:50321".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = resolve_host("localhost", 8080).await.unwrap();
        assert_eq!(addr.port(), 8080);
        assert!(addr.ip().is_loopback());
    }
}
