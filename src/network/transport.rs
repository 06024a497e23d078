//! Transport abstraction for CalcNet
//!
//! The retry engine and the server loop only see the [`Transport`] trait:
//! send a frame to an endpoint, receive the next frame (optionally with a
//! deadline) and close. Two socket-backed implementations live here:
//! - [`UdpTransport`] - connectionless, one frame per datagram
//! - [`TcpTransport`] - one connected stream, one frame per read

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Receive timed out after {0:?}")]
    TimedOut(Duration),

    /// A zero-length read
    #[error("Connection broken")]
    Broken,

    #[error("Transport closed")]
    Closed,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// One inbound frame and where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Bytes,
    pub peer: SocketAddr,
}

/// Raw frame I/O over a bound socket
#[async_trait]
pub trait Transport: Send {
    /// Send one frame to `dest`
    async fn send(&mut self, payload: &[u8], dest: SocketAddr) -> TransportResult<()>;

    /// Wait for the next inbound frame
    async fn recv(&mut self) -> TransportResult<Datagram>;

    /// Wait at most `timeout` for the next inbound frame
    async fn recv_timeout(&mut self, timeout: Duration) -> TransportResult<Datagram> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::TimedOut(timeout)),
        }
    }

    /// Release the socket. Later calls fail with [`TransportError::Closed`].
    async fn close(&mut self) -> TransportResult<()>;

    /// Whether a broken read ends the whole session instead of one exchange
    fn is_connection_oriented(&self) -> bool;
}

/// Connectionless transport over a bound UDP socket
#[derive(Debug)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    local_addr: SocketAddr,
    buffer_size: usize,
}

impl UdpTransport {
    /// Bind to `addr`; port 0 lets the OS pick one
    pub async fn bind(addr: SocketAddr, buffer_size: usize) -> TransportResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket: Some(socket),
            local_addr,
            buffer_size,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn socket(&self) -> TransportResult<&UdpSocket> {
        self.socket.as_ref().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&mut self, payload: &[u8], dest: SocketAddr) -> TransportResult<()> {
        self.socket()?.send_to(payload, dest).await?;
        Ok(())
    }

    async fn recv(&mut self) -> TransportResult<Datagram> {
        let mut buf = vec![0u8; self.buffer_size];
        let (n, peer) = self.socket()?.recv_from(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::Broken);
        }
        buf.truncate(n);
        Ok(Datagram {
            payload: Bytes::from(buf),
            peer,
        })
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.socket.take();
        Ok(())
    }

    fn is_connection_oriented(&self) -> bool {
        false
    }
}

/// Connection-oriented transport over one TCP stream
///
/// The destination passed to `send` is ignored; frames always go to the
/// connected peer.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    buffer_size: usize,
}

impl TcpTransport {
    /// Connect to `addr`, giving up after `connect_timeout`
    pub async fn connect(
        addr: SocketAddr,
        connect_timeout: Duration,
        buffer_size: usize,
    ) -> TransportResult<Self> {
        tracing::info!("Connecting to {}", addr);

        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::TimedOut(connect_timeout)),
        };
        Ok(Self::from_stream(stream, addr, buffer_size))
    }

    /// Wrap an accepted stream
    pub fn from_stream(stream: TcpStream, peer: SocketAddr, buffer_size: usize) -> Self {
        Self {
            stream: Some(stream),
            peer,
            buffer_size,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn stream(&mut self) -> TransportResult<&mut TcpStream> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, payload: &[u8], _dest: SocketAddr) -> TransportResult<()> {
        let stream = self.stream()?;
        stream.write_all(payload).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> TransportResult<Datagram> {
        let mut buf = vec![0u8; self.buffer_size];
        let n = self.stream()?.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::Broken);
        }
        buf.truncate(n);
        Ok(Datagram {
            payload: Bytes::from(buf),
            peer: self.peer,
        })
    }

    async fn close(&mut self) -> TransportResult<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }

    fn is_connection_oriented(&self) -> bool {
        true
    }
}
