//! CalcNet Server
//!
//! One receive → drop gate → evaluate → reply loop serves both transports.
//! Loss simulation is not a separate server kind: the loop is parameterized
//! by a [`DropPolicy`], and the reliable servers simply use [`NeverDrop`].

use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;

use super::loss::{DropPolicy, LossSimulator, NeverDrop};
use super::transport::{TcpTransport, Transport, TransportError, UdpTransport};
use super::NetworkConfig;
use crate::calculator;
use crate::protocol::{build_response, parse_request, StatusCode, EXPRESSION_PARAM, REJECTED_BODY};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Why [`Server::serve`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeEnd {
    /// The stream peer hung up
    PeerClosed,
    /// The shutdown future fired
    Shutdown,
}

/// Server counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub received: u64,
    pub dropped: u64,
    pub answered: u64,
    pub rejected: u64,
}

/// Evaluate one request frame. Anything that goes wrong maps to
/// `406` with body `-1`.
pub fn answer(payload: &[u8]) -> (StatusCode, String) {
    let rejected = || (StatusCode::NotAcceptable, REJECTED_BODY.to_string());

    let request = match parse_request(payload) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Request is invalid: {}", e);
            return rejected();
        }
    };

    tracing::debug!("{} {} from {}", request.method, request.path, request.headers.get("Host").unwrap_or("-"));

    let Some(expression) = request.param(EXPRESSION_PARAM) else {
        tracing::warn!("Request is invalid. Missing parameters.");
        return rejected();
    };
    tracing::info!("Expression received: {}", expression);

    match calculator::evaluate(expression) {
        Ok(value) => {
            tracing::info!("Expression valid, result = {}", value);
            (StatusCode::Ok, value.to_string())
        }
        Err(e) => {
            tracing::warn!(error = ?e, "Expression rejected: {}", e);
            rejected()
        }
    }
}

/// CalcNet Server
pub struct Server<P = NeverDrop> {
    policy: P,
    stats: ServerStats,
}

impl<P: DropPolicy> Server<P> {
    pub fn new(policy: P) -> Self {
        Self {
            policy,
            stats: ServerStats::default(),
        }
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Run one inbound frame through the drop gate and the evaluator.
    /// Returns `None` when the frame was discarded.
    pub fn handle(&mut self, payload: &[u8]) -> Option<Bytes> {
        self.stats.received += 1;

        if !self.policy.should_process() {
            self.stats.dropped += 1;
            tracing::info!("Packet received, but dropped");
            return None;
        }

        tracing::debug!("Received packet:\n{}", String::from_utf8_lossy(payload));
        let (status, data) = answer(payload);
        match status {
            StatusCode::Ok => self.stats.answered += 1,
            StatusCode::NotAcceptable => self.stats.rejected += 1,
        }

        let response = build_response(status, &data);
        tracing::debug!("Sending response:\n{}", String::from_utf8_lossy(&response));
        Some(response)
    }

    /// Serve frames from `transport` until the peer hangs up (streams only)
    /// or `shutdown` completes. Shutdown is only observed between frames, so
    /// a reply is never cut off.
    pub async fn serve<T, S>(&mut self, transport: &mut T, shutdown: &mut S) -> ServerResult<ServeEnd>
    where
        T: Transport + ?Sized,
        S: Future + Unpin,
    {
        loop {
            let received = tokio::select! {
                result = transport.recv() => Some(result),
                _ = &mut *shutdown => None,
            };

            let Some(result) = received else {
                tracing::info!("Server aborted");
                transport.close().await?;
                return Ok(ServeEnd::Shutdown);
            };

            let datagram = match result {
                Ok(datagram) => datagram,
                Err(TransportError::Broken) if transport.is_connection_oriented() => {
                    tracing::info!("Connection ended");
                    return Ok(ServeEnd::PeerClosed);
                }
                Err(TransportError::Broken) => {
                    tracing::debug!("Ignoring empty datagram");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let Some(response) = self.handle(&datagram.payload) else {
                continue;
            };
            match transport.send(&response, datagram.peer).await {
                Ok(()) => {}
                // a failed datagram only loses this reply; the client retries
                Err(e) if !transport.is_connection_oriented() => {
                    tracing::warn!("Failed to reply to {}: {}", datagram.peer, e);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Accept TCP connections one at a time and serve each to completion
    pub async fn serve_connections<S>(
        &mut self,
        listener: &TcpListener,
        buffer_size: usize,
        shutdown: &mut S,
    ) -> ServerResult<()>
    where
        S: Future + Unpin,
    {
        loop {
            let accepted = tokio::select! {
                result = listener.accept() => Some(result),
                _ = &mut *shutdown => None,
            };

            let Some(result) = accepted else {
                tracing::info!("Server aborted");
                return Ok(());
            };

            let (stream, peer) = match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                    continue;
                }
            };
            tracing::info!("New connection from {}", peer);

            let mut transport = TcpTransport::from_stream(stream, peer, buffer_size);
            match self.serve(&mut transport, shutdown).await {
                Ok(ServeEnd::Shutdown) => return Ok(()),
                Ok(ServeEnd::PeerClosed) => {
                    let _ = transport.close().await;
                }
                Err(e) => {
                    tracing::error!("Connection with {} failed: {}", peer, e);
                }
            }
        }
    }
}

/// Run the lossy UDP server on the configured address until `shutdown` fires
pub async fn run_udp<S>(
    config: &NetworkConfig,
    simulator: LossSimulator,
    shutdown: &mut S,
) -> ServerResult<ServerStats>
where
    S: Future + Unpin,
{
    let bind_addr = config.server_addr().await?;
    let mut transport = UdpTransport::bind(bind_addr, config.buffer_size)
        .await
        .map_err(|e| ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e)))?;
    tracing::info!("UDP server listening on {}", transport.local_addr());

    let mut server = Server::new(simulator);
    server.serve(&mut transport, shutdown).await?;

    let simulator = server.policy();
    tracing::info!(
        "Dropped {:.1}% of datagrams at probability {}",
        simulator.stats().drop_ratio() * 100.0,
        simulator.probability()
    );
    Ok(server.stats())
}

/// Run the TCP server on the configured address until `shutdown` fires
pub async fn run_tcp<S>(config: &NetworkConfig, shutdown: &mut S) -> ServerResult<ServerStats>
where
    S: Future + Unpin,
{
    let bind_addr: SocketAddr = config.server_addr().await?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e)))?;
    tracing::info!("TCP server listening on {}", listener.local_addr()?);

    let mut server = Server::new(NeverDrop);
    server
        .serve_connections(&listener, config.buffer_size, shutdown)
        .await?;
    Ok(server.stats())
}
