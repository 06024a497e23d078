//! In-memory transport used to drive the retry engine and the server loop
//! in tests without real sockets.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use super::transport::{Datagram, Transport, TransportError, TransportResult};

/// What the next receive call yields
#[derive(Debug, Clone)]
pub enum Step {
    Deliver(Datagram),
    Timeout,
    Broken,
}

/// Scripted transport that records everything sent through it
///
/// Once the script runs dry, a datagram transport times out on deadline
/// receives and blocks forever on plain receives; a stream transport
/// reports a broken connection.
#[derive(Debug)]
pub struct MemoryTransport {
    script: VecDeque<Step>,
    connection_oriented: bool,
    /// Frames sent, with their destination
    pub sent: Vec<(Bytes, SocketAddr)>,
    /// Deadlines passed to `recv_timeout`, in order
    pub armed: Vec<Duration>,
    /// Number of upcoming sends that fail with an I/O error
    pub fail_sends: usize,
    pub closed: bool,
}

impl MemoryTransport {
    pub fn datagram() -> Self {
        Self::new(false)
    }

    pub fn stream() -> Self {
        Self::new(true)
    }

    fn new(connection_oriented: bool) -> Self {
        Self {
            script: VecDeque::new(),
            connection_oriented,
            sent: Vec::new(),
            armed: Vec::new(),
            fail_sends: 0,
            closed: false,
        }
    }

    pub fn push(&mut self, step: Step) -> &mut Self {
        self.script.push_back(step);
        self
    }

    pub fn push_frame(&mut self, payload: impl Into<Bytes>, peer: SocketAddr) -> &mut Self {
        self.push(Step::Deliver(Datagram {
            payload: payload.into(),
            peer,
        }))
    }

    fn next_step(&mut self) -> Option<Step> {
        self.script.pop_front()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, payload: &[u8], dest: SocketAddr) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.fail_sends > 0 {
            self.fail_sends -= 1;
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "send failed").into());
        }
        self.sent.push((Bytes::copy_from_slice(payload), dest));
        Ok(())
    }

    async fn recv(&mut self) -> TransportResult<Datagram> {
        match self.next_step() {
            Some(Step::Deliver(datagram)) => Ok(datagram),
            Some(Step::Broken) => Err(TransportError::Broken),
            Some(Step::Timeout) => Err(TransportError::TimedOut(Duration::ZERO)),
            None if self.connection_oriented => Err(TransportError::Broken),
            None => std::future::pending().await,
        }
    }

    async fn recv_timeout(&mut self, timeout: Duration) -> TransportResult<Datagram> {
        self.armed.push(timeout);
        match self.next_step() {
            Some(Step::Deliver(datagram)) => Ok(datagram),
            Some(Step::Broken) => Err(TransportError::Broken),
            Some(Step::Timeout) | None => Err(TransportError::TimedOut(timeout)),
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.closed = true;
        Ok(())
    }

    fn is_connection_oriented(&self) -> bool {
        self.connection_oriented
    }
}
