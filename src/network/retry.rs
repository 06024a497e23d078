//! Exponential-backoff exchange over a lossy channel
//!
//! A UDP request may vanish on the way to the server, or its reply may
//! vanish on the way back; the client can't tell which. The engine sends the
//! request, waits for a reply until a deadline, and on silence doubles the
//! deadline and sends again.
//!
//! The ceiling is checked before each send, so nothing is transmitted once
//! the armed deadline exceeds `max_timeout`. With the default policy that is
//! five sends (0.1, 0.2, 0.4, 0.8 and 1.6 s) followed by
//! [`RetryError::TimedOut`] when the sixth deadline (3.2 s) would be armed.

use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use super::transport::{Transport, TransportError, TransportResult};
use crate::protocol::{parse_response, ParseError, StatusCode};

/// Deadline armed for the first attempt
pub const INITIAL_TIMEOUT: Duration = Duration::from_millis(100);

/// Largest deadline that may still be armed
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(2);

/// Retry errors
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Timeout exceeded after {attempts} attempts")]
    TimedOut { attempts: u32 },

    #[error("Connection broken")]
    TransportBroken,

    #[error("Transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for RetryError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Broken => RetryError::TransportBroken,
            other => RetryError::Transport(other),
        }
    }
}

pub type RetryResult<T> = Result<T, RetryError>;

/// Backoff bounds for one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    initial_timeout: Duration,
    max_timeout: Duration,
}

impl RetryPolicy {
    /// `None` when `initial_timeout` is zero, since doubling would never
    /// reach the ceiling
    pub fn new(initial_timeout: Duration, max_timeout: Duration) -> Option<Self> {
        if initial_timeout.is_zero() {
            return None;
        }
        Some(Self {
            initial_timeout,
            max_timeout,
        })
    }

    pub fn initial_timeout(&self) -> Duration {
        self.initial_timeout
    }

    pub fn max_timeout(&self) -> Duration {
        self.max_timeout
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_timeout: INITIAL_TIMEOUT,
            max_timeout: DEFAULT_MAX_TIMEOUT,
        }
    }
}

/// Where an exchange currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sending,
    AwaitingResponse,
    Retrying,
    Success,
    TimedOut,
}

/// Per-exchange backoff state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    current_timeout: Duration,
    max_timeout: Duration,
    attempts: u32,
    phase: Phase,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            current_timeout: policy.initial_timeout,
            max_timeout: policy.max_timeout,
            attempts: 0,
            phase: Phase::Idle,
        }
    }

    pub fn current_timeout(&self) -> Duration {
        self.current_timeout
    }

    /// Number of sends so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Arm the next deadline and count a send, or give up once the deadline
    /// has grown past the ceiling.
    pub fn arm(&mut self) -> Option<Duration> {
        if self.current_timeout > self.max_timeout {
            self.phase = Phase::TimedOut;
            return None;
        }
        self.attempts += 1;
        self.phase = Phase::Sending;
        Some(self.current_timeout)
    }

    pub fn sent(&mut self) {
        self.phase = Phase::AwaitingResponse;
    }

    pub fn back_off(&mut self) {
        self.current_timeout = self.current_timeout.saturating_mul(2);
        self.phase = Phase::Retrying;
    }

    pub fn complete(&mut self) {
        self.phase = Phase::Success;
    }
}

/// Why a reply was not accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The server answered with a non-success status
    Status { status: StatusCode, data: String },
    /// The reply could not be decoded
    Malformed(ParseError),
}

/// What the server said
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A 200 reply carrying the result
    Success(String),
    Invalid(Rejection),
}

/// A finished exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub outcome: Outcome,
    /// Number of times the request was sent
    pub attempts: u32,
}

/// Decode a reply frame into an [`Outcome`]
pub fn interpret_reply(payload: &[u8]) -> Outcome {
    let parsed = parse_response(payload);
    if let Ok(response) = &parsed {
        for (name, value) in response.headers.iter() {
            tracing::trace!("{}: {}", name, value);
        }
    }
    match parsed {
        Ok(response) if response.status.is_success() => Outcome::Success(response.data),
        Ok(response) => Outcome::Invalid(Rejection::Status {
            status: response.status,
            data: response.data,
        }),
        Err(e) => Outcome::Invalid(Rejection::Malformed(e)),
    }
}

/// Send `request` to `dest` until a reply arrives or the policy runs out
pub async fn exchange<T>(
    transport: &mut T,
    request: &[u8],
    dest: SocketAddr,
    policy: &RetryPolicy,
) -> RetryResult<Exchange>
where
    T: Transport + ?Sized,
{
    let mut state = RetryState::new(policy);

    loop {
        let Some(timeout) = state.arm() else {
            tracing::warn!(
                attempts = state.attempts(),
                "Timeout exceeded for request to {}",
                dest
            );
            return Err(RetryError::TimedOut {
                attempts: state.attempts(),
            });
        };

        tracing::debug!(attempt = state.attempts(), ?timeout, "Sending request to {}", dest);
        transport.send(request, dest).await?;
        state.sent();

        match await_reply(transport, dest, timeout).await {
            Ok(payload) => {
                state.complete();
                return Ok(Exchange {
                    outcome: interpret_reply(&payload),
                    attempts: state.attempts(),
                });
            }
            Err(TransportError::TimedOut(_)) => {
                tracing::info!("Request timed out after {:?}, trying again", timeout);
                state.back_off();
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Wait out one armed deadline for a reply from `dest`. Datagrams from any
/// other peer are skipped without extending the deadline.
async fn await_reply<T>(transport: &mut T, dest: SocketAddr, timeout: Duration) -> TransportResult<Bytes>
where
    T: Transport + ?Sized,
{
    let deadline = Instant::now() + timeout;
    let mut wait = timeout;

    loop {
        let datagram = transport.recv_timeout(wait).await?;
        if datagram.peer == dest || transport.is_connection_oriented() {
            return Ok(datagram.payload);
        }

        tracing::debug!("Ignoring datagram from unexpected peer {}", datagram.peer);
        wait = deadline.saturating_duration_since(Instant::now());
        if wait.is_zero() {
            return Err(TransportError::TimedOut(timeout));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::{MemoryTransport, Step};
    use crate::protocol::build_response;

    fn server() -> SocketAddr {
        "127.0.0.1:50123".parse().unwrap()
    }

    fn millis(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|&ms| Duration::from_millis(ms)).collect()
    }

    #[tokio::test]
    async fn test_backoff_sequence_until_timeout() {
        let mut transport = MemoryTransport::datagram();

        let result = exchange(&mut transport, b"req", server(), &RetryPolicy::default()).await;

        assert!(matches!(result, Err(RetryError::TimedOut { attempts: 5 })));
        assert_eq!(transport.armed, millis(&[100, 200, 400, 800, 1600]));
        assert_eq!(transport.sent.len(), 5);
        assert!(transport.sent.iter().all(|(frame, dest)| &frame[..] == b"req" && *dest == server()));
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let mut transport = MemoryTransport::datagram();
        transport.push_frame(build_response(StatusCode::Ok, "3"), server());

        let exchange = exchange(&mut transport, b"req", server(), &RetryPolicy::default())
            .await
            .unwrap();

        assert_eq!(exchange.outcome, Outcome::Success("3".to_string()));
        assert_eq!(exchange.attempts, 1);
        assert_eq!(transport.armed, millis(&[100]));
    }

    #[tokio::test]
    async fn test_recovers_after_losses() {
        let mut transport = MemoryTransport::datagram();
        transport
            .push(Step::Timeout)
            .push(Step::Timeout)
            .push_frame(build_response(StatusCode::Ok, "12"), server());

        let exchange = exchange(&mut transport, b"req", server(), &RetryPolicy::default())
            .await
            .unwrap();

        assert_eq!(exchange.outcome, Outcome::Success("12".to_string()));
        assert_eq!(exchange.attempts, 3);
        assert_eq!(transport.armed, millis(&[100, 200, 400]));
        assert_eq!(transport.sent.len(), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let mut transport = MemoryTransport::datagram();
        transport.push_frame(build_response(StatusCode::NotAcceptable, "-1"), server());

        let exchange = exchange(&mut transport, b"req", server(), &RetryPolicy::default())
            .await
            .unwrap();

        assert_eq!(
            exchange.outcome,
            Outcome::Invalid(Rejection::Status {
                status: StatusCode::NotAcceptable,
                data: "-1".to_string(),
            })
        );
        assert_eq!(transport.sent.len(), 1);
    }

    #[tokio::test]
    async fn test_garbage_reply_is_invalid() {
        let mut transport = MemoryTransport::datagram();
        transport.push_frame(&b"HTTP/1.1 teapot"[..], server());

        let exchange = exchange(&mut transport, b"req", server(), &RetryPolicy::default())
            .await
            .unwrap();

        assert!(matches!(
            exchange.outcome,
            Outcome::Invalid(Rejection::Malformed(ParseError::InvalidStatus(_)))
        ));
    }

    #[tokio::test]
    async fn test_broken_channel_is_fatal() {
        let mut transport = MemoryTransport::datagram();
        transport.push(Step::Broken);

        let result = exchange(&mut transport, b"req", server(), &RetryPolicy::default()).await;

        assert!(matches!(result, Err(RetryError::TransportBroken)));
        assert_eq!(transport.sent.len(), 1);
    }

    #[tokio::test]
    async fn test_reply_from_other_peer_is_ignored() {
        let stranger: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let mut transport = MemoryTransport::datagram();
        transport
            .push_frame(build_response(StatusCode::Ok, "666"), stranger)
            .push_frame(build_response(StatusCode::Ok, "3"), server());

        let exchange = exchange(&mut transport, b"req", server(), &RetryPolicy::default())
            .await
            .unwrap();

        assert_eq!(exchange.outcome, Outcome::Success("3".to_string()));
        assert_eq!(exchange.attempts, 1);
    }

    #[tokio::test]
    async fn test_custom_ceiling() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(400)).unwrap();
        let mut transport = MemoryTransport::datagram();

        let result = exchange(&mut transport, b"req", server(), &policy).await;

        assert!(matches!(result, Err(RetryError::TimedOut { attempts: 3 })));
        assert_eq!(transport.armed, millis(&[100, 200, 400]));
    }

    #[test]
    fn test_zero_initial_timeout_rejected() {
        assert!(RetryPolicy::new(Duration::ZERO, DEFAULT_MAX_TIMEOUT).is_none());
    }

    #[test]
    fn test_state_transitions() {
        let mut state = RetryState::new(&RetryPolicy::default());
        assert_eq!(state.phase(), Phase::Idle);

        assert_eq!(state.arm(), Some(INITIAL_TIMEOUT));
        assert_eq!(state.phase(), Phase::Sending);
        state.sent();
        assert_eq!(state.phase(), Phase::AwaitingResponse);
        state.back_off();
        assert_eq!(state.phase(), Phase::Retrying);
        assert_eq!(state.current_timeout(), Duration::from_millis(200));

        state.arm();
        state.sent();
        state.complete();
        assert_eq!(state.phase(), Phase::Success);
        assert_eq!(state.attempts(), 2);
    }
}
