//! CalcNet Client
//!
//! Wraps a transport and turns expressions into request frames. Over UDP
//! every request goes through the retry engine; over TCP the stream is
//! already reliable, so each request is sent once and answered by the next
//! read.

use bytes::Bytes;
use std::net::SocketAddr;
use thiserror::Error;

use super::retry::{self, Exchange, RetryError, RetryPolicy};
use super::transport::{Transport, TransportError};
use super::NetworkConfig;
use crate::protocol::{build_request, CodecError, Method, Params, EXPRESSION_PARAM};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Timeout exceeded after {attempts} attempts")]
    TimedOut { attempts: u32 },

    #[error("Connection broken")]
    TransportBroken,

    #[error("Transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Broken => ClientError::TransportBroken,
            other => ClientError::Transport(other),
        }
    }
}

impl From<RetryError> for ClientError {
    fn from(e: RetryError) -> Self {
        match e {
            RetryError::TimedOut { attempts } => ClientError::TimedOut { attempts },
            RetryError::TransportBroken => ClientError::TransportBroken,
            RetryError::Transport(inner) => ClientError::Transport(inner),
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Build the POST frame that asks the server to evaluate `expression`
pub fn expression_request(host: &str, expression: &str) -> Result<Bytes, CodecError> {
    let mut params = Params::new();
    params.insert(EXPRESSION_PARAM.to_string(), vec![expression.to_string()]);
    build_request(host, Method::Post, "/", &params)
}

/// CalcNet Client
pub struct Client<T> {
    transport: T,
    /// Where requests go and replies are expected from
    server: SocketAddr,
    /// Value of the `Host` header
    host: String,
    retry: RetryPolicy,
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T, server: SocketAddr, config: &NetworkConfig) -> Self {
        Self {
            transport,
            server,
            host: config.host.clone(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn is_connection_oriented(&self) -> bool {
        self.transport.is_connection_oriented()
    }

    /// Ask the server to evaluate one expression
    pub async fn evaluate(&mut self, expression: &str) -> ClientResult<Exchange> {
        let request = expression_request(&self.host, expression)?;
        tracing::debug!("Sending request:\n{}", String::from_utf8_lossy(&request));

        if self.transport.is_connection_oriented() {
            self.transport.send(&request, self.server).await?;
            let reply = self.transport.recv().await?;
            tracing::debug!("Received response:\n{}", String::from_utf8_lossy(&reply.payload));
            return Ok(Exchange {
                outcome: retry::interpret_reply(&reply.payload),
                attempts: 1,
            });
        }

        Ok(retry::exchange(&mut self.transport, &request, self.server, &self.retry).await?)
    }

    /// Close the underlying transport
    pub async fn close(&mut self) -> ClientResult<()> {
        self.transport.close().await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }
}
