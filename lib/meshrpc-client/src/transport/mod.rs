//! Transport contract: dial an address, exchange framed messages

pub mod tcp;

pub use tcp::{TcpConnection, TcpTransport, TcpTransportListener};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Default bound on establishing a connection
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport-level failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("dial {address}: {reason}")]
    Dial { address: String, reason: String },

    #[error("dial {0}: timed out")]
    DialTimeout(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("connection closed")]
    Closed,

    #[error("invalid frame: {0}")]
    Frame(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => TransportError::Closed,
            _ => TransportError::Io(err.to_string()),
        }
    }
}

/// One frame on the wire: out-of-band headers plus an opaque body
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub header: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Options for establishing a connection
#[derive(Clone, Debug)]
pub struct DialOptions {
    pub timeout: Duration,
    /// The connection will carry a long-lived stream
    pub stream: bool,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DIAL_TIMEOUT,
            stream: false,
        }
    }
}

/// An established, bidirectional connection
#[async_trait::async_trait]
pub trait Connection: Send {
    async fn send(&mut self, message: &TransportMessage) -> Result<(), TransportError>;

    async fn recv(&mut self) -> Result<TransportMessage, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;

    fn remote_address(&self) -> &str;
}

/// Factory for connections
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn dial(
        &self,
        address: &str,
        options: DialOptions,
    ) -> Result<Box<dyn Connection>, TransportError>;

    fn name(&self) -> &'static str;
}

/// Dial, giving up once `options.timeout` elapses
pub async fn dial_with_timeout(
    transport: &dyn Transport,
    address: &str,
    options: DialOptions,
) -> Result<Box<dyn Connection>, TransportError> {
    let timeout = options.timeout;
    match tokio::time::timeout(timeout, transport.dial(address, options)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::DialTimeout(address.to_string())),
    }
}
