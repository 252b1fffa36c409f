//! Transport layer for the broker connection
//!
//! This module provides the stream abstraction the engine runs over, the
//! TCP/TLS implementation and the manager that owns the live connection.
//!
//! # Usage
//!
//! ```rust,no_run
//! use blynk_edge::transport::{Endpoint, TcpConnector, TransportManager, TransportSettings};
//!
//! # tokio_test::block_on(async {
//! let endpoint = Endpoint::new("blynk.cloud", 443, true);
//! let mut manager = TransportManager::new(
//!     TcpConnector::new()?,
//!     endpoint,
//!     TransportSettings::default(),
//! );
//!
//! manager.connect().await;
//! manager.write(b"").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod backoff;
pub mod manager;
pub mod tcp;

pub use backoff::Backoff;
pub use manager::{ConnectPoll, TransportManager, TransportSettings};
pub use tcp::TcpConnector;

/// Reliable byte stream the protocol runs over
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Owned, type-erased stream (plain TCP, TLS or an in-memory pipe)
pub type BoxedStream = Box<dyn ByteStream>;

/// Broker address and security mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Wrap the stream in TLS
    pub secure: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            secure,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "tls" } else { "tcp" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Opens streams to an endpoint
///
/// Abstracted so tests can hand the client in-memory pipes instead of sockets.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<BoxedStream>;
}

/// Transport failures. All of them are fatal for the current connection only.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection to {endpoint} failed")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("Connection to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },
    #[error("Read failed")]
    ReadFailed(#[source] io::Error),
    #[error("Write failed")]
    WriteFailed(#[source] io::Error),
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Transport is not connected")]
    NotConnected,
    #[error("TLS setup failed")]
    TlsSetup(#[source] tokio_rustls::rustls::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        assert_eq!(
            Endpoint::new("blynk.cloud", 443, true).to_string(),
            "tls://blynk.cloud:443"
        );
        assert_eq!(
            Endpoint::new("192.168.1.10", 8080, false).to_string(),
            "tcp://192.168.1.10:8080"
        );
    }

    #[test]
    fn test_transport_error_display() {
        let errors = vec![
            TransportError::ConnectFailed {
                endpoint: "tcp://localhost:1".to_string(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
            },
            TransportError::ConnectTimeout {
                endpoint: "tcp://localhost:1".to_string(),
                timeout: Duration::from_secs(1),
            },
            TransportError::ReadFailed(io::Error::new(io::ErrorKind::Other, "x")),
            TransportError::WriteFailed(io::Error::new(io::ErrorKind::BrokenPipe, "x")),
            TransportError::ConnectionClosed,
            TransportError::NotConnected,
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
