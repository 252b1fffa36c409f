//! Connection ownership, reconnect backoff and raw reads/writes
//!
//! The manager exclusively owns the live stream. Connection establishment is
//! available in two forms: `connect()` retries until it succeeds, while
//! `poll_connect()` makes at most one bounded attempt per call so a service
//! tick never blocks for longer than the connect timeout.

use super::backoff::Backoff;
use super::{BoxedStream, Connector, Endpoint, TransportError};
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Time allowed for a best-effort close
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Timing knobs for the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    /// Upper bound on a single read; expiry means "no data", not an error
    pub read_timeout: Duration,
    /// Upper bound on a single connect attempt
    pub connect_timeout: Duration,
    /// Ceiling of the reconnect backoff
    pub max_backoff: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            max_backoff: Duration::from_secs(super::backoff::MAX_BACKOFF_SECS),
        }
    }
}

/// Result of a single `poll_connect`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPoll {
    /// A stream was already open
    AlreadyOpen,
    /// A new stream was opened
    Connected,
    /// The attempt failed; the next one is allowed after `retry_in`
    Failed { retry_in: Duration },
    /// Still inside the backoff window
    Waiting { remaining: Duration },
}

/// Owner of the broker stream
pub struct TransportManager<C: Connector> {
    connector: C,
    endpoint: Endpoint,
    settings: TransportSettings,
    stream: Option<BoxedStream>,
    backoff: Backoff,
    next_attempt: Option<Instant>,
    read_buf: Vec<u8>,
    connect_count: u64,
    failure_count: u64,
}

impl<C: Connector> TransportManager<C> {
    pub fn new(connector: C, endpoint: Endpoint, settings: TransportSettings) -> Self {
        Self {
            connector,
            endpoint,
            settings,
            stream: None,
            backoff: Backoff::with_max(settings.max_backoff.as_secs()),
            next_attempt: None,
            read_buf: Vec::new(),
            connect_count: 0,
            failure_count: 0,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Point future connects at another server. The open stream is untouched.
    pub fn set_endpoint(&mut self, endpoint: Endpoint) {
        info!(from = %self.endpoint, to = %endpoint, "Transport endpoint changed");
        self.endpoint = endpoint;
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Successful connects since creation
    pub fn connect_count(&self) -> u64 {
        self.connect_count
    }

    /// Failed connect attempts since creation
    pub fn failure_count(&self) -> u64 {
        self.failure_count
    }

    /// Forget the backoff window so the next attempt happens immediately
    pub fn reset_backoff(&mut self) {
        self.backoff.reset();
        self.next_attempt = None;
    }

    /// Connect, retrying with exponential backoff until it succeeds
    pub async fn connect(&mut self) {
        loop {
            match self.attempt().await {
                Ok(()) => return,
                Err(e) => {
                    let delay = self.backoff.fail();
                    warn!(error = %e, retry_in_secs = delay.as_secs(), "Connect failed");
                    sleep(delay).await;
                }
            }
        }
    }

    /// Make at most one connect attempt, honouring the backoff window
    pub async fn poll_connect(&mut self, now: Instant) -> ConnectPoll {
        if self.stream.is_some() {
            return ConnectPoll::AlreadyOpen;
        }

        if let Some(at) = self.next_attempt {
            if now < at {
                return ConnectPoll::Waiting {
                    remaining: at - now,
                };
            }
        }

        match self.attempt().await {
            Ok(()) => ConnectPoll::Connected,
            Err(e) => {
                let retry_in = self.backoff.fail();
                self.next_attempt = Some(now + retry_in);
                warn!(error = %e, retry_in_secs = retry_in.as_secs(), "Connect failed");
                ConnectPoll::Failed { retry_in }
            }
        }
    }

    async fn attempt(&mut self) -> Result<(), TransportError> {
        self.close().await;
        debug!(endpoint = %self.endpoint, "Connecting");

        let result = timeout(
            self.settings.connect_timeout,
            self.connector.connect(&self.endpoint),
        )
        .await;

        match result {
            Ok(Ok(stream)) => {
                self.stream = Some(stream);
                self.backoff.reset();
                self.next_attempt = None;
                self.connect_count += 1;
                info!(endpoint = %self.endpoint, "Transport connected");
                Ok(())
            }
            Ok(Err(source)) => {
                self.failure_count += 1;
                Err(TransportError::ConnectFailed {
                    endpoint: self.endpoint.to_string(),
                    source,
                })
            }
            Err(_) => {
                self.failure_count += 1;
                Err(TransportError::ConnectTimeout {
                    endpoint: self.endpoint.to_string(),
                    timeout: self.settings.connect_timeout,
                })
            }
        }
    }

    /// Read up to `max_bytes`, waiting at most the read timeout.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    ///
    /// # Errors
    ///
    /// End of stream and I/O failures are fatal for the connection.
    pub async fn read(&mut self, max_bytes: usize) -> Result<Option<Bytes>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        self.read_buf.resize(max_bytes.max(1), 0);

        match timeout(self.settings.read_timeout, stream.read(&mut self.read_buf)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(TransportError::ConnectionClosed),
            Ok(Ok(n)) => Ok(self.read_buf.get(..n).map(Bytes::copy_from_slice)),
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            Ok(Err(e)) => Err(TransportError::ReadFailed(e)),
        }
    }

    /// Write all of `data` and flush
    ///
    /// # Errors
    ///
    /// Any failure is fatal for the connection.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        stream
            .write_all(data)
            .await
            .map_err(TransportError::WriteFailed)?;
        stream.flush().await.map_err(TransportError::WriteFailed)
    }

    /// Release the stream. Errors are ignored.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            match timeout(CLOSE_TIMEOUT, stream.shutdown()).await {
                Ok(Ok(())) => debug!("Transport closed"),
                Ok(Err(e)) => debug!(error = %e, "Ignoring error while closing transport"),
                Err(_) => debug!("Transport close timed out"),
            }
        }
    }
}

impl<C: Connector> std::fmt::Debug for TransportManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("endpoint", &self.endpoint)
            .field("open", &self.stream.is_some())
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnector;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn manager(connector: MockConnector) -> TransportManager<MockConnector> {
        TransportManager::new(
            connector,
            Endpoint::new("broker.test", 80, false),
            TransportSettings {
                read_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_connect_backs_off_after_failures() {
        let connector = MockConnector::new();
        connector.push_failure().await;
        connector.push_failure().await;
        let mut transport = manager(connector.clone());
        let t0 = Instant::now();

        assert_eq!(
            transport.poll_connect(t0).await,
            ConnectPoll::Failed {
                retry_in: Duration::from_secs(1)
            }
        );
        assert_eq!(
            transport.poll_connect(t0 + Duration::from_millis(500)).await,
            ConnectPoll::Waiting {
                remaining: Duration::from_millis(500)
            }
        );
        assert_eq!(
            transport.poll_connect(t0 + Duration::from_secs(1)).await,
            ConnectPoll::Failed {
                retry_in: Duration::from_secs(2)
            }
        );

        let _broker = connector.push_stream().await;
        assert_eq!(
            transport.poll_connect(t0 + Duration::from_secs(3)).await,
            ConnectPoll::Connected
        );
        assert_eq!(transport.backoff().current(), Duration::from_secs(1));
        assert_eq!(connector.attempts().await, 3);
        assert_eq!(transport.failure_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_until_success() {
        let connector = MockConnector::new();
        for _ in 0..3 {
            connector.push_failure().await;
        }
        let _broker = connector.push_stream().await;
        let mut transport = manager(connector.clone());

        let start = Instant::now();
        transport.connect().await;

        // Slept 1 + 2 + 4 seconds between the four attempts
        assert_eq!(start.elapsed(), Duration::from_secs(7));
        assert!(transport.is_open());
        assert_eq!(transport.backoff().current(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_is_not_an_error() {
        let connector = MockConnector::new();
        let _broker = connector.push_stream().await;
        let mut transport = manager(connector);
        transport.connect().await;

        assert!(transport.read(64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_and_write_round_trip() {
        let connector = MockConnector::new();
        let mut broker = connector.push_stream().await;
        let mut transport = manager(connector);
        transport.connect().await;

        transport.write(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        broker.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        broker.write_all(b"world").await.unwrap();
        let data = transport.read(64).await.unwrap().unwrap();
        assert_eq!(data.as_ref(), b"world");
    }

    #[tokio::test]
    async fn test_peer_hangup_is_fatal() {
        let connector = MockConnector::new();
        let broker = connector.push_stream().await;
        let mut transport = manager(connector);
        transport.connect().await;

        drop(broker);
        assert!(matches!(
            transport.read(64).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_io_without_stream_fails() {
        let mut transport = manager(MockConnector::new());
        assert!(matches!(
            transport.read(64).await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            transport.write(b"x").await,
            Err(TransportError::NotConnected)
        ));
        transport.close().await;
    }
}
