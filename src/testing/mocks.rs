//! Mock implementations for testing
//!
//! `MockConnector` hands out in-memory pipes instead of sockets, and
//! `MockBroker` speaks the wire protocol on the far end of such a pipe, so the
//! whole client can be exercised without a network.

use crate::protocol::{decode, status, Command, Frame};
use crate::transport::{BoxedStream, Connector, Endpoint};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;

/// Capacity of each in-memory pipe
const PIPE_CAPACITY: usize = 64 * 1024;

enum Scripted {
    Stream(DuplexStream),
    Failure(io::ErrorKind),
}

/// Connector that replays a scripted sequence of outcomes
///
/// Attempts beyond the script fail with `ConnectionRefused`.
#[derive(Clone, Default)]
pub struct MockConnector {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    attempted: Arc<Mutex<Vec<Endpoint>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful connect; returns the broker end of the pipe
    pub async fn push_stream(&self) -> DuplexStream {
        let (client, broker) = tokio::io::duplex(PIPE_CAPACITY);
        self.script.lock().await.push_back(Scripted::Stream(client));
        broker
    }

    /// Queue a successful connect with a protocol-speaking broker behind it
    pub async fn push_broker(&self) -> MockBroker {
        MockBroker::new(self.push_stream().await)
    }

    /// Queue a refused connect
    pub async fn push_failure(&self) {
        self.push_error(io::ErrorKind::ConnectionRefused).await;
    }

    pub async fn push_error(&self, kind: io::ErrorKind) {
        self.script.lock().await.push_back(Scripted::Failure(kind));
    }

    /// Number of connect attempts so far
    pub async fn attempts(&self) -> usize {
        self.attempted.lock().await.len()
    }

    /// Endpoints of every connect attempt, in order
    pub async fn attempted_endpoints(&self) -> Vec<Endpoint> {
        self.attempted.lock().await.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<BoxedStream> {
        self.attempted.lock().await.push(endpoint.clone());
        match self.script.lock().await.pop_front() {
            Some(Scripted::Stream(stream)) => Ok(Box::new(stream)),
            Some(Scripted::Failure(kind)) => Err(io::Error::new(kind, "scripted failure")),
            None => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "no scripted connection",
            )),
        }
    }
}

impl std::fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnector").finish_non_exhaustive()
    }
}

/// Broker side of an in-memory connection
#[derive(Debug)]
pub struct MockBroker {
    stream: DuplexStream,
    buf: BytesMut,
}

impl MockBroker {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Read the next complete frame sent by the client
    pub async fn read_frame(&mut self) -> io::Result<Frame> {
        loop {
            match decode(&self.buf) {
                Ok(Some((frame, consumed))) => {
                    let _ = self.buf.split_to(consumed);
                    return Ok(frame);
                }
                Ok(None) => {}
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }

            let mut chunk = [0u8; 1024];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Like `read_frame`, but gives up after `wait`
    pub async fn try_read_frame(&mut self, wait: Duration) -> Option<Frame> {
        tokio::time::timeout(wait, self.read_frame()).await.ok()?.ok()
    }

    pub async fn send(&mut self, frame: &Frame) -> io::Result<()> {
        let bytes = frame
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.send_raw(&bytes).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Push a virtual pin write to the device
    pub async fn virtual_write(&mut self, id: u16, pin: &str, values: &[&str]) -> io::Result<()> {
        let fields = ["vw", pin].into_iter().chain(values.iter().copied());
        self.send(&Frame::new(Command::Hardware, id, fields)).await
    }

    /// Expect a login frame and answer it with `status`; returns the token
    pub async fn answer_login(&mut self, status: u16) -> io::Result<String> {
        let frame = self.read_frame().await?;
        if frame.command != Command::HardwareLogin {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected login, got {}", frame.command),
            ));
        }
        self.send(&Frame::response(frame.message_id, status))
            .await?;
        Ok(frame.fields().first().cloned().unwrap_or_default())
    }

    /// Expect a login frame and accept it
    pub async fn accept_login(&mut self) -> io::Result<String> {
        self.answer_login(status::SUCCESS).await
    }
}
