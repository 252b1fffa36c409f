//! Protocol state machine
//!
//! Owns the connection lifecycle, message id sequencing, the heartbeat clock
//! and the translation of inbound frames into events. It performs no I/O:
//! outbound frames are queued in an outbox that the owner drains and writes,
//! and every operation takes the current time explicitly.

use super::heartbeat::{HeartbeatClock, HeartbeatPolicy, Liveness};
use crate::events::{Event, EventDispatcher, EventKey, HandlerResult};
use crate::protocol::{decode, status, Command, Frame, FrameError};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Login sent, waiting for the broker's response
    Connecting,
    Connected,
}

impl ConnectionState {
    /// Whether inbound data is processed in this state
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Why the engine last entered `Disconnected`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Explicit request by the owner
    Requested,
    /// Nothing received for 1.5x the heartbeat interval
    HeartbeatTimeout,
    /// Malformed frame or reserved message id
    ProtocolViolation,
    /// Broker rejected the auth token
    InvalidAuth,
    /// Read or write on the transport failed
    TransportFailure,
    /// Broker redirected the device to another server
    Redirect,
}

impl DisconnectCause {
    /// Whether the service loop should reconnect on its own after this cause
    pub fn allows_auto_reconnect(self) -> bool {
        !matches!(self, DisconnectCause::InvalidAuth | DisconnectCause::Requested)
    }
}

/// Message id sequence in `[1, 0xFFFF]`, wrapping to 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageIdCounter {
    next: u16,
}

impl MessageIdCounter {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn reset(&mut self) {
        self.next = 1;
    }

    /// Id the next call to `next_id` will return
    pub fn peek(&self) -> u16 {
        self.next
    }

    pub fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = if id == u16::MAX { 1 } else { id + 1 };
        id
    }
}

impl Default for MessageIdCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Broker-requested server change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    pub host: String,
    pub port: u16,
}

/// Frame counters for the current engine instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub pings_sent: u64,
}

/// Sans-IO protocol engine
pub struct ProtocolStateMachine {
    auth_token: String,
    policy: HeartbeatPolicy,
    state: ConnectionState,
    ids: MessageIdCounter,
    clock: HeartbeatClock,
    rx: BytesMut,
    outbox: VecDeque<Bytes>,
    dispatcher: EventDispatcher,
    pending_redirect: Option<RedirectTarget>,
    last_disconnect: Option<DisconnectCause>,
    stats: EngineStats,
}

impl ProtocolStateMachine {
    pub fn new(auth_token: impl Into<String>, heartbeat: Duration) -> Self {
        Self {
            auth_token: auth_token.into(),
            policy: HeartbeatPolicy::new(heartbeat),
            state: ConnectionState::Disconnected,
            ids: MessageIdCounter::new(),
            clock: HeartbeatClock::new(Instant::now()),
            rx: BytesMut::with_capacity(1024),
            outbox: VecDeque::new(),
            dispatcher: EventDispatcher::new(),
            pending_redirect: None,
            last_disconnect: None,
            stats: EngineStats::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn heartbeat(&self) -> Duration {
        self.policy.interval()
    }

    pub fn clock(&self) -> &HeartbeatClock {
        &self.clock
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn last_disconnect(&self) -> Option<DisconnectCause> {
        self.last_disconnect
    }

    /// Id the next outbound frame will carry
    pub fn next_message_id(&self) -> u16 {
        self.ids.peek()
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut EventDispatcher {
        &mut self.dispatcher
    }

    /// Register a handler, replacing any previous one for `key`
    pub fn on<F>(&mut self, key: EventKey, handler: F)
    where
        F: FnMut(&Event) -> HandlerResult + Send + 'static,
    {
        self.dispatcher.on(key, handler);
    }

    /// Start a login cycle. No-op unless disconnected.
    pub fn connect(&mut self, now: Instant) {
        if self.state != ConnectionState::Disconnected {
            debug!(state = %self.state, "Ignoring connect while not disconnected");
            return;
        }

        self.transition(ConnectionState::Connecting);
        self.ids.reset();
        self.clock.reset(now);
        self.rx.clear();
        self.pending_redirect = None;

        let token = self.auth_token.clone();
        if let Err(e) = self.send(Command::HardwareLogin, [token], now) {
            error!(error = %e, "Failed to encode login frame");
        }
    }

    /// Drop the session unconditionally and notify subscribers
    pub fn disconnect(&mut self, cause: DisconnectCause) {
        self.transition(ConnectionState::Disconnected);
        self.rx.clear();
        self.outbox.clear();
        self.last_disconnect = Some(cause);
        info!(cause = ?cause, "Protocol session closed");
        self.dispatcher.emit(&Event::Disconnected);
    }

    /// Queue a frame with the next message id.
    ///
    /// Returns the id used, or `None` when the frame was dropped because the
    /// engine is disconnected.
    ///
    /// # Errors
    ///
    /// Fails when the fields do not fit in a single frame.
    pub fn send<I, S>(
        &mut self,
        command: Command,
        fields: I,
        now: Instant,
    ) -> Result<Option<u16>, FrameError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.state == ConnectionState::Disconnected {
            debug!(command = %command, "Dropping outbound frame while disconnected");
            return Ok(None);
        }

        // The id is only consumed once the frame is known to fit
        let bytes = Frame::new(command, self.ids.peek(), fields).encode()?;
        let id = self.ids.next_id();
        self.enqueue(bytes, now);
        Ok(Some(id))
    }

    /// Queue a status response echoing `message_id`. Dropped while
    /// disconnected, like `send`.
    ///
    /// # Errors
    ///
    /// Fails on message id 0.
    pub fn respond(&mut self, message_id: u16, status: u16, now: Instant) -> Result<(), FrameError> {
        if self.state == ConnectionState::Disconnected {
            debug!(message_id, "Dropping response while disconnected");
            return Ok(());
        }

        let bytes = Frame::response(message_id, status).encode()?;
        self.enqueue(bytes, now);
        Ok(())
    }

    /// Write `values` to a virtual pin
    ///
    /// # Errors
    ///
    /// Fails when the values do not fit in a single frame.
    pub fn virtual_write<I, V>(
        &mut self,
        pin: impl ToString,
        values: I,
        now: Instant,
    ) -> Result<Option<u16>, FrameError>
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        let fields = ["vw".to_string(), pin.to_string()]
            .into_iter()
            .chain(values.into_iter().map(|v| v.to_string()));
        self.send(Command::Hardware, fields, now)
    }

    /// Report a named event to the cloud event log
    ///
    /// # Errors
    ///
    /// Fails when the details do not fit in a single frame.
    pub fn log_event<I, V>(
        &mut self,
        name: impl ToString,
        details: I,
        now: Instant,
    ) -> Result<Option<u16>, FrameError>
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        let fields = std::iter::once(name.to_string())
            .chain(details.into_iter().map(|v| v.to_string()));
        self.send(Command::EventLog, fields, now)
    }

    /// Set a widget property (label, color, ...) bound to a virtual pin
    ///
    /// # Errors
    ///
    /// Fails when the values do not fit in a single frame.
    pub fn set_property<I, V>(
        &mut self,
        pin: impl ToString,
        property: impl ToString,
        values: I,
        now: Instant,
    ) -> Result<Option<u16>, FrameError>
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        let fields = [pin.to_string(), property.to_string()]
            .into_iter()
            .chain(values.into_iter().map(|v| v.to_string()));
        self.send(Command::Property, fields, now)
    }

    /// Ask the broker to replay the stored values of virtual pins
    ///
    /// # Errors
    ///
    /// Fails when the pin list does not fit in a single frame.
    pub fn sync_virtual<I, P>(&mut self, pins: I, now: Instant) -> Result<Option<u16>, FrameError>
    where
        I: IntoIterator<Item = P>,
        P: ToString,
    {
        let fields =
            std::iter::once("vr".to_string()).chain(pins.into_iter().map(|p| p.to_string()));
        self.send(Command::HwSync, fields, now)
    }

    /// Feed inbound bytes, enforce liveness and route every complete frame
    pub fn process(&mut self, data: &[u8], now: Instant) {
        if !self.state.is_active() {
            return;
        }

        self.rx.extend_from_slice(data);

        match self.policy.evaluate(&self.clock, now) {
            Liveness::TimedOut => {
                warn!(
                    heartbeat_secs = self.policy.interval().as_secs_f64(),
                    "No data from broker within heartbeat timeout"
                );
                self.disconnect(DisconnectCause::HeartbeatTimeout);
                return;
            }
            Liveness::PingDue => {
                match self.send(Command::Ping, Vec::<String>::new(), now) {
                    Ok(_) => self.stats.pings_sent += 1,
                    Err(e) => error!(error = %e, "Failed to encode ping"),
                }
                self.clock.last_ping = now;
            }
            Liveness::Healthy => {}
        }

        while self.state.is_active() {
            match decode(&self.rx) {
                Ok(Some((frame, consumed))) => {
                    self.rx.advance(consumed);
                    self.clock.last_recv = now;
                    self.stats.frames_in += 1;
                    self.route(frame, now);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Protocol violation from broker");
                    self.disconnect(DisconnectCause::ProtocolViolation);
                }
            }
        }
    }

    /// Encoded frames waiting to be written, oldest first
    pub fn drain_outbox(&mut self) -> Vec<Bytes> {
        self.outbox.drain(..).collect()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Redirect received since the last call, if any
    pub fn take_redirect(&mut self) -> Option<RedirectTarget> {
        self.pending_redirect.take()
    }

    fn enqueue(&mut self, bytes: Bytes, now: Instant) {
        self.clock.last_send = now;
        self.stats.frames_out += 1;
        self.outbox.push_back(bytes);
    }

    fn route(&mut self, frame: Frame, now: Instant) {
        debug!(command = %frame.command, id = frame.message_id, "Inbound frame");
        match frame.command {
            Command::Ping => {
                if let Err(e) = self.respond(frame.message_id, status::SUCCESS, now) {
                    error!(error = %e, "Failed to encode ping response");
                }
            }
            Command::Response => self.handle_response(frame.status().unwrap_or_default()),
            Command::Hardware => self.handle_hardware(frame.into_fields()),
            Command::Internal => self.handle_internal(frame.into_fields()),
            Command::Redirect => self.handle_redirect(frame.into_fields()),
            other => debug!(command = %other, "Ignoring unsupported command"),
        }
    }

    fn handle_response(&mut self, code: u16) {
        if self.state != ConnectionState::Connecting {
            debug!(status = code, "Response outside login");
            return;
        }

        match code {
            status::SUCCESS => {
                self.transition(ConnectionState::Connected);
                self.dispatcher.emit(&Event::Connected);
            }
            status::INVALID_TOKEN => {
                error!("Broker rejected auth token");
                self.dispatcher.emit(&Event::InvalidAuth);
                self.disconnect(DisconnectCause::InvalidAuth);
            }
            other => warn!(status = other, "Unhandled login response status"),
        }
    }

    fn handle_hardware(&mut self, fields: Vec<String>) {
        let mut fields = fields.into_iter();
        match fields.next().as_deref() {
            Some("vw") => {}
            other => {
                debug!(operation = ?other, "Ignoring hardware operation");
                return;
            }
        }
        let Some(pin) = fields.next() else {
            warn!("Virtual write without pin");
            return;
        };
        let values: Vec<String> = fields.collect();

        self.dispatcher.emit(&Event::VirtualWrite {
            pin: pin.clone(),
            values: values.clone(),
        });
        self.dispatcher.emit(&Event::VirtualWriteAny { pin, values });
    }

    fn handle_internal(&mut self, fields: Vec<String>) {
        let mut fields = fields.into_iter();
        let Some(name) = fields.next() else {
            warn!("Internal message without name");
            return;
        };
        self.dispatcher.emit(&Event::Internal {
            name,
            values: fields.collect(),
        });
    }

    fn handle_redirect(&mut self, fields: Vec<String>) {
        let (Some(host), Some(port)) = (fields.first(), fields.get(1)) else {
            warn!(fields = ?fields, "Malformed redirect");
            return;
        };
        let Ok(port) = port.parse::<u16>() else {
            warn!(port = %port, "Redirect with invalid port");
            return;
        };

        info!(host = %host, port, "Broker requested redirect");
        self.dispatcher.emit(&Event::Redirect {
            host: host.clone(),
            port,
        });
        self.pending_redirect = Some(RedirectTarget {
            host: host.clone(),
            port,
        });
    }

    fn transition(&mut self, next: ConnectionState) {
        log_state_transition(self.state, next);
        self.state = next;
    }
}

impl fmt::Debug for ProtocolStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolStateMachine")
            .field("state", &self.state)
            .field("heartbeat", &self.policy.interval())
            .field("next_message_id", &self.ids.peek())
            .field("buffered", &self.rx.len())
            .field("outbox", &self.outbox.len())
            .finish_non_exhaustive()
    }
}

fn log_state_transition(from: ConnectionState, to: ConnectionState) {
    match (from, to) {
        (ConnectionState::Disconnected, ConnectionState::Connecting) => {
            info!("Logging in to broker");
        }
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!("Broker connection established");
        }
        (ConnectionState::Connected, ConnectionState::Disconnected) => {
            warn!("Broker connection lost");
        }
        _ => debug!("Connection state: {} -> {}", from, to),
    }
}
