//! Service loop tying the protocol engine to the transport
//!
//! `BlynkClient` owns both halves and is driven by a single task through
//! [`BlynkClient::tick`] or [`BlynkClient::run`]. Other tasks, including
//! event handlers, talk to it through a [`ClientHandle`], which queues
//! commands that the next tick executes.

use crate::config::ClientConfig;
use crate::engine::{ConnectionState, DisconnectCause, ProtocolStateMachine, RedirectTarget};
use crate::error::{ClientError, ClientResult};
use crate::events::{Event, EventKey, HandlerResult};
use crate::protocol::FrameError;
use crate::transport::{
    ConnectPoll, Connector, Endpoint, TcpConnector, TransportError, TransportManager,
};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn, Instrument};

/// Outbound work queued by a [`ClientHandle`]
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outbound {
    VirtualWrite {
        pin: String,
        values: Vec<String>,
    },
    LogEvent {
        name: String,
        details: Vec<String>,
    },
    SetProperty {
        pin: String,
        property: String,
        values: Vec<String>,
    },
    SyncVirtual {
        pins: Vec<String>,
    },
    Reconnect,
    Disconnect,
}

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Session is logging in or connected; `bytes_in` were processed
    Active { bytes_in: usize },
    /// No stream yet; the next connect attempt is allowed after `remaining`
    BackingOff { remaining: Duration },
    /// Automatic reconnection is off until `connect()` or a reconnect request
    Halted,
    /// The engine dropped the session during this tick. Unless the cause
    /// halts reconnection or is a redirect, the tick already waited out the
    /// error pause.
    Dropped { cause: DisconnectCause },
    /// A read or write failed and the connection was torn down
    TransportFailed,
}

/// Counters and state snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStats {
    pub state: ConnectionState,
    pub frames_in: u64,
    pub frames_out: u64,
    pub pings_sent: u64,
    /// Successful transport connects
    pub connects: u64,
    /// Failed transport connect attempts
    pub connect_failures: u64,
    pub last_disconnect: Option<DisconnectCause>,
}

/// Cloneable, `Send` handle for issuing commands from other tasks
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ClientHandle {
    pub fn virtual_write<I, V>(&self, pin: impl ToString, values: I) -> ClientResult<()>
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        self.submit(Outbound::VirtualWrite {
            pin: pin.to_string(),
            values: strings(values),
        })
    }

    pub fn log_event<I, V>(&self, name: impl ToString, details: I) -> ClientResult<()>
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        self.submit(Outbound::LogEvent {
            name: name.to_string(),
            details: strings(details),
        })
    }

    pub fn set_property<I, V>(
        &self,
        pin: impl ToString,
        property: impl ToString,
        values: I,
    ) -> ClientResult<()>
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        self.submit(Outbound::SetProperty {
            pin: pin.to_string(),
            property: property.to_string(),
            values: strings(values),
        })
    }

    pub fn sync_virtual<I, P>(&self, pins: I) -> ClientResult<()>
    where
        I: IntoIterator<Item = P>,
        P: ToString,
    {
        self.submit(Outbound::SyncVirtual {
            pins: strings(pins),
        })
    }

    /// Re-enable automatic reconnection and skip any pending backoff
    pub fn reconnect(&self) -> ClientResult<()> {
        self.submit(Outbound::Reconnect)
    }

    /// Close the session and stop reconnecting
    pub fn disconnect(&self) -> ClientResult<()> {
        self.submit(Outbound::Disconnect)
    }

    fn submit(&self, command: Outbound) -> ClientResult<()> {
        self.tx
            .send(command)
            .map_err(|_| ClientError::ServiceStopped)
    }
}

fn strings<I, V>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = V>,
    V: ToString,
{
    values.into_iter().map(|v| v.to_string()).collect()
}

/// Device-side Blynk client
pub struct BlynkClient<C: Connector = TcpConnector> {
    engine: ProtocolStateMachine,
    transport: TransportManager<C>,
    buffer_in: usize,
    idle_pause: Duration,
    error_pause: Duration,
    auto_reconnect: bool,
    commands_tx: mpsc::UnboundedSender<Outbound>,
    commands_rx: mpsc::UnboundedReceiver<Outbound>,
}

impl BlynkClient<TcpConnector> {
    /// Client dialing the configured server over TCP/TLS
    ///
    /// # Errors
    ///
    /// Fails when the auth token cannot be resolved or TLS cannot be set up.
    pub fn from_config(config: &ClientConfig) -> ClientResult<Self> {
        Self::new(TcpConnector::new()?, config)
    }
}

impl<C: Connector> BlynkClient<C> {
    /// # Errors
    ///
    /// Fails when the auth token cannot be resolved.
    pub fn new(connector: C, config: &ClientConfig) -> ClientResult<Self> {
        let token = config.auth_token()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        Ok(Self {
            engine: ProtocolStateMachine::new(token, config.heartbeat()),
            transport: TransportManager::new(
                connector,
                config.endpoint(),
                config.transport_settings(),
            ),
            buffer_in: config.cloud.buffer_in,
            idle_pause: config.idle_pause(),
            error_pause: config.error_pause(),
            auto_reconnect: true,
            commands_tx,
            commands_rx,
        })
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            tx: self.commands_tx.clone(),
        }
    }

    /// Register a handler, replacing any previous one for `key`
    pub fn on<F>(&mut self, key: EventKey, handler: F)
    where
        F: FnMut(&Event) -> HandlerResult + Send + 'static,
    {
        self.engine.on(key, handler);
    }

    pub fn off(&mut self, key: &EventKey) -> bool {
        self.engine.dispatcher_mut().off(key)
    }

    pub fn has_handler(&self, key: &EventKey) -> bool {
        self.engine.dispatcher().has_handler(key)
    }

    pub fn state(&self) -> ConnectionState {
        self.engine.state()
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.transport.endpoint()
    }

    pub fn engine(&self) -> &ProtocolStateMachine {
        &self.engine
    }

    /// Whether `tick` will reconnect on its own
    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn stats(&self) -> ClientStats {
        let engine = self.engine.stats();
        ClientStats {
            state: self.engine.state(),
            frames_in: engine.frames_in,
            frames_out: engine.frames_out,
            pings_sent: engine.pings_sent,
            connects: self.transport.connect_count(),
            connect_failures: self.transport.failure_count(),
            last_disconnect: self.engine.last_disconnect(),
        }
    }

    /// Open the transport, retrying with backoff until it succeeds, then
    /// send the login. Re-enables automatic reconnection.
    ///
    /// # Errors
    ///
    /// Fails when the login cannot be written.
    pub async fn connect(&mut self) -> ClientResult<()> {
        self.auto_reconnect = true;
        if self.transport.is_open() && self.engine.state().is_active() {
            return Ok(());
        }

        let span = crate::connection_span!(endpoint = %self.transport.endpoint());
        self.transport.connect().instrument(span).await;
        self.engine.connect(Instant::now());

        if let Err(e) = self.flush().await {
            self.drop_connection().await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Close the session and stop reconnecting
    pub async fn disconnect(&mut self) {
        self.auto_reconnect = false;
        if self.engine.state() != ConnectionState::Disconnected {
            self.engine.disconnect(DisconnectCause::Requested);
        }
        self.transport.close().await;
    }

    /// Write `values` to a virtual pin. `None` when not connected.
    ///
    /// # Errors
    ///
    /// Fails when the frame is too large or cannot be written.
    pub async fn virtual_write<I, V>(
        &mut self,
        pin: impl ToString,
        values: I,
    ) -> ClientResult<Option<u16>>
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        let id = self.engine.virtual_write(pin, values, Instant::now())?;
        self.flush_or_drop().await?;
        Ok(id)
    }

    /// Report a named event to the cloud. `None` when not connected.
    ///
    /// # Errors
    ///
    /// Fails when the frame is too large or cannot be written.
    pub async fn log_event<I, V>(
        &mut self,
        name: impl ToString,
        details: I,
    ) -> ClientResult<Option<u16>>
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        let id = self.engine.log_event(name, details, Instant::now())?;
        self.flush_or_drop().await?;
        Ok(id)
    }

    /// Set a widget property bound to a virtual pin. `None` when not connected.
    ///
    /// # Errors
    ///
    /// Fails when the frame is too large or cannot be written.
    pub async fn set_property<I, V>(
        &mut self,
        pin: impl ToString,
        property: impl ToString,
        values: I,
    ) -> ClientResult<Option<u16>>
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        let id = self
            .engine
            .set_property(pin, property, values, Instant::now())?;
        self.flush_or_drop().await?;
        Ok(id)
    }

    /// Ask the cloud to replay stored virtual pin values. `None` when not connected.
    ///
    /// # Errors
    ///
    /// Fails when the frame is too large or cannot be written.
    pub async fn sync_virtual<I, P>(&mut self, pins: I) -> ClientResult<Option<u16>>
    where
        I: IntoIterator<Item = P>,
        P: ToString,
    {
        let id = self.engine.sync_virtual(pins, Instant::now())?;
        self.flush_or_drop().await?;
        Ok(id)
    }

    /// One pass of the service loop.
    ///
    /// Executes queued handle commands, reconnects if needed, reads once
    /// (bounded by the read timeout), feeds the engine, flushes its output
    /// and reconciles the transport with the engine state.
    pub async fn tick(&mut self) -> TickOutcome {
        self.drain_commands().await;

        if !self.transport.is_open() {
            if !self.auto_reconnect {
                return TickOutcome::Halted;
            }
            match self.transport.poll_connect(Instant::now()).await {
                ConnectPoll::Connected | ConnectPoll::AlreadyOpen => {
                    self.engine.connect(Instant::now());
                }
                ConnectPoll::Failed { retry_in } => {
                    return TickOutcome::BackingOff {
                        remaining: retry_in,
                    }
                }
                ConnectPoll::Waiting { remaining } => {
                    return TickOutcome::BackingOff { remaining }
                }
            }
        }

        if let Err(e) = self.flush().await {
            return self.transport_failed(e).await;
        }

        let data = match self.transport.read(self.buffer_in).await {
            Ok(data) => data,
            Err(e) => return self.transport_failed(e).await,
        };
        let bytes_in = data.as_ref().map_or(0, |d| d.len());
        self.engine
            .process(data.as_deref().unwrap_or_default(), Instant::now());

        if let Err(e) = self.flush().await {
            return self.transport_failed(e).await;
        }

        self.reconcile(bytes_in).await
    }

    /// Tick until `shutdown` turns true (or its sender is dropped), then
    /// disconnect
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(endpoint = %self.transport.endpoint(), "Service loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.tick().await {
                TickOutcome::BackingOff { remaining } => Some(remaining.min(self.idle_pause)),
                TickOutcome::Halted => Some(self.idle_pause),
                TickOutcome::Active { .. }
                | TickOutcome::Dropped { .. }
                | TickOutcome::TransportFailed => None,
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = sleep(pause) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        self.disconnect().await;
        info!("Service loop stopped");
    }

    async fn drain_commands(&mut self) {
        while let Ok(command) = self.commands_rx.try_recv() {
            self.execute(command).await;
        }
    }

    async fn execute(&mut self, command: Outbound) {
        let now = Instant::now();
        let result: Result<Option<u16>, FrameError> = match command {
            Outbound::VirtualWrite { pin, values } => self.engine.virtual_write(pin, values, now),
            Outbound::LogEvent { name, details } => self.engine.log_event(name, details, now),
            Outbound::SetProperty {
                pin,
                property,
                values,
            } => self.engine.set_property(pin, property, values, now),
            Outbound::SyncVirtual { pins } => self.engine.sync_virtual(pins, now),
            Outbound::Reconnect => {
                info!("Reconnect requested");
                self.auto_reconnect = true;
                self.transport.reset_backoff();
                return;
            }
            Outbound::Disconnect => {
                self.disconnect().await;
                return;
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "Dropping queued command");
        }
    }

    async fn reconcile(&mut self, bytes_in: usize) -> TickOutcome {
        if let Some(target) = self.engine.take_redirect() {
            self.follow_redirect(target).await;
            return TickOutcome::Dropped {
                cause: DisconnectCause::Redirect,
            };
        }

        if self.engine.state() != ConnectionState::Disconnected {
            return TickOutcome::Active { bytes_in };
        }

        self.transport.close().await;
        let cause = self
            .engine
            .last_disconnect()
            .unwrap_or(DisconnectCause::Requested);
        if cause.allows_auto_reconnect() {
            // The last connect reset the backoff, so hold off the redial here
            sleep(self.error_pause).await;
        } else {
            warn!(cause = ?cause, "Automatic reconnection halted");
            self.auto_reconnect = false;
        }
        TickOutcome::Dropped { cause }
    }

    async fn follow_redirect(&mut self, target: RedirectTarget) {
        let secure = self.transport.endpoint().secure;
        if self.engine.state() != ConnectionState::Disconnected {
            self.engine.disconnect(DisconnectCause::Redirect);
        }
        self.transport.close().await;
        self.transport
            .set_endpoint(Endpoint::new(target.host, target.port, secure));
        self.transport.reset_backoff();
        self.auto_reconnect = true;
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        for frame in self.engine.drain_outbox() {
            self.transport.write(&frame).await?;
        }
        Ok(())
    }

    async fn flush_or_drop(&mut self) -> ClientResult<()> {
        if let Err(e) = self.flush().await {
            warn!(error = %e, "Write failed");
            self.drop_connection().await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn transport_failed(&mut self, error: TransportError) -> TickOutcome {
        warn!(error = %error, "Transport failure");
        self.drop_connection().await;
        sleep(self.error_pause).await;
        TickOutcome::TransportFailed
    }

    async fn drop_connection(&mut self) {
        if self.engine.state() != ConnectionState::Disconnected {
            self.engine.disconnect(DisconnectCause::TransportFailure);
        }
        self.transport.close().await;
        debug!("Connection dropped");
    }
}

impl<C: Connector> std::fmt::Debug for BlynkClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlynkClient")
            .field("engine", &self.engine)
            .field("transport", &self.transport)
            .field("auto_reconnect", &self.auto_reconnect)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{status, Command, Frame};
    use crate::testing::{MockBroker, MockConnector};

    fn config() -> ClientConfig {
        let mut config = ClientConfig::with_token("device-token");
        config.cloud.server = "broker.test".to_string();
        config.cloud.port = 80;
        config.cloud.insecure = true;
        config.cloud.heartbeat_secs = 10;
        config.service.read_timeout_ms = 100;
        config
    }

    async fn connected() -> (BlynkClient<MockConnector>, MockBroker) {
        let connector = MockConnector::new();
        let mut broker = connector.push_broker().await;
        let mut client = BlynkClient::new(connector, &config()).unwrap();

        client.connect().await.unwrap();
        assert_eq!(broker.accept_login().await.unwrap(), "device-token");
        client.tick().await;
        assert!(client.is_connected());
        (client, broker)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_logs_in() {
        let (client, _broker) = connected().await;
        let stats = client.stats();
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.frames_in, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_are_dropped_while_disconnected() {
        let connector = MockConnector::new();
        let mut client = BlynkClient::new(connector, &config()).unwrap();
        assert_eq!(client.virtual_write(1, ["on"]).await.unwrap(), None);
        assert_eq!(client.stats().frames_out, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_virtual_write_reaches_broker() {
        let (mut client, mut broker) = connected().await;

        let id = client.virtual_write(4, [21.5]).await.unwrap();
        assert_eq!(id, Some(2));

        let frame = broker.read_frame().await.unwrap();
        assert_eq!(frame.command, Command::Hardware);
        assert_eq!(frame.message_id, 2);
        assert_eq!(frame.fields(), ["vw", "4", "21.5"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_commands_run_on_tick() {
        let (mut client, mut broker) = connected().await;
        let handle = client.handle();

        handle.log_event("overheat", ["92C"]).unwrap();
        handle.sync_virtual([1, 2]).unwrap();
        client.tick().await;

        let first = broker.read_frame().await.unwrap();
        assert_eq!(first.command, Command::EventLog);
        assert_eq!(first.fields(), ["overheat", "92C"]);
        let second = broker.read_frame().await.unwrap();
        assert_eq!(second.command, Command::HwSync);
        assert_eq!(second.fields(), ["vr", "1", "2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_after_client_dropped_reports_stopped() {
        let client = BlynkClient::new(MockConnector::new(), &config()).unwrap();
        let handle = client.handle();
        drop(client);

        assert!(matches!(
            handle.virtual_write(1, ["x"]),
            Err(ClientError::ServiceStopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_auth_halts_until_reconnect_requested() {
        let connector = MockConnector::new();
        let mut broker = connector.push_broker().await;
        let mut client = BlynkClient::new(connector.clone(), &config()).unwrap();

        client.connect().await.unwrap();
        broker.answer_login(status::INVALID_TOKEN).await.unwrap();

        assert_eq!(
            client.tick().await,
            TickOutcome::Dropped {
                cause: DisconnectCause::InvalidAuth
            }
        );
        assert!(!client.auto_reconnect());
        assert_eq!(client.tick().await, TickOutcome::Halted);
        assert_eq!(connector.attempts().await, 1);

        let mut broker = connector.push_broker().await;
        client.handle().reconnect().unwrap();
        assert!(matches!(
            client.tick().await,
            TickOutcome::Active { .. }
        ));
        assert_eq!(broker.accept_login().await.unwrap(), "device-token");
    }

    #[tokio::test(start_paused = true)]
    async fn test_redirect_moves_endpoint() {
        let (mut client, mut broker) = connected().await;

        broker
            .send(&Frame::new(Command::Redirect, 7, ["10.0.0.9", "8442"]))
            .await
            .unwrap();

        assert_eq!(
            client.tick().await,
            TickOutcome::Dropped {
                cause: DisconnectCause::Redirect
            }
        );
        assert_eq!(client.endpoint(), &Endpoint::new("10.0.0.9", 8442, false));
        assert!(client.auto_reconnect());
    }
}
