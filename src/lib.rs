//! blynk-edge - device-side client for the Blynk cloud protocol
//!
//! Keeps a long-lived, authenticated, heartbeated connection to a
//! Blynk-compatible broker, turns inbound commands into typed events and
//! reconnects with exponential backoff when the transport fails.
//!
//! # Overview
//!
//! - [`protocol`] - binary frame codec and command codes
//! - [`events`] - typed events and the handler registry
//! - [`engine`] - sans-IO protocol state machine and heartbeat policy
//! - [`transport`] - TCP/TLS connector and the connection manager
//! - [`client`] - the service loop and a cross-task handle
//!
//! # Quick Start
//!
//! ```no_run
//! use blynk_edge::{BlynkClient, ClientConfig, Event, EventKey};
//! use tokio::sync::watch;
//!
//! # async fn example() -> Result<(), blynk_edge::ClientError> {
//! let config = ClientConfig::with_token("my-device-token");
//! let mut client = BlynkClient::from_config(&config)?;
//! let handle = client.handle();
//!
//! client.on(EventKey::pin(1), move |event: &Event| {
//!     // Echo slider position back to a display widget
//!     handle.virtual_write(2, event.values())?;
//!     Ok(())
//! });
//!
//! let (_stop, shutdown) = watch::channel(false);
//! client.run(shutdown).await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use client::{BlynkClient, ClientHandle, ClientStats, TickOutcome};
pub use config::{ClientConfig, ConfigError};
pub use engine::{ConnectionState, DisconnectCause, ProtocolStateMachine};
pub use error::{ClientError, ClientResult};
pub use events::{Event, EventKey, HandlerResult};
pub use protocol::{Command, Frame, FrameError};
pub use transport::{Connector, Endpoint, TcpConnector, TransportError};
