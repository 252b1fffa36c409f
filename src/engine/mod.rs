//! Protocol engine
//!
//! - [`heartbeat`] - pure liveness decisions over the heartbeat clock
//! - [`state_machine`] - connection lifecycle, sequencing and frame routing

pub mod heartbeat;
pub mod state_machine;

pub use heartbeat::{HeartbeatClock, HeartbeatPolicy, Liveness};
pub use state_machine::{
    ConnectionState, DisconnectCause, EngineStats, MessageIdCounter, ProtocolStateMachine,
    RedirectTarget,
};
