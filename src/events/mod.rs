//! Event dispatch for inbound protocol messages
//!
//! - [`event`] - typed events and subscription keys
//! - [`dispatcher`] - single-slot handler registry with isolated invocation

pub mod dispatcher;
pub mod event;

pub use dispatcher::{Delivery, EventDispatcher, Handler, HandlerError, HandlerResult};
pub use event::{Event, EventKey, UnknownEventName};
