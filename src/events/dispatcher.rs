//! Single-slot event handler registry
//!
//! Handlers run synchronously on the thread driving the engine. A failing
//! handler, whether it returns an error or panics, is logged and contained so
//! the engine and other handlers keep running.

use super::event::{Event, EventKey};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error};

/// Error type handlers may return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by a handler invocation
pub type HandlerResult = Result<(), HandlerError>;

/// Boxed event handler
pub type Handler = Box<dyn FnMut(&Event) -> HandlerResult + Send>;

/// Outcome of a single `emit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// No handler registered for the key
    NoSubscriber,
    /// Handler ran to completion
    Delivered,
    /// Handler returned an error or panicked
    HandlerFailed,
}

/// Name-keyed registry holding at most one handler per key
#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<EventKey, Handler>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `key`, replacing any previous handler
    pub fn on<F>(&mut self, key: EventKey, handler: F)
    where
        F: FnMut(&Event) -> HandlerResult + Send + 'static,
    {
        if self.handlers.insert(key.clone(), Box::new(handler)).is_some() {
            debug!(event = %key, "Replaced event handler");
        }
    }

    /// Remove the handler for `key`, returning whether one was registered
    pub fn off(&mut self, key: &EventKey) -> bool {
        self.handlers.remove(key).is_some()
    }

    pub fn has_handler(&self, key: &EventKey) -> bool {
        self.handlers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Deliver `event` to its handler, if any
    pub fn emit(&mut self, event: &Event) -> Delivery {
        let key = event.key();
        let Some(handler) = self.handlers.get_mut(&key) else {
            return Delivery::NoSubscriber;
        };
        let _span = crate::dispatch_span!(event = %key).entered();

        match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => Delivery::Delivered,
            Ok(Err(e)) => {
                error!(event = %key, error = %e, "Event handler failed");
                Delivery::HandlerFailed
            }
            Err(payload) => {
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(event = %key, error = %detail, "Event handler panicked");
                Delivery::HandlerFailed
            }
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("keys", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
