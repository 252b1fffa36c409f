//! Exponential reconnect backoff
//!
//! Delays run 1, 2, 4, 8, 16, 30, 30, ... seconds and reset to 1 after a
//! successful connect.

use std::time::Duration;

pub const INITIAL_BACKOFF_SECS: u64 = 1;
pub const MAX_BACKOFF_SECS: u64 = 30;

/// Backoff counter in whole seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    current_secs: u64,
    max_secs: u64,
}

impl Backoff {
    pub fn new() -> Self {
        Self::with_max(MAX_BACKOFF_SECS)
    }

    pub fn with_max(max_secs: u64) -> Self {
        Self {
            current_secs: INITIAL_BACKOFF_SECS,
            max_secs: max_secs.max(INITIAL_BACKOFF_SECS),
        }
    }

    /// Delay the next failure will wait
    pub fn current(&self) -> Duration {
        Duration::from_secs(self.current_secs)
    }

    /// Record a failed attempt; returns the delay to wait before retrying
    pub fn fail(&mut self) -> Duration {
        let delay = self.current();
        self.current_secs = self.current_secs.saturating_mul(2).min(self.max_secs);
        delay
    }

    pub fn reset(&mut self) {
        self.current_secs = INITIAL_BACKOFF_SECS;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
