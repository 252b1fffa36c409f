//! Heartbeat clock and liveness decisions
//!
//! The engine checks liveness on every `process()` call instead of running a
//! timer. Decisions here are pure functions of the clock and `now`.

use std::time::Duration;
use tokio::time::Instant;

/// Timestamps of the last send, receive and ping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatClock {
    pub last_send: Instant,
    pub last_recv: Instant,
    pub last_ping: Instant,
}

impl HeartbeatClock {
    pub fn new(now: Instant) -> Self {
        Self {
            last_send: now,
            last_recv: now,
            last_ping: now,
        }
    }

    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(now);
    }
}

/// What the engine should do about liveness right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Traffic is recent enough
    Healthy,
    /// Send a ping
    PingDue,
    /// Nothing received for 1.5x the heartbeat, drop the connection
    TimedOut,
}

/// Liveness policy for a heartbeat interval `H`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    interval: Duration,
}

impl HeartbeatPolicy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Hard timeout: `H + H/2`
    pub fn timeout(&self) -> Duration {
        self.interval + self.interval / 2
    }

    /// Minimum spacing between pings: `H/10`
    pub fn ping_spacing(&self) -> Duration {
        self.interval / 10
    }

    /// Evaluate the clock at `now`.
    pub fn evaluate(&self, clock: &HeartbeatClock, now: Instant) -> Liveness {
        let since_recv = now.saturating_duration_since(clock.last_recv);
        if since_recv > self.timeout() {
            return Liveness::TimedOut;
        }

        let since_ping = now.saturating_duration_since(clock.last_ping);
        let since_send = now.saturating_duration_since(clock.last_send);
        if since_ping > self.ping_spacing()
            && (since_send > self.interval || since_recv > self.interval)
        {
            return Liveness::PingDue;
        }

        Liveness::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> HeartbeatPolicy {
        HeartbeatPolicy::new(Duration::from_secs(10))
    }

    #[test]
    fn test_derived_durations() {
        let policy = policy();
        assert_eq!(policy.timeout(), Duration::from_secs(15));
        assert_eq!(policy.ping_spacing(), Duration::from_secs(1));
    }

    #[test]
    fn test_fresh_clock_is_healthy() {
        let now = Instant::now();
        let clock = HeartbeatClock::new(now);
        assert_eq!(policy().evaluate(&clock, now), Liveness::Healthy);
        assert_eq!(
            policy().evaluate(&clock, now + Duration::from_secs(10)),
            Liveness::Healthy
        );
    }

    #[test]
    fn test_ping_due_after_idle_send() {
        let t0 = Instant::now();
        let mut clock = HeartbeatClock::new(t0);
        // Receiving recently does not stop the ping if we have not sent
        clock.last_recv = t0 + Duration::from_secs(10);

        let now = t0 + Duration::from_secs(11);
        assert_eq!(policy().evaluate(&clock, now), Liveness::PingDue);
    }

    #[test]
    fn test_ping_due_after_idle_recv() {
        let t0 = Instant::now();
        let mut clock = HeartbeatClock::new(t0);
        clock.last_send = t0 + Duration::from_secs(10);

        let now = t0 + Duration::from_secs(11);
        assert_eq!(policy().evaluate(&clock, now), Liveness::PingDue);
    }

    #[test]
    fn test_ping_spacing_is_respected() {
        let t0 = Instant::now();
        let mut clock = HeartbeatClock::new(t0);
        clock.last_ping = t0 + Duration::from_millis(11_500);

        let now = t0 + Duration::from_secs(12);
        assert_eq!(policy().evaluate(&clock, now), Liveness::Healthy);

        let later = t0 + Duration::from_millis(12_600);
        assert_eq!(policy().evaluate(&clock, later), Liveness::PingDue);
    }

    #[test]
    fn test_timeout_wins_over_ping() {
        let t0 = Instant::now();
        let clock = HeartbeatClock::new(t0);
        assert_eq!(
            policy().evaluate(&clock, t0 + Duration::from_secs(15)),
            Liveness::PingDue
        );
        assert_eq!(
            policy().evaluate(&clock, t0 + Duration::from_millis(15_001)),
            Liveness::TimedOut
        );
    }
}
