//! Static configuration for a monitoring session.
//!
//! These settings describe transport timings, the reconnect policy and the
//! sizes of the passive observers. Defaults match what the status authority
//! expects from well-behaved clients.

use std::time::Duration;

use tracing::warn;

use super::transport::ReconnectPolicy;
use crate::event_log::DEFAULT_CAPACITY;

/// Default cadence of the fallback poller.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Lowest polling cadence accepted when limits are enforced.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Default bound for the push channel to reach `open`.
pub const DEFAULT_PUSH_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
/// Default keepalive cadence while the push channel is open.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);
/// Lowest keepalive cadence accepted when limits are enforced.
pub const MIN_PING_INTERVAL: Duration = Duration::from_secs(1);
/// Default silence tolerated on an open push channel before it is dropped.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(50);
/// Default time the push channel must stay open before polling is suspended.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
/// Default countdown refresh cadence.
pub const DEFAULT_COUNTDOWN_TICK: Duration = Duration::from_secs(1);
/// Upper bound on reconnect attempts accepted when limits are enforced.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 20;

/// Configuration values that control a session's background tasks.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between fallback polls; also bounds each poll request.
    pub poll_interval: Duration,
    /// Time allowed for the push channel handshake.
    pub push_open_timeout: Duration,
    /// Keepalive ping cadence while the push channel is open.
    pub ping_interval: Duration,
    /// Longest silence from the server before the push channel counts as dead.
    pub pong_timeout: Duration,
    /// How long the push channel must stay open before the poller is suspended.
    pub grace_period: Duration,
    /// Countdown refresh cadence.
    pub countdown_tick: Duration,
    /// Number of entries kept by the event log.
    pub event_log_capacity: usize,
    /// Backoff and attempt budget for push channel reconnects.
    pub reconnect: ReconnectPolicy,
    /// When false the session relies on polling alone.
    pub enable_push: bool,
    /// When false `sanitise` skips clamping (intended for tests only).
    pub enforce_limits: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            push_open_timeout: DEFAULT_PUSH_OPEN_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            countdown_tick: DEFAULT_COUNTDOWN_TICK,
            event_log_capacity: DEFAULT_CAPACITY,
            reconnect: ReconnectPolicy::default(),
            enable_push: true,
            enforce_limits: true,
        }
    }
}

impl SessionConfig {
    /// Clamps out-of-range values back to safe defaults.
    pub(crate) fn sanitise(mut self) -> Self {
        if !self.enforce_limits {
            return self;
        }

        if self.poll_interval < MIN_POLL_INTERVAL {
            warn!(
                "poll interval {:?} is below the minimum {:?}; using {:?}",
                self.poll_interval, MIN_POLL_INTERVAL, DEFAULT_POLL_INTERVAL
            );
            self.poll_interval = DEFAULT_POLL_INTERVAL;
        }
        if self.push_open_timeout.is_zero() {
            warn!(
                "push open timeout must be > 0; using {:?}",
                DEFAULT_PUSH_OPEN_TIMEOUT
            );
            self.push_open_timeout = DEFAULT_PUSH_OPEN_TIMEOUT;
        }
        if self.ping_interval < MIN_PING_INTERVAL {
            warn!(
                "ping interval {:?} is below the minimum {:?}; using {:?}",
                self.ping_interval, MIN_PING_INTERVAL, DEFAULT_PING_INTERVAL
            );
            self.ping_interval = DEFAULT_PING_INTERVAL;
        }
        if self.pong_timeout <= self.ping_interval {
            let aligned = self.ping_interval * 2;
            warn!(
                "pong timeout {:?} does not exceed the ping interval {:?}; using {:?}",
                self.pong_timeout, self.ping_interval, aligned
            );
            self.pong_timeout = aligned;
        }
        if self.countdown_tick.is_zero() || self.countdown_tick > DEFAULT_COUNTDOWN_TICK {
            warn!(
                "countdown tick {:?} outside (0, {:?}]; using the default",
                self.countdown_tick, DEFAULT_COUNTDOWN_TICK
            );
            self.countdown_tick = DEFAULT_COUNTDOWN_TICK;
        }
        if self.event_log_capacity == 0 {
            warn!(
                "event log capacity must be > 0; using {}",
                DEFAULT_CAPACITY
            );
            self.event_log_capacity = DEFAULT_CAPACITY;
        }
        if self.reconnect.max_attempts > MAX_RECONNECT_ATTEMPTS {
            warn!(
                "reconnect attempts {} above maximum {}; reducing",
                self.reconnect.max_attempts, MAX_RECONNECT_ATTEMPTS
            );
            self.reconnect.max_attempts = MAX_RECONNECT_ATTEMPTS;
        }
        if self.reconnect.base_delay.is_zero() {
            self.reconnect.base_delay = ReconnectPolicy::default().base_delay;
        }
        if self.reconnect.max_delay < self.reconnect.base_delay {
            warn!(
                "reconnect max delay {:?} below base {:?}; aligning",
                self.reconnect.max_delay, self.reconnect.base_delay
            );
            self.reconnect.max_delay = self.reconnect.base_delay;
        }

        self
    }
}
