//! Telemetry helpers for monitoring sessions.
//!
//! [`CountingTelemetry`] is a drop-in [`SessionTelemetry`] that keeps relaxed
//! atomic counters, handy for exposing metrics or asserting behaviour in
//! tests.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::channel::{ChannelStatus, IgnoreReason};
use crate::service::{CloseKind, SessionTelemetry, TransportState, UpdateSource};

/// Counting implementation of [`SessionTelemetry`].
#[derive(Debug, Default)]
pub struct CountingTelemetry {
    status_applied: AtomicU64,
    push_updates: AtomicU64,
    poll_updates: AtomicU64,
    updates_discarded: AtomicU64,
    regressions: AtomicU64,
    malformed_payloads: AtomicU64,
    transport_open: AtomicU64,
    transport_closed: AtomicU64,
    reconnects_scheduled: AtomicU64,
    polling_fallbacks: AtomicU64,
    poll_success: AtomicU64,
    poll_failure: AtomicU64,
    reconnect_delays: Mutex<Vec<Duration>>,
}

impl CountingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures a point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            status_applied: self.status_applied.load(Ordering::Relaxed),
            push_updates: self.push_updates.load(Ordering::Relaxed),
            poll_updates: self.poll_updates.load(Ordering::Relaxed),
            updates_discarded: self.updates_discarded.load(Ordering::Relaxed),
            regressions: self.regressions.load(Ordering::Relaxed),
            malformed_payloads: self.malformed_payloads.load(Ordering::Relaxed),
            transport_open: self.transport_open.load(Ordering::Relaxed),
            transport_closed: self.transport_closed.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            polling_fallbacks: self.polling_fallbacks.load(Ordering::Relaxed),
            poll_success: self.poll_success.load(Ordering::Relaxed),
            poll_failure: self.poll_failure.load(Ordering::Relaxed),
        }
    }

    /// Delays of every scheduled reconnect, in order.
    pub fn reconnect_delays(&self) -> Vec<Duration> {
        self.reconnect_delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SessionTelemetry for CountingTelemetry {
    fn on_status_applied(&self, _status: ChannelStatus, source: UpdateSource) {
        self.status_applied.fetch_add(1, Ordering::Relaxed);
        match source {
            UpdateSource::Push => self.push_updates.fetch_add(1, Ordering::Relaxed),
            UpdateSource::Poll => self.poll_updates.fetch_add(1, Ordering::Relaxed),
            UpdateSource::Countdown => 0,
        };
    }

    fn on_update_discarded(&self, reason: IgnoreReason, _source: UpdateSource) {
        self.updates_discarded.fetch_add(1, Ordering::Relaxed);
        if reason == IgnoreReason::Regression {
            self.regressions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_malformed_payload(&self, _source: UpdateSource) {
        self.malformed_payloads.fetch_add(1, Ordering::Relaxed);
    }

    fn on_transport_state(&self, state: TransportState) {
        match state {
            TransportState::Open => {
                self.transport_open.fetch_add(1, Ordering::Relaxed);
            }
            TransportState::Closed => {
                self.transport_closed.fetch_add(1, Ordering::Relaxed);
            }
            TransportState::Connecting => {}
        }
    }

    fn on_reconnect_scheduled(&self, _attempt: u32, delay: Duration) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
        self.reconnect_delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(delay);
    }

    fn on_polling_fallback(&self, _kind: CloseKind) {
        self.polling_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn on_poll(&self, success: bool) {
        if success {
            self.poll_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.poll_failure.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Plain data representation of [`CountingTelemetry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Updates that advanced or refreshed the channel.
    pub status_applied: u64,
    /// Applied updates delivered by the push channel.
    pub push_updates: u64,
    /// Applied updates delivered by the poller.
    pub poll_updates: u64,
    /// Updates rejected by the state machine.
    pub updates_discarded: u64,
    /// Rejections caused by a lower-ranked status.
    pub regressions: u64,
    /// Payloads that failed to decode or validate.
    pub malformed_payloads: u64,
    /// Push channel openings.
    pub transport_open: u64,
    /// Push channel closures.
    pub transport_closed: u64,
    /// Reconnects scheduled by the transport manager.
    pub reconnects_scheduled: u64,
    /// Permanent fallbacks to polling.
    pub polling_fallbacks: u64,
    /// Polls that returned a descriptor.
    pub poll_success: u64,
    /// Polls that failed or timed out.
    pub poll_failure: u64,
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status_applied={}, push_updates={}, poll_updates={}, updates_discarded={}, regressions={}, malformed_payloads={}, transport_open={}, transport_closed={}, reconnects_scheduled={}, polling_fallbacks={}, poll_success={}, poll_failure={}",
            self.status_applied,
            self.push_updates,
            self.poll_updates,
            self.updates_discarded,
            self.regressions,
            self.malformed_payloads,
            self.transport_open,
            self.transport_closed,
            self.reconnects_scheduled,
            self.polling_fallbacks,
            self.poll_success,
            self.poll_failure,
        )
    }
}
