//! Session-level telemetry abstractions.
//!
//! Embedders can implement [`SessionTelemetry`] to observe how updates are
//! applied and how the push channel behaves without reaching into session
//! state. Every hook defaults to a no-op.

use std::time::Duration;

use super::state::{TransportState, UpdateSource};
use super::transport::CloseKind;
use crate::channel::{ChannelStatus, IgnoreReason};

/// Telemetry hook invoked on significant session events.
pub trait SessionTelemetry: Send + Sync {
    /// Called when an update advanced or refreshed the channel.
    fn on_status_applied(&self, _status: ChannelStatus, _source: UpdateSource) {}
    /// Called when an update was rejected by the state machine.
    fn on_update_discarded(&self, _reason: IgnoreReason, _source: UpdateSource) {}
    /// Called when a payload could not be decoded.
    fn on_malformed_payload(&self, _source: UpdateSource) {}
    /// Called whenever the push channel changes state.
    fn on_transport_state(&self, _state: TransportState) {}
    /// Called when a reconnect is scheduled.
    fn on_reconnect_scheduled(&self, _attempt: u32, _delay: Duration) {}
    /// Called when the session gives up on the push channel.
    fn on_polling_fallback(&self, _kind: CloseKind) {}
    /// Called after each poll with whether it produced a descriptor.
    fn on_poll(&self, _success: bool) {}
}

/// Default telemetry implementation that performs no-ops.
#[derive(Debug, Default)]
pub(crate) struct NoopTelemetry;

impl SessionTelemetry for NoopTelemetry {}
