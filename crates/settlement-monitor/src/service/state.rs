//! Mutable session state and the read-only snapshots derived from it.
//!
//! The reducer is the only writer of the channel copy held here; the
//! transport manager and the countdown ticker update their own bookkeeping
//! fields under the same lock. Callers only ever see [`SessionSnapshot`]s.

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::channel::{Channel, ChannelDescriptor, ChannelPhase};
use crate::countdown::Countdown;

/// Push channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Connecting,
    Open,
    Closed,
}

impl TransportState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

/// Whether the displayed status was recently confirmed by the authority.
///
/// A session is `Unverified` after a status fetch failed while the push
/// channel was not open. Success is never inferred from a connection alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    Verified,
    Unverified,
}

/// Transport that delivered a status payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    Push,
    Poll,
    /// Synthesised locally by the countdown when the expiry passed.
    Countdown,
}

impl UpdateSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Poll => "poll",
            Self::Countdown => "countdown",
        }
    }
}

/// Messages posted onto the session's inbound queue.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    StatusUpdate {
        source: UpdateSource,
        descriptor: ChannelDescriptor,
    },
    MalformedPayload {
        source: UpdateSource,
        error: String,
    },
    PollFailed {
        error: String,
    },
    /// The countdown reached zero.
    Expired,
}

/// Pending `payment_sent` notification for the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PaymentNotice {
    pub(crate) proof_reference: Option<String>,
    pub(crate) delivered: bool,
}

/// Internal structure encapsulating mutable session state guarded by a mutex.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) channel: Channel,
    pub(crate) transport_state: TransportState,
    pub(crate) reconnect_attempts: u32,
    /// Set once the transport manager gave up on the push channel.
    pub(crate) polling_only: bool,
    pub(crate) countdown: Countdown,
    pub(crate) countdown_active: bool,
    pub(crate) verification: Verification,
    pub(crate) last_verified: Option<Instant>,
    pub(crate) last_error: Option<String>,
    pub(crate) payment_notice: Option<PaymentNotice>,
    pub(crate) updates_applied: u64,
    pub(crate) updates_discarded: u64,
}

impl SessionState {
    pub(crate) fn new(channel: Channel) -> Self {
        Self {
            channel,
            transport_state: TransportState::Closed,
            reconnect_attempts: 0,
            polling_only: false,
            countdown: Countdown::default(),
            countdown_active: false,
            verification: Verification::Verified,
            last_verified: Some(Instant::now()),
            last_error: None,
            payment_notice: None,
            updates_applied: 0,
            updates_discarded: 0,
        }
    }

    /// Records that the authority just confirmed the channel state.
    pub(crate) fn mark_verified(&mut self) {
        self.verification = Verification::Verified;
        self.last_verified = Some(Instant::now());
    }

    /// Records a failed confirmation attempt.
    ///
    /// The session only becomes unverified when no open push channel can
    /// vouch for the displayed status.
    pub(crate) fn mark_unverified(&mut self, error: String) {
        if self.transport_state != TransportState::Open {
            self.verification = Verification::Unverified;
        }
        self.last_error = Some(error);
    }

    /// Stops the countdown and zeroes its output.
    pub(crate) fn clear_countdown(&mut self) {
        self.countdown = Countdown::default();
        self.countdown_active = false;
    }

    pub(crate) fn snapshot(&self, polling_active: bool) -> SessionSnapshot {
        SessionSnapshot {
            channel: self.channel.clone(),
            phase: self.channel.status.phase(),
            transport_state: self.transport_state,
            reconnect_attempts: self.reconnect_attempts,
            polling_active,
            polling_only: self.polling_only,
            countdown: self.countdown,
            countdown_active: self.countdown_active,
            verification: self.verification,
            last_error: self.last_error.clone(),
            updates_applied: self.updates_applied,
            updates_discarded: self.updates_discarded,
        }
    }
}

/// Snapshot exposing the session state to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub channel: Channel,
    pub phase: ChannelPhase,
    pub transport_state: TransportState,
    pub reconnect_attempts: u32,
    pub polling_active: bool,
    pub polling_only: bool,
    pub countdown: Countdown,
    pub countdown_active: bool,
    pub verification: Verification,
    pub last_error: Option<String>,
    pub updates_applied: u64,
    pub updates_discarded: u64,
}

impl SessionSnapshot {
    /// Renders the snapshot as JSON for embedders exposing a status endpoint.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
