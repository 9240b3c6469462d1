//! Channel data model and the status state machine.
//!
//! A channel is the unit the remote status authority tracks for one payment.
//! Statuses advance along a fixed rank order; the terminal statuses `failed`
//! and `expired` may interrupt the order at any point. [`Channel::apply`] is
//! the single place where an inbound descriptor is accepted or discarded, so
//! interleaved push and poll updates can never move a channel backwards.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

/// Upper bound for the advisory progress percentage.
pub const MAX_PROGRESS: u8 = 100;

/// Lifecycle states reported by the status authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Initializing,
    WaitingPayment,
    PaymentDetected,
    Confirming,
    Confirmed,
    Finalizing,
    Completed,
    Failed,
    Expired,
}

impl ChannelStatus {
    /// Position in the anti-regression order.
    ///
    /// `failed` and `expired` share the top rank with `completed`; they are
    /// terminal, so [`Channel::apply`] never compares them by rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::WaitingPayment => 1,
            Self::PaymentDetected => 2,
            Self::Confirming => 3,
            Self::Confirmed => 4,
            Self::Finalizing => 5,
            Self::Completed | Self::Failed | Self::Expired => 6,
        }
    }

    /// Returns `true` for statuses from which no further transition occurs.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }

    /// Wire representation (`waiting_payment`, `confirming`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::WaitingPayment => "waiting_payment",
            Self::PaymentDetected => "payment_detected",
            Self::Confirming => "confirming",
            Self::Confirmed => "confirmed",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// Short human-readable label for event log lines.
    pub fn label(self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::WaitingPayment => "Waiting for payment",
            Self::PaymentDetected => "Payment detected",
            Self::Confirming => "Confirming",
            Self::Confirmed => "Confirmed",
            Self::Finalizing => "Finalizing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Expired => "Expired",
        }
    }

    /// Coarse phase used by presentation layers instead of separate flags.
    pub fn phase(self) -> ChannelPhase {
        match self {
            Self::Initializing | Self::WaitingPayment => ChannelPhase::AwaitingPayment,
            Self::PaymentDetected | Self::Confirming | Self::Confirmed | Self::Finalizing => {
                ChannelPhase::Processing
            }
            Self::Completed => ChannelPhase::Succeeded,
            Self::Failed | Self::Expired => ChannelPhase::Failed,
        }
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presentation phase derived from [`ChannelStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPhase {
    /// Payment instructions should be shown.
    AwaitingPayment,
    /// Payment was seen and is clearing on the ledger.
    Processing,
    Succeeded,
    Failed,
}

/// Opaque payment instructions handed out at channel creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInstruction {
    pub amount_due: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_memo: Option<String>,
}

/// Channel payload as returned by `create`, `status` and `status_update` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDescriptor {
    pub channel_id: String,
    pub status: ChannelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_detail: Option<String>,
    #[serde(default)]
    pub progress: u32,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub confirmations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_instruction: Option<PaymentInstruction>,
}

impl ChannelDescriptor {
    /// Builds a bare descriptor carrying only an id and a status.
    pub fn new(channel_id: impl Into<String>, status: ChannelStatus) -> Self {
        Self {
            channel_id: channel_id.into(),
            status,
            status_message: None,
            status_detail: None,
            progress: 0,
            expires_at: None,
            confirmations: 0,
            payment_instruction: None,
        }
    }

    /// Rejects payloads that cannot describe a real channel.
    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.channel_id.trim().is_empty() {
            return Err(PayloadError::MissingChannelId);
        }
        if self.progress > u32::from(MAX_PROGRESS) {
            return Err(PayloadError::ProgressOutOfRange(self.progress));
        }
        Ok(())
    }

    /// Parses and validates a JSON descriptor.
    pub fn from_json(bytes: &[u8]) -> Result<Self, PayloadError> {
        let descriptor: Self = serde_json::from_slice(bytes)?;
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Malformed payloads are logged and discarded, never applied.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not a valid channel descriptor: {0}")]
    Json(#[from] serde_json::Error),
    #[error("channel descriptor has an empty channel id")]
    MissingChannelId,
    #[error("progress {0} is outside 0..=100")]
    ProgressOutOfRange(u32),
}

/// Why an update was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Lower rank than the status already held.
    Regression,
    /// Same status with nothing new.
    Duplicate,
    /// The channel already reached a terminal status.
    AlreadyTerminal,
    /// Descriptor addressed a different channel id.
    ForeignChannel,
}

impl IgnoreReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regression => "regression",
            Self::Duplicate => "duplicate",
            Self::AlreadyTerminal => "already-terminal",
            Self::ForeignChannel => "foreign-channel",
        }
    }
}

/// Result of [`Channel::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Status moved forward (or into a terminal status).
    Advanced {
        from: ChannelStatus,
        to: ChannelStatus,
    },
    /// Same status, but progress, confirmations or messages changed.
    Refreshed,
    Ignored(IgnoreReason),
}

impl ApplyOutcome {
    /// Returns `true` if the channel was mutated.
    pub fn is_applied(&self) -> bool {
        !matches!(self, Self::Ignored(_))
    }
}

/// Local copy of a tracked channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub status: ChannelStatus,
    pub status_message: Option<String>,
    pub status_detail: Option<String>,
    pub progress: u8,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub confirmations: u32,
    pub instruction: Option<PaymentInstruction>,
}

impl Channel {
    /// Builds the initial channel from a validated descriptor.
    pub fn from_descriptor(descriptor: ChannelDescriptor) -> Result<Self, PayloadError> {
        descriptor.validate()?;
        Ok(Self {
            id: descriptor.channel_id,
            status: descriptor.status,
            status_message: descriptor.status_message,
            status_detail: descriptor.status_detail,
            progress: clamp_progress(descriptor.progress),
            expires_at: descriptor.expires_at,
            confirmations: descriptor.confirmations,
            instruction: descriptor.payment_instruction,
        })
    }

    /// Returns `true` once the channel reached `completed`, `failed` or `expired`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies an inbound descriptor following the rank order.
    ///
    /// Terminal statuses are always accepted while the channel is live and
    /// never replaced once held. Same-status updates only ever raise
    /// `progress` and `confirmations`.
    pub fn apply(&mut self, update: &ChannelDescriptor) -> ApplyOutcome {
        if update.channel_id != self.id {
            return ApplyOutcome::Ignored(IgnoreReason::ForeignChannel);
        }
        if self.status.is_terminal() {
            return ApplyOutcome::Ignored(IgnoreReason::AlreadyTerminal);
        }

        let incoming = update.status;
        if incoming.is_terminal() || incoming.rank() > self.status.rank() {
            let from = self.status;
            self.status = incoming;
            self.status_message = update.status_message.clone();
            self.status_detail = update.status_detail.clone();
            self.merge_counters(update);
            self.adopt_fixed_fields(update);
            return ApplyOutcome::Advanced { from, to: incoming };
        }

        if incoming != self.status {
            return ApplyOutcome::Ignored(IgnoreReason::Regression);
        }

        let before = (
            self.progress,
            self.confirmations,
            self.status_message.clone(),
            self.status_detail.clone(),
        );
        if update.status_message.is_some() {
            self.status_message = update.status_message.clone();
        }
        if update.status_detail.is_some() {
            self.status_detail = update.status_detail.clone();
        }
        self.merge_counters(update);
        self.adopt_fixed_fields(update);
        let after = (
            self.progress,
            self.confirmations,
            self.status_message.clone(),
            self.status_detail.clone(),
        );
        if before == after {
            ApplyOutcome::Ignored(IgnoreReason::Duplicate)
        } else {
            ApplyOutcome::Refreshed
        }
    }

    fn merge_counters(&mut self, update: &ChannelDescriptor) {
        self.progress = self.progress.max(clamp_progress(update.progress));
        self.confirmations = self.confirmations.max(update.confirmations);
    }

    /// Instruction and expiry are set once and never overwritten.
    fn adopt_fixed_fields(&mut self, update: &ChannelDescriptor) {
        if self.instruction.is_none() {
            self.instruction = update.payment_instruction.clone();
        }
        if self.expires_at.is_none() {
            self.expires_at = update.expires_at;
        }
    }
}

fn clamp_progress(progress: u32) -> u8 {
    u8::try_from(progress.min(u32::from(MAX_PROGRESS))).unwrap_or(MAX_PROGRESS)
}
