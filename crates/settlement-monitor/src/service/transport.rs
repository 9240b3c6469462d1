//! Push channel supervision.
//!
//! The transport manager owns the push channel lifecycle: it runs one
//! connection at a time (see `websocket.rs`), classifies how each one ended
//! and decides between stopping, reconnecting with exponential backoff and
//! falling back to polling for good. Every closure re-activates the poller
//! before any reconnect is scheduled, so status updates keep flowing while
//! the push channel is down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, info, warn};

use super::core::SessionShared;
use super::state::TransportState;
use super::websocket::ConnectionEnd;
use crate::event_log::Severity;

/// Backoff and attempt budget applied to push channel reconnects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Reconnects allowed before the session falls back to polling only.
    pub max_attempts: u32,
    /// Growth factor between consecutive delays.
    pub factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            factor: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the reconnect following `attempts` previous ones.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let factor = if self.factor.is_finite() && self.factor >= 1.0 {
            self.factor
        } else {
            1.0
        };
        let scaled = self.base_delay.as_secs_f64() * factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }
}

/// How a push connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Clean close (code 1000); the server is done with us.
    Normal,
    /// The server rejected the protocol or handshake; retrying cannot help.
    Protocol,
    /// Anything else, including open timeouts and dropped sockets.
    Abnormal,
}

impl CloseKind {
    /// Classifies a websocket close code.
    pub fn from_close_code(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1002 | 1003 | 1007 | 1008 | 1009 => Self::Protocol,
            _ => Self::Abnormal,
        }
    }

    /// Classifies a websocket transport error.
    ///
    /// A peer vanishing without a close handshake and handshakes refused with
    /// a 5xx are transient; other protocol and handshake failures are not.
    pub(crate) fn from_ws_error(err: &WsError) -> Self {
        match err {
            WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => Self::Abnormal,
            WsError::Http(response) if response.status().is_server_error() => Self::Abnormal,
            WsError::Protocol(_)
            | WsError::Capacity(_)
            | WsError::Utf8
            | WsError::AttackAttempt
            | WsError::Url(_)
            | WsError::Http(_)
            | WsError::HttpFormat(_) => Self::Protocol,
            _ => Self::Abnormal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Protocol => "protocol",
            Self::Abnormal => "abnormal",
        }
    }
}

/// What the manager does after a connection ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum TransportDecision {
    /// Leave the push channel closed until a manual retry.
    Stop,
    /// Give up on push for this session; polling continues.
    FallbackToPolling,
    /// Reopen after `delay`; `attempt` is the new attempt counter.
    Reconnect { delay: Duration, attempt: u32 },
}

/// Maps a close classification and the attempts spent so far to a decision.
pub(crate) fn decide(policy: &ReconnectPolicy, kind: CloseKind, attempts: u32) -> TransportDecision {
    match kind {
        CloseKind::Normal => TransportDecision::Stop,
        CloseKind::Protocol => TransportDecision::FallbackToPolling,
        CloseKind::Abnormal if attempts < policy.max_attempts => TransportDecision::Reconnect {
            delay: policy.delay_for(attempts),
            attempt: attempts + 1,
        },
        CloseKind::Abnormal => TransportDecision::FallbackToPolling,
    }
}

impl SessionShared {
    /// Supervises push connections until the session is torn down.
    pub(crate) async fn run_transport_manager(self: Arc<Self>, mut retry_rx: mpsc::Receiver<()>) {
        if !self.config.enable_push {
            debug!(channel_id = %self.channel_id, "push channel disabled; polling only");
            self.state.lock().await.polling_only = true;
            return;
        }

        loop {
            // Retries requested while a connection was up are already satisfied.
            while retry_rx.try_recv().is_ok() {}

            let (kind, reason) = match self.run_push_connection().await {
                ConnectionEnd::Cancelled => {
                    self.set_transport_state(TransportState::Closed).await;
                    break;
                }
                ConnectionEnd::Closed { kind, reason } => (kind, reason),
            };
            self.set_transport_state(TransportState::Closed).await;
            if self.cancel.is_cancelled() {
                break;
            }
            self.activate_poller("push channel closed");

            let attempts = self.state.lock().await.reconnect_attempts;
            match decide(&self.config.reconnect, kind, attempts) {
                TransportDecision::Reconnect { delay, attempt } => {
                    self.state.lock().await.reconnect_attempts = attempt;
                    self.telemetry.on_reconnect_scheduled(attempt, delay);
                    info!(
                        channel_id = %self.channel_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "scheduling push channel reconnect"
                    );
                    self.event_log.add(
                        format!(
                            "Live updates interrupted ({reason}); reconnecting in {}s (attempt {attempt}/{})",
                            delay.as_secs_f64(),
                            self.config.reconnect.max_attempts
                        ),
                        Severity::Warning,
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        signal = retry_rx.recv() => {
                            if signal.is_none() {
                                break;
                            }
                            debug!(channel_id = %self.channel_id, "manual retry interrupted reconnect backoff");
                        }
                        _ = sleep(delay) => {}
                    }
                }
                TransportDecision::Stop => {
                    info!(channel_id = %self.channel_id, reason = %reason, "push channel closed by server");
                    self.event_log.add(
                        "Live updates ended by the server; continuing with periodic checks",
                        Severity::Info,
                    );
                    if !self.wait_for_retry(&mut retry_rx).await {
                        break;
                    }
                }
                TransportDecision::FallbackToPolling => {
                    self.state.lock().await.polling_only = true;
                    self.telemetry.on_polling_fallback(kind);
                    warn!(
                        channel_id = %self.channel_id,
                        close_kind = kind.as_str(),
                        attempts,
                        reason = %reason,
                        "push channel unavailable; falling back to polling"
                    );
                    self.event_log.add(
                        format!("Live updates unavailable ({reason}); switched to periodic checks"),
                        Severity::Warning,
                    );
                    if !self.wait_for_retry(&mut retry_rx).await {
                        break;
                    }
                }
            }
        }
        debug!(channel_id = %self.channel_id, "transport manager stopped");
    }

    /// Parks the manager until a manual retry; returns `false` on teardown.
    async fn wait_for_retry(&self, retry_rx: &mut mpsc::Receiver<()>) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            signal = retry_rx.recv() => signal.is_some(),
        }
    }
}
