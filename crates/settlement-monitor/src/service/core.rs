//! Session orchestration.
//!
//! A [`Session`] owns every background task watching one channel: the
//! reducer draining the inbound event queue, the fallback poller, the
//! transport manager and the countdown ticker. All of them share a
//! [`SessionShared`] and a cancellation token; cancelling the token tears the
//! whole session down as a unit.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::SessionConfig;
use super::state::{
    PaymentNotice, SessionEvent, SessionSnapshot, SessionState, TransportState, UpdateSource,
    Verification,
};
use super::telemetry::SessionTelemetry;
use crate::channel::{ApplyOutcome, Channel, ChannelDescriptor, ChannelStatus, PayloadError};
use crate::countdown::Countdown;
use crate::event_log::{EventLog, LogEntry, Severity};
use crate::http::{HttpClient, HttpError};
use crate::store::{ChannelIdStore, StoreError};

/// Capacity of the inbound event queue.
const EVENT_QUEUE_CAPACITY: usize = 64;
/// Time each task gets to wind down during [`Session::shutdown`].
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Error type surfaced by session creation and resumption.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The authority refused or failed to create a channel.
    #[error("failed to create channel: {0}")]
    Create(#[source] HttpError),
    /// The persisted channel could not be resumed; its id was cleared.
    #[error("failed to resume channel {channel_id}: {source}")]
    Resume {
        channel_id: String,
        #[source]
        source: HttpError,
    },
    /// The channel id store failed.
    #[error("channel id store error: {0}")]
    Store(#[from] StoreError),
    /// The authority returned a descriptor that cannot seed a channel.
    #[error("invalid channel payload: {0}")]
    Payload(#[from] PayloadError),
}

/// Shared session internals used by background tasks and the handle.
pub(crate) struct SessionShared {
    pub(crate) channel_id: String,
    pub(crate) config: SessionConfig,
    pub(crate) http_client: HttpClient,
    pub(crate) store: Arc<dyn ChannelIdStore>,
    /// Mutable state guarded by a mutex.
    pub(crate) state: Mutex<SessionState>,
    pub(crate) event_log: EventLog,
    pub(crate) telemetry: Arc<dyn SessionTelemetry>,
    /// Inbound queue drained by the reducer.
    pub(crate) events_tx: mpsc::Sender<SessionEvent>,
    /// Poller activation flag.
    pub(crate) poller_active: watch::Sender<bool>,
    /// Latest accepted status, for callers awaiting changes.
    pub(crate) status_tx: watch::Sender<ChannelStatus>,
    /// Wakes the push connection when a `payment_sent` notice is queued.
    pub(crate) payment_notify: Notify,
    /// Manual retry requests for the transport manager.
    pub(crate) retry_tx: mpsc::Sender<()>,
    pub(crate) cancel: CancellationToken,
}

impl std::fmt::Debug for SessionShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionShared")
            .field("channel_id", &self.channel_id)
            .field("config", &self.config)
            .finish()
    }
}

impl SessionShared {
    /// Posts an event for the reducer; dropped once the session is gone.
    pub(crate) async fn post(&self, event: SessionEvent) {
        if self.events_tx.send(event).await.is_err() {
            debug!(channel_id = %self.channel_id, "session reducer stopped; dropping event");
        }
    }

    pub(crate) async fn set_transport_state(&self, next: TransportState) {
        let changed = {
            let mut state = self.state.lock().await;
            // A torn-down session only ever reports `Closed`.
            if next != TransportState::Closed && self.cancel.is_cancelled() {
                return;
            }
            let changed = state.transport_state != next;
            state.transport_state = next;
            changed
        };
        if changed {
            debug!(channel_id = %self.channel_id, state = next.as_str(), "push channel state changed");
            self.telemetry.on_transport_state(next);
        }
    }

    /// Turns the poller on; a fresh activation polls immediately.
    pub(crate) fn activate_poller(&self, reason: &str) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let changed = self.poller_active.send_if_modified(|active| {
            if *active {
                false
            } else {
                *active = true;
                true
            }
        });
        if changed {
            info!(channel_id = %self.channel_id, reason, "fallback polling resumed");
            self.event_log
                .add("Periodic status checks resumed", Severity::Info);
        }
        changed
    }

    /// Pauses the poller while the push channel carries updates.
    pub(crate) fn suspend_poller(&self, reason: &str) -> bool {
        let changed = self.poller_active.send_if_modified(|active| {
            if *active {
                *active = false;
                true
            } else {
                false
            }
        });
        if changed {
            info!(channel_id = %self.channel_id, reason, "fallback polling suspended");
        }
        changed
    }

    /// Drains the inbound queue until teardown or a terminal status.
    pub(crate) async fn run_reducer(self: Arc<Self>, mut events_rx: mpsc::Receiver<SessionEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(event).await;
            if self.cancel.is_cancelled() {
                break;
            }
        }
        debug!(channel_id = %self.channel_id, "session reducer stopped");
    }

    pub(crate) async fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::StatusUpdate { source, descriptor } => {
                self.apply_update(source, descriptor).await;
            }
            SessionEvent::MalformedPayload { source, error } => {
                self.state.lock().await.updates_discarded += 1;
                self.telemetry.on_malformed_payload(source);
                self.event_log.add(
                    format!("Discarded malformed {} update: {error}", source.as_str()),
                    Severity::Warning,
                );
            }
            SessionEvent::PollFailed { error } => {
                let newly_unverified = {
                    let mut state = self.state.lock().await;
                    let before = state.verification;
                    state.mark_unverified(error.clone());
                    before == Verification::Verified
                        && state.verification == Verification::Unverified
                };
                warn!(channel_id = %self.channel_id, error = %error, "status poll failed");
                if newly_unverified {
                    self.event_log.add(
                        format!("Status could not be confirmed ({error}); showing last known status"),
                        Severity::Warning,
                    );
                }
            }
            SessionEvent::Expired => {
                if self.state.lock().await.channel.is_terminal() {
                    return;
                }
                let mut descriptor =
                    ChannelDescriptor::new(self.channel_id.clone(), ChannelStatus::Expired);
                descriptor.status_message = Some("Payment window elapsed".to_string());
                self.apply_update(UpdateSource::Countdown, descriptor).await;
            }
        }
    }

    /// Runs one descriptor through the state machine and reacts to the outcome.
    async fn apply_update(&self, source: UpdateSource, descriptor: ChannelDescriptor) {
        let (outcome, status, progress, confirmations) = {
            let mut state = self.state.lock().await;
            if source != UpdateSource::Countdown && descriptor.channel_id == self.channel_id {
                state.mark_verified();
            }
            let outcome = state.channel.apply(&descriptor);
            if outcome.is_applied() {
                state.updates_applied += 1;
            } else {
                state.updates_discarded += 1;
            }
            if state.channel.is_terminal() {
                state.clear_countdown();
            }
            (
                outcome,
                state.channel.status,
                state.channel.progress,
                state.channel.confirmations,
            )
        };

        match outcome {
            ApplyOutcome::Advanced { from, to } => {
                self.status_tx.send_replace(to);
                self.telemetry.on_status_applied(to, source);
                info!(
                    channel_id = %self.channel_id,
                    from = from.as_str(),
                    to = to.as_str(),
                    source = source.as_str(),
                    progress,
                    "channel status advanced"
                );
                self.event_log
                    .add(format!("{} ({progress}%)", to.label()), severity_for(to));
                if to.is_terminal() {
                    self.finish(to).await;
                }
            }
            ApplyOutcome::Refreshed => {
                self.telemetry.on_status_applied(status, source);
                debug!(
                    channel_id = %self.channel_id,
                    source = source.as_str(),
                    progress,
                    confirmations,
                    "channel progress refreshed"
                );
                self.event_log.add(
                    format!(
                        "{}: {progress}% ({confirmations} confirmation{})",
                        status.label(),
                        if confirmations == 1 { "" } else { "s" }
                    ),
                    Severity::Info,
                );
            }
            ApplyOutcome::Ignored(reason) => {
                self.telemetry.on_update_discarded(reason, source);
                debug!(
                    channel_id = %self.channel_id,
                    source = source.as_str(),
                    incoming = descriptor.status.as_str(),
                    current = status.as_str(),
                    reason = reason.as_str(),
                    "update ignored"
                );
            }
        }
    }

    /// Tears the session down after a terminal status.
    async fn finish(&self, status: ChannelStatus) {
        if status == ChannelStatus::Completed {
            self.clear_persisted_id();
        }
        self.poller_active.send_replace(false);
        self.cancel.cancel();
        self.set_transport_state(TransportState::Closed).await;
        info!(channel_id = %self.channel_id, status = status.as_str(), "session finished");
    }

    fn clear_persisted_id(&self) {
        match self.store.clear() {
            Ok(()) => debug!(channel_id = %self.channel_id, "cleared persisted channel id"),
            Err(err) => warn!(channel_id = %self.channel_id, "failed to clear persisted channel id: {err}"),
        }
    }
}

fn severity_for(status: ChannelStatus) -> Severity {
    match status {
        ChannelStatus::Completed => Severity::Success,
        ChannelStatus::Failed | ChannelStatus::Expired => Severity::Error,
        _ => Severity::Info,
    }
}

/// Handle to a running monitoring session.
///
/// Dropping the handle cancels every background task; [`Session::shutdown`]
/// additionally waits for them to exit.
pub struct Session {
    shared: Arc<SessionShared>,
    join_handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("channel_id", &self.shared.channel_id)
            .field("join_handles", &self.join_handles.len())
            .finish()
    }
}

impl Session {
    /// Starts watching `channel`. Must be called from within a tokio runtime.
    ///
    /// A channel that is already terminal yields a finished session without
    /// background tasks.
    pub(crate) fn start(
        http_client: HttpClient,
        store: Arc<dyn ChannelIdStore>,
        channel: Channel,
        config: SessionConfig,
        telemetry: Arc<dyn SessionTelemetry>,
    ) -> Self {
        let config = config.sanitise();
        let terminal = channel.is_terminal();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (poller_active, active_rx) = watch::channel(!terminal);
        let (status_tx, _) = watch::channel(channel.status);
        let (retry_tx, retry_rx) = mpsc::channel(1);
        let event_log = EventLog::new(config.event_log_capacity);
        event_log.add(
            format!("Tracking channel {}: {}", channel.id, channel.status.label()),
            Severity::Info,
        );

        let shared = Arc::new(SessionShared {
            channel_id: channel.id.clone(),
            config,
            http_client,
            store,
            state: Mutex::new(SessionState::new(channel)),
            event_log,
            telemetry,
            events_tx,
            poller_active,
            status_tx,
            payment_notify: Notify::new(),
            retry_tx,
            cancel: CancellationToken::new(),
        });

        if terminal {
            let status = *shared.status_tx.borrow();
            if status == ChannelStatus::Completed {
                shared.clear_persisted_id();
            }
            shared
                .event_log
                .add(format!("Channel already {}", status.as_str()), severity_for(status));
            shared.cancel.cancel();
            return Self {
                shared,
                join_handles: Vec::new(),
            };
        }

        let join_handles = vec![
            tokio::spawn(shared.clone().run_reducer(events_rx)),
            tokio::spawn(shared.clone().run_fallback_poller(active_rx)),
            tokio::spawn(shared.clone().run_transport_manager(retry_rx)),
            tokio::spawn(shared.clone().run_countdown()),
        ];
        info!(channel_id = %shared.channel_id, push = shared.config.enable_push, "session started");
        Self {
            shared,
            join_handles,
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.channel_id
    }

    /// Copy of the channel as currently held.
    pub async fn channel(&self) -> Channel {
        self.shared.state.lock().await.channel.clone()
    }

    pub fn status(&self) -> ChannelStatus {
        *self.shared.status_tx.borrow()
    }

    pub async fn progress(&self) -> u8 {
        self.shared.state.lock().await.channel.progress
    }

    pub async fn countdown(&self) -> Countdown {
        self.shared.state.lock().await.countdown
    }

    /// Event log entries, oldest first.
    pub fn events(&self) -> Vec<LogEntry> {
        self.shared.event_log.entries()
    }

    pub async fn transport_state(&self) -> TransportState {
        self.shared.state.lock().await.transport_state
    }

    pub async fn reconnect_attempts(&self) -> u32 {
        self.shared.state.lock().await.reconnect_attempts
    }

    pub fn polling_active(&self) -> bool {
        *self.shared.poller_active.borrow()
    }

    /// Returns `true` once the session was torn down.
    pub fn is_finished(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let polling_active = self.polling_active();
        self.shared.state.lock().await.snapshot(polling_active)
    }

    /// Receiver notified on every status change.
    pub fn status_watch(&self) -> watch::Receiver<ChannelStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Waits for a terminal status, or returns the last status on teardown.
    pub async fn wait_terminal(&self) -> ChannelStatus {
        let mut status_rx = self.shared.status_tx.subscribe();
        loop {
            let status = *status_rx.borrow_and_update();
            if status.is_terminal() || self.shared.cancel.is_cancelled() {
                return status;
            }
            tokio::select! {
                _ = self.shared.cancel.cancelled() => return *status_rx.borrow(),
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return *status_rx.borrow();
                    }
                }
            }
        }
    }

    /// Resets the reconnect budget and re-attempts the push channel.
    ///
    /// Polling continues regardless. No-op once the session finished.
    pub async fn retry(&self) {
        if self.is_finished() {
            return;
        }
        if !self.shared.config.enable_push {
            debug!(channel_id = %self.shared.channel_id, "push channel disabled; retry ignored");
            return;
        }
        {
            let mut state = self.shared.state.lock().await;
            state.reconnect_attempts = 0;
            state.polling_only = false;
        }
        self.shared
            .event_log
            .add("Retrying live updates", Severity::Info);
        if self.shared.retry_tx.try_send(()).is_err() {
            debug!(channel_id = %self.shared.channel_id, "retry already pending");
        }
    }

    /// Tells the authority (over the push channel) that the payer sent funds.
    ///
    /// Delivered once; if the push channel is down the notice is replayed
    /// when it next opens.
    pub async fn notify_payment_sent(&self, proof_reference: Option<String>) {
        if self.is_finished() {
            return;
        }
        {
            let mut state = self.shared.state.lock().await;
            if matches!(&state.payment_notice, Some(notice) if notice.delivered) {
                debug!(channel_id = %self.shared.channel_id, "payment_sent already delivered");
                return;
            }
            state.payment_notice = Some(PaymentNotice {
                proof_reference,
                delivered: false,
            });
        }
        self.shared
            .event_log
            .add("Payment marked as sent", Severity::Info);
        self.shared.payment_notify.notify_one();
    }

    /// Stops every background task and waits for them to exit.
    pub async fn shutdown(mut self) {
        let shared = self.shared.clone();
        let was_running = !shared.cancel.is_cancelled();
        shared.cancel.cancel();
        for mut handle in std::mem::take(&mut self.join_handles) {
            if timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                handle.abort();
                let _ = handle.await;
            }
        }
        shared.poller_active.send_replace(false);
        shared.set_transport_state(TransportState::Closed).await;
        if was_running {
            shared.event_log.add("Monitoring stopped", Severity::Info);
        }
    }

    #[cfg(test)]
    pub(crate) fn shared_for_tests(&self) -> Arc<SessionShared> {
        self.shared.clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
