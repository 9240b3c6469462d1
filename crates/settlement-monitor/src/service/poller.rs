//! Fallback status polling.
//!
//! The poller is always running but only fetches while its activation flag is
//! set. Activation (first start or resumption after a suspension) polls
//! immediately, then every `poll_interval`. Each request is bounded by the
//! same interval so a slow authority never stacks requests.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::debug;

use super::core::SessionShared;
use super::state::{SessionEvent, UpdateSource};
use crate::http::HttpError;

impl SessionShared {
    /// Runs the poller until the session is torn down.
    pub(crate) async fn run_fallback_poller(self: Arc<Self>, mut active_rx: watch::Receiver<bool>) {
        loop {
            while !*active_rx.borrow_and_update() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return,
                    changed = active_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }

            debug!(channel_id = %self.channel_id, "fallback poller active");
            let mut ticker = interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return,
                    changed = active_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if !*active_rx.borrow_and_update() {
                            debug!(channel_id = %self.channel_id, "fallback poller suspended");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return,
                            _ = self.poll_once() => {}
                        }
                    }
                }
            }
        }
    }

    /// Fetches the current status once and posts the outcome to the reducer.
    pub(crate) async fn poll_once(&self) {
        let bound = self.config.poll_interval;
        let result = timeout(bound, self.http_client.fetch_status(&self.channel_id)).await;
        let event = match result {
            Ok(Ok(descriptor)) => SessionEvent::StatusUpdate {
                source: UpdateSource::Poll,
                descriptor,
            },
            Ok(Err(HttpError::Payload(err))) => SessionEvent::MalformedPayload {
                source: UpdateSource::Poll,
                error: err.to_string(),
            },
            Ok(Err(err)) => SessionEvent::PollFailed {
                error: err.to_string(),
            },
            Err(_) => SessionEvent::PollFailed {
                error: format!("status request exceeded {bound:?}"),
            },
        };
        self.telemetry
            .on_poll(matches!(event, SessionEvent::StatusUpdate { .. }));
        self.post(event).await;
    }
}
