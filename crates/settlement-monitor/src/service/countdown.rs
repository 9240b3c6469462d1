//! Countdown ticker.
//!
//! Refreshes the session's countdown view from the channel's expiry on every
//! tick. The expiry may arrive with a later status update, so ticks before
//! that simply leave the view inactive.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use super::core::SessionShared;
use super::state::SessionEvent;
use crate::countdown::Countdown;

impl SessionShared {
    /// Runs the ticker until expiry, a terminal status or teardown.
    pub(crate) async fn run_countdown(self: Arc<Self>) {
        let mut ticker = interval(self.config.countdown_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let mut state = self.state.lock().await;
            if state.channel.is_terminal() {
                state.clear_countdown();
                return;
            }
            let Some(expires_at) = state.channel.expires_at else {
                continue;
            };
            let view = Countdown::until(expires_at, OffsetDateTime::now_utc());
            if view.is_elapsed() {
                state.clear_countdown();
                drop(state);
                debug!(channel_id = %self.channel_id, "countdown elapsed");
                self.post(SessionEvent::Expired).await;
                return;
            }
            state.countdown = view;
            state.countdown_active = true;
        }
    }
}
