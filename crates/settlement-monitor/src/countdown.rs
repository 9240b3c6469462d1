//! Remaining-time view derived from a channel's expiry timestamp.

use serde::Serialize;
use time::OffsetDateTime;

/// Broken-down time left before a channel expires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Countdown {
    pub hours: u64,
    pub minutes: u8,
    pub seconds: u8,
    pub total_ms_remaining: u64,
}

impl Countdown {
    /// Computes the view for `expires_at - now`, saturating at zero.
    pub fn until(expires_at: OffsetDateTime, now: OffsetDateTime) -> Self {
        let remaining = expires_at - now;
        let total_ms = remaining.whole_milliseconds();
        if total_ms <= 0 {
            return Self::default();
        }
        let total_ms_remaining = u64::try_from(total_ms).unwrap_or(u64::MAX);
        let total_secs = total_ms_remaining / 1000;
        Self {
            hours: total_secs / 3600,
            minutes: ((total_secs / 60) % 60) as u8,
            seconds: (total_secs % 60) as u8,
            total_ms_remaining,
        }
    }

    /// Returns `true` once no time is left.
    pub fn is_elapsed(&self) -> bool {
        self.total_ms_remaining == 0
    }

    /// Renders `HH:MM:SS`.
    pub fn label(&self) -> String {
        format!("{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds)
    }
}
