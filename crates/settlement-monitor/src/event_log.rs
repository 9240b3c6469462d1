//! Bounded, append-only diagnostic trail shown alongside a session.
//!
//! Entries are purely observational: nothing in the session reads them back
//! to make decisions. Every entry is also emitted as a `tracing` event so the
//! host's subscriber sees the same trail.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{error, info, warn};

/// Default number of entries retained.
pub const DEFAULT_CAPACITY: usize = 50;

/// Severity attached to a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// One line of the diagnostic trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub message: String,
    pub severity: Severity,
}

/// FIFO log that evicts its oldest entry once `capacity` is exceeded.
#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl EventLog {
    /// Creates an empty log; a zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Appends an entry, evicting the oldest one when full.
    pub fn add(&self, message: impl Into<String>, severity: Severity) {
        let message = message.into();
        match severity {
            Severity::Info | Severity::Success => info!(severity = ?severity, "{message}"),
            Severity::Warning => warn!("{message}"),
            Severity::Error => error!("{message}"),
        }
        let entry = LogEntry {
            timestamp: OffsetDateTime::now_utc(),
            message,
            severity,
        };
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Returns the retained entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
