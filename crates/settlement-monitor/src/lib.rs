//! Public entry points for the settlement monitor crate.
//!
//! The crate follows one externally confirmed payment through a remote status
//! authority: a push channel delivers updates while it is healthy, a poller
//! fills every gap, and a single reducer applies both streams to a channel
//! state machine that never moves backwards.

pub mod channel;
pub mod config;
pub mod countdown;
pub mod event_log;
pub mod http;
pub mod service;
pub mod store;
pub mod telemetry;

pub use channel::{
    ApplyOutcome, Channel, ChannelDescriptor, ChannelPhase, ChannelStatus, IgnoreReason,
    PayloadError, PaymentInstruction,
};
pub use config::MonitorEnv;
pub use countdown::Countdown;
pub use event_log::{EventLog, LogEntry, Severity};
pub use http::{Auth, CreateOutcome, HttpClient, HttpClientOptions, HttpError, PaymentIntent};
pub use service::{
    CloseKind, ReconnectPolicy, Session, SessionConfig, SessionError, SessionResolver,
    SessionSnapshot, SessionTelemetry, TransportState, UpdateSource, Verification,
};
pub use store::{ChannelIdStore, FileStore, MemoryStore, StoreError, UrlStore};
pub use telemetry::{CountingTelemetry, TelemetrySnapshot};
