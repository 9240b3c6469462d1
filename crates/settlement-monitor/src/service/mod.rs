//! Session service module facade.
//!
//! Re-exports the session API while wiring the submodules that implement the
//! reducer, the fallback poller, the push channel and the countdown ticker.

pub(crate) mod config;
mod core;
mod countdown;
mod poller;
pub(crate) mod resolver;
pub(crate) mod state;
pub(crate) mod telemetry;
#[cfg(test)]
pub(crate) mod test_support;
pub(crate) mod transport;
pub(crate) mod websocket;

pub use config::SessionConfig;
pub use core::{Session, SessionError};
pub use resolver::SessionResolver;
pub use state::{SessionSnapshot, TransportState, UpdateSource, Verification};
pub use telemetry::SessionTelemetry;
pub use transport::{CloseKind, ReconnectPolicy};
