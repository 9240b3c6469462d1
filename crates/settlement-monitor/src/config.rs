//! Environment-driven helpers for bootstrapping a monitor.
//!
//! Hosts that configure the monitor through the process environment can use
//! [`MonitorEnv`] to derive the base URL, credentials and the few timing knobs
//! worth exposing, then layer them onto a [`SessionConfig`].

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::http::{Auth, HttpClient, HttpClientOptions, HttpError};
use crate::service::SessionConfig;

/// Base URL of the status authority (scheme + host).
const ENV_URL: &str = "SETTLEMENT_MONITOR_URL";
/// Explicit websocket URL; derived from the base URL when unset.
const ENV_PUSH_URL: &str = "SETTLEMENT_MONITOR_PUSH_URL";
/// API key sent with every request and the websocket handshake.
const ENV_API_KEY: &str = "SETTLEMENT_MONITOR_API_KEY";
/// Disables the push channel entirely (poll-only sessions).
const ENV_PUSH_ENABLED: &str = "SETTLEMENT_MONITOR_PUSH_ENABLED";
/// Fallback polling cadence in seconds.
const ENV_POLL_INTERVAL_SECS: &str = "SETTLEMENT_MONITOR_POLL_INTERVAL_SECS";
/// Reconnect attempts allowed before a session falls back to polling.
const ENV_MAX_RECONNECTS: &str = "SETTLEMENT_MONITOR_MAX_RECONNECTS";
/// Allows plaintext endpoints (local development only).
const ENV_NO_TLS: &str = "SETTLEMENT_MONITOR_NO_TLS";

/// Environment-derived options used to build the HTTP client and session config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEnv {
    pub base_url: Option<String>,
    pub push_url: Option<String>,
    pub api_key: Option<String>,
    pub push_enabled: bool,
    pub poll_interval: Option<Duration>,
    pub max_reconnects: Option<u32>,
    pub no_tls: bool,
}

impl MonitorEnv {
    /// Builds settings from the current process environment.
    pub fn from_os_env() -> Self {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from an iterator of key/value pairs (typically for tests).
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |key: &str| map.get(key).and_then(|value| sanitize_non_empty(value));

        Self {
            base_url: get(ENV_URL).map(|url| url.trim_end_matches('/').to_string()),
            push_url: get(ENV_PUSH_URL),
            api_key: get(ENV_API_KEY),
            push_enabled: parse_bool(map.get(ENV_PUSH_ENABLED).map(String::as_str), true),
            poll_interval: get(ENV_POLL_INTERVAL_SECS)
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            max_reconnects: get(ENV_MAX_RECONNECTS).and_then(|value| value.parse::<u32>().ok()),
            no_tls: parse_bool(map.get(ENV_NO_TLS).map(String::as_str), false),
        }
    }

    pub fn to_auth(&self) -> Auth {
        Auth {
            api_key: self.api_key.clone(),
        }
    }

    /// Builds the HTTP client, or `None` when no base URL is configured.
    pub fn http_client(&self) -> Option<Result<HttpClient, HttpError>> {
        let base_url = self.base_url.as_ref()?;
        let options = HttpClientOptions {
            allow_plaintext: self.no_tls,
            ..Default::default()
        };
        Some(
            HttpClient::new(base_url.clone(), &self.to_auth(), options).map(|client| {
                match &self.push_url {
                    Some(push_url) => client.with_push_url(push_url.clone()),
                    None => client,
                }
            }),
        )
    }

    /// Layers the environment overrides onto `config`.
    pub fn apply_to(&self, mut config: SessionConfig) -> SessionConfig {
        config.enable_push = self.push_enabled;
        if let Some(interval) = self.poll_interval {
            config.poll_interval = interval;
        }
        if let Some(max_attempts) = self.max_reconnects {
            config.reconnect.max_attempts = max_attempts;
        }
        config
    }
}

/// Helper trimming whitespace and discarding empty values.
fn sanitize_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parses boolean values from strings, falling back to the provided default.
fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|s| s.trim().to_ascii_lowercase()) {
        Some(ref v) if ["1", "true", "t", "yes", "y"].contains(&v.as_str()) => true,
        Some(ref v) if ["0", "false", "f", "no", "n"].contains(&v.as_str()) => false,
        _ => default,
    }
}
