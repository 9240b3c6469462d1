//! HTTP client for the remote status authority.
//!
//! Covers the two one-shot calls the monitor needs (`create` and `status`),
//! classifies HTTP failures into an error taxonomy the session can act on,
//! and builds the websocket handshake request for the push channel so
//! credentials flow through both transports.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::{
        header::{HeaderName as WsHeaderName, HeaderValue as WsHeaderValue},
        Request as WsRequest,
    },
};
use tracing::debug;

use crate::channel::{ChannelDescriptor, PayloadError};

/// Endpoint creating a new channel for a payment intent.
pub(crate) const CHANNELS_ENDPOINT: &str = "/api/v1/channels";
/// Websocket endpoint delivering `status_update` frames.
pub(crate) const STREAM_ENDPOINT: &str = "/api/v1/channels/stream";
/// Header carrying the optional API key.
const API_KEY_HEADER: &str = "x-api-key";
/// Default bound applied to every one-shot request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Credentials attached to every request.
#[derive(Debug, Clone, Default)]
pub struct Auth {
    pub api_key: Option<String>,
}

/// Additional options governing how the HTTP client is constructed.
#[derive(Debug, Clone, Copy)]
pub struct HttpClientOptions {
    /// Whether plaintext (HTTP) endpoints are allowed.
    pub allow_plaintext: bool,
    /// Upper bound for a single request.
    pub request_timeout: Duration,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            allow_plaintext: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Error taxonomy for calls against the status authority.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Unknown channel id (resume with a stale or foreign id).
    #[error("channel not found")]
    NotFound,
    /// A channel already exists for this intent.
    #[error("channel already exists for this intent")]
    Conflict {
        /// Id of the existing channel, when the backend returned one.
        channel_id: Option<String>,
    },
    /// Credentials were rejected.
    #[error("unauthorized: status {0}")]
    Unauthorized(u16),
    /// Remaining 4xx responses.
    #[error("request rejected: status {0}")]
    Rejected(u16),
    /// 5xx responses; safe to retry later.
    #[error("transient backend error: status {0}")]
    Retryable(u16),
    /// The provided URL violates the transport policy.
    #[error("insecure base url requires explicit opt-in: {0}")]
    InsecureUrl(String),
    /// The base URL or a derived URL could not be built.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// Transport-level issue (DNS, TLS, socket, timeout).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The response body was not a valid channel descriptor.
    #[error("malformed response: {0}")]
    Payload(#[from] PayloadError),
}

impl HttpError {
    /// Returns `true` when retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Retryable(_) => true,
            Self::Transport(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            _ => false,
        }
    }
}

/// Parameters sent to `create`. Everything besides the intent id is opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntent {
    /// Caller-side identifier used by the backend to detect duplicates.
    pub intent_id: String,
    /// Rail-specific parameters forwarded verbatim.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Result of a `create` call.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(ChannelDescriptor),
    /// The backend already tracks a channel for this intent.
    Existing { channel_id: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConflictBody {
    channel_id: Option<String>,
}

/// HTTP client encapsulating a reusable `reqwest::Client`, base URL and headers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    push_url: Option<String>,
    headers: Arc<RwLock<HeaderMap>>,
}

impl HttpClient {
    /// Builds a client for `base_url` (scheme + host, no trailing slash).
    pub fn new(
        base_url: impl Into<String>,
        auth: &Auth,
        options: HttpClientOptions,
    ) -> Result<Self, HttpError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !options.allow_plaintext && base_url.starts_with("http://") {
            return Err(HttpError::InsecureUrl(base_url));
        }
        Url::parse(&base_url).map_err(|err| HttpError::InvalidUrl(err.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("settlement-monitor/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = &auth.api_key {
            headers.insert(
                API_KEY_HEADER,
                HeaderValue::from_str(api_key).map_err(|_| HttpError::Rejected(400))?,
            );
        }

        let client = Client::builder()
            .use_rustls_tls()
            .timeout(options.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url,
            push_url: None,
            headers: Arc::new(RwLock::new(headers)),
        })
    }

    /// Overrides the websocket URL instead of deriving it from the base URL.
    pub fn with_push_url(mut self, push_url: impl Into<String>) -> Self {
        self.push_url = Some(push_url.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Replaces (or clears) the API key used for subsequent requests.
    pub async fn update_api_key(&self, api_key: Option<&str>) -> Result<(), HttpError> {
        let mut headers = self.headers.write().await;
        match api_key {
            Some(key) => {
                headers.insert(
                    API_KEY_HEADER,
                    HeaderValue::from_str(key).map_err(|_| HttpError::Rejected(400))?,
                );
            }
            None => {
                headers.remove(API_KEY_HEADER);
            }
        }
        Ok(())
    }

    /// Issues the one-shot creation request.
    ///
    /// A 409 carrying a `channelId` is not an error: it means the backend
    /// already has a channel for this intent and the caller should resume it.
    pub async fn create_channel(&self, intent: &PaymentIntent) -> Result<CreateOutcome, HttpError> {
        let body = serde_json::to_vec(intent).map_err(PayloadError::from)?;
        match self
            .send_request(Method::POST, self.channels_url(None)?, Some(body))
            .await
        {
            Ok(bytes) => Ok(CreateOutcome::Created(ChannelDescriptor::from_json(&bytes)?)),
            Err(HttpError::Conflict {
                channel_id: Some(channel_id),
            }) => Ok(CreateOutcome::Existing { channel_id }),
            Err(err) => Err(err),
        }
    }

    /// Fetches the full current status of a channel.
    pub async fn fetch_status(&self, channel_id: &str) -> Result<ChannelDescriptor, HttpError> {
        let url = self.channels_url(Some(channel_id))?;
        let bytes = self.send_request(Method::GET, url, None).await?;
        Ok(ChannelDescriptor::from_json(&bytes)?)
    }

    /// Resolves the channels endpoint, plus an optional channel id segment,
    /// against the base URL. The id is percent-encoded as one path segment.
    fn channels_url(&self, channel_id: Option<&str>) -> Result<Url, HttpError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|err| HttpError::InvalidUrl(err.to_string()))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| HttpError::InvalidUrl(self.base_url.clone()))?;
            segments
                .pop_if_empty()
                .extend(CHANNELS_ENDPOINT.split('/').filter(|segment| !segment.is_empty()));
            if let Some(channel_id) = channel_id {
                segments.push(channel_id);
            }
        }
        Ok(url)
    }

    /// Sends a request and returns the body of a successful response.
    async fn send_request(
        &self,
        method: Method,
        url: Url,
        body: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, HttpError> {
        let headers = self.headers.read().await.clone();
        debug!(
            method = %method,
            url = %url,
            headers = ?redact_headers(&headers),
            body_len = body.as_ref().map(Vec::len).unwrap_or(0),
            "status authority request"
        );

        let builder = self.client.request(method.clone(), url.clone()).headers(headers);
        let builder = match body {
            Some(bytes) => builder.body(bytes),
            None => builder,
        };
        let response = builder.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        debug!(
            method = %method,
            url = %url,
            status = %status,
            body_len = bytes.len(),
            "status authority response"
        );

        if status == StatusCode::CONFLICT {
            let channel_id = serde_json::from_slice::<ConflictBody>(&bytes)
                .ok()
                .and_then(|body| body.channel_id)
                .filter(|id| !id.trim().is_empty());
            return Err(HttpError::Conflict { channel_id });
        }
        classify_status(status)?;
        Ok(bytes.to_vec())
    }

    /// Builds the websocket handshake request for the push channel.
    ///
    /// The HTTP(S) base URL is rewritten to WS(S) unless an explicit push URL
    /// was configured; stored headers are copied so the API key is presented
    /// during the upgrade.
    pub async fn push_request(&self) -> Result<WsRequest<()>, HttpError> {
        let mut url = match &self.push_url {
            Some(push_url) => {
                Url::parse(push_url).map_err(|err| HttpError::InvalidUrl(err.to_string()))?
            }
            None => {
                let mut base = Url::parse(&self.base_url)
                    .map_err(|err| HttpError::InvalidUrl(err.to_string()))?;
                base.set_path(STREAM_ENDPOINT);
                base
            }
        };
        let target_scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => return Err(HttpError::InvalidUrl(format!("unsupported scheme {other}"))),
        };
        if url.scheme() != target_scheme {
            url.set_scheme(target_scheme)
                .map_err(|_| HttpError::InvalidUrl(url.to_string()))?;
        }
        url.set_fragment(None);

        let header_snapshot: Vec<(String, Vec<u8>)> = {
            let headers = self.headers.read().await;
            headers
                .iter()
                .filter(|(name, _)| name.as_str() != "content-type")
                .map(|(name, value)| (name.as_str().to_owned(), value.as_bytes().to_vec()))
                .collect()
        };

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| HttpError::InvalidUrl(err.to_string()))?;
        let request_headers = request.headers_mut();
        for (name, value) in header_snapshot {
            let header_name = WsHeaderName::from_bytes(name.as_bytes())
                .map_err(|_| HttpError::Rejected(400))?;
            let header_value =
                WsHeaderValue::from_bytes(&value).map_err(|_| HttpError::Rejected(400))?;
            request_headers.insert(header_name, header_value);
        }
        Ok(request)
    }
}

/// Maps non-success HTTP status codes to the error taxonomy.
fn classify_status(status: StatusCode) -> Result<(), HttpError> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::NOT_FOUND => Err(HttpError::NotFound),
        StatusCode::CONFLICT => Err(HttpError::Conflict { channel_id: None }),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(HttpError::Unauthorized(status.as_u16()))
        }
        s if s.is_server_error() => Err(HttpError::Retryable(s.as_u16())),
        // Redirects and the remaining 4xx codes mean the request itself is wrong.
        s => Err(HttpError::Rejected(s.as_u16())),
    }
}

/// Returns a redacted view of request headers suitable for debug logging.
fn redact_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    const SENSITIVE_HEADERS: [&str; 2] = [API_KEY_HEADER, "authorization"];

    headers
        .iter()
        .map(|(name, value)| {
            let lower = name.as_str().to_ascii_lowercase();
            let display = if SENSITIVE_HEADERS.contains(&lower.as_str()) {
                "<redacted>".to_string()
            } else {
                value
                    .to_str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| "<non-utf8>".to_string())
            };
            (lower, display)
        })
        .collect()
}
