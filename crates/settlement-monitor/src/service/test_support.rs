//! Shared fixtures and utilities for session service tests.
//!
//! Provides descriptor builders, fast timing presets, an HTTP client bound to
//! an `httptest` server and a scriptable local push server.

#![cfg(test)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use httptest::Server;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::config::SessionConfig;
use super::core::Session;
use super::telemetry::{NoopTelemetry, SessionTelemetry};
use super::transport::ReconnectPolicy;
use crate::channel::{Channel, ChannelDescriptor, ChannelStatus};
use crate::http::{Auth, HttpClient, HttpClientOptions};
use crate::store::{ChannelIdStore, MemoryStore};

/// Channel id used throughout the service tests.
pub(crate) const CHANNEL_ID: &str = "ch_test";
/// Status path served for [`CHANNEL_ID`].
pub(crate) const STATUS_PATH: &str = "/api/v1/channels/ch_test";

/// Builds a descriptor body as the authority would return it.
pub(crate) fn descriptor_json(status: &str, progress: u32, confirmations: u32) -> Value {
    json!({
        "channelId": CHANNEL_ID,
        "status": status,
        "progress": progress,
        "confirmations": confirmations,
    })
}

/// Wraps a descriptor into a `status_update` push frame.
pub(crate) fn status_frame(status: &str, progress: u32, confirmations: u32) -> String {
    json!({"type": "status_update", "data": descriptor_json(status, progress, confirmations)})
        .to_string()
}

pub(crate) fn waiting_channel() -> Channel {
    let mut descriptor = ChannelDescriptor::new(CHANNEL_ID, ChannelStatus::WaitingPayment);
    descriptor.expires_at = Some(time::OffsetDateTime::now_utc() + time::Duration::hours(1));
    Channel::from_descriptor(descriptor).expect("valid descriptor")
}

/// Timings scaled down so scenarios complete in well under a second each.
pub(crate) fn fast_config() -> SessionConfig {
    SessionConfig {
        poll_interval: Duration::from_millis(100),
        push_open_timeout: Duration::from_millis(200),
        ping_interval: Duration::from_millis(250),
        pong_timeout: Duration::from_millis(500),
        grace_period: Duration::from_millis(150),
        countdown_tick: Duration::from_millis(50),
        event_log_capacity: 50,
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(40),
            max_delay: Duration::from_millis(400),
            max_attempts: 3,
            ..Default::default()
        },
        enable_push: true,
        enforce_limits: false,
    }
}

/// HTTP client targeting an `httptest` server.
pub(crate) fn client_for(server: &Server) -> HttpClient {
    HttpClient::new(
        server.url_str("").trim_end_matches('/'),
        &Auth::default(),
        HttpClientOptions {
            allow_plaintext: true,
            ..Default::default()
        },
    )
    .expect("client should build")
}

/// Starts a session directly, bypassing the resolver.
pub(crate) fn start_session(
    client: HttpClient,
    channel: Channel,
    config: SessionConfig,
) -> (Session, Arc<MemoryStore>) {
    start_session_with(client, channel, config, Arc::new(NoopTelemetry))
}

pub(crate) fn start_session_with(
    client: HttpClient,
    channel: Channel,
    config: SessionConfig,
    telemetry: Arc<dyn SessionTelemetry>,
) -> (Session, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::with_id(channel.id.clone()));
    let session = Session::start(
        client,
        store.clone() as Arc<dyn ChannelIdStore>,
        channel,
        config,
        telemetry,
    );
    (session, store)
}

/// Polls `check` until it holds or `limit` elapses.
pub(crate) async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if check().await {
            return true;
        }
        if start.elapsed() > limit {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// How a scripted push connection ends.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PushEnd {
    /// Stay open until the client goes away.
    Hold,
    /// Send a close frame with the given code after the delay.
    Close(u16, Duration),
    /// Drop the socket without a close frame after the delay.
    Drop(Duration),
}

/// Behaviour of one accepted push connection.
#[derive(Debug, Clone)]
pub(crate) struct PushScript {
    /// Accept the TCP connection but never answer the handshake.
    pub(crate) stall: bool,
    /// Never answer keepalive pings.
    pub(crate) silent: bool,
    /// Text frames sent once the client subscribed.
    pub(crate) frames: Vec<String>,
    pub(crate) end: PushEnd,
}

impl PushScript {
    pub(crate) fn stall() -> Self {
        Self {
            stall: true,
            silent: false,
            frames: Vec::new(),
            end: PushEnd::Hold,
        }
    }

    /// Completes the handshake, then goes quiet while keeping the socket open.
    pub(crate) fn silent() -> Self {
        Self {
            silent: true,
            ..Self::frames(Vec::new(), PushEnd::Hold)
        }
    }

    pub(crate) fn frames(frames: Vec<String>, end: PushEnd) -> Self {
        Self {
            stall: false,
            silent: false,
            frames,
            end,
        }
    }
}

/// Local websocket server replaying one script per accepted connection.
///
/// The last script repeats for any further connection.
pub(crate) struct PushServer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Value>>>,
    task: JoinHandle<()>,
}

impl PushServer {
    pub(crate) async fn start(scripts: Vec<PushScript>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind push server");
        let addr = listener.local_addr().expect("local addr");
        let connections = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let task = {
            let connections = connections.clone();
            let received = received.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let index = connections.fetch_add(1, Ordering::SeqCst);
                    let script = scripts
                        .get(index)
                        .or_else(|| scripts.last())
                        .cloned()
                        .unwrap_or_else(|| PushScript::frames(Vec::new(), PushEnd::Hold));
                    tokio::spawn(serve_connection(stream, script, received.clone()));
                }
            })
        };
        Self {
            addr,
            connections,
            received,
            task,
        }
    }

    pub(crate) fn url(&self) -> String {
        format!("ws://{}/stream", self.addr)
    }

    /// Number of TCP connections accepted so far.
    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// JSON frames received from clients, in arrival order.
    pub(crate) fn received(&self) -> Vec<Value> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn received_types(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|frame| frame["type"].as_str().map(str::to_string))
            .collect()
    }
}

impl Drop for PushServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(stream: TcpStream, script: PushScript, received: Arc<Mutex<Vec<Value>>>) {
    if script.stall {
        let _held = stream;
        sleep(Duration::from_secs(30)).await;
        return;
    }
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };
    let record = |frame: &str| {
        if let Ok(value) = serde_json::from_str::<Value>(frame) {
            received
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(value);
        }
    };

    // Wait for the subscription before replaying the script.
    if let Ok(Some(Ok(WsMessage::Text(text)))) = timeout(Duration::from_secs(2), ws.next()).await {
        record(&text);
    }
    for frame in script.frames {
        if ws.send(WsMessage::Text(frame)).await.is_err() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }

    let deadline = match script.end {
        PushEnd::Hold => None,
        PushEnd::Close(_, after) | PushEnd::Drop(after) => Some(Instant::now() + after),
    };
    loop {
        let next = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, ws.next()).await {
                Ok(next) => next,
                Err(_) => break,
            },
            None => ws.next().await,
        };
        match next {
            Some(Ok(WsMessage::Text(text))) => {
                record(&text);
                if !script.silent && text.contains(r#""type":"ping""#) {
                    let pong = json!({"type": "pong"}).to_string();
                    if ws.send(WsMessage::Text(pong)).await.is_err() {
                        return;
                    }
                }
            }
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    }

    match script.end {
        PushEnd::Close(code, _) => {
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::from(code),
                    reason: "scripted close".into(),
                }))
                .await;
            // Let the close handshake finish before dropping the socket.
            let _ = timeout(Duration::from_millis(200), ws.next()).await;
        }
        PushEnd::Drop(_) | PushEnd::Hold => drop(ws),
    }
}
