//! Scripted status authority serving the channel HTTP API and push stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

pub const CHANNEL_ID: &str = "ch_e2e";

/// Shared backend state: the authoritative descriptor plus request records.
#[derive(Default)]
pub struct BackendState {
    /// Descriptor served by `GET status`, advanced as push steps go out.
    current: Option<Value>,
    /// Descriptors pushed, in order, once a client subscribes.
    push_steps: Vec<Value>,
    /// Gap between consecutive push steps.
    step_gap: Duration,
    /// Header values seen per route, keyed by route label.
    pub headers: HashMap<&'static str, Vec<String>>,
    /// Text frames received over the push stream.
    pub client_frames: Vec<Value>,
    pub status_requests: usize,
}

type SharedState = Arc<Mutex<BackendState>>;

pub struct BackendHarness {
    base_url: String,
    pub state: SharedState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BackendHarness {
    /// Spawns the backend with the initial descriptor and the push script.
    pub async fn start(initial: Value, push_steps: Vec<Value>, step_gap: Duration) -> Self {
        let state = Arc::new(Mutex::new(BackendState {
            current: Some(initial),
            push_steps,
            step_gap,
            ..BackendState::default()
        }));
        let router = Router::new()
            .route("/api/v1/channels", post(handle_create))
            .route("/api/v1/channels/stream", get(handle_stream))
            .route("/api/v1/channels/:id", get(handle_status))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("backend bind");
        let addr = listener.local_addr().expect("backend address");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("server run");
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Drop for BackendHarness {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn record_header(state: &mut BackendState, route: &'static str, headers: &HeaderMap) {
    let value = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.headers.entry(route).or_default().push(value);
}

async fn handle_create(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(_intent): Json<Value>,
) -> impl IntoResponse {
    let mut guard = state.lock().await;
    record_header(&mut guard, "create", &headers);
    let body = guard.current.clone().unwrap_or(Value::Null);
    (StatusCode::CREATED, Json(body))
}

async fn handle_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let mut guard = state.lock().await;
    record_header(&mut guard, "status", &headers);
    guard.status_requests += 1;
    if id != CHANNEL_ID {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(guard.current.clone().unwrap_or(Value::Null)).into_response()
}

async fn handle_stream(
    State(state): State<SharedState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    {
        let mut guard = state.lock().await;
        record_header(&mut guard, "stream", &headers);
    }
    ws.on_upgrade(move |socket| serve_stream(socket, state))
}

async fn serve_stream(mut socket: WebSocket, state: SharedState) {
    // The first frame must be the subscription.
    match socket.recv().await {
        Some(Ok(WsMessage::Text(text))) => {
            if let Ok(frame) = serde_json::from_str::<Value>(&text) {
                state.lock().await.client_frames.push(frame);
            }
        }
        _ => return,
    }

    let (steps, gap) = {
        let guard = state.lock().await;
        (guard.push_steps.clone(), guard.step_gap)
    };
    for step in steps {
        sleep(gap).await;
        state.lock().await.current = Some(step.clone());
        let frame = json!({"type": "status_update", "data": step}).to_string();
        if socket.send(WsMessage::Text(frame)).await.is_err() {
            return;
        }
    }

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            WsMessage::Text(text) => {
                if let Ok(frame) = serde_json::from_str::<Value>(&text) {
                    if frame["type"] == "ping" {
                        let _ = socket
                            .send(WsMessage::Text(json!({"type": "pong"}).to_string()))
                            .await;
                    }
                    state.lock().await.client_frames.push(frame);
                }
            }
            WsMessage::Close(_) => return,
            _ => {}
        }
    }
}
