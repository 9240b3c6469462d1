//! A single push channel connection.
//!
//! Opens the websocket within the configured timeout, subscribes to the
//! channel, forwards `status_update` frames to the reducer queue and keeps the
//! connection alive with application-level pings. The connection future owns
//! its keepalive and grace timers so they die with it.

use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{protocol::WebSocketConfig, Error as WsError, Message as WsMessage},
};
use tracing::{debug, info, warn};

use super::core::SessionShared;
use super::state::{SessionEvent, TransportState, UpdateSource};
use super::transport::CloseKind;
use crate::channel::ChannelDescriptor;
use crate::event_log::Severity;

/// Largest frame accepted from the server; descriptors are tiny.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ClientMessage<'a> {
    Subscribe {
        #[serde(rename = "channelId")]
        channel_id: &'a str,
    },
    PaymentSent {
        #[serde(rename = "channelId")]
        channel_id: &'a str,
        #[serde(rename = "proofReference", skip_serializing_if = "Option::is_none")]
        proof_reference: Option<&'a str>,
    },
    Ping,
}

impl ClientMessage<'_> {
    fn to_frame(&self) -> Result<WsMessage, serde_json::Error> {
        serde_json::to_string(self).map(WsMessage::Text)
    }
}

/// Frames sent by the server. Unknown types are tolerated and ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ServerMessage {
    StatusUpdate { data: Value },
    Pong,
    Error { message: Option<String> },
    #[serde(other)]
    Other,
}

/// How a connection ended.
#[derive(Debug)]
pub(crate) enum ConnectionEnd {
    /// Session teardown; nothing to decide.
    Cancelled,
    Closed { kind: CloseKind, reason: String },
}

impl ConnectionEnd {
    fn closed(kind: CloseKind, reason: impl Into<String>) -> Self {
        Self::Closed {
            kind,
            reason: reason.into(),
        }
    }
}

impl SessionShared {
    /// Runs one push connection from handshake to closure.
    pub(crate) async fn run_push_connection(self: &Arc<Self>) -> ConnectionEnd {
        if self.cancel.is_cancelled() {
            return ConnectionEnd::Cancelled;
        }
        self.set_transport_state(TransportState::Connecting).await;

        let request = match self.http_client.push_request().await {
            Ok(request) => request,
            Err(err) => return ConnectionEnd::closed(CloseKind::Protocol, err.to_string()),
        };
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_FRAME_SIZE);
        ws_config.max_frame_size = Some(MAX_FRAME_SIZE);

        let open_timeout = self.config.push_open_timeout;
        let connect = timeout(
            open_timeout,
            connect_async_with_config(request, Some(ws_config), false),
        );
        let stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return ConnectionEnd::Cancelled,
            result = connect => match result {
                Err(_) => {
                    return ConnectionEnd::closed(
                        CloseKind::Abnormal,
                        format!("push channel did not open within {open_timeout:?}"),
                    );
                }
                Ok(Err(err)) => {
                    return ConnectionEnd::closed(CloseKind::from_ws_error(&err), err.to_string());
                }
                Ok(Ok((stream, _response))) => stream,
            },
        };
        let (mut sink, mut source) = stream.split();

        self.set_transport_state(TransportState::Open).await;
        self.event_log.add("Live updates connected", Severity::Success);

        let subscribe = ClientMessage::Subscribe {
            channel_id: &self.channel_id,
        };
        match subscribe.to_frame() {
            Ok(frame) => {
                if let Err(err) = sink.send(frame).await {
                    return ConnectionEnd::closed(CloseKind::from_ws_error(&err), err.to_string());
                }
            }
            Err(err) => return ConnectionEnd::closed(CloseKind::Protocol, err.to_string()),
        }
        if let Err(err) = self.flush_payment_notice(&mut sink).await {
            return ConnectionEnd::closed(CloseKind::from_ws_error(&err), err.to_string());
        }

        let ping_interval = self.config.ping_interval;
        let mut keepalive = interval_at(Instant::now() + ping_interval, ping_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let grace = sleep(self.config.grace_period);
        tokio::pin!(grace);
        let mut grace_elapsed = false;
        // Any server frame proves liveness; silence past this deadline ends the connection.
        let pong_timeout = self.config.pong_timeout;
        let liveness = sleep(pong_timeout);
        tokio::pin!(liveness);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return ConnectionEnd::Cancelled;
                }
                _ = &mut grace, if !grace_elapsed => {
                    grace_elapsed = true;
                    self.suspend_poller("push channel stable");
                }
                _ = self.payment_notify.notified() => {
                    if let Err(err) = self.flush_payment_notice(&mut sink).await {
                        return ConnectionEnd::closed(CloseKind::from_ws_error(&err), err.to_string());
                    }
                }
                _ = &mut liveness => {
                    warn!(
                        channel_id = %self.channel_id,
                        silence_ms = pong_timeout.as_millis() as u64,
                        "push channel unresponsive"
                    );
                    return ConnectionEnd::closed(CloseKind::Abnormal, "push channel unresponsive");
                }
                _ = keepalive.tick() => {
                    let frame = match ClientMessage::Ping.to_frame() {
                        Ok(frame) => frame,
                        Err(err) => return ConnectionEnd::closed(CloseKind::Protocol, err.to_string()),
                    };
                    if let Err(err) = sink.send(frame).await {
                        return ConnectionEnd::closed(CloseKind::from_ws_error(&err), err.to_string());
                    }
                }
                frame = source.next() => {
                    if matches!(frame, Some(Ok(_))) {
                        liveness.as_mut().reset(Instant::now() + pong_timeout);
                    }
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => self.handle_server_frame(text.as_bytes()).await,
                        Some(Ok(WsMessage::Binary(bytes))) => self.handle_server_frame(&bytes).await,
                        Some(Ok(WsMessage::Ping(payload))) => {
                            if let Err(err) = sink.send(WsMessage::Pong(payload)).await {
                                return ConnectionEnd::closed(CloseKind::from_ws_error(&err), err.to_string());
                            }
                        }
                        Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Frame(_))) => {}
                        Some(Ok(WsMessage::Close(frame))) => {
                            return match frame {
                                Some(frame) => {
                                    let code = u16::from(frame.code);
                                    ConnectionEnd::closed(
                                        CloseKind::from_close_code(code),
                                        format!("closed with code {code}"),
                                    )
                                }
                                None => ConnectionEnd::closed(CloseKind::Abnormal, "closed without status"),
                            };
                        }
                        Some(Err(err)) => {
                            return ConnectionEnd::closed(CloseKind::from_ws_error(&err), err.to_string());
                        }
                        None => return ConnectionEnd::closed(CloseKind::Abnormal, "connection dropped"),
                    }
                }
            }
        }
    }

    /// Sends the pending `payment_sent` notice if it has not been delivered yet.
    async fn flush_payment_notice<S>(&self, sink: &mut S) -> Result<(), WsError>
    where
        S: Sink<WsMessage, Error = WsError> + Unpin,
    {
        let proof_reference = {
            let state = self.state.lock().await;
            match &state.payment_notice {
                Some(notice) if !notice.delivered => notice.proof_reference.clone(),
                _ => return Ok(()),
            }
        };
        let message = ClientMessage::PaymentSent {
            channel_id: &self.channel_id,
            proof_reference: proof_reference.as_deref(),
        };
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(channel_id = %self.channel_id, "failed to encode payment_sent: {err}");
                return Ok(());
            }
        };
        sink.send(frame).await?;
        if let Some(notice) = self.state.lock().await.payment_notice.as_mut() {
            notice.delivered = true;
        }
        info!(channel_id = %self.channel_id, "payment_sent delivered over push channel");
        Ok(())
    }

    /// Decodes one server frame and forwards status updates to the reducer.
    pub(crate) async fn handle_server_frame(&self, payload: &[u8]) {
        let message: ServerMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(err) => {
                self.post(SessionEvent::MalformedPayload {
                    source: UpdateSource::Push,
                    error: err.to_string(),
                })
                .await;
                return;
            }
        };
        match message {
            ServerMessage::StatusUpdate { data } => {
                let event = match serde_json::from_value::<ChannelDescriptor>(data) {
                    Ok(descriptor) => match descriptor.validate() {
                        Ok(()) => SessionEvent::StatusUpdate {
                            source: UpdateSource::Push,
                            descriptor,
                        },
                        Err(err) => SessionEvent::MalformedPayload {
                            source: UpdateSource::Push,
                            error: err.to_string(),
                        },
                    },
                    Err(err) => SessionEvent::MalformedPayload {
                        source: UpdateSource::Push,
                        error: err.to_string(),
                    },
                };
                self.post(event).await;
            }
            ServerMessage::Pong => debug!(channel_id = %self.channel_id, "push channel pong"),
            ServerMessage::Error { message } => {
                let message = message.unwrap_or_else(|| "unspecified error".to_string());
                warn!(channel_id = %self.channel_id, "push channel reported error: {message}");
                self.event_log
                    .add(format!("Live updates error: {message}"), Severity::Warning);
            }
            ServerMessage::Other => {
                debug!(channel_id = %self.channel_id, "ignoring unknown push frame type");
            }
        }
    }
}
