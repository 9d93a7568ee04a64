//! WebSocket live feed. Each socket runs one task: client messages and
//! liveness are handled inline, while broadcast frames arrive through the
//! connection's registry outbox.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::AppState;
use crate::auth::Claims;
use crate::fanout::Channel;

/// Close code sent when the auth deadline lapses.
const CLOSE_UNAUTHENTICATED: u16 = 4001;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Bearer token supplied at handshake time, replacing the auth message.
    pub token: Option<String>,
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum ClientMessage {
    /// Authenticate with a bearer token
    Auth { token: String },
    /// Watch a channel
    Subscribe { channel: String },
    /// Stop watching a channel
    Unsubscribe { channel: String },
    /// Application-level liveness probe
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum ServerMessage {
    Ack {
        action: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
    Error {
        message: &'static str,
    },
    Pong,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.token))
}

async fn handle_socket(socket: WebSocket, state: AppState, handshake_token: Option<String>) {
    let connection_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    let (outbox_tx, mut outbox) = mpsc::channel::<String>(state.ws.send_buffer.max(1));
    state.registry.register(connection_id, outbox_tx).await;
    tracing::debug!(connection = %connection_id, "WebSocket connected");

    let mut claims: Option<Claims> = None;
    if let Some(token) = handshake_token {
        match state.verifier.verify(&token) {
            Ok(verified) => {
                claims = Some(verified);
                send_message(&mut sender, &ServerMessage::Ack { action: "auth", channel: None })
                    .await;
            }
            Err(_) => {
                // The client may still authenticate by message before the
                // deadline.
                send_message(&mut sender, &ServerMessage::Error { message: "Invalid token" })
                    .await;
            }
        }
    }

    let auth_deadline = tokio::time::sleep(Duration::from_secs(state.ws.auth_deadline_secs));
    tokio::pin!(auth_deadline);

    let mut ping = tokio::time::interval(Duration::from_secs(state.ws.ping_interval_secs.max(1)));
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;
    let mut responsive = true;

    loop {
        tokio::select! {
            () = &mut auth_deadline, if claims.is_none() => {
                tracing::debug!(connection = %connection_id, "Auth deadline lapsed");
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_UNAUTHENTICATED,
                        reason: "authentication required".into(),
                    })))
                    .await;
                break;
            }
            _ = ping.tick() => {
                if !responsive {
                    tracing::debug!(connection = %connection_id, "Ping timeout");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                responsive = false;
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            frame = outbox.recv() => {
                let Some(frame) = frame else { break };
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => {
                let Some(Ok(message)) = inbound else { break };
                responsive = true;
                match message {
                    Message::Text(text) => {
                        if !handle_client_text(&mut sender, &state, connection_id, &mut claims, &text).await {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    // Protocol pings are answered by axum; pongs and binary
                    // frames only count as liveness.
                    _ => {}
                }
            }
        }
    }

    state.registry.unregister(connection_id).await;
    tracing::debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Runs one text frame through the protocol. Returns false once the socket
/// is no longer writable.
async fn handle_client_text(
    sender: &mut SplitSink<WebSocket, Message>,
    state: &AppState,
    connection_id: Uuid,
    claims: &mut Option<Claims>,
    text: &str,
) -> bool {
    let message = match classify(text) {
        Ok(message) => message,
        Err(label) => return send_message(sender, &ServerMessage::Error { message: label }).await,
    };

    match message {
        ClientMessage::Ping => send_message(sender, &ServerMessage::Pong).await,
        ClientMessage::Auth { token } => match state.verifier.verify(&token) {
            Ok(verified) => {
                *claims = Some(verified);
                send_message(sender, &ServerMessage::Ack { action: "auth", channel: None }).await
            }
            Err(_) => {
                send_message(sender, &ServerMessage::Error { message: "Invalid token" }).await
            }
        },
        ClientMessage::Subscribe { channel } => {
            let Some(channel) = Channel::parse(&channel) else {
                return send_message(sender, &ServerMessage::Error { message: "Invalid channel" })
                    .await;
            };
            let authorized = claims
                .as_ref()
                .map(|claims| channel.authorized(claims))
                .unwrap_or(false);
            if !authorized {
                return send_message(
                    sender,
                    &ServerMessage::Error { message: "Unauthorized channel" },
                )
                .await;
            }

            let snapshot = match state.enricher.snapshot(&channel).await {
                Ok(frames) => frames,
                Err(error) => {
                    tracing::warn!(channel = %channel, error = %error, "Snapshot failed; subscribing without replay");
                    Vec::new()
                }
            };
            state
                .registry
                .subscribe(connection_id, &channel, snapshot)
                .await;
            send_message(
                sender,
                &ServerMessage::Ack {
                    action: "subscribe",
                    channel: Some(channel.name()),
                },
            )
            .await
        }
        ClientMessage::Unsubscribe { channel } => {
            let Some(channel) = Channel::parse(&channel) else {
                return send_message(sender, &ServerMessage::Error { message: "Invalid channel" })
                    .await;
            };
            state.registry.unsubscribe(connection_id, &channel).await;
            send_message(
                sender,
                &ServerMessage::Ack {
                    action: "unsubscribe",
                    channel: Some(channel.name()),
                },
            )
            .await
        }
    }
}

/// Distinguishes malformed JSON from a well-formed message of an unknown or
/// broken type, so the error strings stay stable.
fn classify(text: &str) -> Result<ClientMessage, &'static str> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|_| "Invalid JSON")?;
    let known_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .map(|t| matches!(t, "auth" | "subscribe" | "unsubscribe" | "ping"))
        .unwrap_or(false);
    match serde_json::from_value::<ClientMessage>(value) {
        Ok(message) => Ok(message),
        Err(_) if known_type => Err("Invalid JSON"),
        Err(_) => Err("Unknown message type"),
    }
}

async fn send_message(sender: &mut SplitSink<WebSocket, Message>, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => true,
    }
}
