//! WebSocket transport for session viewers.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /api/sessions/{id}/ws?token=<token>` — the
//!    token is validated before the upgrade completes (when auth is on).
//! 2. The handler subscribes to the session. Terminal output arrives as
//!    binary frames; everything else is a JSON text frame with a `"type"`
//!    field.
//! 3. On disconnect the subscription is cancelled promptly.
//!
//! ## Messages (server → client)
//!
//! | Type     | Key fields          |
//! |----------|---------------------|
//! | (binary) | raw terminal output |
//! | `status` | `app`, `status`, …  |
//! | `resize` | `cols`, `rows`      |
//! | `exit`   | `code`, `signal`    |
//! | `resync` | `dropped`           |
//! | `error`  | `code`, `message`   |
//! | `pong`   | —                   |
//!
//! ## Messages (client → server)
//!
//! | Type     | Fields           | Effect                       |
//! |----------|------------------|------------------------------|
//! | (binary) | raw input bytes  | `send_stdin`                 |
//! | `input`  | `data`           | `send_stdin`                 |
//! | `resize` | `cols`, `rows`   | PTY resize                   |
//! | `status` | `app`, `status`  | store + broadcast to others  |
//! | `ping`   | —                | `pong`                       |

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::auth::ws_token_ok;
use crate::error::CoreError;
use crate::protocol::StatusUpdate;
use crate::session::fanout::{Envelope, SinkKind};
use crate::session::Session;
use crate::AppState;

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// `GET /api/sessions/{id}/ws?token=<token>` — upgrade handler.
pub async fn ws_attach(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let expected = state.config.auth_token();
    if !ws_token_ok(expected.as_deref(), query.token.as_deref()) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    let Some(session) = state.registry.get(&id).await else {
        return (StatusCode::NOT_FOUND, "Session not found").into_response();
    };

    ws.on_upgrade(move |socket| handle_ws(socket, session))
}

fn envelope_to_message(envelope: Envelope) -> Option<Message> {
    match envelope {
        Envelope::Output(bytes) => Some(Message::Binary(bytes)),
        Envelope::Status(update) => {
            let mut value = serde_json::to_value(&update).unwrap_or_else(|_| json!({}));
            value["type"] = json!("status");
            Some(Message::Text(value.to_string().into()))
        }
        Envelope::Resize { cols, rows } => Some(Message::Text(
            json!({"type": "resize", "cols": cols, "rows": rows})
                .to_string()
                .into(),
        )),
        Envelope::Exit(info) => Some(Message::Text(
            json!({"type": "exit", "code": info.code, "signal": info.signal})
                .to_string()
                .into(),
        )),
        Envelope::Resync => Some(Message::Text(
            json!({"type": "resync"}).to_string().into(),
        )),
    }
}

fn error_message(err: &CoreError) -> Message {
    Message::Text(
        json!({"type": "error", "code": err.code(), "message": err.to_string()})
            .to_string()
            .into(),
    )
}

/// Main per-viewer loop: bridge the subscription and the socket.
async fn handle_ws(socket: WebSocket, session: std::sync::Arc<Session>) {
    let (mut sink, mut stream) = socket.split();

    let mut sub = match session.subscribe(SinkKind::WsClient).await {
        Ok(sub) => sub,
        Err(e) => {
            let _ = sink.send(error_message(&e)).await;
            let _ = sink.close().await;
            return;
        }
    };
    let sub_id = sub.id();
    debug!("WS viewer {sub_id} attached");

    loop {
        tokio::select! {
            envelope = sub.recv() => match envelope {
                Some(envelope) => {
                    let closing = matches!(envelope, Envelope::Exit(_));
                    if let Some(msg) = envelope_to_message(envelope) {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    if closing {
                        break;
                    }
                }
                None => {
                    if sub.was_evicted() {
                        let _ = sink.send(error_message(&CoreError::Backpressure)).await;
                    }
                    break;
                }
            },
            incoming = stream.next() => {
                let Some(Ok(msg)) = incoming else { break };
                match msg {
                    Message::Binary(data) => {
                        if let Err(e) = session.send_stdin(data).await {
                            let _ = sink.send(error_message(&e)).await;
                        }
                    }
                    Message::Text(text) => {
                        if let Some(reply) = handle_text(&session, sub_id, &text).await {
                            if sink.send(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    session.unsubscribe(sub_id).await;
    let _ = sink.close().await;
    debug!("WS viewer {sub_id} detached");
}

/// Dispatch one JSON text message. Returns a reply to send, if any.
async fn handle_text(
    session: &std::sync::Arc<Session>,
    sub_id: u64,
    text: &str,
) -> Option<Message> {
    let Ok(parsed) = serde_json::from_str::<Value>(text) else {
        return Some(error_message(&CoreError::MessageProcessing(
            "invalid JSON".into(),
        )));
    };

    match parsed["type"].as_str().unwrap_or("") {
        "ping" => Some(Message::Text(json!({"type": "pong"}).to_string().into())),
        "input" => {
            let data = parsed["data"].as_str().unwrap_or("").to_string();
            match session.send_stdin(Bytes::from(data.into_bytes())).await {
                Ok(()) => None,
                Err(e) => Some(error_message(&e)),
            }
        }
        "resize" => {
            let cols = parsed["cols"].as_u64().unwrap_or(0) as u16;
            let rows = parsed["rows"].as_u64().unwrap_or(0) as u16;
            match session.resize(cols, rows).await {
                Ok(()) => None,
                Err(e) => Some(error_message(&e)),
            }
        }
        "status" => match serde_json::from_value::<StatusUpdate>(parsed.clone()) {
            Ok(mut update) => {
                // The routing "type" field is transport framing, not app data.
                update.extras.remove("type");
                session.set_app_status(update, Some(sub_id)).await;
                None
            }
            Err(e) => Some(error_message(&CoreError::MessageProcessing(format!(
                "invalid status payload: {e}"
            )))),
        },
        other => Some(error_message(&CoreError::MessageProcessing(format!(
            "unknown message type {other:?}"
        )))),
    }
}
