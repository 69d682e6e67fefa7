//! REST endpoints for session management.
//!
//! - `POST   /api/sessions`                 — create a session
//! - `GET    /api/sessions`                 — list all sessions
//! - `GET    /api/sessions/{id}`            — session detail
//! - `DELETE /api/sessions/{id}`            — kill (optional `?signal=`)
//! - `PATCH  /api/sessions/{id}`            — rename
//! - `POST   /api/sessions/{id}/input`      — send stdin bytes
//! - `POST   /api/sessions/{id}/resize`     — resize the PTY
//! - `POST   /api/sessions/{id}/status`     — set the app status record
//! - `GET    /api/sessions/{id}/recording`  — tail the recording (`?offset=`)
//! - `DELETE /api/sessions/{id}/state`      — remove an exited session

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error_response;
use crate::error::CoreError;
use crate::protocol::{parse_signal_name, StatusUpdate};
use crate::recording::tail_recording;
use crate::session::registry::CreateSpec;
use crate::session::store::{self, TitleMode};
use crate::session::KILL_GRACE;
use crate::AppState;

type ApiError = (StatusCode, Json<Value>);

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub command: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub title_mode: Option<TitleMode>,
    #[serde(default)]
    pub shell: bool,
}

/// `POST /api/sessions` — create a session, returning its summary.
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let session = state
        .registry
        .create(CreateSpec {
            name: req.name,
            command: req.command,
            cwd: req.cwd,
            env: req.env,
            cols: req.cols,
            rows: req.rows,
            title_mode: req.title_mode,
            shell: req.shell,
        })
        .await
        .map_err(|e| error_response(&e))?;

    let summary = session.summary().await;
    Ok((StatusCode::CREATED, Json(json!({ "session": summary }))))
}

/// `GET /api/sessions` — list all sessions.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.registry.list().await;
    Json(json!({ "sessions": sessions }))
}

/// `GET /api/sessions/{id}` — session detail.
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .registry
        .require(&id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(json!({ "session": session.summary().await })))
}

#[derive(Deserialize)]
pub struct KillQuery {
    #[serde(default)]
    pub signal: Option<String>,
}

/// `DELETE /api/sessions/{id}` — kill a session. Killing an exited session
/// reports the stored exit (never an error).
pub async fn kill_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<KillQuery>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .registry
        .require(&id)
        .await
        .map_err(|e| error_response(&e))?;

    let signal = match query.signal.as_deref() {
        None => libc::SIGTERM,
        Some(name) => parse_signal_name(name).ok_or_else(|| {
            error_response(&CoreError::ControlMessageFailed(format!(
                "unknown signal {name:?}"
            )))
        })?,
    };

    let exit = session
        .kill(signal, KILL_GRACE)
        .await
        .map_err(|e| error_response(&e))?;

    Ok(Json(json!({
        "ok": true,
        "session_id": id,
        "exit_code": exit.and_then(|e| e.code),
        "exit_signal": exit.and_then(|e| e.signal),
    })))
}

#[derive(Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

/// `PATCH /api/sessions/{id}` — rename a session.
pub async fn patch_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .registry
        .require(&id)
        .await
        .map_err(|e| error_response(&e))?;
    session.rename(req.name.clone()).await;
    Ok(Json(json!({ "ok": true, "session_id": id, "name": req.name })))
}

#[derive(Deserialize)]
pub struct InputRequest {
    pub data: String,
}

/// `POST /api/sessions/{id}/input` — deliver stdin bytes.
pub async fn send_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<InputRequest>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .registry
        .require(&id)
        .await
        .map_err(|e| error_response(&e))?;
    session
        .send_stdin(Bytes::from(req.data.into_bytes()))
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

/// `POST /api/sessions/{id}/resize` — resize the PTY.
pub async fn resize_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .registry
        .require(&id)
        .await
        .map_err(|e| error_response(&e))?;
    session
        .resize(req.cols, req.rows)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(json!({ "ok": true, "cols": req.cols, "rows": req.rows })))
}

/// `POST /api/sessions/{id}/status` — store an app status record and
/// broadcast it to every attached subscriber.
pub async fn set_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .registry
        .require(&id)
        .await
        .map_err(|e| error_response(&e))?;
    // HTTP callers hold no subscription, so nobody is excluded.
    session.set_app_status(update, None).await;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct TailQuery {
    #[serde(default)]
    pub offset: u64,
}

/// `GET /api/sessions/{id}/recording?offset=N` — read recording lines from a
/// byte offset. Works for running and exited sessions alike.
pub async fn tail_session_recording(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .registry
        .require(&id)
        .await
        .map_err(|e| error_response(&e))?;

    let path = store::recording_path(session.control_dir());
    let tail = tail_recording(&path, query.offset)
        .await
        .map_err(|e| error_response(&CoreError::internal("failed to read recording", e)))?;

    Ok(Json(json!({
        "start": tail.start,
        "end": tail.end,
        "data": tail.data,
    })))
}

/// `DELETE /api/sessions/{id}/state` — remove an exited session and delete
/// its control directory. Refused while the session runs or has subscribers.
pub async fn remove_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .remove(&id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(json!({ "ok": true, "session_id": id })))
}
