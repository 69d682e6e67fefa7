//! `GET /api/health` — public liveness endpoint.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let total = state.registry.session_count().await;
    let running = state.registry.running_count().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "sessions": {
            "total": total,
            "running": running,
        },
    }))
}
