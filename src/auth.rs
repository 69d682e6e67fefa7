//! Optional pre-shared token authentication.
//!
//! When a token is configured, all endpoints except `/api/health` require an
//! `Authorization: Bearer <token>` header. The WebSocket path uses a
//! `?token=` query parameter instead (browsers can't set headers on
//! WebSocket upgrades). With no token configured the middleware passes
//! everything through — the IPC sockets are local-trust and the HTTP side
//! defaults to loopback-only binding.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Extension type carrying the expected token (None = auth disabled),
/// injected into the router layer so [`require_token`] can access it without
/// touching `AppState`.
#[derive(Clone)]
pub struct AuthToken(pub Option<String>);

/// Axum middleware enforcing the bearer token when one is configured.
///
/// # Error responses
///
/// - `401 Unauthorized` — header missing or malformed
/// - `403 Forbidden` — token present but invalid
/// - `500 Internal Server Error` — [`AuthToken`] extension not found
pub async fn require_token(request: Request, next: Next) -> Response {
    let expected = match request.extensions().get::<AuthToken>() {
        Some(token) => token.0.clone(),
        None => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Server configuration error"})),
            )
                .into_response();
        }
    };

    let Some(expected) = expected else {
        return next.run(request).await;
    };

    let auth_header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    let provided = match auth_header {
        Some(h) if h.starts_with("Bearer ") => &h[7..],
        _ => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Missing or invalid Authorization header"})),
            )
                .into_response();
        }
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid token"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Token check for WebSocket upgrades (query parameter instead of header).
pub fn ws_token_ok(expected: Option<&str>, provided: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(expected) => provided
            .is_some_and(|p| constant_time_eq(expected.as_bytes(), p.as_bytes())),
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the token length from response
/// times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_ws_token_check() {
        assert!(ws_token_ok(None, None));
        assert!(ws_token_ok(None, Some("anything")));
        assert!(ws_token_ok(Some("tok"), Some("tok")));
        assert!(!ws_token_ok(Some("tok"), Some("wrong")));
        assert!(!ws_token_ok(Some("tok"), None));
    }
}
