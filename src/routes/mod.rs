//! REST control-plane handlers.

pub mod health;
pub mod sessions;

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::error::CoreError;

/// Map a core error onto an HTTP status and `{error, code}` body.
pub fn error_response(err: &CoreError) -> (StatusCode, Json<Value>) {
    let status = match err {
        CoreError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        CoreError::SessionExited
        | CoreError::NotReattachable
        | CoreError::InvalidOperation(_) => StatusCode::CONFLICT,
        CoreError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        CoreError::PathTooLong { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::ConnectionLimit { .. } | CoreError::Backpressure => {
            StatusCode::TOO_MANY_REQUESTS
        }
        CoreError::KillTimeout => StatusCode::GATEWAY_TIMEOUT,
        CoreError::InvalidMessageType(_)
        | CoreError::MalformedFrame(_)
        | CoreError::MessageProcessing(_)
        | CoreError::ControlMessageFailed(_)
        | CoreError::ResetSizeFailed(_) => StatusCode::BAD_REQUEST,
        CoreError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({"error": err.to_string(), "code": err.code()})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let (status, _) = error_response(&CoreError::SessionNotFound("x".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = error_response(&CoreError::SessionExited);
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = error_response(&CoreError::PayloadTooLarge { size: 9, max: 1 });
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body.0["code"], "PAYLOAD_TOO_LARGE");

        let (status, _) = error_response(&CoreError::KillTimeout);
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    }
}
