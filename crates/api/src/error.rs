//! HTTP error mapping
//!
//! Translates engine errors into status codes and a JSON error body.
//! Internal detail (database messages, processor responses) never leaves
//! the server; clients get a category and a safe message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use revive_engine::RecoveryError;

pub struct ApiError(pub RecoveryError);

impl From<RecoveryError> for ApiError {
    fn from(e: RecoveryError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            RecoveryError::Authentication => {
                (StatusCode::UNAUTHORIZED, "invalid signature".to_string())
            }
            RecoveryError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            RecoveryError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            RecoveryError::InvalidState { reason, .. } => {
                (StatusCode::CONFLICT, reason.clone())
            }
            RecoveryError::Conflict { .. } => (
                StatusCode::CONFLICT,
                "the record changed concurrently, retry the request".to_string(),
            ),
            RecoveryError::Transient(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "temporarily unavailable, retry shortly".to_string(),
            ),
            RecoveryError::Processor(_) => (
                StatusCode::BAD_GATEWAY,
                "payment processor unavailable".to_string(),
            ),
            RecoveryError::EmailSend(_)
            | RecoveryError::Database(_)
            | RecoveryError::Configuration(_) => {
                tracing::error!(error = %self.0, "Internal error serving request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(e: RecoveryError) -> StatusCode {
        ApiError(e).into_response().status()
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(status_of(RecoveryError::Authentication), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_of(RecoveryError::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(RecoveryError::NotFound("invoice in_1".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(RecoveryError::InvalidState {
                invoice_id: "in_1".into(),
                status: "recovered".into(),
                reason: "payment already recovered".into(),
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(RecoveryError::Transient("busy".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(RecoveryError::Processor("down".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(RecoveryError::Configuration("missing".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_detail_does_not_leak() {
        let resp = ApiError(RecoveryError::Configuration(
            "PROCESSOR_API_URL must be set".into(),
        ))
        .into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
