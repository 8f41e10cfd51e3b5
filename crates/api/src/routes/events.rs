//! Processor webhook ingestion route

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use revive_engine::RecoveryError;

use crate::error::ApiError;
use crate::state::AppState;

/// `POST /v1/events`
///
/// Body is the raw processor payload; `Processor-Signature` carries the
/// HMAC header and `X-Tenant-Id` names the tenant whose secret verifies
/// it. Returns 200 for processed, duplicate, and ignored events alike so
/// the processor stops redelivering; signature and shape problems get a
/// 4xx the processor will not retry.
pub async fn ingest_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<serde_json::Value>, ApiError> {
    let signature = headers
        .get("Processor-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(RecoveryError::Authentication)?;

    let tenant_id = headers
        .get("X-Tenant-Id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| {
            RecoveryError::Validation("missing or malformed X-Tenant-Id header".to_string())
        })?;

    state
        .engine
        .ingestor
        .ingest(tenant_id, &body, signature)
        .await?;

    Ok(Json(json!({ "received": true })))
}
