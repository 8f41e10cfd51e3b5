//! Recovery lookup and manual retry routes

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use revive_engine::{DunningMessageRecord, RecoveryError, RecoveryRecord, RetryAttempt};

use crate::error::ApiError;
use crate::state::AppState;

/// Client-facing view of a recovery record.
#[derive(Debug, Serialize)]
pub struct RecoveryView {
    pub invoice_id: String,
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub decline_code: String,
    pub retry_count: i32,
    pub max_retries: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub first_failed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_attempt_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
}

impl From<RecoveryRecord> for RecoveryView {
    fn from(r: RecoveryRecord) -> Self {
        Self {
            invoice_id: r.invoice_id,
            customer_id: r.customer_id,
            subscription_id: r.subscription_id,
            amount_cents: r.amount_cents,
            currency: r.currency,
            status: r.status,
            decline_code: r.decline_code,
            retry_count: r.retry_count,
            max_retries: r.max_retries,
            next_retry_at: r.next_retry_at,
            first_failed_at: r.first_failed_at,
            last_attempt_at: r.last_attempt_at,
            resolved_at: r.resolved_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecoveryDetail {
    #[serde(flatten)]
    pub recovery: RecoveryView,
    pub attempts: Vec<RetryAttempt>,
    pub dunning_history: Vec<DunningMessageRecord>,
}

/// `GET /v1/recoveries/{invoice_id}`
pub async fn get_recovery(
    State(state): State<AppState>,
    Path(invoice_id): Path<String>,
) -> Result<Json<RecoveryDetail>, ApiError> {
    let record = state
        .engine
        .ledger
        .find_by_invoice(&invoice_id)
        .await?
        .ok_or_else(|| RecoveryError::NotFound(format!("invoice {invoice_id}")))?;

    let attempts = state.engine.ledger.attempts(record.id).await?;
    let dunning_history = state.engine.ledger.dunning_history(record.id).await?;

    Ok(Json(RecoveryDetail {
        recovery: record.into(),
        attempts,
        dunning_history,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub customer_id: String,
}

/// `GET /v1/recoveries?customer_id=`
///
/// A customer with no failures is an empty list, not a 404; only an
/// unknown invoice id is "not found".
pub async fn list_by_customer(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<RecoveryView>>, ApiError> {
    let records = state
        .engine
        .ledger
        .find_by_customer(&query.customer_id)
        .await?;

    Ok(Json(records.into_iter().map(RecoveryView::from).collect()))
}

/// `POST /v1/recoveries/{invoice_id}/retry`
///
/// Drives one charge attempt immediately. Rejections carry the specific
/// reason (already recovered, cancelled, retry in progress, grace
/// expired) so support tooling can show why.
pub async fn manual_retry(
    State(state): State<AppState>,
    Path(invoice_id): Path<String>,
) -> Result<Json<RecoveryView>, ApiError> {
    let record = state.engine.scheduler.manual_retry(&invoice_id).await?;
    Ok(Json(record.into()))
}
