//! Recovery analytics route

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use revive_engine::{RecoveryError, RecoveryStats, TrendPoint};

use crate::error::ApiError;
use crate::state::AppState;

/// Default reporting window when the caller gives no bounds.
const DEFAULT_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub tenant_id: Option<Uuid>,
    /// RFC 3339; defaults to 30 days ago.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub from: Option<OffsetDateTime>,
    /// RFC 3339; defaults to now.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub to: Option<OffsetDateTime>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(with = "time::serde::rfc3339")]
    pub from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub to: OffsetDateTime,
    #[serde(flatten)]
    pub stats: RecoveryStats,
    pub trend: Vec<TrendPoint>,
}

/// `GET /v1/stats?tenant_id=&from=&to=`
pub async fn get_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    let to = query.to.unwrap_or_else(OffsetDateTime::now_utc);
    let from = query.from.unwrap_or(to - Duration::days(DEFAULT_WINDOW_DAYS));

    if from >= to {
        return Err(RecoveryError::Validation(
            "'from' must be earlier than 'to'".to_string(),
        )
        .into());
    }

    let stats = state.engine.analytics.stats(query.tenant_id, from, to).await?;
    let trend = state.engine.analytics.trend(query.tenant_id, from, to).await?;

    Ok(Json(StatsResponse {
        from,
        to,
        stats,
        trend,
    }))
}
