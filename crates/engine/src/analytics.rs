//! Recovery analytics
//!
//! Aggregate reporting over the ledger: counts, recovered revenue, and
//! the recovery rate over a time window, plus a per-day trend series.
//! Everything is computed in SQL with FILTER clauses; the only logic
//! kept in Rust is the rate division so it can be tested directly.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::RecoveryResult;

/// Window summary returned by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStats {
    pub failed_count: i64,
    pub recovered_count: i64,
    pub recovered_amount_cents: i64,
    pub exhausted_count: i64,
    pub active_count: i64,
    /// recovered / (recovered + exhausted), 0 when nothing has resolved.
    pub recovery_rate: f64,
}

/// One day of the trend series.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TrendPoint {
    pub day: time::Date,
    pub failed_count: i64,
    pub recovered_count: i64,
    pub recovered_amount_cents: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StatsRow {
    failed_count: i64,
    recovered_count: i64,
    recovered_amount_cents: Option<i64>,
    exhausted_count: i64,
    active_count: i64,
}

/// Resolved outcomes only: records still in flight do not dilute the rate.
pub fn recovery_rate(recovered: i64, exhausted: i64) -> f64 {
    let resolved = recovered + exhausted;
    if resolved <= 0 {
        return 0.0;
    }
    recovered as f64 / resolved as f64
}

#[derive(Clone)]
pub struct AnalyticsService {
    pool: PgPool,
}

impl AnalyticsService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Window summary. Failures are bucketed by `first_failed_at`;
    /// recoveries and exhaustions by `resolved_at` so late outcomes land
    /// in the period they actually resolved.
    pub async fn stats(
        &self,
        tenant_id: Option<Uuid>,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> RecoveryResult<RecoveryStats> {
        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (
                    WHERE first_failed_at >= $2 AND first_failed_at < $3
                ) AS failed_count,
                COUNT(*) FILTER (
                    WHERE status = 'recovered'
                      AND resolved_at >= $2 AND resolved_at < $3
                ) AS recovered_count,
                COALESCE(SUM(amount_cents) FILTER (
                    WHERE status = 'recovered'
                      AND resolved_at >= $2 AND resolved_at < $3
                ), 0) AS recovered_amount_cents,
                COUNT(*) FILTER (
                    WHERE status = 'exhausted'
                      AND resolved_at >= $2 AND resolved_at < $3
                ) AS exhausted_count,
                COUNT(*) FILTER (
                    WHERE status IN ('scheduled', 'retrying')
                ) AS active_count
            FROM recovery_records
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            "#,
        )
        .bind(tenant_id)
        .bind(since)
        .bind(until)
        .fetch_one(&self.pool)
        .await?;

        Ok(RecoveryStats {
            failed_count: row.failed_count,
            recovered_count: row.recovered_count,
            recovered_amount_cents: row.recovered_amount_cents.unwrap_or(0),
            exhausted_count: row.exhausted_count,
            active_count: row.active_count,
            recovery_rate: recovery_rate(row.recovered_count, row.exhausted_count),
        })
    }

    /// Per-day series over the window: failures by day of first failure,
    /// recoveries by day of resolution. Days with no activity are absent.
    pub async fn trend(
        &self,
        tenant_id: Option<Uuid>,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> RecoveryResult<Vec<TrendPoint>> {
        let points: Vec<TrendPoint> = sqlx::query_as(
            r#"
            WITH failures AS (
                SELECT DATE(first_failed_at) AS day, COUNT(*) AS failed_count
                FROM recovery_records
                WHERE ($1::uuid IS NULL OR tenant_id = $1)
                  AND first_failed_at >= $2 AND first_failed_at < $3
                GROUP BY DATE(first_failed_at)
            ),
            recoveries AS (
                SELECT DATE(resolved_at) AS day,
                       COUNT(*) AS recovered_count,
                       SUM(amount_cents) AS recovered_amount_cents
                FROM recovery_records
                WHERE ($1::uuid IS NULL OR tenant_id = $1)
                  AND status = 'recovered'
                  AND resolved_at >= $2 AND resolved_at < $3
                GROUP BY DATE(resolved_at)
            )
            SELECT
                COALESCE(f.day, r.day) AS day,
                COALESCE(f.failed_count, 0) AS failed_count,
                COALESCE(r.recovered_count, 0) AS recovered_count,
                COALESCE(r.recovered_amount_cents, 0) AS recovered_amount_cents
            FROM failures f
            FULL OUTER JOIN recoveries r ON f.day = r.day
            ORDER BY day
            "#,
        )
        .bind(tenant_id)
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_is_zero_with_no_resolved_records() {
        assert_eq!(recovery_rate(0, 0), 0.0);
    }

    #[test]
    fn rate_ignores_active_records_by_construction() {
        // Only resolved outcomes enter the division.
        assert_eq!(recovery_rate(3, 1), 0.75);
    }

    #[test]
    fn rate_with_only_recoveries_is_one() {
        assert_eq!(recovery_rate(5, 0), 1.0);
    }

    #[test]
    fn rate_with_only_exhaustions_is_zero() {
        assert_eq!(recovery_rate(0, 4), 0.0);
    }
}
