//! Recovery ledger
//!
//! Owns all persisted recovery state. Every other component reads records
//! through this service and submits mutations as guarded updates, so a
//! single writer per record is guaranteed without any global lock.
//!
//! The guard is optimistic: an update names the status set it expects the
//! record to be in, and zero affected rows means the caller lost a race.
//! The loser re-reads and decides whether its operation is still
//! applicable (usually it just discards itself).

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{RecoveryError, RecoveryResult};

/// Lifecycle status of a recovery record.
///
/// `Recovered` and `Cancelled` are absolutely terminal. `Exhausted` is
/// terminal for the automatic driver, but an out-of-band payment success
/// upgrades it to `Recovered`, and a manual retry within the grace window
/// re-enters `Retrying`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Scheduled,
    Retrying,
    Recovered,
    Exhausted,
    Cancelled,
}

impl RecoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStatus::Scheduled => "scheduled",
            RecoveryStatus::Retrying => "retrying",
            RecoveryStatus::Recovered => "recovered",
            RecoveryStatus::Exhausted => "exhausted",
            RecoveryStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> RecoveryResult<Self> {
        match s {
            "scheduled" => Ok(RecoveryStatus::Scheduled),
            "retrying" => Ok(RecoveryStatus::Retrying),
            "recovered" => Ok(RecoveryStatus::Recovered),
            "exhausted" => Ok(RecoveryStatus::Exhausted),
            "cancelled" => Ok(RecoveryStatus::Cancelled),
            other => Err(RecoveryError::Validation(format!(
                "unknown recovery status '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecoveryStatus::Recovered | RecoveryStatus::Exhausted | RecoveryStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The mutable state of one failing invoice's recovery lifecycle.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RecoveryRecord {
    pub id: Uuid,
    pub invoice_id: String,
    pub tenant_id: Uuid,
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub decline_code: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<OffsetDateTime>,
    pub first_failed_at: OffsetDateTime,
    pub last_attempt_at: Option<OffsetDateTime>,
    pub resolved_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl RecoveryRecord {
    pub fn status(&self) -> RecoveryResult<RecoveryStatus> {
        RecoveryStatus::parse(&self.status)
    }
}

/// One row of the per-record retry history.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RetryAttempt {
    pub id: Uuid,
    pub recovery_id: Uuid,
    pub attempt_number: i32,
    /// "succeeded" or "declined".
    pub outcome: String,
    pub decline_code: Option<String>,
    /// Whether the attempt was triggered manually or by the driver.
    pub manual: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub attempted_at: OffsetDateTime,
}

/// One row of the per-record dunning history.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DunningMessageRecord {
    pub id: Uuid,
    pub recovery_id: Uuid,
    pub stage: String,
    /// "sent", "failed" or "skipped" (email not configured).
    pub delivery_outcome: String,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
}

/// Field changes applied by a guarded update.
#[derive(Debug, Clone)]
pub struct RecordUpdate {
    pub status: RecoveryStatus,
    pub retry_count: i32,
    pub next_retry_at: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct Ledger {
    pool: PgPool,
}

impl Ledger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the record for an invoice's first failure. Returns the
    /// existing record untouched when one is already present (at most one
    /// record per invoice, ever).
    #[allow(clippy::too_many_arguments)]
    pub async fn create_if_absent(
        &self,
        invoice_id: &str,
        tenant_id: Uuid,
        customer_id: &str,
        subscription_id: Option<&str>,
        amount_cents: i64,
        currency: &str,
        decline_code: &str,
        initial: &RecordUpdate,
        first_failed_at: OffsetDateTime,
        max_retries: i32,
    ) -> RecoveryResult<(RecoveryRecord, bool)> {
        let inserted: Option<RecoveryRecord> = sqlx::query_as(
            r#"
            INSERT INTO recovery_records (
                id, invoice_id, tenant_id, customer_id, subscription_id,
                amount_cents, currency, status, decline_code,
                retry_count, max_retries, next_retry_at, first_failed_at,
                resolved_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW(), NOW())
            ON CONFLICT (invoice_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(invoice_id)
        .bind(tenant_id)
        .bind(customer_id)
        .bind(subscription_id)
        .bind(amount_cents)
        .bind(currency)
        .bind(initial.status.as_str())
        .bind(decline_code)
        .bind(initial.retry_count)
        .bind(max_retries)
        .bind(initial.next_retry_at)
        .bind(first_failed_at)
        .bind(if initial.status.is_terminal() {
            Some(first_failed_at)
        } else {
            None
        })
        .fetch_optional(&self.pool)
        .await?;

        if let Some(record) = inserted {
            return Ok((record, true));
        }

        let existing = self.find_by_invoice(invoice_id).await?.ok_or_else(|| {
            // Insert conflicted but the row is not visible: caller retries.
            RecoveryError::Transient(format!(
                "record for invoice {invoice_id} conflicted but could not be read back"
            ))
        })?;
        Ok((existing, false))
    }

    pub async fn find_by_invoice(&self, invoice_id: &str) -> RecoveryResult<Option<RecoveryRecord>> {
        let record = sqlx::query_as::<_, RecoveryRecord>(
            "SELECT * FROM recovery_records WHERE invoice_id = $1",
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// All records for a customer, newest first. An empty list is a valid
    /// "never failed" outcome, distinct from an unknown invoice.
    pub async fn find_by_customer(&self, customer_id: &str) -> RecoveryResult<Vec<RecoveryRecord>> {
        let records = sqlx::query_as::<_, RecoveryRecord>(
            "SELECT * FROM recovery_records WHERE customer_id = $1 ORDER BY first_failed_at DESC",
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Active (non-terminal) records attached to a subscription.
    pub async fn find_active_by_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: &str,
    ) -> RecoveryResult<Vec<RecoveryRecord>> {
        let records = sqlx::query_as::<_, RecoveryRecord>(
            r#"
            SELECT * FROM recovery_records
            WHERE tenant_id = $1
              AND subscription_id = $2
              AND status IN ('scheduled', 'retrying')
            "#,
        )
        .bind(tenant_id)
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Conditional update: applies only while the record is in one of the
    /// expected statuses. Zero affected rows means the caller lost a race
    /// (or the invoice vanished) and gets a `Conflict`/`NotFound` with the
    /// actual status, so it can re-evaluate.
    pub async fn update_guarded(
        &self,
        invoice_id: &str,
        expected: &[RecoveryStatus],
        update: &RecordUpdate,
    ) -> RecoveryResult<RecoveryRecord> {
        let expected_strs: Vec<&str> = expected.iter().map(|s| s.as_str()).collect();
        let resolved = update.status.is_terminal();

        let record: Option<RecoveryRecord> = sqlx::query_as(
            r#"
            UPDATE recovery_records
            SET status = $3,
                retry_count = $4,
                next_retry_at = $5,
                resolved_at = CASE WHEN $6 THEN COALESCE(resolved_at, NOW()) ELSE resolved_at END,
                updated_at = NOW()
            WHERE invoice_id = $1
              AND status = ANY($2)
            RETURNING *
            "#,
        )
        .bind(invoice_id)
        .bind(&expected_strs[..])
        .bind(update.status.as_str())
        .bind(update.retry_count)
        .bind(update.next_retry_at)
        .bind(resolved)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(record) = record {
            return Ok(record);
        }

        match self.find_by_invoice(invoice_id).await? {
            Some(actual) => Err(RecoveryError::Conflict {
                invoice_id: invoice_id.to_string(),
                expected: expected_strs.join("|"),
                actual: actual.status,
            }),
            None => Err(RecoveryError::NotFound(format!("invoice {invoice_id}"))),
        }
    }

    /// Atomically claim due records for the retry driver: scheduled rows
    /// whose next_retry_at has passed flip to `retrying` and are returned.
    /// A second driver firing for the same due timestamp finds nothing to
    /// claim, which is what makes at-least-once triggering safe.
    pub async fn claim_due(&self, limit: i64) -> RecoveryResult<Vec<RecoveryRecord>> {
        let records = sqlx::query_as::<_, RecoveryRecord>(
            r#"
            UPDATE recovery_records
            SET status = 'retrying', last_attempt_at = NOW(), updated_at = NOW()
            WHERE id IN (
                SELECT id FROM recovery_records
                WHERE status = 'scheduled'
                  AND next_retry_at IS NOT NULL
                  AND next_retry_at <= NOW()
                ORDER BY next_retry_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Claim a single record for a manual or immediate retry.
    pub async fn claim_for_retry(
        &self,
        invoice_id: &str,
        expected: &[RecoveryStatus],
    ) -> RecoveryResult<RecoveryRecord> {
        let expected_strs: Vec<&str> = expected.iter().map(|s| s.as_str()).collect();
        let record: Option<RecoveryRecord> = sqlx::query_as(
            r#"
            UPDATE recovery_records
            SET status = 'retrying', last_attempt_at = NOW(), updated_at = NOW()
            WHERE invoice_id = $1
              AND status = ANY($2)
            RETURNING *
            "#,
        )
        .bind(invoice_id)
        .bind(&expected_strs[..])
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => Ok(record),
            None => match self.find_by_invoice(invoice_id).await? {
                Some(actual) => Err(RecoveryError::Conflict {
                    invoice_id: invoice_id.to_string(),
                    expected: expected_strs.join("|"),
                    actual: actual.status,
                }),
                None => Err(RecoveryError::NotFound(format!("invoice {invoice_id}"))),
            },
        }
    }

    pub async fn append_attempt(
        &self,
        recovery_id: Uuid,
        attempt_number: i32,
        outcome: &str,
        decline_code: Option<&str>,
        manual: bool,
    ) -> RecoveryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO retry_attempts (id, recovery_id, attempt_number, outcome, decline_code, manual, attempted_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(recovery_id)
        .bind(attempt_number)
        .bind(outcome)
        .bind(decline_code)
        .bind(manual)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of charge attempts recorded for a record. Drives attempt
    /// numbering: only completed attempts append rows, so a replay after
    /// a transport failure reuses the previous number.
    pub async fn attempt_count(&self, recovery_id: Uuid) -> RecoveryResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM retry_attempts WHERE recovery_id = $1")
                .bind(recovery_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn attempts(&self, recovery_id: Uuid) -> RecoveryResult<Vec<RetryAttempt>> {
        let attempts = sqlx::query_as::<_, RetryAttempt>(
            "SELECT * FROM retry_attempts WHERE recovery_id = $1 ORDER BY attempted_at",
        )
        .bind(recovery_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }

    /// Claim a dunning stage for an invoice. Returns the message row id
    /// when this caller won the claim, None when the stage was already
    /// sent (idempotent per stage per invoice).
    pub async fn claim_dunning_stage(
        &self,
        recovery_id: Uuid,
        stage: &str,
    ) -> RecoveryResult<Option<Uuid>> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO dunning_messages (id, recovery_id, stage, delivery_outcome, sent_at)
            VALUES ($1, $2, $3, 'pending', NOW())
            ON CONFLICT (recovery_id, stage) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(recovery_id)
        .bind(stage)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.map(|(id,)| id))
    }

    /// Record the delivery outcome on a previously claimed dunning row.
    /// Send failures are recorded, never propagated into state machine
    /// transitions.
    pub async fn finish_dunning_message(
        &self,
        message_id: Uuid,
        delivery_outcome: &str,
        error_message: Option<&str>,
    ) -> RecoveryResult<()> {
        sqlx::query(
            r#"
            UPDATE dunning_messages
            SET delivery_outcome = $2, error_message = $3
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .bind(delivery_outcome)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn dunning_history(
        &self,
        recovery_id: Uuid,
    ) -> RecoveryResult<Vec<DunningMessageRecord>> {
        let messages = sqlx::query_as::<_, DunningMessageRecord>(
            "SELECT * FROM dunning_messages WHERE recovery_id = $1 ORDER BY sent_at",
        )
        .bind(recovery_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    /// Non-terminal records whose first failure is older than the given
    /// threshold and which still owe a reminder. Used by the reminder
    /// sweep; stage dedupe happens at claim time.
    pub async fn reminder_candidates(
        &self,
        older_than: OffsetDateTime,
        limit: i64,
    ) -> RecoveryResult<Vec<RecoveryRecord>> {
        let records = sqlx::query_as::<_, RecoveryRecord>(
            r#"
            SELECT r.* FROM recovery_records r
            WHERE r.status IN ('scheduled', 'retrying')
              AND r.first_failed_at <= $1
              AND NOT EXISTS (
                  SELECT 1 FROM dunning_messages d
                  WHERE d.recovery_id = r.id AND d.stage = 'reminder'
              )
            ORDER BY r.first_failed_at
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
