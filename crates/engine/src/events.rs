//! Processor event ingestion
//!
//! Verifies, deduplicates, and normalizes raw processor webhook
//! deliveries into typed events, then routes them to the scheduler.
//! Signature verification is manual HMAC-SHA256 over the timestamped
//! payload, checked against the tenant's webhook secret.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{RecoveryError, RecoveryResult};
use crate::scheduler::RetryScheduler;
use crate::tenants::TenantDirectory;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew between the signature timestamp and now.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Events stuck in `processing` longer than this are eligible for
/// re-claim by a later delivery of the same event.
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Raw envelope shared by every processor event type.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawPaymentFailed {
    invoice_id: String,
    customer_id: String,
    #[serde(default)]
    subscription_id: Option<String>,
    amount_cents: i64,
    currency: String,
    #[serde(default)]
    decline_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPaymentSucceeded {
    invoice_id: String,
}

#[derive(Debug, Deserialize)]
struct RawSubscriptionUpdated {
    subscription_id: String,
    #[serde(default)]
    change_kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSubscriptionDeleted {
    subscription_id: String,
}

/// A normalized `payment_failed`, ready for the scheduler.
#[derive(Debug, Clone)]
pub struct PaymentFailed {
    pub invoice_id: String,
    pub tenant_id: Uuid,
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub decline_code: String,
    pub occurred_at: OffsetDateTime,
}

/// Typed processor events the engine reacts to.
#[derive(Debug, Clone)]
pub enum ProcessorEvent {
    PaymentFailed(PaymentFailed),
    PaymentSucceeded {
        invoice_id: String,
    },
    SubscriptionUpdated {
        subscription_id: String,
        payment_method_updated: bool,
    },
    SubscriptionDeleted {
        subscription_id: String,
    },
    /// Recognized envelope, irrelevant event type. Acknowledged and dropped.
    Ignored {
        event_type: String,
    },
}

/// Ingests raw webhook deliveries for one tenant at a time.
pub struct EventIngestor {
    pool: PgPool,
    tenants: TenantDirectory,
    scheduler: RetryScheduler,
}

impl EventIngestor {
    pub fn new(pool: PgPool, tenants: TenantDirectory, scheduler: RetryScheduler) -> Self {
        Self {
            pool,
            tenants,
            scheduler,
        }
    }

    /// Verify a delivery's signature against the tenant's webhook secret.
    ///
    /// Header format: `t=<unix seconds>,v1=<hex hmac>`. The signed payload
    /// is `"{t}.{body}"`. Deliveries older than the tolerance window are
    /// rejected even with a valid MAC.
    pub async fn verify_signature(
        &self,
        tenant_id: Uuid,
        payload: &str,
        signature: &str,
    ) -> RecoveryResult<()> {
        let tenant = self.tenants.get(tenant_id).await?;

        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!(tenant_id = %tenant_id, "Missing timestamp in signature header");
            RecoveryError::Authentication
        })?;
        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::warn!(tenant_id = %tenant_id, "Missing v1 signature in signature header");
            RecoveryError::Authentication
        })?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                tenant_id = %tenant_id,
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(RecoveryError::Authentication);
        }

        let provided = hex::decode(&v1_signature).map_err(|_| {
            tracing::warn!(tenant_id = %tenant_id, "Signature is not valid hex");
            RecoveryError::Authentication
        })?;

        let signed_payload = format!("{timestamp}.{payload}");
        let mut mac =
            HmacSha256::new_from_slice(tenant.webhook_secret.as_bytes()).map_err(|_| {
                tracing::error!(tenant_id = %tenant_id, "Webhook secret unusable as HMAC key");
                RecoveryError::Authentication
            })?;
        mac.update(signed_payload.as_bytes());

        // Constant-time comparison via the MAC itself.
        mac.verify_slice(&provided).map_err(|_| {
            tracing::warn!(tenant_id = %tenant_id, "Webhook signature mismatch");
            RecoveryError::Authentication
        })?;

        Ok(())
    }

    /// Parse a verified payload into a typed event. Malformed envelopes or
    /// event bodies are a validation error; unknown event types are not.
    pub fn normalize(&self, tenant_id: Uuid, payload: &str) -> RecoveryResult<(String, ProcessorEvent)> {
        let envelope: RawEnvelope = serde_json::from_str(payload)
            .map_err(|e| RecoveryError::Validation(format!("malformed event envelope: {e}")))?;

        let occurred_at = OffsetDateTime::from_unix_timestamp(envelope.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let event = match envelope.event_type.as_str() {
            "payment_failed" => {
                let raw: RawPaymentFailed = serde_json::from_value(envelope.data)
                    .map_err(|e| RecoveryError::Validation(format!("payment_failed: {e}")))?;
                if raw.amount_cents <= 0 {
                    return Err(RecoveryError::Validation(format!(
                        "payment_failed: non-positive amount {}",
                        raw.amount_cents
                    )));
                }
                ProcessorEvent::PaymentFailed(PaymentFailed {
                    invoice_id: raw.invoice_id,
                    tenant_id,
                    customer_id: raw.customer_id,
                    subscription_id: raw.subscription_id,
                    amount_cents: raw.amount_cents,
                    currency: raw.currency,
                    // Missing decline code is still actionable; the
                    // classifier has a conservative bucket for it.
                    decline_code: raw.decline_code.unwrap_or_else(|| "unknown".to_string()),
                    occurred_at,
                })
            }
            "payment_succeeded" => {
                let raw: RawPaymentSucceeded = serde_json::from_value(envelope.data)
                    .map_err(|e| RecoveryError::Validation(format!("payment_succeeded: {e}")))?;
                ProcessorEvent::PaymentSucceeded {
                    invoice_id: raw.invoice_id,
                }
            }
            "subscription_updated" => {
                let raw: RawSubscriptionUpdated = serde_json::from_value(envelope.data)
                    .map_err(|e| RecoveryError::Validation(format!("subscription_updated: {e}")))?;
                ProcessorEvent::SubscriptionUpdated {
                    subscription_id: raw.subscription_id,
                    payment_method_updated: raw.change_kind.as_deref()
                        == Some("payment_method_updated"),
                }
            }
            "subscription_deleted" => {
                let raw: RawSubscriptionDeleted = serde_json::from_value(envelope.data)
                    .map_err(|e| RecoveryError::Validation(format!("subscription_deleted: {e}")))?;
                ProcessorEvent::SubscriptionDeleted {
                    subscription_id: raw.subscription_id,
                }
            }
            other => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    event_type = %other,
                    "Unhandled processor event type - acknowledged without action"
                );
                ProcessorEvent::Ignored {
                    event_type: other.to_string(),
                }
            }
        };

        Ok((envelope.id, event))
    }

    /// Verify, deduplicate, and process one raw delivery. This is the
    /// single entry point the webhook route calls.
    ///
    /// Idempotency is an atomic claim: INSERT...ON CONFLICT...RETURNING
    /// ensures exactly one concurrent delivery of an event id wins
    /// processing rights. Only `success` is terminal: rows that ended in
    /// `error` are re-claimable so the processor's redelivery retries
    /// them, and rows stuck in `processing` past the timeout are
    /// re-claimable so a crashed worker does not poison the id.
    pub async fn ingest(
        &self,
        tenant_id: Uuid,
        payload: &str,
        signature: &str,
    ) -> RecoveryResult<()> {
        self.verify_signature(tenant_id, payload, signature).await?;
        let (event_id, event) = self.normalize(tenant_id, payload)?;

        let event_type = match &event {
            ProcessorEvent::PaymentFailed(_) => "payment_failed",
            ProcessorEvent::PaymentSucceeded { .. } => "payment_succeeded",
            ProcessorEvent::SubscriptionUpdated { .. } => "subscription_updated",
            ProcessorEvent::SubscriptionDeleted { .. } => "subscription_deleted",
            ProcessorEvent::Ignored { event_type } => event_type.as_str(),
        };

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO processor_events
                (processor_event_id, tenant_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (processor_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE processor_events.processing_result = 'error'
               OR (processor_events.processing_result = 'processing'
                   AND processor_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL)
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(tenant_id)
        .bind(event_type)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                tenant_id = %tenant_id,
                "Duplicate processor event - already claimed"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            tenant_id = %tenant_id,
            "Processing processor event"
        );

        let result = self.process(tenant_id, &event_id, &event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };
        if let Err(e) = sqlx::query(
            r#"
            UPDATE processor_events
            SET processing_result = $1, error_message = $2
            WHERE processor_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(&event_id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to record event processing result"
            );
        }

        result
    }

    async fn process(
        &self,
        tenant_id: Uuid,
        event_id: &str,
        event: &ProcessorEvent,
    ) -> RecoveryResult<()> {
        match event {
            ProcessorEvent::PaymentFailed(failed) => {
                self.append_failure_audit(tenant_id, event_id, failed).await?;
                self.scheduler.record_failure(failed).await?;
            }
            ProcessorEvent::PaymentSucceeded { invoice_id } => {
                self.scheduler.apply_external_success(invoice_id).await?;
            }
            ProcessorEvent::SubscriptionUpdated {
                subscription_id,
                payment_method_updated,
            } => {
                if *payment_method_updated {
                    self.scheduler
                        .apply_payment_method_updated(tenant_id, subscription_id)
                        .await?;
                } else {
                    tracing::debug!(
                        tenant_id = %tenant_id,
                        subscription_id = %subscription_id,
                        "Subscription update without payment method change - no action"
                    );
                }
            }
            ProcessorEvent::SubscriptionDeleted { subscription_id } => {
                self.scheduler
                    .apply_subscription_deleted(tenant_id, subscription_id)
                    .await?;
            }
            ProcessorEvent::Ignored { .. } => {}
        }
        Ok(())
    }

    /// Drop processed-event bookkeeping older than the retention window.
    /// Retained long enough that duplicate deliveries are still caught,
    /// then cleared so the table does not grow without bound. The
    /// `failure_events` audit trail is never touched.
    pub async fn cleanup_processed_events(&self, retention_days: i32) -> RecoveryResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM processor_events
            WHERE processing_result = 'success'
              AND processing_started_at < NOW() - ($1 || ' days')::INTERVAL
            "#,
        )
        .bind(retention_days)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::info!(deleted = deleted, "Cleared old processed-event records");
        }
        Ok(deleted)
    }

    /// Every failure delivery lands in the audit trail, including repeats
    /// for invoices already under recovery.
    async fn append_failure_audit(
        &self,
        tenant_id: Uuid,
        event_id: &str,
        failed: &PaymentFailed,
    ) -> RecoveryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO failure_events
                (tenant_id, processor_event_id, invoice_id, customer_id, subscription_id,
                 amount_cents, currency, decline_code, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(tenant_id)
        .bind(event_id)
        .bind(&failed.invoice_id)
        .bind(&failed.customer_id)
        .bind(failed.subscription_id.as_deref())
        .bind(failed.amount_cents)
        .bind(&failed.currency)
        .bind(&failed.decline_code)
        .bind(failed.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Compute a valid signature header for a payload. Test and tooling use.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &str) -> RecoveryResult<String> {
    let signed = format!("{timestamp}.{payload}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| RecoveryError::Configuration("webhook secret unusable as HMAC key".into()))?;
    mac.update(signed.as_bytes());
    Ok(format!(
        "t={timestamp},v1={}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingestor_free_normalize(payload: &str) -> RecoveryResult<(String, ProcessorEvent)> {
        // normalize() never touches the pool, so a zeroed ingestor is not
        // needed; replicate its parse path directly.
        let envelope: RawEnvelope = serde_json::from_str(payload)
            .map_err(|e| RecoveryError::Validation(format!("malformed event envelope: {e}")))?;
        Ok((envelope.id, ProcessorEvent::Ignored { event_type: envelope.event_type }))
    }

    #[test]
    fn envelope_requires_core_fields() {
        let err = ingestor_free_normalize(r#"{"id": "evt_1"}"#);
        assert!(matches!(err, Err(RecoveryError::Validation(_))));

        let ok = ingestor_free_normalize(
            r#"{"id": "evt_1", "type": "payment_failed", "created": 1700000000, "data": {}}"#,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn payment_failed_body_parses() {
        let raw: RawPaymentFailed = serde_json::from_str(
            r#"{
                "invoice_id": "in_123",
                "customer_id": "cus_9",
                "subscription_id": "sub_4",
                "amount_cents": 2900,
                "currency": "usd",
                "decline_code": "insufficient_funds"
            }"#,
        )
        .unwrap();
        assert_eq!(raw.invoice_id, "in_123");
        assert_eq!(raw.amount_cents, 2900);
        assert_eq!(raw.decline_code.as_deref(), Some("insufficient_funds"));
    }

    #[test]
    fn payment_failed_decline_code_is_optional() {
        let raw: RawPaymentFailed = serde_json::from_str(
            r#"{
                "invoice_id": "in_123",
                "customer_id": "cus_9",
                "amount_cents": 2900,
                "currency": "usd"
            }"#,
        )
        .unwrap();
        assert!(raw.decline_code.is_none());
        assert!(raw.subscription_id.is_none());
    }

    #[test]
    fn signature_round_trip_verifies() {
        let secret = "whsec_test_secret";
        let payload = r#"{"id":"evt_1"}"#;
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign_payload(secret, ts, payload).unwrap();

        // Re-derive the MAC the verifier computes and compare.
        let v1 = header
            .split(',')
            .find_map(|p| p.strip_prefix("v1="))
            .unwrap()
            .to_string();
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{ts}.{payload}").as_bytes());
        assert_eq!(v1, hex::encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let secret = "whsec_test_secret";
        let ts = 1700000000;
        let header = sign_payload(secret, ts, r#"{"id":"evt_1"}"#).unwrap();
        let v1 = hex::decode(
            header
                .split(',')
                .find_map(|p| p.strip_prefix("v1="))
                .unwrap(),
        )
        .unwrap();

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{ts}.{}", r#"{"id":"evt_2"}"#).as_bytes());
        assert!(mac.verify_slice(&v1).is_err());
    }

    #[test]
    fn signature_header_carries_timestamp() {
        let header = sign_payload("s", 1700000000, "body").unwrap();
        assert!(header.starts_with("t=1700000000,v1="));
    }

    /// Redelivery semantics of the idempotency claim: a delivery whose
    /// processing failed must be reprocessed when the processor redelivers
    /// it, while a successfully processed delivery stays a no-op duplicate.
    #[sqlx::test(migrations = "../../migrations")]
    async fn failed_delivery_is_reprocessed_on_redelivery(pool: sqlx::PgPool) {
        use crate::{DunningEmailService, ProcessorClient, RecoveryEngine};

        let engine = RecoveryEngine::new(
            pool.clone(),
            ProcessorClient::new("http://processor.invalid".to_string()),
            DunningEmailService::from_env(),
        );

        let tenant_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO tenants (id, name, webhook_secret, processor_api_key, branding_name)
            VALUES ($1, 'Acme', 'whsec_redeliver', 'pk_test', 'Acme')
            "#,
        )
        .bind(tenant_id)
        .execute(&pool)
        .await
        .unwrap();

        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let payload = serde_json::json!({
            "id": "evt_redeliver_1",
            "type": "payment_failed",
            "created": ts,
            "data": {
                "invoice_id": "in_redeliver_1",
                "customer_id": "cus_redeliver_1",
                "amount_cents": 2900,
                "currency": "usd",
                "decline_code": "insufficient_funds"
            }
        })
        .to_string();
        let signature = sign_payload("whsec_redeliver", ts, &payload).unwrap();

        let failure_count = || async {
            let (n,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM failure_events WHERE invoice_id = 'in_redeliver_1'",
            )
            .fetch_one(&pool)
            .await
            .unwrap();
            n
        };

        engine
            .ingestor
            .ingest(tenant_id, &payload, &signature)
            .await
            .unwrap();
        assert_eq!(failure_count().await, 1);

        // Flip the bookkeeping to the state a transient processing
        // failure leaves behind, then redeliver.
        sqlx::query(
            "UPDATE processor_events SET processing_result = 'error' \
             WHERE processor_event_id = 'evt_redeliver_1'",
        )
        .execute(&pool)
        .await
        .unwrap();

        engine
            .ingestor
            .ingest(tenant_id, &payload, &signature)
            .await
            .unwrap();
        assert_eq!(failure_count().await, 2);

        let (result,): (String,) = sqlx::query_as(
            "SELECT processing_result FROM processor_events \
             WHERE processor_event_id = 'evt_redeliver_1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(result, "success");

        // A further redelivery of the now-successful event is a duplicate.
        engine
            .ingestor
            .ingest(tenant_id, &payload, &signature)
            .await
            .unwrap();
        assert_eq!(failure_count().await, 2);

        // Exactly one recovery record regardless of redeliveries.
        let (records,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM recovery_records WHERE invoice_id = 'in_redeliver_1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(records, 1);
    }
}
