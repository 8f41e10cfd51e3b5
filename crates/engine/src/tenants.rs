//! Tenant directory
//!
//! Maps a merchant/tenant identifier to processor credentials, branding
//! and dunning preferences. Configuration is versioned and fetched at
//! event-processing time; client-held copies are never trusted.

use sqlx::PgPool;
use time::Duration;
use uuid::Uuid;

use crate::error::{RecoveryError, RecoveryResult};

/// Per-tenant configuration record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TenantConfig {
    pub id: Uuid,
    pub name: String,
    /// Secret used to verify inbound webhook signatures for this tenant.
    pub webhook_secret: String,
    /// Credential reference for the upstream processor's charge API.
    pub processor_api_key: String,
    /// Name shown in dunning emails.
    pub branding_name: String,
    pub reply_to: Option<String>,
    /// Hours after first failure before the reminder stage fires.
    pub reminder_after_hours: i32,
    /// Hours after the last attempt during which a manual retry of an
    /// exhausted invoice is still accepted.
    pub manual_retry_grace_hours: i32,
    /// Days of lookahead for the expiring-card sweep.
    pub card_expiry_lookahead_days: i32,
    /// Days before the same customer/card is notified again.
    pub card_expiry_cooldown_days: i32,
    /// Bumped on every configuration change.
    pub config_version: i32,
}

impl TenantConfig {
    pub fn reminder_threshold(&self) -> Duration {
        Duration::hours(self.reminder_after_hours as i64)
    }

    pub fn manual_retry_grace(&self) -> Duration {
        Duration::hours(self.manual_retry_grace_hours as i64)
    }
}

/// Read access to the tenant directory.
#[derive(Clone)]
pub struct TenantDirectory {
    pool: PgPool,
}

impl TenantDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, tenant_id: Uuid) -> RecoveryResult<TenantConfig> {
        let tenant = sqlx::query_as::<_, TenantConfig>(
            r#"
            SELECT id, name, webhook_secret, processor_api_key, branding_name, reply_to,
                   reminder_after_hours, manual_retry_grace_hours,
                   card_expiry_lookahead_days, card_expiry_cooldown_days, config_version
            FROM tenants
            WHERE id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        tenant.ok_or_else(|| RecoveryError::NotFound(format!("tenant {tenant_id}")))
    }

    /// All tenant ids, for sweeps that iterate the directory.
    pub async fn all_ids(&self) -> RecoveryResult<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM tenants ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Contact email for a customer, from the stored payment methods.
    pub async fn customer_email(
        &self,
        tenant_id: Uuid,
        customer_id: &str,
    ) -> RecoveryResult<Option<String>> {
        let email: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT email FROM payment_methods
            WHERE tenant_id = $1 AND customer_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(email.map(|(e,)| e))
    }
}
