//! Expiring-card sweep
//!
//! Preventive dunning: cards on file that expire within the tenant's
//! lookahead window get a low-urgency heads-up email before a charge
//! ever fails. A per-card cooldown keeps the notice from repeating
//! every run.

use sqlx::PgPool;
use uuid::Uuid;

use crate::email::DunningEmailService;
use crate::error::RecoveryResult;
use crate::tenants::TenantDirectory;

/// A card on file that falls inside the expiry lookahead window.
#[derive(Debug, Clone, sqlx::FromRow)]
struct ExpiringCard {
    id: Uuid,
    customer_id: String,
    email: String,
    card_last4: String,
    card_exp_month: i32,
    card_exp_year: i32,
}

/// Counters for one pass of the expiry sweep.
#[derive(Debug, Default, Clone)]
pub struct ExpirySweepSummary {
    pub candidates: usize,
    pub notified: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct CardExpirySweep {
    pool: PgPool,
    tenants: TenantDirectory,
    email: DunningEmailService,
}

impl CardExpirySweep {
    pub fn new(pool: PgPool, tenants: TenantDirectory, email: DunningEmailService) -> Self {
        Self {
            pool,
            tenants,
            email,
        }
    }

    /// Run the sweep across every tenant. Per-tenant failures are logged
    /// and counted so one tenant cannot block the rest.
    pub async fn run(&self) -> RecoveryResult<ExpirySweepSummary> {
        let mut summary = ExpirySweepSummary::default();

        for tenant_id in self.tenants.all_ids().await? {
            match self.run_for_tenant(tenant_id).await {
                Ok(tenant_summary) => {
                    summary.candidates += tenant_summary.candidates;
                    summary.notified += tenant_summary.notified;
                    summary.skipped += tenant_summary.skipped;
                    summary.errors += tenant_summary.errors;
                }
                Err(e) => {
                    tracing::error!(
                        tenant_id = %tenant_id,
                        error = %e,
                        "Card expiry sweep failed for tenant"
                    );
                    summary.errors += 1;
                }
            }
        }

        tracing::info!(
            candidates = summary.candidates,
            notified = summary.notified,
            skipped = summary.skipped,
            errors = summary.errors,
            "Card expiry sweep complete"
        );
        Ok(summary)
    }

    async fn run_for_tenant(&self, tenant_id: Uuid) -> RecoveryResult<ExpirySweepSummary> {
        let tenant = self.tenants.get(tenant_id).await?;
        let mut summary = ExpirySweepSummary::default();

        // A card expires at the end of its expiry month; it is a candidate
        // once that moment is inside the lookahead window but not past.
        let cards: Vec<ExpiringCard> = sqlx::query_as(
            r#"
            SELECT id, customer_id, email, card_last4, card_exp_month, card_exp_year
            FROM payment_methods
            WHERE tenant_id = $1
              AND MAKE_DATE(card_exp_year, card_exp_month, 1) + INTERVAL '1 month'
                  BETWEEN NOW() AND NOW() + ($2 || ' days')::INTERVAL
            "#,
        )
        .bind(tenant_id)
        .bind(tenant.card_expiry_lookahead_days)
        .fetch_all(&self.pool)
        .await?;

        summary.candidates = cards.len();

        for card in cards {
            // Atomic claim: the insert only lands if no notice for this
            // card exists inside the cooldown window, so concurrent sweep
            // runs cannot double-notify.
            let claimed: Option<(Uuid,)> = sqlx::query_as(
                r#"
                INSERT INTO card_expiry_notices (tenant_id, payment_method_id, notified_at)
                SELECT $1, $2, NOW()
                WHERE NOT EXISTS (
                    SELECT 1 FROM card_expiry_notices
                    WHERE payment_method_id = $2
                      AND notified_at > NOW() - ($3 || ' days')::INTERVAL
                )
                RETURNING id
                "#,
            )
            .bind(tenant_id)
            .bind(card.id)
            .bind(tenant.card_expiry_cooldown_days)
            .fetch_optional(&self.pool)
            .await?;

            if claimed.is_none() {
                summary.skipped += 1;
                continue;
            }

            if !self.email.is_enabled() {
                tracing::debug!(
                    tenant_id = %tenant_id,
                    customer_id = %card.customer_id,
                    "Email sending disabled - expiry notice recorded but not sent"
                );
                summary.skipped += 1;
                continue;
            }

            let subject = format!(
                "{}: your card ending in {} expires soon",
                tenant.branding_name, card.card_last4
            );
            let html = format!(
                "<p>The card ending in {} we have on file for {} expires {:02}/{}. \
                 Please update your payment method to avoid any interruption.</p>",
                card.card_last4, tenant.branding_name, card.card_exp_month, card.card_exp_year
            );

            match self
                .email
                .send(&card.email, &subject, &html, tenant.reply_to.as_deref())
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        tenant_id = %tenant_id,
                        customer_id = %card.customer_id,
                        exp_month = card.card_exp_month,
                        exp_year = card.card_exp_year,
                        "Card expiry notice sent"
                    );
                    summary.notified += 1;
                }
                Err(e) => {
                    tracing::error!(
                        tenant_id = %tenant_id,
                        customer_id = %card.customer_id,
                        error = %e,
                        "Failed to send card expiry notice"
                    );
                    summary.errors += 1;
                }
            }
        }

        Ok(summary)
    }
}
