//! Dunning orchestrator
//!
//! Decides which customer email (if any) a record transition triggers,
//! renders it with tenant branding, and records the outcome. Stage
//! selection is pure; the orchestrator only executes what selection and
//! the transition effects decide.
//!
//! Invariants: stages are monotonically non-decreasing per invoice, each
//! stage is sent at most once (claimed in the ledger before sending), and
//! a recovered invoice gets at most one confirmation with every other
//! pending stage suppressed.

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::classifier::DunningTone;
use crate::email::DunningEmailService;
use crate::error::RecoveryResult;
use crate::ledger::{Ledger, RecoveryRecord, RecoveryStatus};
use crate::tenants::{TenantConfig, TenantDirectory};

/// Dunning sequence stages, in escalation order.
///
/// `ActionRequired` replaces the soft ladder for non-retryable declines;
/// `Confirmation` is only ever sent on recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DunningStage {
    InitialNotice,
    Reminder,
    FinalWarning,
    ActionRequired,
    Confirmation,
}

impl DunningStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DunningStage::InitialNotice => "initial_notice",
            DunningStage::Reminder => "reminder",
            DunningStage::FinalWarning => "final_warning",
            DunningStage::ActionRequired => "action_required",
            DunningStage::Confirmation => "confirmation",
        }
    }

}

/// Stage to open a brand-new recovery with, given the policy tone.
pub fn opening_stage(tone: DunningTone) -> Option<DunningStage> {
    match tone {
        // Non-retryable declines skip the soft stages entirely.
        DunningTone::Urgent => Some(DunningStage::ActionRequired),
        DunningTone::Neutral => Some(DunningStage::InitialNotice),
        DunningTone::None => None,
    }
}

/// Whether a candidate stage may be sent given what was already sent.
/// Keeps the sequence monotonic: a reminder never precedes the initial
/// notice, and nothing but a confirmation follows recovery.
pub fn stage_allowed(candidate: DunningStage, sent: &[DunningStage]) -> bool {
    if sent.contains(&candidate) {
        return false;
    }
    if sent.contains(&DunningStage::Confirmation) {
        return false;
    }
    match candidate {
        DunningStage::InitialNotice => sent.is_empty(),
        DunningStage::Reminder => sent.contains(&DunningStage::InitialNotice),
        DunningStage::FinalWarning => {
            sent.contains(&DunningStage::InitialNotice)
                || sent.contains(&DunningStage::ActionRequired)
        }
        // Escalation and confirmation do not depend on earlier stages.
        DunningStage::ActionRequired | DunningStage::Confirmation => true,
    }
}

/// Reminder decision for the periodic sweep: fire once the tenant's
/// elapsed threshold is crossed and the record is still active.
pub fn reminder_due(
    status: RecoveryStatus,
    first_failed_at: OffsetDateTime,
    threshold: Duration,
    now: OffsetDateTime,
) -> bool {
    !status.is_terminal() && now - first_failed_at >= threshold
}

fn format_amount(amount_cents: i64, currency: &str) -> String {
    format!("{:.2} {}", amount_cents as f64 / 100.0, currency.to_uppercase())
}

/// Render subject and body for a stage. Content is deliberately plain;
/// per-tenant template editing is outside the engine.
fn render(stage: DunningStage, tenant: &TenantConfig, record: &RecoveryRecord) -> (String, String) {
    let amount = format_amount(record.amount_cents, &record.currency);
    let brand = &tenant.branding_name;

    match stage {
        DunningStage::InitialNotice => (
            format!("{brand}: payment of {amount} failed"),
            format!(
                "<p>Your recent payment of {amount} to {brand} could not be processed. \
                 We will retry automatically; no action is needed yet. \
                 If you would like to resolve this sooner, please update your payment method.</p>"
            ),
        ),
        DunningStage::Reminder => (
            format!("{brand}: reminder - payment of {amount} still outstanding"),
            format!(
                "<p>We still have not been able to collect your payment of {amount} to {brand}. \
                 Please check that your payment method is up to date.</p>"
            ),
        ),
        DunningStage::FinalWarning => (
            format!("{brand}: final notice for payment of {amount}"),
            format!(
                "<p>This is the final automatic attempt to collect {amount} for {brand}. \
                 If it fails, your subscription may be interrupted. \
                 Please update your payment method now.</p>"
            ),
        ),
        DunningStage::ActionRequired => (
            format!("{brand}: action required - your card was declined"),
            format!(
                "<p>Your payment of {amount} to {brand} was declined in a way we cannot retry \
                 (for example an expired or replaced card). \
                 Please update your payment method to keep your subscription active.</p>"
            ),
        ),
        DunningStage::Confirmation => (
            format!("{brand}: payment of {amount} recovered"),
            format!(
                "<p>Good news - your payment of {amount} to {brand} went through. \
                 No further action is needed.</p>"
            ),
        ),
    }
}

/// Executes dunning decisions: claims a stage, renders, sends, records.
#[derive(Clone)]
pub struct DunningOrchestrator {
    ledger: Ledger,
    tenants: TenantDirectory,
    email: DunningEmailService,
}

impl DunningOrchestrator {
    pub fn new(ledger: Ledger, tenants: TenantDirectory, email: DunningEmailService) -> Self {
        Self {
            ledger,
            tenants,
            email,
        }
    }

    /// Send a stage for a record if the sequence allows it and it has not
    /// been sent before. Errors from the email transport are recorded on
    /// the message row; only storage errors propagate.
    pub async fn dispatch(&self, record: &RecoveryRecord, stage: DunningStage) -> RecoveryResult<()> {
        let sent = self.sent_stages(record).await?;
        if !stage_allowed(stage, &sent) {
            tracing::debug!(
                invoice_id = %record.invoice_id,
                stage = %stage.as_str(),
                "Dunning stage suppressed by sequence rules"
            );
            return Ok(());
        }

        // Claim before sending: the unique (recovery, stage) row is what
        // makes the stage at-most-once under concurrent triggers.
        let Some(message_id) = self
            .ledger
            .claim_dunning_stage(record.id, stage.as_str())
            .await?
        else {
            tracing::debug!(
                invoice_id = %record.invoice_id,
                stage = %stage.as_str(),
                "Dunning stage already claimed"
            );
            return Ok(());
        };

        let tenant = self.tenants.get(record.tenant_id).await?;
        let recipient = self
            .tenants
            .customer_email(record.tenant_id, &record.customer_id)
            .await?;

        let Some(recipient) = recipient else {
            tracing::warn!(
                invoice_id = %record.invoice_id,
                customer_id = %record.customer_id,
                "No customer email on file - dunning message skipped"
            );
            self.ledger
                .finish_dunning_message(message_id, "skipped", Some("no customer email"))
                .await?;
            return Ok(());
        };

        if !self.email.is_enabled() {
            self.ledger
                .finish_dunning_message(message_id, "skipped", Some("email not configured"))
                .await?;
            return Ok(());
        }

        let (subject, html) = render(stage, &tenant, record);
        match self
            .email
            .send(&recipient, &subject, &html, tenant.reply_to.as_deref())
            .await
        {
            Ok(()) => {
                tracing::info!(
                    invoice_id = %record.invoice_id,
                    stage = %stage.as_str(),
                    "Dunning message sent"
                );
                self.ledger
                    .finish_dunning_message(message_id, "sent", None)
                    .await?;
            }
            Err(e) => {
                // Delivery failure is data, not a reason to unwind the
                // transition that triggered this message.
                tracing::error!(
                    invoice_id = %record.invoice_id,
                    stage = %stage.as_str(),
                    error = %e,
                    "Failed to send dunning message"
                );
                self.ledger
                    .finish_dunning_message(message_id, "failed", Some(&e.to_string()))
                    .await?;
            }
        }

        Ok(())
    }

    async fn sent_stages(&self, record: &RecoveryRecord) -> RecoveryResult<Vec<DunningStage>> {
        let history = self.ledger.dunning_history(record.id).await?;
        Ok(history
            .iter()
            .filter_map(|m| match m.stage.as_str() {
                "initial_notice" => Some(DunningStage::InitialNotice),
                "reminder" => Some(DunningStage::Reminder),
                "final_warning" => Some(DunningStage::FinalWarning),
                "action_required" => Some(DunningStage::ActionRequired),
                "confirmation" => Some(DunningStage::Confirmation),
                _ => None,
            })
            .collect())
    }

    /// Reminder sweep body: send the reminder stage to records whose
    /// elapsed threshold has passed. Candidates are pre-filtered in SQL;
    /// the per-tenant threshold is re-checked here.
    pub async fn run_reminder_sweep(&self, limit: i64) -> RecoveryResult<usize> {
        let now = OffsetDateTime::now_utc();
        // Widest tenant threshold is bounded below by zero, so scan from
        // the oldest active record forward and re-check per tenant.
        let candidates = self.ledger.reminder_candidates(now, limit).await?;

        let mut sent = 0;
        for record in candidates {
            let status = record.status()?;
            let tenant = self.tenants.get(record.tenant_id).await?;
            if !reminder_due(status, record.first_failed_at, tenant.reminder_threshold(), now) {
                continue;
            }
            self.dispatch(&record, DunningStage::Reminder).await?;
            sent += 1;
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_stage_follows_tone() {
        assert_eq!(opening_stage(DunningTone::Neutral), Some(DunningStage::InitialNotice));
        assert_eq!(opening_stage(DunningTone::Urgent), Some(DunningStage::ActionRequired));
        assert_eq!(opening_stage(DunningTone::None), None);
    }

    #[test]
    fn reminder_never_precedes_initial_notice() {
        assert!(!stage_allowed(DunningStage::Reminder, &[]));
        assert!(stage_allowed(DunningStage::Reminder, &[DunningStage::InitialNotice]));
    }

    #[test]
    fn each_stage_sent_at_most_once() {
        let sent = [DunningStage::InitialNotice, DunningStage::Reminder];
        assert!(!stage_allowed(DunningStage::InitialNotice, &sent));
        assert!(!stage_allowed(DunningStage::Reminder, &sent));
        assert!(stage_allowed(DunningStage::FinalWarning, &sent));
    }

    #[test]
    fn confirmation_suppresses_everything_after() {
        let sent = [DunningStage::InitialNotice, DunningStage::Confirmation];
        assert!(!stage_allowed(DunningStage::Reminder, &sent));
        assert!(!stage_allowed(DunningStage::FinalWarning, &sent));
        assert!(!stage_allowed(DunningStage::ActionRequired, &sent));
        assert!(!stage_allowed(DunningStage::Confirmation, &sent));
    }

    #[test]
    fn action_required_skips_soft_stages() {
        // Hard decline on first failure: no initial notice required.
        assert!(stage_allowed(DunningStage::ActionRequired, &[]));
        // And the final warning may still follow it later.
        assert!(stage_allowed(DunningStage::FinalWarning, &[DunningStage::ActionRequired]));
    }

    #[test]
    fn stage_order_is_monotone() {
        let ladder = [
            DunningStage::InitialNotice,
            DunningStage::Reminder,
            DunningStage::FinalWarning,
            DunningStage::ActionRequired,
            DunningStage::Confirmation,
        ];
        for pair in ladder.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn reminder_due_respects_threshold_and_terminal_states() {
        let now = OffsetDateTime::now_utc();
        let first_failed = now - Duration::hours(80);
        let threshold = Duration::hours(72);

        assert!(reminder_due(RecoveryStatus::Scheduled, first_failed, threshold, now));
        assert!(!reminder_due(RecoveryStatus::Recovered, first_failed, threshold, now));
        assert!(!reminder_due(
            RecoveryStatus::Scheduled,
            now - Duration::hours(10),
            threshold,
            now
        ));
    }
}
