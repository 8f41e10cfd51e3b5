//! Retry scheduler
//!
//! Drives the per-invoice state machine: creates records on first
//! failure, claims due records, invokes the processor's charge attempt,
//! persists the resulting transition through the ledger's guarded update
//! and then hands the requested effects to the dunning orchestrator.
//!
//! Races are resolved by the guard, not by locks: a scheduled retry that
//! loses to a concurrent `recovered` transition discards itself instead
//! of fighting.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::classifier::policy_for;
use crate::dunning::{DunningOrchestrator, DunningStage};
use crate::error::{RecoveryError, RecoveryResult};
use crate::events::PaymentFailed;
use crate::ledger::{Ledger, RecordUpdate, RecoveryRecord, RecoveryStatus};
use crate::processor::ProcessorClient;
use crate::tenants::TenantDirectory;
use crate::transition::{self, ChargeOutcome, Effect, ManualRetryRejection};

/// How many times a conflicted command is re-evaluated before the caller
/// sees a transient failure.
const CONFLICT_REEVALUATIONS: usize = 3;

/// Delay applied when the processor itself was unreachable: the attempt
/// did not consume a retry slot and is re-driven shortly.
const TRANSPORT_FAILURE_BACKOFF: time::Duration = time::Duration::minutes(15);

/// Counters for one pass of the due-retry driver.
#[derive(Debug, Default, Clone)]
pub struct SweepSummary {
    pub claimed: usize,
    pub recovered: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
    pub discarded: usize,
    pub errors: usize,
}

/// Attempt numbers count physical charge attempts, so they come from the
/// recorded history rather than `retry_count` (which clamps at the
/// budget). A grace-window manual retry of an exhausted record therefore
/// gets a fresh idempotency key instead of replaying the final decline;
/// a transport-failure replay records no attempt and reuses its number.
fn next_attempt_number(recorded_attempts: i64) -> i32 {
    i32::try_from(recorded_attempts.saturating_add(1)).unwrap_or(i32::MAX)
}

#[derive(Clone)]
pub struct RetryScheduler {
    ledger: Ledger,
    tenants: TenantDirectory,
    processor: ProcessorClient,
    dunning: DunningOrchestrator,
}

impl RetryScheduler {
    pub fn new(
        ledger: Ledger,
        tenants: TenantDirectory,
        processor: ProcessorClient,
        dunning: DunningOrchestrator,
    ) -> Self {
        Self {
            ledger,
            tenants,
            processor,
            dunning,
        }
    }

    /// Handle a normalized `payment_failed` event: create the record on
    /// first failure, or leave an existing record's schedule untouched
    /// (the event normalizer already deduplicated deliveries; a distinct
    /// failure event for a tracked invoice is audit-only).
    pub async fn record_failure(&self, event: &PaymentFailed) -> RecoveryResult<RecoveryRecord> {
        let policy = policy_for(&event.decline_code);
        let opening = transition::on_first_failure(&policy, event.occurred_at);

        let (record, created) = self
            .ledger
            .create_if_absent(
                &event.invoice_id,
                event.tenant_id,
                &event.customer_id,
                event.subscription_id.as_deref(),
                event.amount_cents,
                &event.currency,
                &event.decline_code,
                &opening.update,
                event.occurred_at,
                policy.max_retries(),
            )
            .await?;

        if !created {
            tracing::info!(
                invoice_id = %event.invoice_id,
                status = %record.status,
                "Failure event for an already-tracked invoice - schedule unchanged"
            );
            return Ok(record);
        }

        tracing::info!(
            invoice_id = %event.invoice_id,
            tenant_id = %event.tenant_id,
            decline_code = %event.decline_code,
            category = ?policy.category,
            status = %opening.update.status,
            next_retry_at = ?opening.update.next_retry_at,
            max_retries = policy.max_retries(),
            "Recovery record created"
        );

        self.run_effects(&record, &opening.effects).await;
        Ok(record)
    }

    /// One pass of the retry driver: claim everything due, attempt each
    /// charge, persist the outcome. Per-record errors are counted, not
    /// propagated, so one bad invoice cannot stall the sweep.
    pub async fn run_due_retries(&self, limit: i64) -> RecoveryResult<SweepSummary> {
        let due = self.ledger.claim_due(limit).await?;
        let mut summary = SweepSummary {
            claimed: due.len(),
            ..SweepSummary::default()
        };

        for record in due {
            match self.drive_attempt(&record, false).await {
                Ok(status) => match status {
                    RecoveryStatus::Recovered => summary.recovered += 1,
                    RecoveryStatus::Scheduled => summary.rescheduled += 1,
                    RecoveryStatus::Exhausted => summary.exhausted += 1,
                    _ => {}
                },
                Err(RecoveryError::Conflict { invoice_id, actual, .. }) => {
                    // Lost to a concurrent success or cancellation: the
                    // attempt result is stale and simply discarded.
                    tracing::info!(
                        invoice_id = %invoice_id,
                        actual_status = %actual,
                        "Retry outcome discarded after losing status race"
                    );
                    summary.discarded += 1;
                }
                Err(e) => {
                    tracing::error!(
                        invoice_id = %record.invoice_id,
                        error = %e,
                        "Retry attempt failed"
                    );
                    summary.errors += 1;
                }
            }
        }

        tracing::info!(
            claimed = summary.claimed,
            recovered = summary.recovered,
            rescheduled = summary.rescheduled,
            exhausted = summary.exhausted,
            discarded = summary.discarded,
            errors = summary.errors,
            "Due-retry sweep complete"
        );
        Ok(summary)
    }

    /// Manual retry from the external API. Accepted while `scheduled`, or
    /// while `exhausted` within the tenant's grace window; consumes one
    /// retry slot exactly like an automatic attempt.
    pub async fn manual_retry(&self, invoice_id: &str) -> RecoveryResult<RecoveryRecord> {
        let record = self
            .ledger
            .find_by_invoice(invoice_id)
            .await?
            .ok_or_else(|| RecoveryError::NotFound(format!("invoice {invoice_id}")))?;

        let tenant = self.tenants.get(record.tenant_id).await?;
        let now = OffsetDateTime::now_utc();

        if let Err(rejection) = transition::manual_retry_check(&record, tenant.manual_retry_grace(), now)
        {
            return Err(RecoveryError::InvalidState {
                invoice_id: invoice_id.to_string(),
                status: record.status,
                reason: rejection.reason().to_string(),
            });
        }

        // Claim re-checks the status under the guard; a concurrent
        // transition between the check above and here surfaces as a
        // Conflict which we translate for the caller.
        let claimed = match self
            .ledger
            .claim_for_retry(
                invoice_id,
                &[RecoveryStatus::Scheduled, RecoveryStatus::Exhausted],
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(RecoveryError::Conflict { actual, .. }) => {
                return Err(RecoveryError::InvalidState {
                    invoice_id: invoice_id.to_string(),
                    status: actual,
                    reason: ManualRetryRejection::RetryInProgress.reason().to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        tracing::info!(invoice_id = %invoice_id, "Manual retry accepted");
        self.drive_attempt(&claimed, true).await?;

        self.ledger
            .find_by_invoice(invoice_id)
            .await?
            .ok_or_else(|| RecoveryError::NotFound(format!("invoice {invoice_id}")))
    }

    /// Out-of-band `payment_succeeded`: success always wins. Conflicts are
    /// re-evaluated a bounded number of times because the record may be
    /// mid-claim by the driver; only absolute terminal states stop us.
    pub async fn apply_external_success(&self, invoice_id: &str) -> RecoveryResult<()> {
        for _ in 0..CONFLICT_REEVALUATIONS {
            let Some(record) = self.ledger.find_by_invoice(invoice_id).await? else {
                // Success for an invoice we never tracked: nothing to do.
                tracing::debug!(invoice_id = %invoice_id, "Success event for untracked invoice");
                return Ok(());
            };

            let Some(transition) = transition::on_external_success(&record) else {
                tracing::debug!(
                    invoice_id = %invoice_id,
                    status = %record.status,
                    "Success event is a no-op in current state"
                );
                return Ok(());
            };

            let expected = [
                RecoveryStatus::Scheduled,
                RecoveryStatus::Retrying,
                RecoveryStatus::Exhausted,
            ];
            match self
                .ledger
                .update_guarded(invoice_id, &expected, &transition.update)
                .await
            {
                Ok(updated) => {
                    tracing::info!(invoice_id = %invoice_id, "Payment recovered out of band");
                    self.run_effects(&updated, &transition.effects).await;
                    return Ok(());
                }
                Err(RecoveryError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(RecoveryError::Transient(format!(
            "could not apply success to invoice {invoice_id} after {CONFLICT_REEVALUATIONS} attempts"
        )))
    }

    /// `subscription_deleted`: abandon every active recovery attached to
    /// the subscription. Already-terminal records stay as they are.
    pub async fn apply_subscription_deleted(
        &self,
        tenant_id: Uuid,
        subscription_id: &str,
    ) -> RecoveryResult<usize> {
        let records = self
            .ledger
            .find_active_by_subscription(tenant_id, subscription_id)
            .await?;

        let mut cancelled = 0;
        for record in records {
            let Some(transition) = transition::on_subscription_deleted(&record) else {
                continue;
            };
            match self
                .ledger
                .update_guarded(
                    &record.invoice_id,
                    &[RecoveryStatus::Scheduled, RecoveryStatus::Retrying],
                    &transition.update,
                )
                .await
            {
                Ok(_) => cancelled += 1,
                Err(RecoveryError::Conflict { invoice_id, actual, .. }) => {
                    tracing::info!(
                        invoice_id = %invoice_id,
                        actual_status = %actual,
                        "Cancellation lost a race - leaving record as is"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if cancelled > 0 {
            tracing::info!(
                tenant_id = %tenant_id,
                subscription_id = %subscription_id,
                cancelled = cancelled,
                "Active recoveries cancelled with subscription"
            );
        }
        Ok(cancelled)
    }

    /// `subscription_updated` with a fresh payment method: pull every
    /// scheduled retry for the subscription forward so the new card is
    /// tried right away instead of days from now.
    pub async fn apply_payment_method_updated(
        &self,
        tenant_id: Uuid,
        subscription_id: &str,
    ) -> RecoveryResult<usize> {
        let records = self
            .ledger
            .find_active_by_subscription(tenant_id, subscription_id)
            .await?;

        let now = OffsetDateTime::now_utc();
        let mut advanced = 0;
        for record in records {
            if record.status()? != RecoveryStatus::Scheduled {
                continue;
            }
            let update = RecordUpdate {
                status: RecoveryStatus::Scheduled,
                retry_count: record.retry_count,
                next_retry_at: Some(now),
            };
            match self
                .ledger
                .update_guarded(&record.invoice_id, &[RecoveryStatus::Scheduled], &update)
                .await
            {
                Ok(_) => advanced += 1,
                Err(RecoveryError::Conflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if advanced > 0 {
            tracing::info!(
                tenant_id = %tenant_id,
                subscription_id = %subscription_id,
                advanced = advanced,
                "Scheduled retries pulled forward after payment method update"
            );
        }
        Ok(advanced)
    }

    /// Run one charge attempt for a record already claimed as `retrying`
    /// and persist the outcome. Returns the resulting status.
    async fn drive_attempt(
        &self,
        record: &RecoveryRecord,
        manual: bool,
    ) -> RecoveryResult<RecoveryStatus> {
        let tenant = self.tenants.get(record.tenant_id).await?;
        let policy = policy_for(&record.decline_code);
        let attempt_number = next_attempt_number(self.ledger.attempt_count(record.id).await?);

        let outcome = match self
            .processor
            .attempt_charge(&tenant, &record.invoice_id, attempt_number)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // The processor was unreachable: no slot consumed. Put the
                // record back on the schedule a short while from now so the
                // at-least-once driver picks it up again.
                tracing::warn!(
                    invoice_id = %record.invoice_id,
                    error = %e,
                    "Charge attempt could not be issued - rescheduling"
                );
                let update = RecordUpdate {
                    status: RecoveryStatus::Scheduled,
                    retry_count: record.retry_count,
                    next_retry_at: Some(OffsetDateTime::now_utc() + TRANSPORT_FAILURE_BACKOFF),
                };
                self.ledger
                    .update_guarded(&record.invoice_id, &[RecoveryStatus::Retrying], &update)
                    .await?;
                return Err(e);
            }
        };

        let now = OffsetDateTime::now_utc();
        let transition = transition::on_attempt_outcome(record, &policy, &outcome, now);

        // Persist first, under the guard; the attempt row and emails only
        // happen once the transition has actually won.
        let updated = self
            .ledger
            .update_guarded(&record.invoice_id, &[RecoveryStatus::Retrying], &transition.update)
            .await?;

        let (outcome_str, decline_code) = match &outcome {
            ChargeOutcome::Succeeded => ("succeeded", None),
            ChargeOutcome::Declined { code } => ("declined", Some(code.as_str())),
        };
        self.ledger
            .append_attempt(record.id, attempt_number, outcome_str, decline_code, manual)
            .await?;

        tracing::info!(
            invoice_id = %record.invoice_id,
            attempt_number = attempt_number,
            outcome = outcome_str,
            new_status = %transition.update.status,
            manual = manual,
            "Charge attempt recorded"
        );

        self.run_effects(&updated, &transition.effects).await;
        Ok(transition.update.status)
    }

    /// Execute transition effects. Dunning failures are logged and
    /// recorded by the orchestrator; they never fail the transition.
    async fn run_effects(&self, record: &RecoveryRecord, effects: &[Effect]) {
        for effect in effects {
            let stage = match effect {
                Effect::SendDunning(stage) => *stage,
                Effect::SendConfirmation => DunningStage::Confirmation,
            };
            if let Err(e) = self.dunning.dispatch(record, stage).await {
                tracing::error!(
                    invoice_id = %record.invoice_id,
                    stage = %stage.as_str(),
                    error = %e,
                    "Failed to dispatch dunning stage"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_numbers_follow_recorded_history() {
        assert_eq!(next_attempt_number(0), 1);
        assert_eq!(next_attempt_number(3), 4);
    }

    /// A manual retry of an exhausted record must carry a fresh
    /// idempotency key: with the full budget recorded, the next number is
    /// past the final automatic attempt's, never a reuse of it.
    #[test]
    fn grace_window_retry_does_not_reuse_final_attempt_number() {
        let max_retries = policy_for("generic_decline").max_retries();
        let next = next_attempt_number(i64::from(max_retries));
        assert_eq!(next, max_retries + 1);
    }

    #[test]
    fn attempt_number_saturates_instead_of_overflowing() {
        assert_eq!(next_attempt_number(i64::MAX), i32::MAX);
        assert_eq!(next_attempt_number(i64::from(i32::MAX)), i32::MAX);
    }
}
