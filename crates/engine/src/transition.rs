//! Pure state-transition logic for the retry state machine
//!
//! Each function maps (current record snapshot, input, now) to a
//! `Transition`: the fields to persist plus the side effects to run
//! afterwards. Nothing here touches I/O, so every path is unit-testable
//! without mocking; the scheduler persists the transition through the
//! ledger's guarded update and then executes the effects.

use time::{Duration, OffsetDateTime};

use crate::classifier::RetryPolicy;
use crate::dunning::{opening_stage, DunningStage};
use crate::ledger::{RecordUpdate, RecoveryRecord, RecoveryStatus};

/// Side effect requested by a transition, executed after persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    SendDunning(DunningStage),
    SendConfirmation,
}

/// Outcome of one charge attempt against the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Succeeded,
    Declined { code: String },
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub update: RecordUpdate,
    pub effects: Vec<Effect>,
}

fn scheduled_delay(policy: &RetryPolicy, retry_count: i32) -> Option<Duration> {
    let base = policy.delay_for(retry_count)?;
    let base = Duration::seconds(base.as_secs() as i64);
    // The fraud-block cool-down is a floor on the first wait.
    match (retry_count, policy.cooldown) {
        (0, Some(cooldown)) => {
            let floor = Duration::seconds(cooldown.as_secs() as i64);
            Some(if base < floor { floor } else { base })
        }
        _ => Some(base),
    }
}

/// Transition for the very first failure of an invoice.
///
/// Retry-eligible declines enter `scheduled` with the policy's first
/// delay; permanent declines go straight to dunning-only `exhausted`
/// handling with zero scheduled retries.
pub fn on_first_failure(policy: &RetryPolicy, occurred_at: OffsetDateTime) -> Transition {
    let mut effects = Vec::new();
    if let Some(stage) = opening_stage(policy.tone) {
        effects.push(Effect::SendDunning(stage));
    }

    if !policy.eligible || policy.delays.is_empty() {
        return Transition {
            update: RecordUpdate {
                status: RecoveryStatus::Exhausted,
                retry_count: 0,
                next_retry_at: None,
            },
            effects,
        };
    }

    let delay = scheduled_delay(policy, 0).unwrap_or(Duration::days(3));
    Transition {
        update: RecordUpdate {
            status: RecoveryStatus::Scheduled,
            retry_count: 0,
            next_retry_at: Some(occurred_at + delay),
        },
        effects,
    }
}

/// Transition after a charge attempt (automatic or manual) completes.
/// The attempt consumes one retry slot; the count is clamped so the
/// `retry_count <= max_retries` invariant holds even for grace-window
/// manual retries of an exhausted invoice.
pub fn on_attempt_outcome(
    record: &RecoveryRecord,
    policy: &RetryPolicy,
    outcome: &ChargeOutcome,
    now: OffsetDateTime,
) -> Transition {
    let new_count = (record.retry_count + 1).min(record.max_retries).max(0);

    match outcome {
        ChargeOutcome::Succeeded => Transition {
            update: RecordUpdate {
                status: RecoveryStatus::Recovered,
                retry_count: new_count,
                next_retry_at: None,
            },
            effects: vec![Effect::SendConfirmation],
        },
        ChargeOutcome::Declined { .. } => {
            if policy.eligible && new_count < record.max_retries {
                let delay = scheduled_delay(policy, new_count).unwrap_or(Duration::days(3));
                let mut effects = Vec::new();
                // The final warning fires on the attempt immediately
                // preceding exhaustion, i.e. when the last slot is being
                // scheduled.
                if new_count == record.max_retries - 1 {
                    effects.push(Effect::SendDunning(DunningStage::FinalWarning));
                }
                Transition {
                    update: RecordUpdate {
                        status: RecoveryStatus::Scheduled,
                        retry_count: new_count,
                        next_retry_at: Some(now + delay),
                    },
                    effects,
                }
            } else {
                Transition {
                    update: RecordUpdate {
                        status: RecoveryStatus::Exhausted,
                        retry_count: new_count,
                        next_retry_at: None,
                    },
                    effects: vec![Effect::SendDunning(DunningStage::FinalWarning)],
                }
            }
        }
    }
}

/// Out-of-band `payment_succeeded` (customer paid directly). Applies from
/// any state except the absolutely terminal `recovered`/`cancelled`:
/// success wins every race, including against an exhaustion that slipped
/// in between delivery and processing.
pub fn on_external_success(record: &RecoveryRecord) -> Option<Transition> {
    match RecoveryStatus::parse(&record.status).ok()? {
        RecoveryStatus::Recovered | RecoveryStatus::Cancelled => None,
        RecoveryStatus::Scheduled | RecoveryStatus::Retrying | RecoveryStatus::Exhausted => {
            Some(Transition {
                update: RecordUpdate {
                    status: RecoveryStatus::Recovered,
                    retry_count: record.retry_count,
                    next_retry_at: None,
                },
                effects: vec![Effect::SendConfirmation],
            })
        }
    }
}

/// `subscription_deleted`: the underlying subscription is gone, so any
/// active recovery is abandoned. Terminal records are left untouched.
pub fn on_subscription_deleted(record: &RecoveryRecord) -> Option<Transition> {
    match RecoveryStatus::parse(&record.status).ok()? {
        RecoveryStatus::Scheduled | RecoveryStatus::Retrying => Some(Transition {
            update: RecordUpdate {
                status: RecoveryStatus::Cancelled,
                retry_count: record.retry_count,
                next_retry_at: None,
            },
            effects: vec![],
        }),
        _ => None,
    }
}

/// Why a manual retry was rejected; carried into `InvalidStateError` so
/// the caller can distinguish "already resolved" from "try again later".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualRetryRejection {
    AlreadyRecovered,
    Cancelled,
    RetryInProgress,
    GraceExpired,
}

impl ManualRetryRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            ManualRetryRejection::AlreadyRecovered => "payment already recovered",
            ManualRetryRejection::Cancelled => "subscription was cancelled",
            ManualRetryRejection::RetryInProgress => "a retry is already in progress",
            ManualRetryRejection::GraceExpired => {
                "retries exhausted and the manual-retry grace window has passed"
            }
        }
    }
}

/// Whether a manual retry may claim this record right now. Accepted while
/// `scheduled`, or while `exhausted` within the grace window after the
/// last attempt.
pub fn manual_retry_check(
    record: &RecoveryRecord,
    grace: Duration,
    now: OffsetDateTime,
) -> Result<(), ManualRetryRejection> {
    match RecoveryStatus::parse(&record.status) {
        Ok(RecoveryStatus::Scheduled) => Ok(()),
        Ok(RecoveryStatus::Retrying) => Err(ManualRetryRejection::RetryInProgress),
        Ok(RecoveryStatus::Recovered) => Err(ManualRetryRejection::AlreadyRecovered),
        Ok(RecoveryStatus::Cancelled) => Err(ManualRetryRejection::Cancelled),
        Ok(RecoveryStatus::Exhausted) => {
            let anchor = record.last_attempt_at.unwrap_or(record.first_failed_at);
            if now - anchor <= grace {
                Ok(())
            } else {
                Err(ManualRetryRejection::GraceExpired)
            }
        }
        Err(_) => Err(ManualRetryRejection::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::policy_for;
    use uuid::Uuid;

    fn record(status: &str, retry_count: i32, max_retries: i32) -> RecoveryRecord {
        let now = OffsetDateTime::now_utc();
        RecoveryRecord {
            id: Uuid::new_v4(),
            invoice_id: "in_test".to_string(),
            tenant_id: Uuid::new_v4(),
            customer_id: "cus_test".to_string(),
            subscription_id: None,
            amount_cents: 2900,
            currency: "usd".to_string(),
            status: status.to_string(),
            decline_code: "generic_decline".to_string(),
            retry_count,
            max_retries,
            next_retry_at: None,
            first_failed_at: now - Duration::days(1),
            last_attempt_at: Some(now - Duration::hours(2)),
            resolved_at: None,
            created_at: now - Duration::days(1),
            updated_at: now,
        }
    }

    #[test]
    fn first_failure_schedules_with_first_delay() {
        let t0 = OffsetDateTime::now_utc();
        let policy = policy_for("insufficient_funds");
        let t = on_first_failure(&policy, t0);

        assert_eq!(t.update.status, RecoveryStatus::Scheduled);
        assert_eq!(t.update.retry_count, 0);
        assert_eq!(t.update.next_retry_at, Some(t0 + Duration::days(2)));
        assert_eq!(t.effects, vec![Effect::SendDunning(DunningStage::InitialNotice)]);
    }

    #[test]
    fn first_failure_hard_decline_goes_dunning_only() {
        let policy = policy_for("expired_card");
        let t = on_first_failure(&policy, OffsetDateTime::now_utc());

        assert_eq!(t.update.status, RecoveryStatus::Exhausted);
        assert_eq!(t.update.next_retry_at, None);
        // Action-required fires immediately, skipping the soft stages.
        assert_eq!(t.effects, vec![Effect::SendDunning(DunningStage::ActionRequired)]);
    }

    #[test]
    fn first_failure_fraud_block_respects_cooldown_floor() {
        let t0 = OffsetDateTime::now_utc();
        let policy = policy_for("fraudulent");
        let t = on_first_failure(&policy, t0);

        let next = t.update.next_retry_at.unwrap();
        assert!(next - t0 >= Duration::days(3));
    }

    #[test]
    fn failed_attempt_with_budget_reschedules_with_next_delay() {
        let now = OffsetDateTime::now_utc();
        let policy = policy_for("insufficient_funds");
        let rec = record("retrying", 0, policy.max_retries());

        let t = on_attempt_outcome(
            &rec,
            &policy,
            &ChargeOutcome::Declined {
                code: "insufficient_funds".to_string(),
            },
            now,
        );

        assert_eq!(t.update.status, RecoveryStatus::Scheduled);
        assert_eq!(t.update.retry_count, 1);
        // Second delay in the sequence (index = incremented count).
        assert_eq!(t.update.next_retry_at, Some(now + Duration::days(5)));
    }

    #[test]
    fn final_slot_scheduling_triggers_final_warning() {
        let now = OffsetDateTime::now_utc();
        let policy = policy_for("insufficient_funds");
        let max = policy.max_retries();
        let rec = record("retrying", max - 2, max);

        let t = on_attempt_outcome(
            &rec,
            &policy,
            &ChargeOutcome::Declined {
                code: "insufficient_funds".to_string(),
            },
            now,
        );

        assert_eq!(t.update.status, RecoveryStatus::Scheduled);
        assert_eq!(t.update.retry_count, max - 1);
        assert_eq!(t.effects, vec![Effect::SendDunning(DunningStage::FinalWarning)]);
    }

    #[test]
    fn exhaustion_when_budget_spent() {
        let now = OffsetDateTime::now_utc();
        let policy = policy_for("generic_decline");
        let max = policy.max_retries();
        let rec = record("retrying", max - 1, max);

        let t = on_attempt_outcome(
            &rec,
            &policy,
            &ChargeOutcome::Declined {
                code: "generic_decline".to_string(),
            },
            now,
        );

        assert_eq!(t.update.status, RecoveryStatus::Exhausted);
        assert_eq!(t.update.retry_count, max);
        assert_eq!(t.update.next_retry_at, None);
        assert_eq!(t.effects, vec![Effect::SendDunning(DunningStage::FinalWarning)]);
    }

    #[test]
    fn retry_count_never_exceeds_max() {
        let now = OffsetDateTime::now_utc();
        let policy = policy_for("generic_decline");
        let max = policy.max_retries();
        // Grace-window manual retry of an exhausted record: count already
        // at max, attempt fails again.
        let rec = record("retrying", max, max);

        let t = on_attempt_outcome(
            &rec,
            &policy,
            &ChargeOutcome::Declined {
                code: "generic_decline".to_string(),
            },
            now,
        );

        assert!(t.update.retry_count <= max);
        assert_eq!(t.update.status, RecoveryStatus::Exhausted);
    }

    #[test]
    fn successful_attempt_recovers_and_confirms() {
        let now = OffsetDateTime::now_utc();
        let policy = policy_for("insufficient_funds");
        let rec = record("retrying", 1, policy.max_retries());

        let t = on_attempt_outcome(&rec, &policy, &ChargeOutcome::Succeeded, now);

        assert_eq!(t.update.status, RecoveryStatus::Recovered);
        assert_eq!(t.update.next_retry_at, None);
        assert_eq!(t.effects, vec![Effect::SendConfirmation]);
    }

    #[test]
    fn external_success_wins_from_any_active_state() {
        for status in ["scheduled", "retrying", "exhausted"] {
            let rec = record(status, 1, 3);
            let t = on_external_success(&rec).unwrap();
            assert_eq!(t.update.status, RecoveryStatus::Recovered);
            assert_eq!(t.effects, vec![Effect::SendConfirmation]);
        }
    }

    #[test]
    fn external_success_is_noop_on_recovered_and_cancelled() {
        assert!(on_external_success(&record("recovered", 1, 3)).is_none());
        assert!(on_external_success(&record("cancelled", 1, 3)).is_none());
    }

    #[test]
    fn subscription_deleted_cancels_active_only() {
        assert_eq!(
            on_subscription_deleted(&record("scheduled", 0, 3))
                .unwrap()
                .update
                .status,
            RecoveryStatus::Cancelled
        );
        assert!(on_subscription_deleted(&record("recovered", 0, 3)).is_none());
        assert!(on_subscription_deleted(&record("exhausted", 3, 3)).is_none());
    }

    #[test]
    fn manual_retry_accepted_while_scheduled() {
        let rec = record("scheduled", 1, 3);
        assert!(manual_retry_check(&rec, Duration::hours(72), OffsetDateTime::now_utc()).is_ok());
    }

    #[test]
    fn manual_retry_on_exhausted_honors_grace_window() {
        let now = OffsetDateTime::now_utc();
        let mut rec = record("exhausted", 3, 3);

        rec.last_attempt_at = Some(now - Duration::hours(10));
        assert!(manual_retry_check(&rec, Duration::hours(72), now).is_ok());

        rec.last_attempt_at = Some(now - Duration::hours(100));
        assert_eq!(
            manual_retry_check(&rec, Duration::hours(72), now),
            Err(ManualRetryRejection::GraceExpired)
        );
    }

    #[test]
    fn manual_retry_rejected_in_terminal_states_with_specific_reason() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            manual_retry_check(&record("recovered", 1, 3), Duration::hours(72), now),
            Err(ManualRetryRejection::AlreadyRecovered)
        );
        assert_eq!(
            manual_retry_check(&record("cancelled", 1, 3), Duration::hours(72), now),
            Err(ManualRetryRejection::Cancelled)
        );
        assert_eq!(
            manual_retry_check(&record("retrying", 1, 3), Duration::hours(72), now),
            Err(ManualRetryRejection::RetryInProgress)
        );
    }
}
