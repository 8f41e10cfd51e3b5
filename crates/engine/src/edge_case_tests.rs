//! Cross-module lifecycle tests
//!
//! Walks whole recovery lifecycles through the pure layer (classifier,
//! transitions, dunning sequence rules) to pin down the behaviors the
//! individual module tests only cover in isolation.

use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::classifier::{policy_for, DeclineCategory};
use crate::dunning::{stage_allowed, DunningStage};
use crate::ledger::{RecoveryRecord, RecoveryStatus};
use crate::transition::{
    manual_retry_check, on_attempt_outcome, on_external_success, on_first_failure,
    on_subscription_deleted, ChargeOutcome, Effect, ManualRetryRejection,
};

fn base_record(decline_code: &str, max_retries: i32) -> RecoveryRecord {
    let now = OffsetDateTime::now_utc();
    RecoveryRecord {
        id: Uuid::new_v4(),
        invoice_id: "in_lifecycle".to_string(),
        tenant_id: Uuid::new_v4(),
        customer_id: "cus_lifecycle".to_string(),
        subscription_id: Some("sub_lifecycle".to_string()),
        amount_cents: 4900,
        currency: "usd".to_string(),
        status: "scheduled".to_string(),
        decline_code: decline_code.to_string(),
        retry_count: 0,
        max_retries,
        next_retry_at: Some(now),
        first_failed_at: now,
        last_attempt_at: None,
        resolved_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn apply(record: &mut RecoveryRecord, status: RecoveryStatus, retry_count: i32) {
    record.status = status.as_str().to_string();
    record.retry_count = retry_count;
    record.last_attempt_at = Some(OffsetDateTime::now_utc());
}

/// Full insufficient-funds lifecycle: every attempt declines, the record
/// walks the complete delay ladder and exhausts with the expected dunning
/// sequence along the way.
#[test]
fn insufficient_funds_walks_full_ladder_to_exhaustion() {
    let policy = policy_for("insufficient_funds");
    assert_eq!(policy.category, DeclineCategory::InsufficientFunds);
    let max = policy.max_retries();
    assert_eq!(max, 4);

    let t0 = OffsetDateTime::now_utc();
    let opening = on_first_failure(&policy, t0);
    assert_eq!(opening.update.status, RecoveryStatus::Scheduled);
    assert_eq!(
        opening.effects,
        vec![Effect::SendDunning(DunningStage::InitialNotice)]
    );

    let mut record = base_record("insufficient_funds", max);
    let mut sent_stages = vec![DunningStage::InitialNotice];
    let decline = ChargeOutcome::Declined {
        code: "insufficient_funds".to_string(),
    };

    let mut now = t0;
    for attempt in 1..=max {
        // The driver claims the record into `retrying` before attempting.
        let count = record.retry_count;
        apply(&mut record, RecoveryStatus::Retrying, count);
        now += Duration::days(2);

        let t = on_attempt_outcome(&record, &policy, &decline, now);
        assert_eq!(t.update.retry_count, attempt);

        if attempt < max {
            assert_eq!(t.update.status, RecoveryStatus::Scheduled);
            assert!(t.update.next_retry_at.unwrap() > now);
        } else {
            assert_eq!(t.update.status, RecoveryStatus::Exhausted);
            assert_eq!(t.update.next_retry_at, None);
        }

        for effect in &t.effects {
            if let Effect::SendDunning(stage) = effect {
                // Every requested stage must be sendable given history.
                if stage_allowed(*stage, &sent_stages) {
                    sent_stages.push(*stage);
                }
            }
        }
        apply(&mut record, t.update.status, t.update.retry_count);
    }

    // Final warning requested when the last slot was scheduled; the
    // exhaustion request for the same stage deduplicates away.
    assert_eq!(
        sent_stages,
        vec![DunningStage::InitialNotice, DunningStage::FinalWarning]
    );
    assert_eq!(record.retry_count, max);
}

/// A success mid-ladder stops everything and sends exactly one
/// confirmation, after which no further dunning stage is allowed.
#[test]
fn mid_ladder_success_recovers_and_silences_dunning() {
    let policy = policy_for("generic_decline");
    let mut record = base_record("generic_decline", policy.max_retries());
    let mut sent = vec![DunningStage::InitialNotice];

    apply(&mut record, RecoveryStatus::Retrying, 0);
    let t = on_attempt_outcome(
        &record,
        &policy,
        &ChargeOutcome::Succeeded,
        OffsetDateTime::now_utc(),
    );
    assert_eq!(t.update.status, RecoveryStatus::Recovered);
    assert_eq!(t.effects, vec![Effect::SendConfirmation]);

    assert!(stage_allowed(DunningStage::Confirmation, &sent));
    sent.push(DunningStage::Confirmation);

    // Nothing follows a confirmation.
    for stage in [
        DunningStage::InitialNotice,
        DunningStage::Reminder,
        DunningStage::FinalWarning,
        DunningStage::ActionRequired,
    ] {
        assert!(!stage_allowed(stage, &sent));
    }
}

/// Out-of-band payment beats a scheduled retry: once recovered, the stale
/// retry outcome has no transition to apply. This is the pure-layer half
/// of the race; the ledger's guarded update enforces the same thing for
/// the concurrent case, including two resolutions in the same millisecond.
#[test]
fn external_success_beats_pending_retry() {
    let policy = policy_for("insufficient_funds");
    let mut record = base_record("insufficient_funds", policy.max_retries());

    let success = on_external_success(&record).unwrap();
    assert_eq!(success.update.status, RecoveryStatus::Recovered);
    let count = record.retry_count;
    apply(&mut record, RecoveryStatus::Recovered, count);

    // The retry that was in flight now has nothing to do.
    assert!(on_external_success(&record).is_none());
    assert!(on_subscription_deleted(&record).is_none());
    assert_eq!(
        manual_retry_check(&record, Duration::hours(72), OffsetDateTime::now_utc()),
        Err(ManualRetryRejection::AlreadyRecovered)
    );
}

/// Hard declines never schedule a retry: the record exhausts immediately
/// and the customer gets the action-required escalation, but an
/// out-of-band payment can still upgrade the record to recovered.
#[test]
fn hard_decline_is_dunning_only_but_still_recoverable() {
    let policy = policy_for("expired_card");
    assert!(!policy.eligible);

    let t = on_first_failure(&policy, OffsetDateTime::now_utc());
    assert_eq!(t.update.status, RecoveryStatus::Exhausted);
    assert_eq!(
        t.effects,
        vec![Effect::SendDunning(DunningStage::ActionRequired)]
    );

    let mut record = base_record("expired_card", 0);
    apply(&mut record, RecoveryStatus::Exhausted, 0);
    record.next_retry_at = None;

    let success = on_external_success(&record).unwrap();
    assert_eq!(success.update.status, RecoveryStatus::Recovered);
}

/// Grace-window manual retry of an exhausted invoice: accepted inside the
/// window, consumes a (clamped) slot, and a success recovers the record.
#[test]
fn manual_retry_after_exhaustion_within_grace() {
    let policy = policy_for("generic_decline");
    let max = policy.max_retries();
    let now = OffsetDateTime::now_utc();

    let mut record = base_record("generic_decline", max);
    apply(&mut record, RecoveryStatus::Exhausted, max);
    record.last_attempt_at = Some(now - Duration::hours(24));

    assert!(manual_retry_check(&record, Duration::hours(72), now).is_ok());

    apply(&mut record, RecoveryStatus::Retrying, max);
    let t = on_attempt_outcome(&record, &policy, &ChargeOutcome::Succeeded, now);
    assert_eq!(t.update.status, RecoveryStatus::Recovered);
    assert!(t.update.retry_count <= max);

    // Outside the window the same request is rejected.
    record.status = RecoveryStatus::Exhausted.as_str().to_string();
    record.last_attempt_at = Some(now - Duration::hours(96));
    assert_eq!(
        manual_retry_check(&record, Duration::hours(72), now),
        Err(ManualRetryRejection::GraceExpired)
    );
}

/// Cancellation only reaps active records; a cancelled record is inert to
/// every later input except nothing at all.
#[test]
fn cancellation_is_absolutely_terminal() {
    let mut record = base_record("generic_decline", 3);

    let t = on_subscription_deleted(&record).unwrap();
    assert_eq!(t.update.status, RecoveryStatus::Cancelled);
    assert!(t.effects.is_empty());
    let count = record.retry_count;
    apply(&mut record, RecoveryStatus::Cancelled, count);

    assert!(on_external_success(&record).is_none());
    assert!(on_subscription_deleted(&record).is_none());
    assert_eq!(
        manual_retry_check(&record, Duration::hours(72), OffsetDateTime::now_utc()),
        Err(ManualRetryRejection::Cancelled)
    );
}

/// Fraud blocks schedule conservatively: first wait respects the cooldown
/// floor even though the configured first delay already exceeds it.
#[test]
fn fraud_block_first_wait_never_shorter_than_cooldown() {
    let policy = policy_for("card_velocity_exceeded");
    assert_eq!(policy.category, DeclineCategory::FraudBlock);

    let t0 = OffsetDateTime::now_utc();
    let t = on_first_failure(&policy, t0);
    let next = t.update.next_retry_at.unwrap();
    assert!(next - t0 >= Duration::days(3));
}

/// An unrecognized decline code still produces a workable, conservative
/// lifecycle rather than an error.
#[test]
fn unknown_decline_code_gets_conservative_ladder() {
    let policy = policy_for("code_the_processor_invented_yesterday");
    assert_eq!(policy.category, DeclineCategory::Unknown);
    assert!(policy.eligible);
    assert_eq!(policy.max_retries(), 2);

    let t = on_first_failure(&policy, OffsetDateTime::now_utc());
    assert_eq!(t.update.status, RecoveryStatus::Scheduled);
}
