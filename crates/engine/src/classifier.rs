//! Decline classifier
//!
//! Pure, total mapping from a processor decline-reason code to a retry
//! policy. Unknown codes never error: they fall back to a conservative
//! generic policy and are logged for later classification review.
//!
//! The concrete delay values are tunable policy data, not contracts.
//! Changing them requires no data migration because policies are
//! recomputed from the code on every read.

use std::time::Duration;

use serde::Serialize;

/// Broad category a decline code falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineCategory {
    /// Technical/processing failure on the processor or issuer side.
    Transient,
    /// Not enough money on the account; retries spaced around pay cycles.
    InsufficientFunds,
    /// Bank-level decline with no further detail.
    GenericDecline,
    /// Permanent card defect: expired, invalid number, bad CVC, lost/stolen.
    HardDecline,
    /// Velocity or fraud block; retrying too soon amplifies the flag.
    FraudBlock,
    /// Code we have not seen before.
    Unknown,
}

/// Tone hint the dunning orchestrator uses when picking copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DunningTone {
    Urgent,
    Neutral,
    None,
}

/// Retry policy derived from a decline code.
///
/// Stateless and never persisted; recomputed wherever it is needed.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub category: DeclineCategory,
    /// Ordered delays; index = retry count after increment. Empty for
    /// permanent declines.
    pub delays: Vec<Duration>,
    /// Whether automatic retries are allowed at all.
    pub eligible: bool,
    pub tone: DunningTone,
    /// Minimum wait before the first retry, enforced on top of the delay
    /// sequence (fraud blocks).
    pub cooldown: Option<Duration>,
}

impl RetryPolicy {
    pub fn max_retries(&self) -> i32 {
        self.delays.len() as i32
    }

    /// Delay to apply before the attempt with the given retry count,
    /// clamped to the last entry so a count at the boundary is safe.
    pub fn delay_for(&self, retry_count: i32) -> Option<Duration> {
        if self.delays.is_empty() {
            return None;
        }
        let idx = (retry_count.max(0) as usize).min(self.delays.len() - 1);
        Some(self.delays[idx])
    }
}

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

/// Map a raw decline code to its category. Total over all inputs.
pub fn categorize(code: &str) -> DeclineCategory {
    match code.trim().to_ascii_lowercase().as_str() {
        "processing_error" | "issuer_unavailable" | "try_again_later" | "reenter_transaction"
        | "approve_with_id" => DeclineCategory::Transient,

        "insufficient_funds" | "withdrawal_count_limit_exceeded" | "card_limit_exceeded" => {
            DeclineCategory::InsufficientFunds
        }

        "generic_decline" | "card_declined" | "do_not_honor" | "transaction_not_allowed"
        | "call_issuer" | "no_action_taken" => DeclineCategory::GenericDecline,

        "expired_card" | "incorrect_cvc" | "invalid_cvc" | "invalid_number"
        | "incorrect_number" | "invalid_expiry_month" | "invalid_expiry_year" | "lost_card"
        | "stolen_card" | "pickup_card" | "invalid_account" | "new_account_information_available" => {
            DeclineCategory::HardDecline
        }

        "fraudulent" | "security_violation" | "card_velocity_exceeded" | "merchant_blacklist"
        | "restricted_card" => DeclineCategory::FraudBlock,

        _ => DeclineCategory::Unknown,
    }
}

/// Derive the retry policy for a decline code. Never fails.
pub fn policy_for(code: &str) -> RetryPolicy {
    let category = categorize(code);

    if category == DeclineCategory::Unknown {
        tracing::warn!(
            decline_code = %code,
            "Unclassified decline code - using conservative generic policy"
        );
    }

    match category {
        DeclineCategory::Transient => RetryPolicy {
            category,
            delays: vec![
                Duration::from_secs(HOUR),
                Duration::from_secs(6 * HOUR),
                Duration::from_secs(DAY),
            ],
            eligible: true,
            tone: DunningTone::Neutral,
            cooldown: None,
        },
        DeclineCategory::InsufficientFunds => RetryPolicy {
            category,
            // Spaced around typical pay-cycle boundaries: days, not hours.
            delays: vec![
                Duration::from_secs(2 * DAY),
                Duration::from_secs(5 * DAY),
                Duration::from_secs(7 * DAY),
                Duration::from_secs(7 * DAY),
            ],
            eligible: true,
            tone: DunningTone::Neutral,
            cooldown: None,
        },
        DeclineCategory::GenericDecline => RetryPolicy {
            category,
            delays: vec![
                Duration::from_secs(DAY),
                Duration::from_secs(3 * DAY),
                Duration::from_secs(5 * DAY),
            ],
            eligible: true,
            tone: DunningTone::Neutral,
            cooldown: None,
        },
        DeclineCategory::HardDecline => RetryPolicy {
            category,
            delays: vec![],
            eligible: false,
            tone: DunningTone::Urgent,
            cooldown: None,
        },
        DeclineCategory::FraudBlock => RetryPolicy {
            category,
            delays: vec![Duration::from_secs(3 * DAY), Duration::from_secs(7 * DAY)],
            eligible: true,
            tone: DunningTone::Neutral,
            // Retrying inside the block window amplifies the fraud flag.
            cooldown: Some(Duration::from_secs(3 * DAY)),
        },
        DeclineCategory::Unknown => RetryPolicy {
            category,
            delays: vec![Duration::from_secs(3 * DAY), Duration::from_secs(7 * DAY)],
            eligible: true,
            tone: DunningTone::Neutral,
            cooldown: None,
        },
    }
}
