// Engine crate clippy configuration
#![allow(clippy::too_many_arguments)] // Ledger writes carry full event context
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Revive Recovery Engine
//!
//! Turns failed subscription payments into recovered revenue.
//!
//! ## Features
//!
//! - **Event Ingestion**: Verified, deduplicated processor webhooks
//! - **Decline Classification**: Retry policy chosen per decline code
//! - **Retry Scheduling**: Per-invoice state machine with backoff ladders
//! - **Dunning**: Staged customer emails, at most once per stage
//! - **Recovery Ledger**: Durable per-invoice lifecycle and attempt history
//! - **Analytics**: Recovery rate, recovered revenue, daily trend
//! - **Card Expiry Sweep**: Preventive notices before cards go stale

pub mod analytics;
pub mod classifier;
pub mod dunning;
pub mod email;
pub mod error;
pub mod events;
pub mod ledger;
pub mod processor;
pub mod scheduler;
pub mod sweep;
pub mod tenants;
pub mod transition;

#[cfg(test)]
mod edge_case_tests;

// Analytics
pub use analytics::{recovery_rate, AnalyticsService, RecoveryStats, TrendPoint};

// Classifier
pub use classifier::{categorize, policy_for, DeclineCategory, DunningTone, RetryPolicy};

// Dunning
pub use dunning::{opening_stage, stage_allowed, DunningOrchestrator, DunningStage};

// Email
pub use email::DunningEmailService;

// Error
pub use error::{RecoveryError, RecoveryResult};

// Events
pub use events::{sign_payload, EventIngestor, PaymentFailed, ProcessorEvent};

// Ledger
pub use ledger::{
    DunningMessageRecord, Ledger, RecordUpdate, RecoveryRecord, RecoveryStatus, RetryAttempt,
};

// Processor
pub use processor::ProcessorClient;

// Scheduler
pub use scheduler::{RetryScheduler, SweepSummary};

// Sweep
pub use sweep::{CardExpirySweep, ExpirySweepSummary};

// Tenants
pub use tenants::{TenantConfig, TenantDirectory};

// Transition
pub use transition::{ChargeOutcome, Effect, ManualRetryRejection, Transition};

use sqlx::PgPool;

/// Main engine handle that combines all recovery functionality
pub struct RecoveryEngine {
    pub ingestor: EventIngestor,
    pub scheduler: RetryScheduler,
    pub ledger: Ledger,
    pub tenants: TenantDirectory,
    pub dunning: DunningOrchestrator,
    pub analytics: AnalyticsService,
    pub card_expiry: CardExpirySweep,
}

impl RecoveryEngine {
    /// Create the engine from environment variables
    pub fn from_env(pool: PgPool) -> RecoveryResult<Self> {
        let processor = ProcessorClient::from_env()?;
        let email = DunningEmailService::from_env();
        Ok(Self::new(pool, processor, email))
    }

    /// Create the engine with explicit processor and email services
    pub fn new(pool: PgPool, processor: ProcessorClient, email: DunningEmailService) -> Self {
        let ledger = Ledger::new(pool.clone());
        let tenants = TenantDirectory::new(pool.clone());
        let dunning = DunningOrchestrator::new(ledger.clone(), tenants.clone(), email.clone());
        let scheduler = RetryScheduler::new(
            ledger.clone(),
            tenants.clone(),
            processor,
            dunning.clone(),
        );

        Self {
            ingestor: EventIngestor::new(pool.clone(), tenants.clone(), scheduler.clone()),
            scheduler,
            ledger,
            tenants: tenants.clone(),
            dunning,
            analytics: AnalyticsService::new(pool.clone()),
            card_expiry: CardExpirySweep::new(pool, tenants, email),
        }
    }
}
