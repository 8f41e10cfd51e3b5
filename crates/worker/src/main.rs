//! Revive Background Worker
//!
//! Drives the scheduled side of the recovery engine:
//! - Due-retry sweep (every minute)
//! - Dunning reminder sweep (every 15 minutes)
//! - Expiring-card sweep (daily at 6:00 UTC)
//! - Processed-event cleanup (daily at 3:00 UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use revive_engine::RecoveryEngine;
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Records claimed per due-retry pass. A busy backlog drains across
/// passes rather than hogging one.
const DUE_RETRY_BATCH: i64 = 100;

/// Reminder candidates examined per pass.
const REMINDER_BATCH: i64 = 200;

/// Days a successfully processed event id is kept for deduplication.
const EVENT_RETENTION_DAYS: i32 = 30;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Revive Worker");

    let pool = create_db_pool().await?;
    let engine = Arc::new(RecoveryEngine::from_env(pool)?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Due-retry sweep (every minute)
    // Claims everything whose next_retry_at has passed and drives one
    // charge attempt each. The claim uses SKIP LOCKED, so overlapping
    // runs and extra worker replicas are safe.
    let retry_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let engine = retry_engine.clone();
            Box::pin(async move {
                match engine.scheduler.run_due_retries(DUE_RETRY_BATCH).await {
                    Ok(summary) => {
                        if summary.claimed > 0 {
                            info!(
                                claimed = summary.claimed,
                                recovered = summary.recovered,
                                rescheduled = summary.rescheduled,
                                exhausted = summary.exhausted,
                                "Due-retry sweep finished"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Due-retry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Due-retry sweep (every minute)");

    // Job 2: Dunning reminder sweep (every 15 minutes)
    let reminder_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let engine = reminder_engine.clone();
            Box::pin(async move {
                match engine.dunning.run_reminder_sweep(REMINDER_BATCH).await {
                    Ok(sent) => {
                        if sent > 0 {
                            info!(sent = sent, "Reminder sweep finished");
                        }
                    }
                    Err(e) => error!(error = %e, "Reminder sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Dunning reminder sweep (every 15 minutes)");

    // Job 3: Expiring-card sweep (daily at 6:00 UTC)
    let expiry_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 0 6 * * *", move |_uuid, _l| {
            let engine = expiry_engine.clone();
            Box::pin(async move {
                match engine.card_expiry.run().await {
                    Ok(summary) => info!(
                        candidates = summary.candidates,
                        notified = summary.notified,
                        skipped = summary.skipped,
                        errors = summary.errors,
                        "Card expiry sweep finished"
                    ),
                    Err(e) => error!(error = %e, "Card expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Expiring-card sweep (daily at 6:00 UTC)");

    // Job 4: Processed-event cleanup (daily at 3:00 UTC)
    let cleanup_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let engine = cleanup_engine.clone();
            Box::pin(async move {
                match engine
                    .ingestor
                    .cleanup_processed_events(EVENT_RETENTION_DAYS)
                    .await
                {
                    Ok(deleted) => info!(deleted = deleted, "Processed-event cleanup finished"),
                    Err(e) => error!(error = %e, "Processed-event cleanup failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Processed-event cleanup (daily at 3:00 UTC)");

    // Job 5: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Revive Worker started successfully with 5 scheduled jobs");

    // Keep the main task running; the scheduler runs jobs in background
    // tasks.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
