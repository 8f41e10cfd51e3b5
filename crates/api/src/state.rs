//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use revive_engine::{DunningEmailService, ProcessorClient, RecoveryEngine};

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub engine: Arc<RecoveryEngine>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let processor = ProcessorClient::from_env()?;
        let email = DunningEmailService::from_env();
        if email.is_enabled() {
            tracing::info!("Dunning email sending enabled");
        } else {
            tracing::warn!("Dunning email sending not configured (missing RESEND_API_KEY)");
        }

        let engine = RecoveryEngine::new(pool.clone(), processor, email);

        Ok(Self {
            pool,
            config,
            engine: Arc::new(engine),
        })
    }
}
