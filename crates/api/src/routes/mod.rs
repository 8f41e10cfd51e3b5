//! Route registration

pub mod events;
pub mod recoveries;
pub mod stats;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/events", post(events::ingest_event))
        .route("/v1/recoveries", get(recoveries::list_by_customer))
        .route(
            "/v1/recoveries/{invoice_id}",
            get(recoveries::get_recovery),
        )
        .route(
            "/v1/recoveries/{invoice_id}/retry",
            post(recoveries::manual_retry),
        )
        .route("/v1/stats", get(stats::get_stats))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
