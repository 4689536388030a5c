//! Router assembly for the governance API

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::handlers::{approvals, events, governance};
use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
    })
}

/// Build the full API router
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Audit events
        .route("/v1/events", post(events::record_event).get(events::list_events))
        .route("/v1/events/{id}", get(events::get_event))
        .route("/v1/events/{id}/outcome", post(events::record_outcome))
        .route("/v1/verify", get(events::verify_chain))
        // Approvals
        .route(
            "/v1/approvals",
            post(approvals::create_approval).get(approvals::list_approvals),
        )
        .route("/v1/approvals/pending", get(approvals::list_pending))
        .route("/v1/approvals/{id}", get(approvals::get_approval))
        .route("/v1/approvals/{id}/wait", get(approvals::wait_approval))
        .route("/v1/approvals/{id}/approve", post(approvals::approve))
        .route("/v1/approvals/{id}/deny", post(approvals::deny))
        .route("/v1/approvals/{id}/cancel", post(approvals::cancel))
        // Governance
        .route("/v1/governance/info", get(governance::governance_info))
        .route("/v1/governance/policies", get(governance::governance_policies))
        .route("/v1/governance/explain", get(governance::governance_explain))
        .route("/v1/governance/check", post(governance::governance_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
