//! Event endpoints: append, outcome patch, query, verify

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use auditd_core::{AuditEvent, ChainStatus, OutcomeInfo};
use auditd_persist::EventQuery;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Response for a successful append
#[derive(Debug, Serialize)]
pub struct RecordResponse {
    pub event_id: String,
    pub event_hash: String,
    pub prev_hash: String,
}

/// POST /v1/events
pub async fn record_event(
    State(state): State<AppState>,
    body: Result<Json<AuditEvent>, JsonRejection>,
) -> ApiResult<Json<RecordResponse>> {
    let Json(event) = body?;
    let recorded = state.events().record(event).await?;
    Ok(Json(RecordResponse {
        event_id: recorded.event_id,
        event_hash: recorded.event_hash,
        prev_hash: recorded.prev_hash,
    }))
}

/// POST /v1/events/{id}/outcome
pub async fn record_outcome(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    body: Result<Json<OutcomeInfo>, JsonRejection>,
) -> ApiResult<Json<AuditEvent>> {
    let Json(outcome) = body?;
    let events = state.events();
    events.record_outcome(&event_id, &outcome).await?;
    let event = events
        .get(&event_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("event {}", event_id)))?;
    Ok(Json(event))
}

/// Query-string filters for GET /v1/events
#[derive(Debug, Default, Deserialize)]
pub struct EventListParams {
    pub event_id: Option<String>,
    pub session_id: Option<String>,
    pub trace_id: Option<String>,
    pub event_type: Option<String>,
    pub agent: Option<String>,
    pub action_class: Option<String>,
    pub tool_name: Option<String>,
    pub approval_status: Option<String>,
    pub min_confidence: Option<f64>,
    pub max_confidence: Option<f64>,
    /// Inclusive RFC3339 lower bound
    pub since: Option<String>,
    pub limit: Option<i64>,
}

const EVENT_TYPES: &[&str] = &[
    "delegation_decision",
    "delegation_outcome",
    "gateway_request",
    "tool_execution",
    "policy_decision",
    "agent_reasoning",
];
const ACTION_CLASSES: &[&str] = &["read", "write", "destructive", "unknown"];

impl EventListParams {
    fn into_query(self) -> ApiResult<EventQuery> {
        if let Some(t) = &self.event_type {
            if !EVENT_TYPES.contains(&t.as_str()) {
                return Err(ApiError::BadRequest(format!("unknown event_type {:?}", t)));
            }
        }
        if let Some(a) = &self.action_class {
            if !ACTION_CLASSES.contains(&a.as_str()) {
                return Err(ApiError::BadRequest(format!("unknown action_class {:?}", a)));
            }
        }
        let since = self
            .since
            .as_deref()
            .map(|s| {
                DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|_| ApiError::BadRequest(format!("bad since timestamp {:?}", s)))
            })
            .transpose()?;
        if let Some(limit) = self.limit {
            if limit <= 0 {
                return Err(ApiError::BadRequest("limit must be positive".to_string()));
            }
        }

        Ok(EventQuery {
            event_id: self.event_id,
            session_id: self.session_id,
            trace_id: self.trace_id,
            event_type: self.event_type,
            agent: self.agent,
            action_class: self.action_class,
            tool_name: self.tool_name,
            approval_status: self.approval_status,
            min_confidence: self.min_confidence,
            max_confidence: self.max_confidence,
            since,
            limit: self.limit,
        })
    }
}

/// Event list response
#[derive(Debug, Serialize)]
pub struct EventListResponse {
    pub events: Vec<AuditEvent>,
    pub count: usize,
}

/// GET /v1/events
pub async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventListParams>,
) -> ApiResult<Json<EventListResponse>> {
    let query = params.into_query()?;
    let events = state.events().query(&query).await?;
    Ok(Json(EventListResponse {
        count: events.len(),
        events,
    }))
}

/// GET /v1/events/{id}
pub async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<AuditEvent>> {
    state
        .events()
        .get(&event_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("event {}", event_id)))
}

/// GET /v1/verify
pub async fn verify_chain(State(state): State<AppState>) -> ApiResult<Json<ChainStatus>> {
    Ok(Json(state.events().verify_integrity().await?))
}
