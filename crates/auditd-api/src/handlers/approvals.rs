//! Approval endpoints: create, list, fetch, long-poll wait, transitions

use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use auditd_core::{ApprovalRequest, ApprovalStatus, NewApproval};
use auditd_persist::ApprovalFilter;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Hard ceiling for the long-poll wait
pub const MAX_WAIT: Duration = Duration::from_secs(120);
pub const DEFAULT_WAIT: Duration = Duration::from_secs(30);

/// POST /v1/approvals
pub async fn create_approval(
    State(state): State<AppState>,
    body: Result<Json<NewApproval>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ApprovalRequest>)> {
    let Json(req) = body?;
    let record = state.approvals().create(req).await?;

    let notifier = state.notifier();
    let announce = record.clone();
    tokio::spawn(async move {
        notifier.notify_created(&announce).await;
    });

    Ok((StatusCode::CREATED, Json(record)))
}

/// Query-string filters for GET /v1/approvals
#[derive(Debug, Default, Deserialize)]
pub struct ApprovalListParams {
    pub status: Option<String>,
    pub agent_name: Option<String>,
    pub trace_id: Option<String>,
    pub requested_by: Option<String>,
    pub since: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ApprovalListResponse {
    pub approvals: Vec<ApprovalRequest>,
    pub count: usize,
}

/// GET /v1/approvals
pub async fn list_approvals(
    State(state): State<AppState>,
    Query(params): Query<ApprovalListParams>,
) -> ApiResult<Json<ApprovalListResponse>> {
    let status = params
        .status
        .as_deref()
        .map(|s| {
            ApprovalStatus::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status {:?}", s)))
        })
        .transpose()?;
    let since = params
        .since
        .as_deref()
        .map(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| ApiError::BadRequest(format!("bad since timestamp {:?}", s)))
        })
        .transpose()?;

    let approvals = state
        .approvals()
        .list(&ApprovalFilter {
            status,
            agent_name: params.agent_name,
            trace_id: params.trace_id,
            requested_by: params.requested_by,
            since,
            limit: params.limit,
        })
        .await?;
    Ok(Json(ApprovalListResponse {
        count: approvals.len(),
        approvals,
    }))
}

/// GET /v1/approvals/pending
pub async fn list_pending(State(state): State<AppState>) -> ApiResult<Json<ApprovalListResponse>> {
    let approvals = state
        .approvals()
        .list(&ApprovalFilter {
            status: Some(ApprovalStatus::Pending),
            ..Default::default()
        })
        .await?;
    Ok(Json(ApprovalListResponse {
        count: approvals.len(),
        approvals,
    }))
}

/// GET /v1/approvals/{id}
pub async fn get_approval(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
) -> ApiResult<Json<ApprovalRequest>> {
    state
        .approvals()
        .get(&approval_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("approval {}", approval_id)))
}

#[derive(Debug, Default, Deserialize)]
pub struct WaitParams {
    /// Seconds, or a value with an `ms`/`s`/`m` suffix (`30`, `2s`, `1m`)
    pub timeout: Option<String>,
}

/// Parse a wait timeout; plain numbers are seconds
fn parse_timeout(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(m) = s.strip_suffix('m') {
        return m.trim().parse::<u64>().ok().map(|v| Duration::from_secs(v * 60));
    }
    let s = s.strip_suffix('s').unwrap_or(s);
    s.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// GET /v1/approvals/{id}/wait?timeout=
///
/// Blocks until the request resolves or the timeout fires; a timeout
/// returns the current (still pending) record with 200, never a 5xx.
pub async fn wait_approval(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
    Query(params): Query<WaitParams>,
) -> ApiResult<Json<ApprovalRequest>> {
    let wait = params
        .timeout
        .as_deref()
        .map(|s| parse_timeout(s).ok_or_else(|| ApiError::BadRequest(format!("bad timeout {:?}", s))))
        .transpose()?
        .unwrap_or(DEFAULT_WAIT)
        .min(MAX_WAIT);

    let approvals = state.approvals();
    match tokio::time::timeout(wait, approvals.wait_for_resolution(&approval_id)).await {
        Ok(result) => Ok(Json(result?)),
        Err(_elapsed) => approvals
            .get(&approval_id)
            .await?
            .map(Json)
            .ok_or_else(|| ApiError::NotFound(format!("approval {}", approval_id))),
    }
}

#[derive(Debug, Deserialize)]
pub struct ApproveBody {
    pub approved_by: Option<String>,
    pub reason: Option<String>,
    pub valid_for_minutes: Option<i64>,
}

/// POST /v1/approvals/{id}/approve
pub async fn approve(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
    body: Result<Json<ApproveBody>, JsonRejection>,
) -> ApiResult<Json<ApprovalRequest>> {
    let Json(body) = body?;
    let approved_by = body
        .approved_by
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("approved_by is required".to_string()))?;
    let valid_for = body
        .valid_for_minutes
        .filter(|m| *m > 0)
        .map(chrono::Duration::minutes);

    let record = state
        .approvals()
        .approve(&approval_id, &approved_by, body.reason, valid_for)
        .await?;
    spawn_resolution_notice(&state, record.clone());
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct DenyBody {
    pub denied_by: Option<String>,
    pub reason: Option<String>,
}

/// POST /v1/approvals/{id}/deny
pub async fn deny(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
    body: Result<Json<DenyBody>, JsonRejection>,
) -> ApiResult<Json<ApprovalRequest>> {
    let Json(body) = body?;
    let denied_by = body
        .denied_by
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("denied_by is required".to_string()))?;

    let record = state
        .approvals()
        .deny(&approval_id, &denied_by, body.reason)
        .await?;
    spawn_resolution_notice(&state, record.clone());
    Ok(Json(record))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    pub cancelled_by: Option<String>,
    pub reason: Option<String>,
}

/// POST /v1/approvals/{id}/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
    body: Result<Json<CancelBody>, JsonRejection>,
) -> ApiResult<Json<ApprovalRequest>> {
    // The body is optional for cancellation; an absent caller is the system.
    let body = match body {
        Ok(Json(body)) => body,
        Err(_) => CancelBody::default(),
    };
    let cancelled_by = body
        .cancelled_by
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "system".to_string());

    let record = state
        .approvals()
        .cancel(&approval_id, &cancelled_by, body.reason)
        .await?;
    spawn_resolution_notice(&state, record.clone());
    Ok(Json(record))
}

/// Fire the resolution side channels off the request path; when the stored
/// callback goes out, record it on the row.
fn spawn_resolution_notice(state: &AppState, record: ApprovalRequest) {
    let notifier = state.notifier();
    let approvals = state.approvals();
    tokio::spawn(async move {
        let callback_sent = notifier.notify_resolved(&record).await;
        if callback_sent {
            if let Err(e) = approvals.mark_callback_sent(&record.approval_id).await {
                warn!(approval_id = %record.approval_id, error = %e, "failed to record callback delivery");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_values_parse() {
        assert_eq!(parse_timeout("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_timeout("2s"), Some(Duration::from_secs(2)));
        assert_eq!(parse_timeout("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_timeout("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_timeout("soon"), None);
        assert_eq!(parse_timeout(""), None);
    }
}
