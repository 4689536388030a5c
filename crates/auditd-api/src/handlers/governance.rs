//! Governance endpoints: info, policy summary, explain, check
//!
//! `check` is the gate agents call before a guarded tool call: it evaluates
//! the policy engine and atomically records a `pol_*` event in the same
//! chain the tool execution will land in. The policy answer is computed
//! before recording, so a storage failure is logged and the caller still
//! gets the decision.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use auditd_core::{
    new_check_trace_id, ActionClass, AuditEvent, EventType, OutcomeInfo, PolicyDecisionInfo,
    SessionInfo,
};
use auditd_policy::{
    DecisionTrace, Effect, PolicyEngine, PolicyRequest, Principal, RequestContext, ResourceRef,
};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn parse_action(s: &str) -> ApiResult<ActionClass> {
    match s {
        "read" => Ok(ActionClass::Read),
        "write" => Ok(ActionClass::Write),
        "destructive" => Ok(ActionClass::Destructive),
        "unknown" | "" => Ok(ActionClass::Unknown),
        other => Err(ApiError::BadRequest(format!("unknown action {:?}", other))),
    }
}

fn engine_or_unavailable(state: &AppState) -> ApiResult<Arc<PolicyEngine>> {
    state
        .engine()
        .ok_or_else(|| ApiError::Unavailable("no policy engine configured".to_string()))
}

/// GET /v1/governance/info
pub async fn governance_info(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let events = state.events();
    let approvals = state.approvals();
    let notifier = state.notifier();

    let policy = match state.engine() {
        Some(engine) => serde_json::json!({
            "enabled": true,
            "file": state.policy_file(),
            "default_deny": engine.default_deny(),
            "policy_count": engine.policy_count(),
            "rule_count": engine.rule_count(),
            "policies": engine.summaries(),
        }),
        None => serde_json::json!({
            "enabled": false,
            "file": serde_json::Value::Null,
        }),
    };

    let chain = events.verify_integrity().await?;
    let last_event_at = events.last_event_at().await?;

    Ok(Json(serde_json::json!({
        "policy": policy,
        "approvals": {
            "webhook_configured": notifier.webhook_configured(),
            "email_configured": notifier.email_configured(),
            "pending_count": approvals.pending_count().await?,
        },
        "audit": {
            "total_events": chain.total,
            "chain_valid": chain.valid,
            "last_event_at": last_event_at,
        },
    })))
}

/// GET /v1/governance/policies
pub async fn governance_policies(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let engine = engine_or_unavailable(&state)?;
    Ok(Json(serde_json::json!({
        "default_deny": engine.default_deny(),
        "policy_count": engine.policy_count(),
        "policies": engine.summaries(),
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExplainParams {
    pub resource_type: Option<String>,
    pub resource_name: Option<String>,
    pub action: Option<String>,
    /// Comma-separated; empty means resolve from the infrastructure map
    pub tags: Option<String>,
    pub user_id: Option<String>,
    pub role: Option<String>,
}

/// GET /v1/governance/explain
///
/// Hypothetical evaluation; nothing is recorded.
pub async fn governance_explain(
    State(state): State<AppState>,
    Query(params): Query<ExplainParams>,
) -> ApiResult<Json<DecisionTrace>> {
    let engine = engine_or_unavailable(&state)?;

    let resource_type = params
        .resource_type
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("resource_type is required".to_string()))?;
    let resource_name = params.resource_name.unwrap_or_default();
    let action = parse_action(params.action.as_deref().unwrap_or(""))?;

    let tags = split_tags(params.tags.as_deref());
    let tags = if tags.is_empty() {
        engine.resolve_tags(&resource_type, &resource_name)
    } else {
        tags
    };

    let request = PolicyRequest {
        principal: Principal {
            user_id: params.user_id.unwrap_or_default(),
            roles: params.role.map(|r| vec![r]).unwrap_or_default(),
        },
        resource: ResourceRef {
            resource_type,
            name: resource_name,
            tags,
        },
        action,
        context: RequestContext::default(),
    };

    Ok(Json(engine.explain(&request)))
}

fn split_tags(tags: Option<&str>) -> Vec<String> {
    tags.map(|t| {
        t.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

/// POST /v1/governance/check body
#[derive(Debug, Default, Deserialize)]
pub struct CheckRequest {
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub resource_name: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub rows_affected: Option<i64>,
    #[serde(default)]
    pub pods_affected: Option<i64>,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub note: Option<String>,
    /// True when the check runs after the fact (audit-only)
    #[serde(default)]
    pub post_execution: bool,
}

/// POST /v1/governance/check response
#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub effect: Effect,
    pub policy_name: String,
    pub message: String,
    pub explanation: String,
    pub requires_approval: bool,
    pub trace: DecisionTrace,
    /// Recorded pol_* event, empty when persistence failed
    pub event_id: String,
    pub trace_id: String,
}

/// POST /v1/governance/check
pub async fn governance_check(
    State(state): State<AppState>,
    body: Result<Json<CheckRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CheckResponse>)> {
    let Json(req) = body?;
    let engine = engine_or_unavailable(&state)?;

    if req.resource_type.is_empty() {
        return Err(ApiError::BadRequest("resource_type is required".to_string()));
    }
    let action = parse_action(&req.action)?;

    // Agents must propagate trace IDs; only direct operator calls get a
    // synthesized chk_ trace.
    let trace_id = if req.trace_id.is_empty() {
        if !req.agent_name.is_empty() {
            return Err(ApiError::BadRequest(
                "trace_id is required when agent_name is set".to_string(),
            ));
        }
        new_check_trace_id()
    } else {
        req.trace_id.clone()
    };
    let session_id = if req.session_id.is_empty() {
        trace_id.clone()
    } else {
        req.session_id.clone()
    };

    let tags = if req.tags.is_empty() {
        engine.resolve_tags(&req.resource_type, &req.resource_name)
    } else {
        req.tags.clone()
    };

    let request = PolicyRequest {
        principal: Principal {
            user_id: req.user_id.clone(),
            roles: req.roles.clone(),
        },
        resource: ResourceRef {
            resource_type: req.resource_type.clone(),
            name: req.resource_name.clone(),
            tags: tags.clone(),
        },
        action,
        context: RequestContext {
            trace_id: trace_id.clone(),
            rows_affected: req.rows_affected,
            pods_affected: req.pods_affected,
            time: None,
        },
    };

    let trace = engine.explain(&request);
    let decision = &trace.decision;
    info!(
        trace_id = %trace_id,
        effect = decision.effect.as_str(),
        policy = %decision.policy_name,
        resource = %req.resource_name,
        "policy check"
    );

    // The decision is already made; losing the audit row must not turn a
    // computed answer into an error for the caller.
    let event_id = match record_decision(&state, &req, &trace, action, &trace_id, &session_id, &tags).await
    {
        Ok(id) => id,
        Err(e) => {
            error!(trace_id = %trace_id, error = %e, "failed to record policy decision event");
            String::new()
        }
    };

    let status = match decision.effect {
        Effect::Deny => StatusCode::FORBIDDEN,
        _ => StatusCode::OK,
    };
    let response = CheckResponse {
        effect: decision.effect,
        policy_name: decision.policy_name.clone(),
        message: decision.message.clone(),
        explanation: trace.explanation.clone(),
        requires_approval: decision.effect == Effect::RequireApproval,
        event_id,
        trace_id,
        trace,
    };
    Ok((status, Json(response)))
}

#[allow(clippy::too_many_arguments)]
async fn record_decision(
    state: &AppState,
    req: &CheckRequest,
    trace: &DecisionTrace,
    action: ActionClass,
    trace_id: &str,
    session_id: &str,
    tags: &[String],
) -> Result<String, ApiError> {
    let decision = &trace.decision;

    let mut event = AuditEvent::new(EventType::PolicyDecision);
    event.trace_id = trace_id.to_string();
    event.action_class = action;
    event.session = Some(SessionInfo {
        id: session_id.to_string(),
        user_id: req.user_id.clone(),
        started_at: None,
        delegation_count: 0,
    });
    if req.note.is_some() || !req.agent_name.is_empty() {
        event.input = Some(serde_json::json!({
            "agent_name": req.agent_name,
            "note": req.note,
        }));
    }
    event.policy_decision = Some(PolicyDecisionInfo {
        resource_type: req.resource_type.clone(),
        resource_name: req.resource_name.clone(),
        action: action.as_str().to_string(),
        tags: tags.to_vec(),
        effect: decision.effect.as_str().to_string(),
        policy_name: decision.policy_name.clone(),
        rule_index: decision.rule_index,
        message: decision.message.clone(),
        trace: serde_json::to_value(trace).ok(),
        explanation: trace.explanation.clone(),
        post_execution: req.post_execution,
    });
    // Mirror the effect into the outcome so one indexed column filters
    // allow/deny without JSON extraction.
    event.outcome = Some(OutcomeInfo {
        status: decision.effect.as_str().to_string(),
        error: None,
        duration_ms: None,
    });

    let recorded = state.events().record(event).await?;
    Ok(recorded.event_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_splitting_trims_and_drops_empties() {
        assert_eq!(split_tags(Some("production, pii ,")), vec!["production", "pii"]);
        assert!(split_tags(Some("")).is_empty());
        assert!(split_tags(None).is_empty());
    }

    #[test]
    fn actions_parse_strictly() {
        assert!(parse_action("read").is_ok());
        assert!(parse_action("").is_ok(), "empty means unknown");
        assert!(parse_action("rm -rf").is_err());
    }
}
