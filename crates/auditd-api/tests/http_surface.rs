//! End-to-end tests over the assembled router: policy checks landing in the
//! audit chain, the approval workflow with long-polling, and chain
//! verification under concurrent appends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use auditd_api::{api_router, AppState};
use auditd_notify::{Notifier, NotifierConfig};
use auditd_persist::{ApprovalStore, DbPool, EventStore, StreamHub};
use auditd_policy::{PolicyConfig, PolicyEngine};

const POLICY: &str = r#"
policies:
  - name: prod-freeze
    resources:
      - type: database
        match:
          tags: [production]
    rules:
      - action: [read, write, destructive]
        effect: deny
        message: production frozen
  - name: db-policy
    resources:
      - type: database
    rules:
      - action: [read]
        effect: allow
      - action: [write]
        effect: deny
        message: writes not allowed
  - name: deploy-policy
    resources:
      - type: cluster
    rules:
      - action: [write]
        effect: allow
        conditions:
          require_approval: true
infrastructure:
  - type: database
    name: prod-db
    tags: [production]
"#;

async fn test_app(policy: Option<&str>) -> (Router, AppState) {
    let db = DbPool::connect("sqlite::memory:").await.unwrap();
    let events = Arc::new(EventStore::open(db.clone(), StreamHub::new()).await.unwrap());
    let approvals = Arc::new(ApprovalStore::open(db).await.unwrap());
    let engine = policy.map(|yaml| {
        Arc::new(PolicyEngine::new(PolicyConfig::from_yaml(yaml).unwrap()).unwrap())
    });
    let notifier = Arc::new(Notifier::new(NotifierConfig::default()));

    let state = AppState::new(
        events,
        approvals,
        engine,
        notifier,
        policy.map(|_| "policies.yaml".to_string()),
    );
    (api_router(state.clone()), state)
}

async fn request(
    app: &Router,
    method: &str,
    path: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let builder = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    let request = match body {
        Some(json) => builder.body(Body::from(json.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn get(app: &Router, path: &str) -> (StatusCode, serde_json::Value) {
    request(app, "GET", path, None).await
}

async fn post(app: &Router, path: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    request(app, "POST", path, Some(body)).await
}

#[tokio::test]
async fn health_reports_version() {
    let (app, _) = test_app(None).await;
    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn allowed_read_lands_in_the_audit_chain() {
    let (app, _) = test_app(Some(POLICY)).await;

    let (status, body) = post(
        &app,
        "/v1/governance/check",
        serde_json::json!({
            "resource_type": "database",
            "resource_name": "dev-db",
            "action": "read",
            "trace_id": "t1",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["effect"], "allow");
    assert_eq!(body["policy_name"], "db-policy");
    assert_eq!(body["requires_approval"], false);
    assert!(body["event_id"].as_str().unwrap().starts_with("pol_"));

    let (status, listing) = get(&app, "/v1/events?trace_id=t1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["count"], 1);
    let event = &listing["events"][0];
    assert_eq!(event["event_type"], "policy_decision");
    assert_eq!(event["trace_id"], "t1");
    assert_eq!(event["policy_decision"]["effect"], "allow");
    // Effect is mirrored into the outcome for column-level filtering.
    assert_eq!(event["outcome"]["status"], "allow");
}

#[tokio::test]
async fn denied_write_returns_403_with_explanation() {
    let (app, _) = test_app(Some(POLICY)).await;

    let (status, body) = post(
        &app,
        "/v1/governance/check",
        serde_json::json!({
            "resource_type": "database",
            "resource_name": "staging-db",
            "action": "write",
            "trace_id": "t2",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["effect"], "deny");
    assert_eq!(body["message"], "writes not allowed");
    let explanation = body["explanation"].as_str().unwrap();
    assert!(explanation.contains("DENIED"));
    assert!(explanation.contains("writes not allowed"));
}

#[tokio::test]
async fn approval_gate_end_to_end() {
    let (app, _) = test_app(Some(POLICY)).await;

    let (status, check) = post(
        &app,
        "/v1/governance/check",
        serde_json::json!({
            "resource_type": "cluster",
            "resource_name": "k8s-main",
            "action": "write",
            "trace_id": "t3",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(check["effect"], "require_approval");
    assert_eq!(check["requires_approval"], true);

    let (status, created) = post(
        &app,
        "/v1/approvals",
        serde_json::json!({
            "trace_id": "t3",
            "tool_name": "kubectl",
            "agent_name": "infra-agent",
            "action_class": "write",
            "resource_type": "cluster",
            "resource_name": "k8s-main",
            "policy_name": "deploy-policy",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "pending");
    let approval_id = created["approval_id"].as_str().unwrap().to_string();

    // A blocked waiter and a concurrent operator approval.
    let waiter_app = app.clone();
    let wait_path = format!("/v1/approvals/{}/wait?timeout=5s", approval_id);
    let waiter =
        tokio::spawn(async move { get(&waiter_app, &wait_path).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let started = Instant::now();
    let (status, resolved) = post(
        &app,
        &format!("/v1/approvals/{}/approve", approval_id),
        serde_json::json!({"approved_by": "ops", "reason": "go ahead", "valid_for_minutes": 30}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["status"], "approved");
    assert_eq!(resolved["resolved_by"], "ops");
    assert!(resolved["approval_valid_until"].is_string());

    let (status, woken) = waiter.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(woken["status"], "approved");
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "waiter must wake promptly after resolution"
    );
}

#[tokio::test]
async fn hundred_concurrent_appends_keep_the_chain_valid() {
    let (app, _) = test_app(None).await;

    let posts: Vec<_> = (0..100)
        .map(|i| {
            let app = app.clone();
            tokio::spawn(async move {
                let (status, _) = post(
                    &app,
                    "/v1/events",
                    serde_json::json!({
                        "event_type": "tool_execution",
                        "trace_id": format!("bulk-{}", i),
                        "action_class": "write",
                    }),
                )
                .await;
                assert_eq!(status, StatusCode::OK);
            })
        })
        .collect();
    for task in posts {
        task.await.unwrap();
    }

    let (status, report) = get(&app, "/v1/verify").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["valid"], true);
    assert_eq!(report["total"], 100);
    assert_eq!(report["hashed_count"], 100);
    assert_eq!(report["broken_at"], -1);
}

#[tokio::test]
async fn untagged_request_resolves_tags_from_the_infra_map() {
    let (app, _) = test_app(Some(POLICY)).await;

    // No tags supplied: prod-db maps to ["production"], which trips the
    // production-only freeze instead of the generic db-policy.
    let (status, body) = post(
        &app,
        "/v1/governance/check",
        serde_json::json!({
            "resource_type": "database",
            "resource_name": "prod-db",
            "action": "read",
            "trace_id": "t5",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["policy_name"], "prod-freeze");

    let (_, listing) = get(&app, "/v1/events?trace_id=t5").await;
    let tags = listing["events"][0]["policy_decision"]["tags"]
        .as_array()
        .unwrap();
    assert!(tags.contains(&serde_json::json!("production")));
}

#[tokio::test]
async fn long_poll_timeout_returns_the_pending_record() {
    let (app, _) = test_app(None).await;

    let (_, created) = post(
        &app,
        "/v1/approvals",
        serde_json::json!({"tool_name": "psql", "trace_id": "t6"}),
    )
    .await;
    let approval_id = created["approval_id"].as_str().unwrap();

    let started = Instant::now();
    let (status, body) = get(
        &app,
        &format!("/v1/approvals/{}/wait?timeout=1s", approval_id),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn second_resolution_names_the_current_status() {
    let (app, _) = test_app(None).await;

    let (_, created) = post(
        &app,
        "/v1/approvals",
        serde_json::json!({"tool_name": "psql", "trace_id": "t7"}),
    )
    .await;
    let approval_id = created["approval_id"].as_str().unwrap();

    let (status, _) = post(
        &app,
        &format!("/v1/approvals/{}/deny", approval_id),
        serde_json::json!({"denied_by": "ops", "reason": "nope"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post(
        &app,
        &format!("/v1/approvals/{}/approve", approval_id),
        serde_json::json!({"approved_by": "ops"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("denied"));
}

#[tokio::test]
async fn cancel_defaults_to_system() {
    let (app, _) = test_app(None).await;
    let (_, created) = post(
        &app,
        "/v1/approvals",
        serde_json::json!({"tool_name": "psql", "trace_id": "t8"}),
    )
    .await;
    let approval_id = created["approval_id"].as_str().unwrap();

    let (status, body) = post(
        &app,
        &format!("/v1/approvals/{}/cancel", approval_id),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["resolved_by"], "system");
}

#[tokio::test]
async fn unknown_ids_are_404() {
    let (app, _) = test_app(None).await;
    let (status, body) = get(&app, "/v1/events/evt_missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let (status, _) = get(&app, "/v1/approvals/apr_missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post(
        &app,
        "/v1/approvals/apr_missing/approve",
        serde_json::json!({"approved_by": "ops"}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn agents_must_propagate_trace_ids() {
    let (app, _) = test_app(Some(POLICY)).await;
    let (status, body) = post(
        &app,
        "/v1/governance/check",
        serde_json::json!({
            "resource_type": "database",
            "resource_name": "dev-db",
            "action": "read",
            "agent_name": "sql-agent",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("trace_id"));
}

#[tokio::test]
async fn operator_checks_get_a_synthetic_trace() {
    let (app, _) = test_app(Some(POLICY)).await;
    let (status, body) = post(
        &app,
        "/v1/governance/check",
        serde_json::json!({
            "resource_type": "database",
            "resource_name": "dev-db",
            "action": "read",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let trace_id = body["trace_id"].as_str().unwrap();
    assert!(trace_id.starts_with("chk_"));

    // The synthesized trace doubles as the session, keeping the event
    // queryable.
    let (_, listing) = get(&app, &format!("/v1/events?trace_id={}", trace_id)).await;
    assert_eq!(listing["count"], 1);
    assert_eq!(listing["events"][0]["session"]["id"], trace_id);
}

#[tokio::test]
async fn check_without_engine_is_503_and_info_reports_disabled() {
    let (app, _) = test_app(None).await;

    let (status, body) = post(
        &app,
        "/v1/governance/check",
        serde_json::json!({"resource_type": "database", "action": "read"}),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].is_string());

    let (status, _) = get(&app, "/v1/governance/explain?resource_type=database").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, info) = get(&app, "/v1/governance/info").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["policy"]["enabled"], false);
}

#[tokio::test]
async fn governance_info_aggregates_all_three_subsystems() {
    let (app, _) = test_app(Some(POLICY)).await;

    post(
        &app,
        "/v1/governance/check",
        serde_json::json!({"resource_type": "database", "resource_name": "dev-db", "action": "read", "trace_id": "t9"}),
    )
    .await;
    post(
        &app,
        "/v1/approvals",
        serde_json::json!({"tool_name": "psql", "trace_id": "t9"}),
    )
    .await;

    let (status, info) = get(&app, "/v1/governance/info").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["policy"]["enabled"], true);
    assert_eq!(info["policy"]["policy_count"], 3);
    assert_eq!(info["policy"]["file"], "policies.yaml");
    assert_eq!(info["approvals"]["pending_count"], 1);
    assert_eq!(info["approvals"]["webhook_configured"], false);
    assert_eq!(info["audit"]["total_events"], 1);
    assert_eq!(info["audit"]["chain_valid"], true);
    assert!(info["audit"]["last_event_at"].is_string());
}

#[tokio::test]
async fn outcome_patch_is_visible_but_chain_stays_valid() {
    let (app, _) = test_app(None).await;

    let (_, recorded) = post(
        &app,
        "/v1/events",
        serde_json::json!({"event_type": "tool_execution", "trace_id": "t10"}),
    )
    .await;
    let event_id = recorded["event_id"].as_str().unwrap();

    let (status, patched) = post(
        &app,
        &format!("/v1/events/{}/outcome", event_id),
        serde_json::json!({"status": "error", "error": "timeout", "duration_ms": 900}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(patched["outcome"]["status"], "error");

    let (_, report) = get(&app, "/v1/verify").await;
    assert_eq!(report["valid"], true);
}

#[tokio::test]
async fn bad_filter_values_are_rejected() {
    let (app, _) = test_app(None).await;
    let (status, body) = get(&app, "/v1/events?event_type=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("event_type"));

    let (status, _) = get(&app, "/v1/events?since=yesterday").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(&app, "/v1/approvals?status=perhaps").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn explain_matches_check_for_identical_input() {
    let (app, _) = test_app(Some(POLICY)).await;

    let (_, explained) = get(
        &app,
        "/v1/governance/explain?resource_type=database&resource_name=staging-db&action=write",
    )
    .await;
    let (_, checked) = post(
        &app,
        "/v1/governance/check",
        serde_json::json!({
            "resource_type": "database",
            "resource_name": "staging-db",
            "action": "write",
            "trace_id": "t11",
        }),
    )
    .await;

    assert_eq!(explained["decision"]["effect"], checked["effect"]);
    assert_eq!(explained["decision"]["policy_name"], checked["policy_name"]);
    assert_eq!(explained["decision"]["message"], checked["message"]);
}

#[tokio::test]
async fn pending_listing_is_a_filtered_view() {
    let (app, _) = test_app(None).await;

    let (_, a) = post(
        &app,
        "/v1/approvals",
        serde_json::json!({"tool_name": "psql", "trace_id": "t12"}),
    )
    .await;
    post(
        &app,
        "/v1/approvals",
        serde_json::json!({"tool_name": "kubectl", "trace_id": "t13"}),
    )
    .await;
    post(
        &app,
        &format!("/v1/approvals/{}/deny", a["approval_id"].as_str().unwrap()),
        serde_json::json!({"denied_by": "ops"}),
    )
    .await;

    let (status, pending) = get(&app, "/v1/approvals/pending").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending["count"], 1);
    assert_eq!(pending["approvals"][0]["tool_name"], "kubectl");

    let (_, by_trace) = get(&app, "/v1/approvals?trace_id=t12").await;
    assert_eq!(by_trace["count"], 1);
    assert_eq!(by_trace["approvals"][0]["status"], "denied");
}
