//! Audit event model
//!
//! Events are immutable once appended. Optional substructures are tagged by
//! `event_type` and serialize only when present, so legacy rows and rows
//! written by newer builds hash identically after a round trip through the
//! store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Chain head for the very first event: 64 ASCII zeros.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Event categories recorded in the governance chain
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    DelegationDecision,
    DelegationOutcome,
    GatewayRequest,
    ToolExecution,
    PolicyDecision,
    AgentReasoning,
}

impl EventType {
    /// Prefix for generated event IDs of this type
    pub fn id_prefix(&self) -> &'static str {
        match self {
            EventType::DelegationDecision | EventType::DelegationOutcome => "evt_",
            EventType::GatewayRequest => "gw_",
            EventType::ToolExecution => "tool_",
            EventType::PolicyDecision => "pol_",
            EventType::AgentReasoning => "rsn_",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::DelegationDecision => "delegation_decision",
            EventType::DelegationOutcome => "delegation_outcome",
            EventType::GatewayRequest => "gateway_request",
            EventType::ToolExecution => "tool_execution",
            EventType::PolicyDecision => "policy_decision",
            EventType::AgentReasoning => "agent_reasoning",
        }
    }
}

/// Coarse classification of an operation's impact
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    Read,
    Write,
    Destructive,
    #[default]
    Unknown,
}

impl ActionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionClass::Read => "read",
            ActionClass::Write => "write",
            ActionClass::Destructive => "destructive",
            ActionClass::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ActionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session context the event was emitted under
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delegation_count: u32,
}

/// Tool invocation details for `tool_execution` events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Approval linkage carried by gated events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ApprovalInfo {
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
}

/// Delegation decision details
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DecisionInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// Policy evaluation embedded in a `policy_decision` event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PolicyDecisionInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub effect: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy_name: String,
    #[serde(default)]
    pub rule_index: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Opaque decision trace as produced by the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub explanation: String,
    #[serde(default)]
    pub post_execution: bool,
}

/// Outcome of the operation the event describes.
///
/// Patched in after the fact via `record_outcome`; not covered by the event
/// hash (see the event store docs).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OutcomeInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// Free-form reasoning capture for `agent_reasoning` events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AgentReasoning {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Single hash-chained audit event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    /// Opaque ID with a kind prefix (`evt_`, `tool_`, `pol_`, `gw_`, `rsn_`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_id: String,
    /// UTC instant, nanosecond precision. Epoch means "unset" and is
    /// replaced by the store at append time.
    #[serde(default = "unset_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_id: String,
    #[serde(default)]
    pub action_class: ActionClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_decision: Option<PolicyDecisionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OutcomeInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_reasoning: Option<AgentReasoning>,
    /// Hash of the chronologically-previous event (genesis = 64 zeros)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prev_hash: String,
    /// SHA-256 of the canonical serialization excluding this field
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_hash: String,
}

fn unset_timestamp() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl AuditEvent {
    /// Bare event of the given type; everything else defaulted
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_id: String::new(),
            timestamp: unset_timestamp(),
            event_type,
            trace_id: String::new(),
            parent_id: String::new(),
            action_class: ActionClass::default(),
            session: None,
            input: None,
            output: None,
            tool: None,
            approval: None,
            decision: None,
            policy_decision: None,
            outcome: None,
            agent_reasoning: None,
            prev_hash: String::new(),
            event_hash: String::new(),
        }
    }

    /// True when the timestamp has never been set
    pub fn timestamp_is_zero(&self) -> bool {
        self.timestamp == unset_timestamp()
    }

    /// Tool name, when the event carries one (used for indexed columns)
    pub fn tool_name(&self) -> Option<&str> {
        self.tool.as_ref().map(|t| t.name.as_str()).filter(|n| !n.is_empty())
    }

    /// User query extracted from the free-form input, when present
    pub fn user_query(&self) -> Option<&str> {
        self.input
            .as_ref()
            .and_then(|v| v.get("user_query"))
            .and_then(|v| v.as_str())
    }
}

/// Generate an event ID: kind prefix + 32 hex chars
pub fn new_event_id(event_type: EventType) -> String {
    format!("{}{}", event_type.id_prefix(), Uuid::new_v4().simple())
}

/// Synthesize a trace ID for direct operator calls.
///
/// The `chk_` prefix is reserved for checks that reached the daemon without
/// an agent-propagated trace.
pub fn new_check_trace_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("chk_{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_prefixes_follow_event_kind() {
        assert!(new_event_id(EventType::ToolExecution).starts_with("tool_"));
        assert!(new_event_id(EventType::PolicyDecision).starts_with("pol_"));
        assert!(new_event_id(EventType::GatewayRequest).starts_with("gw_"));
        assert!(new_event_id(EventType::AgentReasoning).starts_with("rsn_"));
        assert!(new_event_id(EventType::DelegationDecision).starts_with("evt_"));
    }

    #[test]
    fn check_trace_ids_are_short_and_prefixed() {
        let id = new_check_trace_id();
        assert!(id.starts_with("chk_"));
        assert_eq!(id.len(), "chk_".len() + 8);
    }

    #[test]
    fn absent_substructures_do_not_serialize() {
        let event = AuditEvent::new(EventType::ToolExecution);
        let json = serde_json::to_value(&event).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("session"));
        assert!(!obj.contains_key("policy_decision"));
        assert!(!obj.contains_key("event_hash"));
    }

    #[test]
    fn event_round_trips_through_json() {
        let mut event = AuditEvent::new(EventType::PolicyDecision);
        event.event_id = "pol_abc".to_string();
        event.trace_id = "t1".to_string();
        event.timestamp = Utc::now();
        event.policy_decision = Some(PolicyDecisionInfo {
            resource_type: "database".to_string(),
            resource_name: "prod-db".to_string(),
            action: "write".to_string(),
            effect: "deny".to_string(),
            policy_name: "db-policy".to_string(),
            rule_index: 1,
            message: "writes not allowed".to_string(),
            ..Default::default()
        });

        let json = serde_json::to_string(&event).unwrap();
        let back: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn user_query_comes_from_input() {
        let mut event = AuditEvent::new(EventType::GatewayRequest);
        event.input = Some(serde_json::json!({"user_query": "drop the table"}));
        assert_eq!(event.user_query(), Some("drop the table"));
    }
}
