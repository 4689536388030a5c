//! Canonical event hashing and chain verification
//!
//! Hashing uses RFC 8785 (JCS) over a canonical view of the event so the
//! digest is independent of field declaration order and of how the event was
//! materialized. The timestamp is pre-formatted as RFC3339 with nanosecond
//! precision, because chrono's serde output varies in fractional width.
//!
//! Events written before hashing was introduced carry an empty `event_hash`;
//! verification treats those as legacy and falls back to recomputation when
//! checking the link into them.

use chrono::SecondsFormat;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::event::{
    AgentReasoning, ApprovalInfo, AuditEvent, DecisionInfo, EventType, OutcomeInfo,
    PolicyDecisionInfo, SessionInfo, ToolCall, GENESIS_HASH,
};

/// Canonical hashing input: the event minus `event_hash`
#[derive(Serialize)]
struct CanonicalEvent<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    event_id: &'a str,
    timestamp: String,
    event_type: &'a EventType,
    #[serde(skip_serializing_if = "str::is_empty")]
    trace_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    parent_id: &'a str,
    action_class: &'a crate::event::ActionClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: &'a Option<SessionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: &'a Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: &'a Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool: &'a Option<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    approval: &'a Option<ApprovalInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    decision: &'a Option<DecisionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    policy_decision: &'a Option<PolicyDecisionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: &'a Option<OutcomeInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_reasoning: &'a Option<AgentReasoning>,
    #[serde(skip_serializing_if = "str::is_empty")]
    prev_hash: &'a str,
}

impl<'a> CanonicalEvent<'a> {
    fn of(event: &'a AuditEvent) -> Self {
        Self {
            event_id: &event.event_id,
            timestamp: event.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            event_type: &event.event_type,
            trace_id: &event.trace_id,
            parent_id: &event.parent_id,
            action_class: &event.action_class,
            session: &event.session,
            input: &event.input,
            output: &event.output,
            tool: &event.tool,
            approval: &event.approval,
            decision: &event.decision,
            policy_decision: &event.policy_decision,
            outcome: &event.outcome,
            agent_reasoning: &event.agent_reasoning,
            prev_hash: &event.prev_hash,
        }
    }
}

/// SHA-256 of the event's canonical serialization, lowercase hex.
///
/// `event_hash` itself is excluded; `prev_hash` is included, which is what
/// links the chain.
pub fn compute_event_hash(event: &AuditEvent) -> String {
    // JCS serialization of this shape cannot fail: every field is a plain
    // string, integer, bool or JSON value.
    let bytes = serde_jcs::to_vec(&CanonicalEvent::of(event))
        .unwrap_or_else(|_| serde_json::to_vec(&CanonicalEvent::of(event)).unwrap_or_default());
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

/// True iff the stored hash is empty (legacy) or matches the recomputed one
pub fn verify_event_hash(event: &AuditEvent) -> bool {
    event.event_hash.is_empty() || event.event_hash == compute_event_hash(event)
}

/// Why a chain failed verification
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("event {index} ({event_id}): stored hash does not match content")]
    HashMismatch { index: usize, event_id: String },

    #[error("event {index} ({event_id}): prev_hash does not link to the preceding event")]
    LinkBroken { index: usize, event_id: String },

    #[error("event {index} ({event_id}): first event must link to the genesis hash")]
    BadGenesis { index: usize, event_id: String },
}

impl ChainError {
    /// Insertion index of the event that broke the chain
    pub fn index(&self) -> usize {
        match self {
            ChainError::HashMismatch { index, .. }
            | ChainError::LinkBroken { index, .. }
            | ChainError::BadGenesis { index, .. } => *index,
        }
    }
}

/// Effective hash of an event for link checking: stored when present,
/// recomputed for legacy rows.
fn effective_hash(event: &AuditEvent) -> String {
    if event.event_hash.is_empty() {
        compute_event_hash(event)
    } else {
        event.event_hash.clone()
    }
}

/// Walk the events in insertion order and verify content hashes and links.
///
/// Events must be supplied in chain (insertion) order, not timestamp order.
pub fn verify_chain(events: &[AuditEvent]) -> Result<(), ChainError> {
    for (i, event) in events.iter().enumerate() {
        if !verify_event_hash(event) {
            return Err(ChainError::HashMismatch {
                index: i,
                event_id: event.event_id.clone(),
            });
        }

        // Fully-legacy rows predate chaining and carry no link to check.
        let legacy = event.event_hash.is_empty() && event.prev_hash.is_empty();
        if legacy {
            continue;
        }

        if i == 0 {
            if !event.prev_hash.is_empty() && event.prev_hash != GENESIS_HASH {
                return Err(ChainError::BadGenesis {
                    index: i,
                    event_id: event.event_id.clone(),
                });
            }
        } else {
            let expected = effective_hash(&events[i - 1]);
            if event.prev_hash != expected {
                return Err(ChainError::LinkBroken {
                    index: i,
                    event_id: event.event_id.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Aggregate verification report for a full chain walk
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChainStatus {
    pub valid: bool,
    pub total: usize,
    pub hashed_count: usize,
    pub legacy_count: usize,
    pub first_id: String,
    pub last_id: String,
    pub last_hash: String,
    /// Insertion index of the first broken event, -1 when valid
    pub broken_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Verify the chain and summarize the result
pub fn verify_chain_status(events: &[AuditEvent]) -> ChainStatus {
    let hashed_count = events.iter().filter(|e| !e.event_hash.is_empty()).count();
    let (broken_at, error) = match verify_chain(events) {
        Ok(()) => (-1, None),
        Err(e) => (e.index() as i64, Some(e.to_string())),
    };

    ChainStatus {
        valid: broken_at < 0,
        total: events.len(),
        hashed_count,
        legacy_count: events.len() - hashed_count,
        first_id: events.first().map(|e| e.event_id.clone()).unwrap_or_default(),
        last_id: events.last().map(|e| e.event_id.clone()).unwrap_or_default(),
        last_hash: events.last().map(effective_hash).unwrap_or_default(),
        broken_at,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{new_event_id, ActionClass};
    use chrono::Utc;

    fn sample(event_type: EventType, trace: &str) -> AuditEvent {
        let mut e = AuditEvent::new(event_type);
        e.event_id = new_event_id(event_type);
        e.timestamp = Utc::now();
        e.trace_id = trace.to_string();
        e.action_class = ActionClass::Read;
        e
    }

    fn chain(n: usize) -> Vec<AuditEvent> {
        let mut events = Vec::with_capacity(n);
        let mut prev = GENESIS_HASH.to_string();
        for i in 0..n {
            let mut e = sample(EventType::ToolExecution, &format!("t{}", i));
            e.prev_hash = prev.clone();
            e.event_hash = compute_event_hash(&e);
            prev = e.event_hash.clone();
            events.push(e);
        }
        events
    }

    #[test]
    fn hash_is_deterministic() {
        let e = sample(EventType::GatewayRequest, "t1");
        assert_eq!(compute_event_hash(&e), compute_event_hash(&e.clone()));
    }

    #[test]
    fn hash_changes_with_content() {
        let e = sample(EventType::GatewayRequest, "t1");
        let mut other = e.clone();
        other.trace_id = "t2".to_string();
        assert_ne!(compute_event_hash(&e), compute_event_hash(&other));
    }

    #[test]
    fn hash_survives_a_store_round_trip() {
        let mut e = sample(EventType::PolicyDecision, "t1");
        e.input = Some(serde_json::json!({"user_query": "select 1", "nested": {"b": 2, "a": 1}}));
        e.prev_hash = GENESIS_HASH.to_string();
        e.event_hash = compute_event_hash(&e);

        let raw = serde_json::to_string(&e).unwrap();
        let back: AuditEvent = serde_json::from_str(&raw).unwrap();
        assert!(verify_event_hash(&back));
    }

    #[test]
    fn valid_chain_verifies() {
        let events = chain(5);
        assert_eq!(verify_chain(&events), Ok(()));
        let status = verify_chain_status(&events);
        assert!(status.valid);
        assert_eq!(status.total, 5);
        assert_eq!(status.hashed_count, 5);
        assert_eq!(status.broken_at, -1);
        assert_eq!(status.last_hash, events[4].event_hash);
    }

    #[test]
    fn tampered_field_is_detected_at_its_index() {
        let mut events = chain(4);
        events[2].trace_id = "tampered".to_string();

        let status = verify_chain_status(&events);
        assert!(!status.valid);
        assert_eq!(status.broken_at, 2);
    }

    #[test]
    fn broken_link_is_detected() {
        let mut events = chain(3);
        events[1].prev_hash = GENESIS_HASH.to_string();
        // Re-hash so the content hash is consistent and only the link is bad.
        events[1].event_hash = compute_event_hash(&events[1]);

        match verify_chain(&events) {
            Err(ChainError::LinkBroken { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected LinkBroken, got {:?}", other),
        }
    }

    #[test]
    fn legacy_events_pass_and_are_counted() {
        let mut legacy = sample(EventType::DelegationDecision, "t0");
        legacy.event_hash = String::new();
        legacy.prev_hash = String::new();

        let mut hashed = sample(EventType::ToolExecution, "t1");
        hashed.prev_hash = compute_event_hash(&legacy);
        hashed.event_hash = compute_event_hash(&hashed);

        let events = vec![legacy, hashed];
        let status = verify_chain_status(&events);
        assert!(status.valid, "legacy link should fall back to recomputed hash");
        assert_eq!(status.legacy_count, 1);
        assert_eq!(status.hashed_count, 1);
    }

    #[test]
    fn empty_chain_is_valid() {
        let status = verify_chain_status(&[]);
        assert!(status.valid);
        assert_eq!(status.total, 0);
        assert_eq!(status.broken_at, -1);
    }

    #[test]
    fn later_outcome_changes_the_recomputed_hash() {
        // An outcome present at insert time is hashed; one patched in later
        // is not, which is why the store keeps the insert-time serialization
        // for verification.
        let mut e = sample(EventType::ToolExecution, "t1");
        e.prev_hash = GENESIS_HASH.to_string();
        e.event_hash = compute_event_hash(&e);
        let before = e.event_hash.clone();

        e.outcome = Some(OutcomeInfo {
            status: "ok".to_string(),
            error: None,
            duration_ms: Some(12),
        });
        assert_ne!(compute_event_hash(&e), before);
    }
}
