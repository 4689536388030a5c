//! Approval request lifecycle types
//!
//! An approval request is a durable record representing a human-in-the-loop
//! decision gate. Transitions are one-shot: `pending` moves to exactly one of
//! `approved`, `denied`, `expired` or `cancelled`, after which the record is
//! immutable apart from callback bookkeeping.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::ActionClass;

/// Default time a request stays pending before the sweep expires it
pub const DEFAULT_EXPIRY_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
    Cancelled,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
            ApprovalStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "denied" => Some(ApprovalStatus::Denied),
            "expired" => Some(ApprovalStatus::Expired),
            "cancelled" => Some(ApprovalStatus::Cancelled),
            _ => None,
        }
    }

    /// Non-pending statuses accept no further transitions
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable approval record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    /// `apr_` + 32 hex chars
    pub approval_id: String,
    /// Originating audit event, when the caller linked one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub action_class: ActionClass,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub approver_role: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub requested_by: String,
    /// Opaque map supplied by the requester
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_context: Option<serde_json::Value>,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_reason: Option<String>,
    /// End of the grant window for an approved request; None = no limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_valid_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// An approved request is valid until its grant window closes
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Approved
            && self.approval_valid_until.map_or(true, |until| now <= until)
    }
}

/// Fields a caller supplies when opening a request; everything else is
/// assigned by the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewApproval {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub action_class: ActionClass,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub resource_name: String,
    #[serde(default)]
    pub policy_name: String,
    #[serde(default)]
    pub approver_role: String,
    #[serde(default)]
    pub requested_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_context: Option<serde_json::Value>,
    /// Minutes until the pending request expires; None or 0 = default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

impl NewApproval {
    /// Expiry the store will apply for this request
    pub fn expiry(&self) -> Duration {
        match self.expires_in_minutes {
            Some(m) if m > 0 => Duration::minutes(m),
            _ => Duration::minutes(DEFAULT_EXPIRY_MINUTES),
        }
    }
}

/// Generate an approval ID: `apr_` + 32 hex chars
pub fn new_approval_id() -> String {
    format!("apr_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [
            ApprovalStatus::Pending,
            ApprovalStatus::Approved,
            ApprovalStatus::Denied,
            ApprovalStatus::Expired,
            ApprovalStatus::Cancelled,
        ] {
            assert_eq!(ApprovalStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ApprovalStatus::parse("bogus"), None);
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!ApprovalStatus::Pending.is_terminal());
        assert!(ApprovalStatus::Approved.is_terminal());
        assert!(ApprovalStatus::Expired.is_terminal());
    }

    #[test]
    fn validity_respects_grant_window() {
        let now = Utc::now();
        let mut record = ApprovalRequest {
            approval_id: new_approval_id(),
            event_id: None,
            trace_id: "t1".to_string(),
            status: ApprovalStatus::Approved,
            action_class: ActionClass::Write,
            tool_name: String::new(),
            agent_name: String::new(),
            resource_type: String::new(),
            resource_name: String::new(),
            policy_name: String::new(),
            approver_role: String::new(),
            requested_by: String::new(),
            request_context: None,
            requested_at: now,
            expires_at: now + Duration::hours(1),
            resolved_at: Some(now),
            resolved_by: Some("ops".to_string()),
            resolution_reason: None,
            approval_valid_until: None,
            callback_url: None,
            callback_sent_at: None,
            created_at: now,
            updated_at: now,
        };

        assert!(record.is_valid(now), "no window means valid forever");

        record.approval_valid_until = Some(now + Duration::minutes(10));
        assert!(record.is_valid(now + Duration::minutes(5)));
        assert!(!record.is_valid(now + Duration::minutes(15)));

        record.status = ApprovalStatus::Denied;
        assert!(!record.is_valid(now));
    }

    #[test]
    fn default_expiry_is_an_hour() {
        let req = NewApproval::default();
        assert_eq!(req.expiry(), Duration::minutes(60));
        let req = NewApproval {
            expires_in_minutes: Some(5),
            ..Default::default()
        };
        assert_eq!(req.expiry(), Duration::minutes(5));
    }
}
