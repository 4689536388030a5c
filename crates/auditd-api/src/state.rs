//! Application state
//!
//! Centralizes access to the stores, the policy engine and the notifier.

use std::sync::Arc;

use auditd_notify::Notifier;
use auditd_persist::{ApprovalStore, EventStore};
use auditd_policy::PolicyEngine;

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    events: Arc<EventStore>,
    approvals: Arc<ApprovalStore>,
    /// None when the daemon runs without a policy file; `/governance/check`
    /// answers 503 in that case.
    engine: Option<Arc<PolicyEngine>>,
    notifier: Arc<Notifier>,
    policy_file: Option<String>,
}

impl AppState {
    pub fn new(
        events: Arc<EventStore>,
        approvals: Arc<ApprovalStore>,
        engine: Option<Arc<PolicyEngine>>,
        notifier: Arc<Notifier>,
        policy_file: Option<String>,
    ) -> Self {
        Self {
            events,
            approvals,
            engine,
            notifier,
            policy_file,
        }
    }

    pub fn events(&self) -> Arc<EventStore> {
        self.events.clone()
    }

    pub fn approvals(&self) -> Arc<ApprovalStore> {
        self.approvals.clone()
    }

    pub fn engine(&self) -> Option<Arc<PolicyEngine>> {
        self.engine.clone()
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }

    pub fn policy_file(&self) -> Option<&str> {
        self.policy_file.as_deref()
    }
}
