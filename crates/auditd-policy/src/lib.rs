//! # auditd-policy
//!
//! YAML-configured policy engine: decide allow / deny / require_approval for
//! a (principal, resource, action) triple, with a full explainability trace.
//!
//! Configuration is immutable after load; a changed file takes effect on
//! process restart.

pub mod config;
pub mod engine;

pub use config::{
    Effect, InfraResource, Policy, PolicyConfig, PolicyError, ResourceMatch, ResourceSelector,
    Rule, RuleConditions, Schedule,
};
pub use engine::{
    ConsideredRule, Decision, DecisionTrace, PolicyEngine, PolicyRequest, PolicySummary,
    Principal, RequestContext, ResourceRef, DEFAULT_POLICY_NAME,
};
