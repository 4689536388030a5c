//! Policy evaluation and explainability
//!
//! Policies are evaluated in declaration order and the first fully-matching
//! rule wins, so a specific policy (say, one selecting on a `production` tag)
//! placed before a catch-all overrides it. When nothing matches, the
//! configured default applies under the policy name `<default>`.

use chrono::{DateTime, Datelike, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use auditd_core::ActionClass;

use crate::config::{parse_hhmm, Effect, Policy, PolicyConfig, PolicyError, Rule, Schedule};

/// Policy name reported when the default effect applied
pub const DEFAULT_POLICY_NAME: &str = "<default>";

/// Caller identity for an evaluation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Principal {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Resource an action targets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(rename = "type", alias = "resource_type")]
    pub resource_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Ambient facts rule conditions are checked against
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub rows_affected: Option<i64>,
    #[serde(default)]
    pub pods_affected: Option<i64>,
    /// Evaluation instant for schedule windows; None = now
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

/// One (principal, resource, action) evaluation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyRequest {
    #[serde(default)]
    pub principal: Principal,
    pub resource: ResourceRef,
    pub action: ActionClass,
    #[serde(default)]
    pub context: RequestContext,
}

/// Outcome of an evaluation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub effect: Effect,
    pub policy_name: String,
    /// Index of the matched rule within its policy, -1 for the default
    pub rule_index: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// A rule the walk looked at, and why it did or did not match
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsideredRule {
    pub policy: String,
    pub rule_index: i32,
    pub matched: bool,
    pub reason: String,
}

/// Full evaluation trace, embeddable into a policy_decision event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub decision: Decision,
    pub default_applied: bool,
    pub matched_policies: Vec<String>,
    pub considered_rules: Vec<ConsideredRule>,
    pub reasons: Vec<String>,
    pub explanation: String,
}

/// One-line description of a policy for the governance endpoints
#[derive(Debug, Clone, Serialize)]
pub struct PolicySummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    pub resource_types: Vec<String>,
    pub rule_count: usize,
}

/// Name selector compiled once at load
struct CompiledSelector {
    resource_type: String,
    name: Option<String>,
    pattern: Option<Regex>,
    tags: Vec<String>,
}

struct CompiledPolicy {
    policy: Policy,
    selectors: Vec<CompiledSelector>,
}

/// Immutable rule engine over a loaded [`PolicyConfig`]
pub struct PolicyEngine {
    compiled: Vec<CompiledPolicy>,
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Result<Self, PolicyError> {
        let mut compiled = Vec::with_capacity(config.policies.len());
        for policy in config.policies.iter().filter(|p| p.enabled) {
            let mut selectors = Vec::with_capacity(policy.resources.len());
            for selector in &policy.resources {
                let matcher = selector.matcher.clone().unwrap_or_default();
                let pattern = match matcher.name_pattern.as_deref() {
                    Some(glob) => Some(compile_glob(glob).map_err(|e| {
                        PolicyError::Invalid(format!(
                            "policy {}: bad name_pattern {:?}: {}",
                            policy.name, glob, e
                        ))
                    })?),
                    None => None,
                };
                selectors.push(CompiledSelector {
                    resource_type: selector.resource_type.clone(),
                    name: matcher.name,
                    pattern,
                    tags: matcher.tags,
                });
            }
            compiled.push(CompiledPolicy {
                policy: policy.clone(),
                selectors,
            });
        }
        Ok(Self { compiled, config })
    }

    /// Load, validate and compile a policy file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, PolicyError> {
        Self::new(PolicyConfig::load(path)?)
    }

    pub fn default_deny(&self) -> bool {
        self.config.default_deny
    }

    pub fn policy_count(&self) -> usize {
        self.compiled.len()
    }

    pub fn rule_count(&self) -> usize {
        self.compiled.iter().map(|c| c.policy.rules.len()).sum()
    }

    /// Tags recorded for a resource in the infrastructure map
    pub fn resolve_tags(&self, resource_type: &str, name: &str) -> Vec<String> {
        self.config
            .infrastructure
            .iter()
            .find(|r| r.resource_type == resource_type && r.name == name)
            .map(|r| r.tags.clone())
            .unwrap_or_default()
    }

    /// Per-policy summaries for the governance surface
    pub fn summaries(&self) -> Vec<PolicySummary> {
        self.compiled
            .iter()
            .map(|c| PolicySummary {
                name: c.policy.name.clone(),
                description: c.policy.description.clone(),
                enabled: c.policy.enabled,
                resource_types: c
                    .selectors
                    .iter()
                    .map(|s| s.resource_type.clone())
                    .collect(),
                rule_count: c.policy.rules.len(),
            })
            .collect()
    }

    /// First-match evaluation; same walk as [`PolicyEngine::explain`]
    pub fn evaluate(&self, request: &PolicyRequest) -> Decision {
        self.explain(request).decision
    }

    /// Evaluate and keep the full trace of what was considered and why
    pub fn explain(&self, request: &PolicyRequest) -> DecisionTrace {
        let now = request.context.time.unwrap_or_else(Utc::now);
        let mut matched_policies = Vec::new();
        let mut considered = Vec::new();
        let mut reasons = Vec::new();

        for compiled in &self.compiled {
            if !selectors_match(&compiled.selectors, request) {
                continue;
            }
            matched_policies.push(compiled.policy.name.clone());

            for (i, rule) in compiled.policy.rules.iter().enumerate() {
                match rule_match(rule, request, now) {
                    RuleOutcome::Matched => {
                        considered.push(ConsideredRule {
                            policy: compiled.policy.name.clone(),
                            rule_index: i as i32,
                            matched: true,
                            reason: format!("action {} in rule actions", request.action),
                        });

                        let mut effect = rule.effect;
                        // An allow that demands approval engages the gate.
                        if effect == Effect::Allow
                            && rule
                                .conditions
                                .as_ref()
                                .map(|c| c.require_approval)
                                .unwrap_or(false)
                        {
                            effect = Effect::RequireApproval;
                            reasons.push(format!(
                                "policy {} rule #{} allows with approval required",
                                compiled.policy.name, i
                            ));
                        }

                        let decision = Decision {
                            effect,
                            policy_name: compiled.policy.name.clone(),
                            rule_index: i as i32,
                            message: rule.message.clone().unwrap_or_default(),
                        };
                        let explanation = explain_decision(&decision, request);
                        reasons.push(explanation.clone());
                        return DecisionTrace {
                            decision,
                            default_applied: false,
                            matched_policies,
                            considered_rules: considered,
                            reasons,
                            explanation,
                        };
                    }
                    RuleOutcome::Skipped(reason) => {
                        considered.push(ConsideredRule {
                            policy: compiled.policy.name.clone(),
                            rule_index: i as i32,
                            matched: false,
                            reason,
                        });
                    }
                }
            }
        }

        let effect = if self.config.default_deny {
            Effect::Deny
        } else {
            Effect::Allow
        };
        let decision = Decision {
            effect,
            policy_name: DEFAULT_POLICY_NAME.to_string(),
            rule_index: -1,
            message: String::new(),
        };
        let explanation = explain_decision(&decision, request);
        reasons.push("no policy rule matched".to_string());
        reasons.push(explanation.clone());
        DecisionTrace {
            decision,
            default_applied: true,
            matched_policies,
            considered_rules: considered,
            reasons,
            explanation,
        }
    }
}

enum RuleOutcome {
    Matched,
    Skipped(String),
}

fn rule_match(rule: &Rule, request: &PolicyRequest, now: DateTime<Utc>) -> RuleOutcome {
    if !rule.action.contains(&request.action) {
        return RuleOutcome::Skipped(format!("action {} not in rule actions", request.action));
    }

    if let Some(conditions) = &rule.conditions {
        if let Some(max) = conditions.max_rows_affected {
            let rows = request.context.rows_affected.unwrap_or(0);
            if rows > max {
                return RuleOutcome::Skipped(format!("rows_affected {} > max {}", rows, max));
            }
        }
        if let Some(max) = conditions.max_pods_affected {
            let pods = request.context.pods_affected.unwrap_or(0);
            if pods > max {
                return RuleOutcome::Skipped(format!("pods_affected {} > max {}", pods, max));
            }
        }
        if let Some(schedule) = &conditions.schedule {
            if !schedule_contains(schedule, now) {
                return RuleOutcome::Skipped("outside schedule window".to_string());
            }
        }
    }

    RuleOutcome::Matched
}

fn selectors_match(selectors: &[CompiledSelector], request: &PolicyRequest) -> bool {
    // A policy without resource selectors applies to every resource.
    selectors.is_empty() || selectors.iter().any(|s| selector_match(s, request))
}

fn selector_match(selector: &CompiledSelector, request: &PolicyRequest) -> bool {
    let resource = &request.resource;
    if selector.resource_type != resource.resource_type {
        return false;
    }
    if let Some(name) = &selector.name {
        if name != &resource.name {
            return false;
        }
    }
    if let Some(pattern) = &selector.pattern {
        if !pattern.is_match(&resource.name) {
            return false;
        }
    }
    selector
        .tags
        .iter()
        .all(|tag| resource.tags.iter().any(|t| t == tag))
}

fn schedule_contains(schedule: &Schedule, now: DateTime<Utc>) -> bool {
    if !schedule.days.is_empty() {
        let day = match now.weekday() {
            chrono::Weekday::Mon => "mon",
            chrono::Weekday::Tue => "tue",
            chrono::Weekday::Wed => "wed",
            chrono::Weekday::Thu => "thu",
            chrono::Weekday::Fri => "fri",
            chrono::Weekday::Sat => "sat",
            chrono::Weekday::Sun => "sun",
        };
        if !schedule.days.iter().any(|d| d.eq_ignore_ascii_case(day)) {
            return false;
        }
    }

    let minute = now.hour() * 60 + now.minute();
    let start = schedule.start.as_deref().and_then(parse_hhmm).unwrap_or(0);
    let end = schedule
        .end
        .as_deref()
        .and_then(parse_hhmm)
        .unwrap_or(24 * 60 - 1);

    if start <= end {
        minute >= start && minute <= end
    } else {
        // Overnight window, e.g. 22:00 - 06:00
        minute >= start || minute <= end
    }
}

/// Short human string for a decision, e.g.
/// `ALLOW: action read matched policy db-policy rule #0` or
/// `DENIED: writes not allowed (policy db-policy rule #1)`
fn explain_decision(decision: &Decision, request: &PolicyRequest) -> String {
    if decision.rule_index < 0 {
        return match decision.effect {
            Effect::Deny => format!(
                "DENIED: no policy matched action {} on {} {} (default deny)",
                request.action, request.resource.resource_type, request.resource.name
            ),
            _ => format!(
                "ALLOW: no policy matched action {} on {} {} (default allow)",
                request.action, request.resource.resource_type, request.resource.name
            ),
        };
    }

    let detail = if decision.message.is_empty() {
        format!("action {} on {}", request.action, request.resource.name)
    } else {
        decision.message.clone()
    };
    match decision.effect {
        Effect::Allow => format!(
            "ALLOW: action {} matched policy {} rule #{}",
            request.action, decision.policy_name, decision.rule_index
        ),
        Effect::Deny => format!(
            "DENIED: {} (policy {} rule #{})",
            detail, decision.policy_name, decision.rule_index
        ),
        Effect::RequireApproval => format!(
            "APPROVAL REQUIRED: {} (policy {} rule #{})",
            detail, decision.policy_name, decision.rule_index
        ),
    }
}

/// Compile a `*`-wildcard glob into an anchored regex
fn compile_glob(glob: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() + 4);
    pattern.push('^');
    for (i, part) in glob.split('*').enumerate() {
        if i > 0 {
            pattern.push_str(".*");
        }
        pattern.push_str(&regex::escape(part));
    }
    pattern.push('$');
    Regex::new(&pattern)
}
