//! Policy configuration file model
//!
//! Loaded once at startup from YAML; reloads require a process restart. The
//! same file carries the infrastructure map used to resolve tags for
//! resources the caller did not tag.

use serde::{Deserialize, Serialize};
use std::path::Path;

use auditd_core::ActionClass;

/// Errors raised while loading or validating a policy file
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to read policy file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid policy configuration: {0}")]
    Invalid(String),
}

/// A rule's outcome
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
    RequireApproval,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
            Effect::RequireApproval => "require_approval",
        }
    }
}

impl std::fmt::Display for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level policy file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    /// When no rule matches: deny instead of allow
    #[serde(default)]
    pub default_deny: bool,
    #[serde(default)]
    pub policies: Vec<Policy>,
    /// Known resources and their tags, for tag auto-resolution
    #[serde(default)]
    pub infrastructure: Vec<InfraResource>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub resources: Vec<ResourceSelector>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSelector {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub matcher: Option<ResourceMatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceMatch {
    /// Exact resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Glob over resource names, `*` is the only wildcard
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_pattern: Option<String>,
    /// The resource must carry every listed tag
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Action classes this rule applies to; must be non-empty
    pub action: Vec<ActionClass>,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<RuleConditions>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuleConditions {
    /// An allow that matches with this set is rewritten to require_approval
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows_affected: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pods_affected: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
}

/// Time window a rule is active in, UTC
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Schedule {
    /// Three-letter day names (`mon`..`sun`); empty = every day
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub days: Vec<String>,
    /// `"HH:MM"`; absent = from midnight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    /// `"HH:MM"`; absent = to midnight. An end before start wraps overnight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

/// Infrastructure map entry: a known resource and its tags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfraResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl PolicyConfig {
    /// Parse a YAML document and validate it
    pub fn from_yaml(yaml: &str) -> Result<Self, PolicyError> {
        let config: PolicyConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a policy file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_yaml(&yaml)?;
        tracing::info!(
            path = %path.display(),
            policies = config.policies.len(),
            "loaded policy configuration"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), PolicyError> {
        for policy in &self.policies {
            if policy.name.is_empty() {
                return Err(PolicyError::Invalid("policy with empty name".to_string()));
            }
            for (i, rule) in policy.rules.iter().enumerate() {
                if rule.action.is_empty() {
                    return Err(PolicyError::Invalid(format!(
                        "policy {} rule #{} has no actions",
                        policy.name, i
                    )));
                }
                if let Some(schedule) = rule.conditions.as_ref().and_then(|c| c.schedule.as_ref()) {
                    for field in [&schedule.start, &schedule.end].into_iter().flatten() {
                        parse_hhmm(field).ok_or_else(|| {
                            PolicyError::Invalid(format!(
                                "policy {} rule #{}: bad schedule time {:?}",
                                policy.name, i, field
                            ))
                        })?;
                    }
                }
            }
            for selector in &policy.resources {
                if selector.resource_type.is_empty() {
                    return Err(PolicyError::Invalid(format!(
                        "policy {}: resource selector without a type",
                        policy.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Total rule count across enabled policies
    pub fn rule_count(&self) -> usize {
        self.policies
            .iter()
            .filter(|p| p.enabled)
            .map(|p| p.rules.len())
            .sum()
    }
}

/// Parse `"HH:MM"` into minutes since midnight
pub(crate) fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}
