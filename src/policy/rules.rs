//! User policy rules — declarative condition→outcome pairs loaded from
//! `policies/rules.json`.
//!
//! A rule matches on tool name, resource patterns (glob-style `*`), argument
//! regexes, and an autonomy window. Among matching rules the most specific
//! resource pattern wins; ties break by explicit priority, then by
//! Deny > Allow > AskUser. Loading is fail-closed: one malformed rule aborts
//! startup rather than being skipped.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::ToolCallRequest;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to read rules file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse rules file '{path}': {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("rule '{rule_id}' has invalid argument pattern for '{key}': {source}")]
    BadArgPattern {
        rule_id: String,
        key: String,
        source: regex::Error,
    },

    #[error("rule '{rule_id}' is invalid: {detail}")]
    BadRule { rule_id: String, detail: String },
}

// ─── Outcomes & decisions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Allow,
    Deny,
    AskUser,
}

impl Outcome {
    /// Tie-break rank: Deny beats Allow beats AskUser.
    fn rank(self) -> u8 {
        match self {
            Outcome::Deny => 2,
            Outcome::Allow => 1,
            Outcome::AskUser => 0,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Allow => "allow",
            Outcome::Deny => "deny",
            Outcome::AskUser => "ask_user",
        };
        write!(f, "{}", s)
    }
}

/// Result of evaluating one request. Immutable once produced.
///
/// Decision identity is `(outcome, rule_id, reason)` — the evaluation
/// timestamp is bookkeeping and excluded from equality so that repeated
/// evaluation of the same request yields equal decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub outcome: Outcome,
    /// Id of the matched rule, or `"default-deny"` / a `builtin:` id.
    pub rule_id: String,
    pub reason: String,
    pub evaluated_at: DateTime<Utc>,
}

impl PolicyDecision {
    pub fn new(outcome: Outcome, rule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            rule_id: rule_id.into(),
            reason: reason.into(),
            evaluated_at: Utc::now(),
        }
    }

    pub fn default_deny() -> Self {
        Self::new(Outcome::Deny, "default-deny", "no policy matched; default is deny")
    }

    pub fn is_allow(&self) -> bool {
        self.outcome == Outcome::Allow
    }
}

impl PartialEq for PolicyDecision {
    fn eq(&self, other: &Self) -> bool {
        self.outcome == other.outcome
            && self.rule_id == other.rule_id
            && self.reason == other.reason
    }
}

// ─── Rules ────────────────────────────────────────────────────────────────────

/// One declarative rule as it appears in the rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    /// Tool this rule applies to. `None` = any tool.
    #[serde(default)]
    pub tool: Option<String>,
    /// Glob-style patterns matched against the request's resource string.
    /// Empty = matches any resource (specificity 0).
    #[serde(default)]
    pub resource_patterns: Vec<String>,
    /// Per-argument regexes; every listed key must be present and match.
    #[serde(default)]
    pub arg_patterns: BTreeMap<String, String>,
    /// Inclusive autonomy window this rule applies in.
    #[serde(default)]
    pub min_autonomy: Option<u8>,
    #[serde(default)]
    pub max_autonomy: Option<u8>,
    /// Explicit tie-break priority; higher wins.
    #[serde(default)]
    pub priority: i32,
    pub outcome: Outcome,
    #[serde(default)]
    pub reason: String,
}

/// A rule with its argument regexes compiled. Compilation happens once at
/// load; a bad pattern is fatal.
#[derive(Debug)]
struct CompiledRule {
    rule: PolicyRule,
    arg_regexes: Vec<(String, Regex)>,
}

impl CompiledRule {
    fn compile(rule: PolicyRule) -> Result<Self, RuleError> {
        if rule.id.is_empty() {
            return Err(RuleError::BadRule {
                rule_id: "<unnamed>".to_string(),
                detail: "rule id must not be empty".to_string(),
            });
        }
        if let (Some(min), Some(max)) = (rule.min_autonomy, rule.max_autonomy) {
            if min > max {
                return Err(RuleError::BadRule {
                    rule_id: rule.id.clone(),
                    detail: format!("min_autonomy {} exceeds max_autonomy {}", min, max),
                });
            }
        }

        let mut arg_regexes = Vec::with_capacity(rule.arg_patterns.len());
        for (key, pattern) in &rule.arg_patterns {
            let regex = Regex::new(pattern).map_err(|source| RuleError::BadArgPattern {
                rule_id: rule.id.clone(),
                key: key.clone(),
                source,
            })?;
            arg_regexes.push((key.clone(), regex));
        }

        Ok(Self { rule, arg_regexes })
    }

    /// Returns `Some(specificity)` when the rule matches the request.
    fn matches(&self, request: &ToolCallRequest, resource: &str) -> Option<usize> {
        if let Some(tool) = &self.rule.tool {
            if tool != &request.tool {
                return None;
            }
        }
        if let Some(min) = self.rule.min_autonomy {
            if request.autonomy_level < min {
                return None;
            }
        }
        if let Some(max) = self.rule.max_autonomy {
            if request.autonomy_level > max {
                return None;
            }
        }

        for (key, regex) in &self.arg_regexes {
            let value = request.args.get(key).and_then(|v| v.as_str())?;
            if !regex.is_match(value) {
                return None;
            }
        }

        if self.rule.resource_patterns.is_empty() {
            return Some(0);
        }
        self.rule
            .resource_patterns
            .iter()
            .filter(|p| glob_match(p, resource))
            .map(|p| literal_prefix_len(p))
            .max()
    }
}

// ─── Rule set ─────────────────────────────────────────────────────────────────

/// JSON shape of the rules file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<PolicyRule>,
}

/// Immutable, compiled rule set. Evaluation sites hold an `Arc` snapshot;
/// reload swaps the whole set, never mutates it.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_rules(rules: Vec<PolicyRule>) -> Result<Self, RuleError> {
        let rules = rules
            .into_iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Load from a JSON file. A missing file yields the empty set (built-in
    /// rules still apply); a present-but-malformed file is fatal.
    pub fn load(path: &Path) -> Result<Self, RuleError> {
        if !path.exists() {
            return Ok(Self::empty());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| RuleError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: RulesFile = serde_json::from_str(&raw).map_err(|source| RuleError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_rules(file.rules)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Find the winning rule for a request, if any.
    ///
    /// Ordering: highest resource-pattern specificity, then highest explicit
    /// priority, then Deny > Allow > AskUser.
    pub fn best_match(&self, request: &ToolCallRequest) -> Option<PolicyDecision> {
        let resource = request.resource_string();

        let winner = self
            .rules
            .iter()
            .filter_map(|r| {
                r.matches(request, &resource)
                    .map(|specificity| (specificity, r.rule.priority, r.rule.outcome.rank(), r))
            })
            .max_by_key(|(specificity, priority, rank, _)| (*specificity, *priority, *rank))?;

        let rule = &winner.3.rule;
        let reason = if rule.reason.is_empty() {
            format!("matched rule '{}'", rule.id)
        } else {
            rule.reason.clone()
        };
        Some(PolicyDecision::new(rule.outcome, rule.id.clone(), reason))
    }
}

// ─── Glob matching ────────────────────────────────────────────────────────────

/// Minimal `*` glob: a star matches any (possibly empty) substring. No
/// character classes, no escaping — rule authors get predictable behavior.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut remaining = text;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            // Leading literal must anchor at the start.
            match remaining.strip_prefix(part) {
                Some(rest) => remaining = rest,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            // Trailing literal must anchor at the end.
            return remaining.ends_with(part);
        } else {
            match remaining.find(part) {
                Some(idx) => remaining = &remaining[idx + part.len()..],
                None => return false,
            }
        }
    }
    true
}

/// Specificity metric: literal characters before the first wildcard.
fn literal_prefix_len(pattern: &str) -> usize {
    pattern.find('*').unwrap_or(pattern.len())
}
