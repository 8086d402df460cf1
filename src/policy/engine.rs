//! `PolicyEngine` — the single entry point for authorization decisions.
//!
//! Evaluation is deterministic and synchronous: no I/O, no clock-dependent
//! branching, no network. Call sites evaluate against an immutable `Arc`
//! snapshot of the rule set; `reload` swaps the snapshot atomically and never
//! mutates a set that an in-flight evaluation might be reading.
//!
//! Stage order: built-in hard-deny → user rules (most specific wins) →
//! built-in autonomy ladder → default deny.

use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::schema::ToolCallRequest;
use crate::tools::ToolDescriptor;

use super::builtin;
use super::rules::{PolicyDecision, RuleError, RuleSet};

pub struct PolicyEngine {
    snapshot: RwLock<Arc<RuleSet>>,
}

impl PolicyEngine {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(rules)),
        }
    }

    /// Load the engine from the rules file. A malformed rule is fatal to
    /// startup; a missing file yields only the built-in layers.
    pub fn load(path: &Path) -> Result<Self, RuleError> {
        Ok(Self::new(RuleSet::load(path)?))
    }

    /// Current immutable rule-set snapshot.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Replace the rule set. Exclusive: blocks until in-flight snapshot reads
    /// complete; evaluations already holding a snapshot keep their old view.
    pub fn reload(&self, rules: RuleSet) {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(rules);
    }

    /// Reload from the rules file, keeping the old set on failure.
    pub fn reload_from(&self, path: &Path) -> Result<(), RuleError> {
        let rules = RuleSet::load(path)?;
        self.reload(rules);
        Ok(())
    }

    /// Evaluate one request against the current snapshot.
    pub fn evaluate(&self, request: &ToolCallRequest, tool: &ToolDescriptor) -> PolicyDecision {
        let snapshot = self.snapshot();
        let decision = evaluate_with(&snapshot, request, tool);
        debug!(
            tool = %request.tool,
            autonomy = request.autonomy_level,
            outcome = %decision.outcome,
            rule = %decision.rule_id,
            "policy_decision"
        );
        decision
    }
}

/// Pure evaluation against an explicit rule-set snapshot.
///
/// Same `(rules, request, tool)` always yields the same decision.
pub fn evaluate_with(
    rules: &RuleSet,
    request: &ToolCallRequest,
    tool: &ToolDescriptor,
) -> PolicyDecision {
    if let Some(decision) = builtin::hard_deny(request, tool) {
        return decision;
    }
    if let Some(decision) = rules.best_match(request) {
        return decision;
    }
    if let Some(decision) = builtin::default_decision(request, tool) {
        return decision;
    }
    PolicyDecision::default_deny()
}
