//! Integration tests for the policy engine.
//!
//! Covers:
//! 1. Default-deny law: no matching rule ⇒ Deny
//! 2. The shell_exec autonomy-window scenario, with the reason citing the rule
//! 3. Hard-deny precedence over permissive user rules
//! 4. Specificity and priority ordering across a realistic rule file
//! 5. Determinism under repeated evaluation

use std::collections::BTreeMap;

use serde_json::json;

use warden::policy::{evaluate_with, Outcome, PolicyEngine, PolicyRule, RuleSet};
use warden::schema::ToolCallRequest;
use warden::tools::{SkillManifest, ToolCategory, ToolDescriptor, ToolRegistry};

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn rule(id: &str, outcome: Outcome) -> PolicyRule {
    PolicyRule {
        id: id.to_string(),
        tool: None,
        resource_patterns: vec![],
        arg_patterns: BTreeMap::new(),
        min_autonomy: None,
        max_autonomy: None,
        priority: 0,
        outcome,
        reason: String::new(),
    }
}

fn request(tool: &str, args: serde_json::Value, autonomy: u8) -> ToolCallRequest {
    ToolCallRequest::new(tool, args, "session-1", autonomy)
}

fn registry() -> ToolRegistry {
    ToolRegistry::with_builtin_tools()
}

// ─── Test 1: default-deny law ────────────────────────────────────────────────

#[test]
fn unmatched_request_is_denied() {
    // A skill-category tool at a ladder gap: no builtin, no user rule.
    let skill = ToolDescriptor {
        name: "summarize".to_string(),
        category: ToolCategory::SkillExec,
        min_autonomy: 1,
        manifest: SkillManifest::default(),
    };

    let rules = RuleSet::empty();
    let decision = evaluate_with(&rules, &request("summarize", json!({}), 2), &skill);
    assert_eq!(decision.outcome, Outcome::Deny);
    assert_eq!(decision.rule_id, "default-deny");
}

// ─── Test 2: shell autonomy scenario ─────────────────────────────────────────

#[test]
fn shell_below_autonomy_three_denied_citing_rule() {
    let mut shell_rule = rule("shell-autonomy-gate", Outcome::Deny);
    shell_rule.tool = Some("shell_exec".to_string());
    shell_rule.max_autonomy = Some(2);
    shell_rule.reason = "shell_exec requires autonomy level 3 or higher".to_string();

    let engine =
        PolicyEngine::new(RuleSet::from_rules(vec![shell_rule]).expect("compile"));
    let reg = registry();

    // Descriptor floor would also deny; the user rule must win the citation.
    // Use a descriptor with floor 0 so only the rule can match.
    let mut shell = reg.get("shell_exec").unwrap().clone();
    shell.min_autonomy = 0;

    let decision = engine.evaluate(&request("shell_exec", json!({"command": "ls"}), 2), &shell);
    assert_eq!(decision.outcome, Outcome::Deny);
    assert_eq!(decision.rule_id, "shell-autonomy-gate");
    assert!(decision.reason.contains("autonomy level 3"));
}

// ─── Test 3: hard deny beats user allow ──────────────────────────────────────

#[test]
fn permissive_rule_cannot_reach_ssh_keys() {
    let mut allow_everything = rule("allow-everything", Outcome::Allow);
    allow_everything.priority = i32::MAX;

    let engine =
        PolicyEngine::new(RuleSet::from_rules(vec![allow_everything]).expect("compile"));
    let reg = registry();
    let tool = reg.get("read_file").unwrap();

    let decision = engine.evaluate(
        &request("read_file", json!({"path": "~/.ssh/id_rsa"}), 4),
        tool,
    );
    assert_eq!(decision.outcome, Outcome::Deny);
    assert_eq!(decision.rule_id, "builtin:sensitive-path");
}

// ─── Test 4: specificity then priority ───────────────────────────────────────

#[test]
fn realistic_rule_file_ordering() {
    let mut allow_reads = rule("allow-workspace-reads", Outcome::Allow);
    allow_reads.resource_patterns = vec!["read_file:*".to_string()];

    let mut deny_secrets_dir = rule("deny-secrets-dir", Outcome::Deny);
    deny_secrets_dir.resource_patterns = vec!["read_file:secrets/*".to_string()];
    deny_secrets_dir.reason = "the secrets directory is off limits".to_string();

    let mut ask_dotfiles = rule("ask-dotfiles", Outcome::AskUser);
    ask_dotfiles.resource_patterns = vec!["read_file:secrets/*".to_string()];
    ask_dotfiles.priority = -1;

    let set = RuleSet::from_rules(vec![allow_reads, deny_secrets_dir, ask_dotfiles])
        .expect("compile");
    let reg = registry();
    let tool = reg.get("read_file").unwrap();

    // Most specific pattern wins over the broad allow.
    let denied = evaluate_with(
        &set,
        &request("read_file", json!({"path": "secrets/db.json"}), 2),
        tool,
    );
    assert_eq!(denied.rule_id, "deny-secrets-dir");

    // Outside the specific pattern, the broad allow applies.
    let allowed = evaluate_with(
        &set,
        &request("read_file", json!({"path": "docs/readme.md"}), 2),
        tool,
    );
    assert_eq!(allowed.rule_id, "allow-workspace-reads");
    assert_eq!(allowed.outcome, Outcome::Allow);
}

// ─── Test 5: determinism ─────────────────────────────────────────────────────

#[test]
fn evaluation_is_a_pure_function() {
    let mut ask_push = rule("ask-git-push", Outcome::AskUser);
    ask_push.tool = Some("shell_exec".to_string());
    ask_push
        .arg_patterns
        .insert("command".to_string(), r"^git\s+push".to_string());

    let set = RuleSet::from_rules(vec![ask_push]).expect("compile");
    let reg = registry();
    let tool = reg.get("shell_exec").unwrap();
    let req = request("shell_exec", json!({"command": "git push origin main"}), 3);

    let first = evaluate_with(&set, &req, tool);
    for _ in 0..50 {
        let again = evaluate_with(&set, &req, tool);
        assert_eq!(again, first);
    }
    assert_eq!(first.rule_id, "ask-git-push");
}

// ─── Test 6: malformed rules file is fatal ───────────────────────────────────

#[test]
fn malformed_rules_file_fails_load() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("rules.json");
    std::fs::write(&path, r#"{"rules": [{"id": "broken"}]}"#).expect("write");

    // Missing `outcome` — must be a parse error, not a silently skipped rule.
    assert!(RuleSet::load(&path).is_err());
}

#[test]
fn missing_rules_file_is_empty_set() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let set = RuleSet::load(&dir.path().join("absent.json")).expect("load");
    assert!(set.is_empty());
}
