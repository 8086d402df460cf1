//! `policy` — deterministic allow/deny/ask authorization.
//!
//! Every tool call is evaluated here before anything executes:
//!
//! - **Built-in hard deny** — credential paths, destructive commands,
//!   SSRF-bait hosts, autonomy floors. Not overridable.
//! - **User rules** — declarative condition→outcome pairs from
//!   `policies/rules.json`; most specific resource pattern wins.
//! - **Autonomy ladder** — fallback defaults keyed off the session's 0–4
//!   autonomy dial.
//! - **Default deny** — nothing matched, nothing runs.

pub mod builtin;
pub mod engine;
pub mod rules;

// ─── Top-level re-exports ─────────────────────────────────────────────────────

pub use engine::{evaluate_with, PolicyEngine};
pub use rules::{Outcome, PolicyDecision, PolicyRule, RuleError, RuleSet};
