//! Warden — the tool-execution security mediation core of a personal AI
//! agent host.
//!
//! Every tool call flows vault → policy → sandbox → egress → audit; no path
//! may skip a stage. The model side of the agent is treated as an adversarial
//! input source: authorization is deny-by-default, the audit log is
//! hash-chained, credentials decrypt only into zero-on-drop buffers, and
//! execution is isolated and resource-bounded.

pub mod audit;
pub mod canary;
pub mod config;
pub mod doctor;
pub mod egress;
pub mod orchestrator;
pub mod policy;
pub mod rest;
pub mod sandbox;
pub mod schema;
pub mod tools;
pub mod vault;

use anyhow::Context as _;

use audit::AuditLogger;
use config::CoreConfig;
use orchestrator::Orchestrator;
use policy::PolicyEngine;
use tools::ToolRegistry;
use vault::SecretsVault;

/// Assemble the full pipeline from a validated config.
///
/// Fail-closed: a config that disables audit or policy without the override,
/// or a rules file with one malformed rule, aborts here instead of starting a
/// weaker core.
pub fn bootstrap(config: CoreConfig) -> anyhow::Result<Orchestrator> {
    config.validate().context("config validation failed")?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let policy = PolicyEngine::load(&config.rules_path()).context("loading policy rules")?;
    let vault = SecretsVault::new(config.vault_path());
    let audit = AuditLogger::open(config.audit_dir(), config.audit_rotate_entries)
        .context("opening audit log")?;
    let registry = ToolRegistry::with_builtin_tools();

    Ok(Orchestrator::new(config, registry, policy, vault, audit))
}
