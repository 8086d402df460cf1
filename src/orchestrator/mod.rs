//! `orchestrator` — the tool-call pipeline.
//!
//! Every call runs the same sequence, and no path may skip a stage:
//! canary check → policy evaluation → (optional) user approval → sandboxed
//! execution → egress inspection → audit commit. The per-call state machine:
//!
//! `Received → PolicyChecked → {Denied | AskPending | SandboxRunning}
//!  → EgressChecked → AuditCommitted → {Completed | Rejected | Faulted}`
//!
//! Failures are never silent: every terminal state produces exactly one audit
//! entry before the caller sees a response, and an audit write failure halts
//! all further tool execution — unauditable actions are unacceptable.

pub mod approval;
pub mod events;
pub mod plan;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, warn};

use crate::audit::{digest_json, digest_text, Actor, AuditEvent, AuditLogger, EventKind};
use crate::canary::{CanaryHit, CanaryStore};
use crate::config::CoreConfig;
use crate::egress::{EgressFilter, EgressVerdict, FilteredResult};
use crate::policy::{Outcome, PolicyDecision, PolicyEngine, RuleError};
use crate::sandbox::{ExecOutcome, SandboxManager, SandboxSpec};
use crate::schema::{CallStatus, ToolCallRequest, ToolCallResponse};
use crate::tools::{ToolDescriptor, ToolRegistry};
use crate::vault::{SecretHandle, SecretsVault, VaultError};

pub use approval::{ApprovalRouter, ApprovalStatus};
pub use events::{EventBroadcaster, SecurityEvent};

// ─── Call states ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Received,
    PolicyChecked,
    Denied,
    AskPending,
    SandboxRunning,
    EgressChecked,
    AuditCommitted,
    Completed,
    Rejected,
    Faulted,
    Cancelled,
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ─── Cancellation ─────────────────────────────────────────────────────────────

/// Receiver half of a cancellation signal, raced against execution.
pub struct CancelHandle {
    rx: watch::Receiver<bool>,
}

impl CancelHandle {
    /// Resolves when cancellation is triggered. If the trigger is dropped
    /// without firing, this pends forever (the call simply runs to term).
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sender half; owned by whoever may abort the call (user, autonomy
/// downgrade).
pub struct CancelTrigger {
    tx: watch::Sender<bool>,
}

impl CancelTrigger {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn handle(&self) -> CancelHandle {
        CancelHandle {
            rx: self.tx.subscribe(),
        }
    }
}

pub fn cancellation() -> (CancelTrigger, CancelHandle) {
    let (tx, rx) = watch::channel(false);
    (CancelTrigger { tx }, CancelHandle { rx })
}

// ─── Orchestrator ─────────────────────────────────────────────────────────────

pub struct Orchestrator {
    config: CoreConfig,
    registry: RwLock<ToolRegistry>,
    policy: Arc<PolicyEngine>,
    vault: Arc<SecretsVault>,
    canaries: Arc<CanaryStore>,
    sandbox: Arc<SandboxManager>,
    egress: Arc<EgressFilter>,
    audit: Arc<AuditLogger>,
    approvals: Arc<ApprovalRouter>,
    events: EventBroadcaster,
    slots: Arc<Semaphore>,
    /// Set on audit write failure; no further tool calls execute.
    halted: AtomicBool,
    /// Sessions suspended after an injection alert.
    quarantined: RwLock<HashSet<String>>,
}

impl Orchestrator {
    pub fn new(
        config: CoreConfig,
        registry: ToolRegistry,
        policy: PolicyEngine,
        vault: SecretsVault,
        audit: AuditLogger,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_sandboxes));
        let sandbox = Arc::new(SandboxManager::probe(config.data_dir.join("sandbox")));
        Self {
            config,
            registry: RwLock::new(registry),
            policy: Arc::new(policy),
            vault: Arc::new(vault),
            canaries: Arc::new(CanaryStore::new()),
            sandbox,
            egress: Arc::new(EgressFilter::new()),
            audit: Arc::new(audit),
            approvals: Arc::new(ApprovalRouter::new()),
            events: EventBroadcaster::new(),
            slots,
            halted: AtomicBool::new(false),
            quarantined: RwLock::new(HashSet::new()),
        }
    }

    /// Swap the sandbox manager (tests, constrained deployments).
    pub fn with_sandbox(mut self, sandbox: SandboxManager) -> Self {
        self.sandbox = Arc::new(sandbox);
        self
    }

    pub fn approvals(&self) -> &Arc<ApprovalRouter> {
        &self.approvals
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    pub fn canaries(&self) -> &Arc<CanaryStore> {
        &self.canaries
    }

    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn vault(&self) -> &Arc<SecretsVault> {
        &self.vault
    }

    pub fn egress(&self) -> &Arc<EgressFilter> {
        &self.egress
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn is_quarantined(&self, session_id: &str) -> bool {
        self.quarantined
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(session_id)
    }

    /// End a conversation turn: retire the session's canary markers.
    pub fn end_session(&self, session_id: &str) {
        self.canaries.retire_session(session_id);
    }

    // ─── Entry points ────────────────────────────────────────────────────────

    pub async fn handle(&self, request: ToolCallRequest) -> ToolCallResponse {
        self.run(request, None).await
    }

    pub async fn handle_cancellable(
        &self,
        request: ToolCallRequest,
        cancel: CancelHandle,
    ) -> ToolCallResponse {
        self.run(request, Some(cancel)).await
    }

    /// Fetch a credential for a tool call. Emits a `credential_access` entry
    /// recording *that* the name was accessed, never the value.
    pub async fn credential(
        &self,
        name: &str,
        session_id: &str,
    ) -> Result<SecretHandle, VaultError> {
        let outcome = self.vault.get(name);
        let decision = match &outcome {
            Ok(_) => "allow:vault-get".to_string(),
            Err(e) => format!("deny:vault-get:{}", kind_of(e)),
        };
        let _ = self
            .audit_or_halt(AuditEvent {
                actor: Actor::Agent,
                kind: EventKind::CredentialAccess,
                input_digest: digest_text(name),
                output_digest: String::new(),
                decision,
                correlation_id: session_id.to_string(),
            })
            .await;
        outcome
    }

    /// Store a credential on the user's behalf, with the matching audit entry.
    pub async fn store_credential(&self, name: &str, plaintext: &[u8]) -> Result<(), VaultError> {
        let outcome = self.vault.put(name, plaintext);
        if outcome.is_ok() {
            self.egress.watch_names([name.to_string()]);
        }
        let decision = match &outcome {
            Ok(_) => "allow:vault-put".to_string(),
            Err(e) => format!("deny:vault-put:{}", kind_of(e)),
        };
        let _ = self
            .audit_or_halt(AuditEvent {
                actor: Actor::User,
                kind: EventKind::CredentialAccess,
                input_digest: digest_text(name),
                output_digest: String::new(),
                decision,
                correlation_id: String::new(),
            })
            .await;
        outcome
    }

    /// Unlock the vault and register its entry names with the egress filter so
    /// output that embeds them gets redacted.
    pub async fn unlock_vault(&self, master_password: &str) -> Result<(), VaultError> {
        self.vault.unlock(master_password)?;
        if let Ok(names) = self.vault.list() {
            self.egress.watch_names(names);
        }
        let _ = self
            .audit_or_halt(AuditEvent {
                actor: Actor::User,
                kind: EventKind::CredentialAccess,
                input_digest: String::new(),
                output_digest: String::new(),
                decision: "allow:vault-unlock".to_string(),
                correlation_id: String::new(),
            })
            .await;
        Ok(())
    }

    /// Register a tool descriptor into the dispatch table. Descriptors are
    /// data — registration never introduces new code paths.
    pub async fn register_tool(&self, descriptor: ToolDescriptor) {
        let name = descriptor.name.clone();
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register(descriptor);
        let _ = self
            .audit_or_halt(AuditEvent {
                actor: Actor::System,
                kind: EventKind::SkillInstall,
                input_digest: digest_text(&name),
                output_digest: String::new(),
                decision: "allow:tool-registered".to_string(),
                correlation_id: String::new(),
            })
            .await;
    }

    /// Reload the policy rule set from disk. Exclusive with respect to new
    /// evaluations; in-flight evaluations keep their snapshot. The old rules
    /// stay active if the file fails to parse.
    pub async fn reload_policy(&self) -> Result<(), RuleError> {
        self.policy.reload_from(&self.config.rules_path())?;
        let _ = self
            .audit_or_halt(AuditEvent {
                actor: Actor::User,
                kind: EventKind::ConfigChange,
                input_digest: digest_text(&self.config.rules_path().display().to_string()),
                output_digest: String::new(),
                decision: "allow:policy-reload".to_string(),
                correlation_id: String::new(),
            })
            .await;
        Ok(())
    }

    // ─── Pipeline ────────────────────────────────────────────────────────────

    async fn run(&self, request: ToolCallRequest, cancel: Option<CancelHandle>) -> ToolCallResponse {
        let correlation = request.id.to_string();
        let mut state = CallState::Received;

        if self.is_halted() {
            return ToolCallResponse::faulted(
                correlation,
                "tool execution halted: audit log unavailable",
            );
        }

        if self.is_quarantined(&request.session_id) {
            let _ = self
                .audit_or_halt(AuditEvent {
                    actor: Actor::Agent,
                    kind: EventKind::PolicyDecision,
                    input_digest: digest_json(&request.args),
                    output_digest: String::new(),
                    decision: "deny:session-quarantined".to_string(),
                    correlation_id: correlation.clone(),
                })
                .await;
            return ToolCallResponse::denied(
                correlation,
                "session is suspended after an injection alert",
            );
        }

        // Canary check on the arguments before anything executes.
        if self.config.canary_tokens_enabled {
            let args_text = request.args.to_string();
            if let Some(hit) = self.canaries.check(&args_text) {
                return self.injection_alert(&request, hit, "tool_args").await;
            }
        }

        let tool = {
            let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
            registry.get(&request.tool).cloned()
        };
        let Some(tool) = tool else {
            self.transition(&mut state, CallState::Denied, &correlation);
            let _ = self
                .audit_or_halt(AuditEvent {
                    actor: Actor::Agent,
                    kind: EventKind::PolicyDecision,
                    input_digest: digest_json(&request.args),
                    output_digest: String::new(),
                    decision: "deny:unknown-tool".to_string(),
                    correlation_id: correlation.clone(),
                })
                .await;
            return ToolCallResponse::denied(
                correlation,
                format!("unknown tool '{}'", request.tool),
            );
        };

        // Policy evaluation against the current rule-set snapshot.
        let decision = if self.config.policy_engine_enabled {
            self.policy.evaluate(&request, &tool)
        } else {
            // Reachable only with the explicit insecure override.
            PolicyDecision::new(
                Outcome::Allow,
                "builtin:policy-disabled",
                "policy enforcement disabled by override",
            )
        };
        self.transition(&mut state, CallState::PolicyChecked, &correlation);

        if self
            .audit_or_halt(AuditEvent {
                actor: Actor::Agent,
                kind: EventKind::PolicyDecision,
                input_digest: digest_json(&request.args),
                output_digest: String::new(),
                decision: render_decision(&decision),
                correlation_id: correlation.clone(),
            })
            .await
            .is_err()
        {
            return ToolCallResponse::faulted(correlation, "audit log unavailable");
        }

        let exec_decision = match decision.outcome {
            Outcome::Deny => {
                self.transition(&mut state, CallState::Denied, &correlation);
                return ToolCallResponse::denied(correlation, decision.reason);
            }
            Outcome::AskUser => {
                self.transition(&mut state, CallState::AskPending, &correlation);
                match self.resolve_ask(&request, &decision, &correlation).await {
                    Ok(granted) => granted,
                    Err(response) => {
                        self.transition(&mut state, CallState::Rejected, &correlation);
                        return *response;
                    }
                }
            }
            Outcome::Allow => decision,
        };

        self.execute(request, tool, exec_decision, correlation, cancel, &mut state)
            .await
    }

    /// Suspend on an AskUser decision until granted, denied, or timed out.
    /// Returns the effective Allow decision on grant, or the response to
    /// return otherwise.
    async fn resolve_ask(
        &self,
        request: &ToolCallRequest,
        decision: &PolicyDecision,
        correlation: &str,
    ) -> Result<PolicyDecision, Box<ToolCallResponse>> {
        let approval_id = self
            .approvals
            .request_approval(request, &decision.reason)
            .await;
        self.events.emit(SecurityEvent::AskPending {
            approval_id: approval_id.clone(),
            request_id: correlation.to_string(),
            session_id: request.session_id.clone(),
            tool: request.tool.clone(),
            reason: decision.reason.clone(),
        });

        if self.config.ask_timeout_secs == 0 {
            // Non-blocking mode: hand the pending approval back to the caller.
            return Err(Box::new(ToolCallResponse {
                status: CallStatus::AskUser,
                output: None,
                reason: format!("approval pending: {approval_id}"),
                correlation_id: correlation.to_string(),
            }));
        }

        let status = self
            .approvals
            .wait_for_decision(&approval_id, Duration::from_secs(self.config.ask_timeout_secs))
            .await;

        let (audit_decision, result) = match status {
            ApprovalStatus::Granted => (
                "allow:user-approval".to_string(),
                Ok(PolicyDecision::new(
                    Outcome::Allow,
                    "user-approval",
                    format!("approved by user ({approval_id})"),
                )),
            ),
            ApprovalStatus::Denied => (
                "deny:user-approval".to_string(),
                Err(Box::new(ToolCallResponse::denied(
                    correlation,
                    "approval denied by user",
                ))),
            ),
            ApprovalStatus::TimedOut | ApprovalStatus::Pending => (
                "deny:ask-timeout".to_string(),
                Err(Box::new(ToolCallResponse::denied(
                    correlation,
                    "approval timed out; defaulting to deny",
                ))),
            ),
        };

        if self
            .audit_or_halt(AuditEvent {
                actor: Actor::User,
                kind: EventKind::PolicyDecision,
                input_digest: digest_json(&request.args),
                output_digest: String::new(),
                decision: audit_decision,
                correlation_id: correlation.to_string(),
            })
            .await
            .is_err()
        {
            return Err(Box::new(ToolCallResponse::faulted(
                correlation,
                "audit log unavailable",
            )));
        }
        result
    }

    async fn execute(
        &self,
        request: ToolCallRequest,
        tool: ToolDescriptor,
        exec_decision: PolicyDecision,
        correlation: String,
        cancel: Option<CancelHandle>,
        state: &mut CallState,
    ) -> ToolCallResponse {
        if !self.config.sandbox_enabled {
            // Override-only path: the core approves but does not execute.
            let _ = self
                .audit_or_halt(AuditEvent {
                    actor: Actor::Agent,
                    kind: EventKind::ToolCall,
                    input_digest: digest_json(&request.args),
                    output_digest: String::new(),
                    decision: render_decision(&exec_decision),
                    correlation_id: correlation.clone(),
                })
                .await;
            return ToolCallResponse {
                status: CallStatus::Allow,
                output: None,
                reason: "approved; sandbox disabled, execution not performed by core".to_string(),
                correlation_id: correlation,
            };
        }

        // Backpressure: bounded concurrent sandboxes; waiting is bounded too.
        let queue_budget = Duration::from_secs(self.config.sandbox_queue_timeout_secs);
        let _permit = match tokio::time::timeout(
            queue_budget,
            Arc::clone(&self.slots).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                let _ = self
                    .audit_or_halt(AuditEvent {
                        actor: Actor::System,
                        kind: EventKind::ToolCall,
                        input_digest: digest_json(&request.args),
                        output_digest: String::new(),
                        decision: "deny:busy".to_string(),
                        correlation_id: correlation.clone(),
                    })
                    .await;
                return ToolCallResponse::denied(
                    correlation,
                    "concurrent sandbox limit reached; call queued past its budget",
                );
            }
        };

        let exec_plan = match plan::build_plan(&request, &tool) {
            Ok(p) => p,
            Err(e) => {
                let _ = self
                    .audit_or_halt(AuditEvent {
                        actor: Actor::Agent,
                        kind: EventKind::ToolCall,
                        input_digest: digest_json(&request.args),
                        output_digest: String::new(),
                        decision: "deny:invalid-args".to_string(),
                        correlation_id: correlation.clone(),
                    })
                    .await;
                return ToolCallResponse::denied(correlation, format!("invalid arguments: {e}"));
            }
        };

        let writable_root = self
            .config
            .data_dir
            .join("workspace")
            .join(&request.session_id);
        let spec = SandboxSpec::for_manifest(&tool.manifest, writable_root);

        self.transition(state, CallState::SandboxRunning, &correlation);
        let execution = self.sandbox.execute(&exec_plan.argv, &spec, &exec_decision);

        let executed = match cancel {
            Some(mut handle) => {
                tokio::select! {
                    biased;
                    _ = handle.cancelled() => {
                        // Dropping the execution future kills the child and
                        // removes the session directory.
                        self.transition(state, CallState::Cancelled, &correlation);
                        let _ = self
                            .audit_or_halt(AuditEvent {
                                actor: Actor::User,
                                kind: EventKind::ToolCall,
                                input_digest: digest_json(&request.args),
                                output_digest: String::new(),
                                decision: "deny:cancelled".to_string(),
                                correlation_id: correlation.clone(),
                            })
                            .await;
                        return ToolCallResponse::faulted(correlation, "tool call cancelled");
                    }
                    result = execution => result,
                }
            }
            None => execution.await,
        };

        let mut result = match executed {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, tool = %request.tool, "sandbox_fault");
                self.transition(state, CallState::Faulted, &correlation);
                let _ = self
                    .audit_or_halt(AuditEvent {
                        actor: Actor::System,
                        kind: EventKind::ToolCall,
                        input_digest: digest_json(&request.args),
                        output_digest: String::new(),
                        decision: "deny:sandbox-fault".to_string(),
                        correlation_id: correlation.clone(),
                    })
                    .await;
                // Generic message only — internals stay in the logs.
                return ToolCallResponse::faulted(correlation, "sandbox execution failed");
            }
        };
        // Record the actual destinations for egress comparison and audit.
        result.touched.hosts = exec_plan.hosts.clone();

        self.transition(state, CallState::EgressChecked, &correlation);
        let filtered = if self.config.egress_filtering_enabled {
            self.egress.inspect(&result, &tool.manifest)
        } else {
            FilteredResult {
                verdict: EgressVerdict::Clean,
                stdout: result.stdout.clone(),
                stderr: result.stderr.clone(),
            }
        };

        if let EgressVerdict::Blocked { host } = &filtered.verdict {
            let _ = self
                .audit_or_halt(AuditEvent {
                    actor: Actor::System,
                    kind: EventKind::ToolCall,
                    input_digest: digest_json(&request.args),
                    output_digest: digest_text(&result.stdout),
                    decision: "deny:egress-blocked".to_string(),
                    correlation_id: correlation.clone(),
                })
                .await;
            return ToolCallResponse::denied(
                correlation,
                format!("egress blocked: destination '{host}' is not allow-listed"),
            );
        }

        // A marker in the output means injected content reached the model side.
        if self.config.canary_tokens_enabled {
            if let Some(hit) = self.canaries.check(&filtered.stdout) {
                return self.injection_alert(&request, hit, "tool_output").await;
            }
        }

        if self
            .audit_or_halt(AuditEvent {
                actor: Actor::Agent,
                kind: EventKind::ToolCall,
                input_digest: digest_json(&request.args),
                output_digest: digest_text(&filtered.stdout),
                decision: render_decision(&exec_decision),
                correlation_id: correlation.clone(),
            })
            .await
            .is_err()
        {
            return ToolCallResponse::faulted(correlation, "audit log unavailable");
        }
        self.transition(state, CallState::AuditCommitted, &correlation);

        match result.outcome {
            ExecOutcome::Completed => {
                self.transition(state, CallState::Completed, &correlation);
                let reason = match result.exit_code {
                    Some(0) => "completed".to_string(),
                    Some(code) => format!("completed with exit code {code}"),
                    None => "completed (terminated by signal)".to_string(),
                };
                ToolCallResponse {
                    status: CallStatus::Executed,
                    output: Some(filtered.stdout),
                    reason: if filtered.stderr.is_empty() {
                        reason
                    } else {
                        format!("{reason}; stderr: {}", truncate(&filtered.stderr, 500))
                    },
                    correlation_id: correlation,
                }
            }
            ExecOutcome::Timeout => {
                self.transition(state, CallState::Faulted, &correlation);
                ToolCallResponse::faulted(correlation, "execution exceeded its wall-clock budget")
            }
            ExecOutcome::ResourceExceeded => {
                self.transition(state, CallState::Faulted, &correlation);
                ToolCallResponse::faulted(correlation, "execution exceeded its resource limits")
            }
        }
    }

    /// Injection detection: higher severity than a policy deny. Exactly one
    /// `injection_alert` entry, session quarantine, and a security warning
    /// instead of a tool result.
    async fn injection_alert(
        &self,
        request: &ToolCallRequest,
        hit: CanaryHit,
        location: &str,
    ) -> ToolCallResponse {
        let correlation = request.id.to_string();
        warn!(
            session = %request.session_id,
            fingerprint = %hit.fingerprint,
            location,
            "injection_detected"
        );

        self.quarantined
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request.session_id.clone());

        // Treat a live marker in executable material as compromise: zero the
        // in-memory vault until the user re-unlocks it.
        self.vault.wipe();

        if self
            .audit_or_halt(AuditEvent {
                actor: Actor::System,
                kind: EventKind::InjectionAlert,
                input_digest: digest_json(&request.args),
                output_digest: String::new(),
                // Fingerprint only; the marker value never reaches the log.
                decision: format!("deny:injection:{}", hit.fingerprint),
                correlation_id: correlation.clone(),
            })
            .await
            .is_err()
        {
            return ToolCallResponse::faulted(correlation, "audit log unavailable");
        }

        self.events.emit(SecurityEvent::InjectionAlert {
            session_id: request.session_id.clone(),
            fingerprint: hit.fingerprint,
            location: location.to_string(),
        });

        ToolCallResponse::denied(
            correlation,
            "security warning: a prompt-injection marker was detected; \
             tool execution for this session is suspended",
        )
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    /// Append to the audit log; on failure, halt the orchestrator for good.
    async fn audit_or_halt(&self, event: AuditEvent) -> Result<(), ()> {
        if !self.config.audit_logging_enabled {
            // Reachable only with the explicit insecure override.
            return Ok(());
        }
        match self.audit.append(event).await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(error = %e, "audit_write_failed; halting tool execution");
                self.halted.store(true, Ordering::SeqCst);
                self.events.emit(SecurityEvent::AuditHalted {
                    reason: e.to_string(),
                });
                Err(())
            }
        }
    }

    fn transition(&self, state: &mut CallState, next: CallState, correlation: &str) {
        debug!(call = correlation, from = %state, to = %next, "call_state");
        *state = next;
    }
}

fn render_decision(decision: &PolicyDecision) -> String {
    format!("{}:{}", decision.outcome, decision.rule_id)
}

fn kind_of(error: &VaultError) -> &'static str {
    match error {
        VaultError::Locked => "locked",
        VaultError::DecryptionFailed => "decryption-failed",
        VaultError::NotFound(_) => "not-found",
        _ => "error",
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancellation_signal_fires() {
        let (trigger, mut handle) = cancellation();
        let waiter = tokio::spawn(async move {
            handle.cancelled().await;
            true
        });
        trigger.cancel();
        assert!(waiter.await.expect("join"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = truncate(s, 3);
        assert!(t.starts_with('h'));
        assert!(truncate("short", 100).eq("short"));
    }
}
