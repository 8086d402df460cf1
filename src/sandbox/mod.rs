//! `sandbox` — isolated, resource-bounded execution of approved actions.
//!
//! Every approved tool call runs inside a single-use [`SandboxSession`]: a
//! scratch directory, a probed isolation backend, a writable-scope mount, a
//! network policy, and hard resource limits. The session is destroyed on
//! every exit path — success, failure, timeout, or cancellation — via a drop
//! guard, and the child process is killed when its future is dropped.
//!
//! Escapes are prevented structurally (namespace/Seatbelt isolation, denied
//! paths mounted over), not detected after the fact.

pub mod backend;

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::policy::PolicyDecision;
use crate::tools::SkillManifest;

pub use backend::{probe_backends, BackendKind};

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SandboxError {
    /// Execution requested without a prior Allow decision.
    #[error("sandbox execution requires an allow decision")]
    NotAuthorized,

    #[error("sandbox received an empty command")]
    EmptyCommand,

    /// Every probed backend failed to spawn the command.
    #[error("all sandbox backends failed; last error: {last}")]
    AllBackendsFailed { last: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ─── Limits & spec ────────────────────────────────────────────────────────────

const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub max_memory_mb: u64,
    pub max_runtime: Duration,
    pub max_output_bytes: usize,
}

impl ResourceLimits {
    pub fn from_manifest(manifest: &SkillManifest) -> Self {
        Self {
            max_memory_mb: manifest.max_memory_mb,
            max_runtime: Duration::from_secs(manifest.max_runtime_seconds),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub enum NetworkPolicy {
    Denied,
    /// Network is enabled; the egress filter holds the tool to these hosts.
    AllowHosts(Vec<String>),
}

/// Everything a session needs to confine one execution.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// The only directory the tool may write under.
    pub writable_root: PathBuf,
    /// Paths hidden from the tool entirely (mounted over / deny-read).
    pub denied_paths: Vec<PathBuf>,
    pub network: NetworkPolicy,
    pub limits: ResourceLimits,
}

impl SandboxSpec {
    /// Derive a spec from a tool's manifest: network iff the manifest lists
    /// hosts, limits from the manifest, sensitive home paths always denied.
    pub fn for_manifest(manifest: &SkillManifest, writable_root: PathBuf) -> Self {
        let network = if manifest.permissions.network.is_empty() {
            NetworkPolicy::Denied
        } else {
            NetworkPolicy::AllowHosts(manifest.permissions.network.clone())
        };
        Self {
            writable_root,
            denied_paths: default_denied_paths(),
            network,
            limits: ResourceLimits::from_manifest(manifest),
        }
    }
}

/// Credential-bearing paths under the user's home, hidden from every session.
fn default_denied_paths() -> Vec<PathBuf> {
    let Some(home) = std::env::var_os("HOME").map(PathBuf::from) else {
        return Vec::new();
    };
    [".ssh", ".gnupg", ".aws", ".azure", ".gcloud", ".warden"]
        .iter()
        .map(|fragment| home.join(fragment))
        .collect()
}

// ─── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecOutcome {
    Completed,
    /// Wall-clock budget exceeded; the child was torn down.
    Timeout,
    /// Output or resource ceiling breached; not a partial success.
    ResourceExceeded,
}

/// Resources the session actually granted, for audit and egress comparison.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TouchedResources {
    pub paths: Vec<String>,
    pub hosts: Vec<String>,
}

impl TouchedResources {
    fn from_spec(spec: &SandboxSpec) -> Self {
        let hosts = match &spec.network {
            NetworkPolicy::Denied => Vec::new(),
            NetworkPolicy::AllowHosts(hosts) => hosts.clone(),
        };
        Self {
            paths: vec![spec.writable_root.display().to_string()],
            hosts,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxResult {
    pub backend: BackendKind,
    pub outcome: ExecOutcome,
    /// Exit code; `None` on timeout or signal death.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub touched: TouchedResources,
}

impl SandboxResult {
    pub fn success(&self) -> bool {
        self.outcome == ExecOutcome::Completed && self.exit_code == Some(0)
    }
}

// ─── Session guard ────────────────────────────────────────────────────────────

/// Removes the session scratch directory on drop, on every exit path.
struct SessionGuard {
    dir: PathBuf,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %e, "sandbox_scratch_cleanup_failed");
            }
        }
    }
}

// ─── Manager ──────────────────────────────────────────────────────────────────

/// Executes approved commands through the best available isolation backend,
/// falling back down the preference order when a backend cannot spawn.
pub struct SandboxManager {
    backends: Vec<BackendKind>,
    scratch_base: PathBuf,
}

impl SandboxManager {
    /// Probe the platform and use the resulting preference order.
    pub fn probe(scratch_base: PathBuf) -> Self {
        Self {
            backends: probe_backends(),
            scratch_base,
        }
    }

    /// Explicit backend list, for tests and constrained deployments.
    pub fn with_backends(backends: Vec<BackendKind>, scratch_base: PathBuf) -> Self {
        Self {
            backends,
            scratch_base,
        }
    }

    pub fn backends(&self) -> &[BackendKind] {
        &self.backends
    }

    /// Run `argv` inside a fresh single-use session.
    ///
    /// Precondition: `decision` is an Allow — anything else is refused before
    /// a session is even created. The session directory and child process are
    /// torn down on every exit path, including cancellation of this future.
    pub async fn execute(
        &self,
        argv: &[String],
        spec: &SandboxSpec,
        decision: &PolicyDecision,
    ) -> Result<SandboxResult, SandboxError> {
        if !decision.is_allow() {
            return Err(SandboxError::NotAuthorized);
        }
        if argv.is_empty() {
            return Err(SandboxError::EmptyCommand);
        }

        let scratch = self.scratch_base.join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&scratch)?;
        let _guard = SessionGuard {
            dir: scratch.clone(),
        };
        std::fs::create_dir_all(&spec.writable_root)?;

        let mut last_error = String::from("no backend available");
        for &kind in &self.backends {
            let mut cmd = match backend::build_command(kind, argv, spec, &scratch) {
                Ok(cmd) => cmd,
                Err(e) => {
                    last_error = e.to_string();
                    warn!(backend = %kind, error = %last_error, "sandbox_backend_setup_failed");
                    continue;
                }
            };

            let child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    // Backend binary missing or broken — fall back, don't fail.
                    last_error = e.to_string();
                    warn!(backend = %kind, error = %last_error, "sandbox_backend_spawn_failed");
                    continue;
                }
            };

            debug!(backend = %kind, tool_argv = ?argv.first(), "sandbox_exec");
            return Ok(self.wait_with_limits(kind, child, spec).await);
        }

        Err(SandboxError::AllBackendsFailed { last: last_error })
    }

    /// Await the child under the wall-clock budget and output cap.
    ///
    /// On timeout the `wait_with_output` future is dropped, which kills the
    /// child (`kill_on_drop`) — no orphan survives.
    async fn wait_with_limits(
        &self,
        backend: BackendKind,
        child: tokio::process::Child,
        spec: &SandboxSpec,
    ) -> SandboxResult {
        let touched = TouchedResources::from_spec(spec);
        let budget = spec.limits.max_runtime;

        let output = match tokio::time::timeout(budget, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return SandboxResult {
                    backend,
                    outcome: ExecOutcome::Completed,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("sandbox wait failed: {e}"),
                    touched,
                };
            }
            Err(_) => {
                warn!(backend = %backend, timeout_secs = budget.as_secs(), "sandbox_timeout");
                return SandboxResult {
                    backend,
                    outcome: ExecOutcome::Timeout,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("execution exceeded {}s wall-clock budget", budget.as_secs()),
                    touched,
                };
            }
        };

        let cap = spec.limits.max_output_bytes;
        let overflowed = output.stdout.len() > cap || output.stderr.len() > cap;
        let stdout = truncate_lossy(&output.stdout, cap);
        let stderr = truncate_lossy(&output.stderr, cap);

        SandboxResult {
            backend,
            outcome: if overflowed {
                ExecOutcome::ResourceExceeded
            } else {
                ExecOutcome::Completed
            },
            exit_code: output.status.code(),
            stdout,
            stderr,
            touched,
        }
    }
}

fn truncate_lossy(bytes: &[u8], cap: usize) -> String {
    let slice = &bytes[..bytes.len().min(cap)];
    String::from_utf8_lossy(slice).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Outcome, PolicyDecision};
    use tempfile::TempDir;

    fn allow() -> PolicyDecision {
        PolicyDecision::new(Outcome::Allow, "test-allow", "test")
    }

    fn deny() -> PolicyDecision {
        PolicyDecision::new(Outcome::Deny, "test-deny", "test")
    }

    fn spec(root: PathBuf, secs: u64) -> SandboxSpec {
        SandboxSpec {
            writable_root: root,
            denied_paths: vec![],
            network: NetworkPolicy::Denied,
            limits: ResourceLimits {
                max_memory_mb: 64,
                max_runtime: Duration::from_secs(secs),
                max_output_bytes: 64 * 1024,
            },
        }
    }

    fn manager(dir: &TempDir) -> SandboxManager {
        // Restricted process only: unit tests must not depend on bwrap.
        SandboxManager::with_backends(
            vec![BackendKind::RestrictedProcess],
            dir.path().join("scratch"),
        )
    }

    #[tokio::test]
    async fn refuses_without_allow_decision() {
        let dir = TempDir::new().expect("tempdir");
        let m = manager(&dir);
        let s = spec(dir.path().join("ws"), 5);
        let result = m.execute(&["true".to_string()], &s, &deny()).await;
        assert!(matches!(result, Err(SandboxError::NotAuthorized)));
    }

    #[tokio::test]
    async fn runs_simple_command() {
        let dir = TempDir::new().expect("tempdir");
        let m = manager(&dir);
        let s = spec(dir.path().join("ws"), 5);
        let result = m
            .execute(
                &["echo".to_string(), "hello".to_string()],
                &s,
                &allow(),
            )
            .await
            .expect("execute");
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn timeout_tears_session_down() {
        let dir = TempDir::new().expect("tempdir");
        let m = manager(&dir);
        let s = spec(dir.path().join("ws"), 1);
        let result = m
            .execute(
                &["sleep".to_string(), "30".to_string()],
                &s,
                &allow(),
            )
            .await
            .expect("execute");
        assert_eq!(result.outcome, ExecOutcome::Timeout);
        assert_eq!(result.exit_code, None);
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_success() {
        let dir = TempDir::new().expect("tempdir");
        let m = manager(&dir);
        let s = spec(dir.path().join("ws"), 5);
        let result = m
            .execute(&["false".to_string()], &s, &allow())
            .await
            .expect("execute");
        assert!(!result.success());
        assert_eq!(result.outcome, ExecOutcome::Completed);
    }

    #[tokio::test]
    async fn scratch_dir_removed_after_run() {
        let dir = TempDir::new().expect("tempdir");
        let m = manager(&dir);
        let s = spec(dir.path().join("ws"), 5);
        m.execute(&["true".to_string()], &s, &allow())
            .await
            .expect("execute");

        let scratch = dir.path().join("scratch");
        let leftovers = std::fs::read_dir(&scratch)
            .map(|it| it.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn manifest_without_hosts_denies_network() {
        let manifest = SkillManifest::default();
        let s = SandboxSpec::for_manifest(&manifest, PathBuf::from("/tmp/ws"));
        assert!(matches!(s.network, NetworkPolicy::Denied));
    }
}
