//! Sandbox backend probing and command construction.
//!
//! Preference order per platform: Linux namespace isolation (`bwrap`) →
//! macOS `sandbox-exec` → restricted-process fallback (cleared environment +
//! rlimits). Probing happens once at startup; execution walks the available
//! list and falls back on spawn failure.

use std::path::Path;
use std::process::Stdio;

use serde::Serialize;
use tracing::debug;

use super::{NetworkPolicy, SandboxError, SandboxSpec};

// ─── Backend kinds ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Linux user-namespace isolation via bubblewrap.
    Bubblewrap,
    /// macOS Seatbelt profiles via `sandbox-exec`.
    SandboxExec,
    /// Last resort: subprocess with cleared env and rlimits.
    RestrictedProcess,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendKind::Bubblewrap => "bubblewrap",
            BackendKind::SandboxExec => "sandbox-exec",
            BackendKind::RestrictedProcess => "restricted-process",
        };
        write!(f, "{}", s)
    }
}

/// Probe the platform for available backends, most isolated first. The
/// restricted-process fallback is always present.
pub fn probe_backends() -> Vec<BackendKind> {
    let mut available = Vec::new();
    if cfg!(target_os = "linux") && binary_answers("bwrap", "--version") {
        available.push(BackendKind::Bubblewrap);
    }
    if cfg!(target_os = "macos") && Path::new("/usr/bin/sandbox-exec").exists() {
        available.push(BackendKind::SandboxExec);
    }
    available.push(BackendKind::RestrictedProcess);
    debug!(?available, "sandbox_backends_probed");
    available
}

fn binary_answers(binary: &str, arg: &str) -> bool {
    std::process::Command::new(binary)
        .arg(arg)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

// ─── Command construction ─────────────────────────────────────────────────────

/// Build the ready-to-spawn command for `argv` under `backend`.
///
/// `scratch_dir` is the session's ephemeral directory; the Seatbelt profile
/// is written there so session teardown removes it.
pub fn build_command(
    backend: BackendKind,
    argv: &[String],
    spec: &SandboxSpec,
    scratch_dir: &Path,
) -> Result<tokio::process::Command, SandboxError> {
    if argv.is_empty() {
        return Err(SandboxError::EmptyCommand);
    }

    match backend {
        BackendKind::Bubblewrap => build_bubblewrap(argv, spec),
        BackendKind::SandboxExec => build_sandbox_exec(argv, spec, scratch_dir),
        BackendKind::RestrictedProcess => build_restricted_process(argv, spec),
    }
}

fn base_command(program: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

fn build_bubblewrap(
    argv: &[String],
    spec: &SandboxSpec,
) -> Result<tokio::process::Command, SandboxError> {
    let mut cmd = base_command("bwrap");
    cmd.args(["--ro-bind", "/", "/"])
        .args(["--tmpfs", "/tmp"])
        .args(["--dev", "/dev"])
        .args(["--proc", "/proc"])
        .arg("--unshare-all")
        .arg("--die-with-parent");

    let root = spec.writable_root.display().to_string();
    cmd.args(["--bind", &root, &root]);

    // Sensitive paths disappear behind empty tmpfs mounts.
    for denied in &spec.denied_paths {
        if denied.exists() {
            let path = denied.display().to_string();
            cmd.args(["--tmpfs", &path]);
        }
    }

    if matches!(spec.network, NetworkPolicy::AllowHosts(_)) {
        // --unshare-all already dropped the network namespace; opt back in.
        cmd.arg("--share-net");
    }

    cmd.args(["--chdir", &root]);
    cmd.arg("--");
    cmd.args(argv);
    cmd.env_clear().env("PATH", "/usr/bin:/bin");
    Ok(cmd)
}

fn build_sandbox_exec(
    argv: &[String],
    spec: &SandboxSpec,
    scratch_dir: &Path,
) -> Result<tokio::process::Command, SandboxError> {
    let profile = seatbelt_profile(spec);
    let profile_path = scratch_dir.join("profile.sb");
    std::fs::write(&profile_path, profile)?;

    let mut cmd = base_command("/usr/bin/sandbox-exec");
    cmd.arg("-f").arg(&profile_path);
    cmd.args(argv);
    cmd.current_dir(&spec.writable_root);
    cmd.env_clear().env("PATH", "/usr/bin:/bin");
    Ok(cmd)
}

/// Seatbelt profile: deny by default, read-only filesystem, writes confined
/// to the declared root and /tmp, sensitive paths unreadable.
fn seatbelt_profile(spec: &SandboxSpec) -> String {
    let mut rules = vec![
        "(version 1)".to_string(),
        "(deny default)".to_string(),
        "(allow process-exec)".to_string(),
        "(allow process-fork)".to_string(),
        "(allow sysctl-read)".to_string(),
        "(allow file-read*)".to_string(),
        "(allow file-write* (subpath \"/tmp\"))".to_string(),
        "(allow file-write* (subpath \"/dev/null\"))".to_string(),
    ];

    rules.push(format!(
        "(allow file-write* (subpath \"{}\"))",
        spec.writable_root.display()
    ));
    for denied in &spec.denied_paths {
        rules.push(format!("(deny file-read* (subpath \"{}\"))", denied.display()));
    }

    match spec.network {
        NetworkPolicy::Denied => rules.push("(deny network*)".to_string()),
        NetworkPolicy::AllowHosts(_) => rules.push("(allow network*)".to_string()),
    }

    rules.join("\n")
}

fn build_restricted_process(
    argv: &[String],
    spec: &SandboxSpec,
) -> Result<tokio::process::Command, SandboxError> {
    let mut cmd = base_command(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.current_dir(&spec.writable_root);
    cmd.env_clear().env("PATH", "/usr/bin:/bin");

    #[cfg(unix)]
    {
        let memory_bytes = spec.limits.max_memory_mb.saturating_mul(1024 * 1024);
        let cpu_secs = spec.limits.max_runtime.as_secs().max(1);
        // SAFETY: only async-signal-safe setrlimit calls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                let mem = libc::rlimit {
                    rlim_cur: memory_bytes,
                    rlim_max: memory_bytes,
                };
                libc::setrlimit(libc::RLIMIT_AS, &mem);

                let cpu = libc::rlimit {
                    rlim_cur: cpu_secs,
                    rlim_max: cpu_secs,
                };
                libc::setrlimit(libc::RLIMIT_CPU, &cpu);
                Ok(())
            });
        }
    }

    Ok(cmd)
}
