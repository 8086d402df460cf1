//! Built-in policy layers.
//!
//! Two stages bracket the user rule set:
//!
//! - [`hard_deny`] runs *before* user rules and cannot be overridden by them:
//!   credential-bearing paths, destructive shell commands, cloud-metadata and
//!   loopback hosts, and requests below a tool's declared autonomy floor.
//! - [`default_decision`] runs *after* user rules as the fallback ladder:
//!   system paths, always-prompt shell commands, and the 0–4 autonomy dial.
//!
//! Anything neither stage nor a user rule decides falls through to the
//! engine's default deny.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::schema::ToolCallRequest;
use crate::tools::{ToolCategory, ToolDescriptor};

use super::rules::{Outcome, PolicyDecision};

// ─── Non-overridable pattern registries ───────────────────────────────────────

/// Path fragments that always indicate credential material. Access is denied
/// regardless of autonomy level or user rules.
pub static SENSITIVE_PATH_FRAGMENTS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".aws",
    ".azure",
    ".gcloud",
    ".env",
    "credentials",
    ".gitconfig",
    "vault.enc",
    "id_rsa",
    "id_ed25519",
    ".npmrc",
    ".pypirc",
    ".bash_history",
    ".zsh_history",
];

/// Shell commands that must never be executed, at any autonomy level.
static FORBIDDEN_COMMANDS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"rm\s+-rf\s+/",
        r"rm\s+-rf\s+~",
        r"mkfs\.",
        r"dd\s+if=.*of=/dev/",
        r"chmod\s+(-R\s+)?777\s+/",
        r":\(\)\{.*:\|:.*\};:",
        r">\s*/dev/sd",
        r"curl.*\|\s*(bash|sh|sudo)",
        r"wget.*\|\s*(bash|sh|sudo)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("FORBIDDEN_COMMANDS: invalid regex"))
    .collect()
});

/// Hosts that are never legitimate tool destinations (SSRF bait).
pub static BLOCKED_HOSTS: &[&str] = &[
    "localhost",
    "127.0.0.1",
    "0.0.0.0",
    "169.254.169.254",
    "metadata.google.internal",
];

/// Shell commands that always prompt, even when the ladder would auto-allow.
static PROMPT_COMMANDS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)sudo\s+",
        r"(?i)pip\s+install",
        r"(?i)npm\s+install",
        r"(?i)apt\s+install",
        r"(?i)brew\s+install",
        r"(?i)docker\s+",
        r"(?i)git\s+push",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("PROMPT_COMMANDS: invalid regex"))
    .collect()
});

const SYSTEM_PATH_PREFIXES: &[&str] = &["/etc/", "/usr/", "/bin/", "/sbin/", "/boot/"];

// ─── Hard deny stage ──────────────────────────────────────────────────────────

fn is_file_category(category: ToolCategory) -> bool {
    matches!(
        category,
        ToolCategory::FileRead | ToolCategory::FileWrite | ToolCategory::FileDelete
    )
}

/// Non-overridable checks, evaluated before any user rule.
pub fn hard_deny(request: &ToolCallRequest, tool: &ToolDescriptor) -> Option<PolicyDecision> {
    let resource = request.resource_string();
    let resource_lower = resource.to_lowercase();

    if is_file_category(tool.category) {
        for fragment in SENSITIVE_PATH_FRAGMENTS {
            if resource_lower.contains(fragment) {
                return Some(PolicyDecision::new(
                    Outcome::Deny,
                    "builtin:sensitive-path",
                    format!("access to credential-bearing path '{}' is forbidden", fragment),
                ));
            }
        }
        // The declared scope is also binding, not just the visible arguments.
        for path in &request.declared_scope.paths {
            let lower = path.to_lowercase();
            for fragment in SENSITIVE_PATH_FRAGMENTS {
                if lower.contains(fragment) {
                    return Some(PolicyDecision::new(
                        Outcome::Deny,
                        "builtin:sensitive-path",
                        format!(
                            "declared scope includes credential-bearing path '{}'",
                            fragment
                        ),
                    ));
                }
            }
        }
    }

    if tool.category == ToolCategory::ShellExec {
        for pattern in FORBIDDEN_COMMANDS.iter() {
            if pattern.is_match(&resource) {
                return Some(PolicyDecision::new(
                    Outcome::Deny,
                    "builtin:forbidden-command",
                    format!("destructive command blocked: matches '{}'", pattern.as_str()),
                ));
            }
        }
    }

    if tool.category == ToolCategory::NetworkRequest {
        let mut targets: Vec<&str> = request.declared_scope.hosts.iter().map(String::as_str).collect();
        targets.push(&resource_lower);
        for blocked in BLOCKED_HOSTS {
            if targets.iter().any(|t| t.to_lowercase().contains(blocked)) {
                return Some(PolicyDecision::new(
                    Outcome::Deny,
                    "builtin:blocked-host",
                    format!("destination '{}' is blocked (SSRF prevention)", blocked),
                ));
            }
        }
    }

    if request.autonomy_level < tool.min_autonomy {
        return Some(PolicyDecision::new(
            Outcome::Deny,
            "builtin:autonomy-floor",
            format!(
                "tool '{}' requires autonomy level {} (session is at {})",
                tool.name, tool.min_autonomy, request.autonomy_level
            ),
        ));
    }

    None
}

// ─── Default ladder stage ─────────────────────────────────────────────────────

/// Fallback defaults applied when no user rule matched.
///
/// Ladder semantics:
/// - level 0 — ask for everything
/// - level 1 — reads auto, everything else asks
/// - level 2 — safe actions auto; shell/network/delete ask
/// - level 3 — all but destructive auto
/// - level 4 — auto everything
pub fn default_decision(
    request: &ToolCallRequest,
    tool: &ToolDescriptor,
) -> Option<PolicyDecision> {
    let resource = request.resource_string();

    // System paths are restricted regardless of the ladder.
    if is_file_category(tool.category) {
        let lower = resource.to_lowercase();
        for prefix in SYSTEM_PATH_PREFIXES {
            // Resource strings look like `tool:path`.
            if lower
                .split(':')
                .nth(1)
                .is_some_and(|path| path.starts_with(prefix))
            {
                return Some(PolicyDecision::new(
                    Outcome::Deny,
                    "builtin:system-path",
                    format!("access to system path '{}' is restricted", prefix),
                ));
            }
        }
    }

    // Package installs, sudo, pushes: always prompt.
    if tool.category == ToolCategory::ShellExec {
        for pattern in PROMPT_COMMANDS.iter() {
            if pattern.is_match(&resource) {
                return Some(PolicyDecision::new(
                    Outcome::AskUser,
                    "builtin:shell-prompt",
                    format!("command matches always-prompt pattern '{}'", pattern.as_str()),
                ));
            }
        }
    }

    let category = tool.category;
    let decision = match request.autonomy_level {
        0 => Some((
            Outcome::AskUser,
            "autonomy level 0: approval required for all actions",
        )),
        1 => {
            if matches!(
                category,
                ToolCategory::FileRead | ToolCategory::MemoryRead | ToolCategory::SystemInfo
            ) {
                Some((Outcome::Allow, "autonomy level 1: read action allowed"))
            } else {
                Some((
                    Outcome::AskUser,
                    "autonomy level 1: write/exec actions require approval",
                ))
            }
        }
        2 => match category {
            ToolCategory::FileRead
            | ToolCategory::MemoryRead
            | ToolCategory::MemoryWrite
            | ToolCategory::SystemInfo
            | ToolCategory::FileWrite => {
                Some((Outcome::Allow, "autonomy level 2: safe action allowed"))
            }
            ToolCategory::ShellExec
            | ToolCategory::NetworkRequest
            | ToolCategory::FileDelete => Some((
                Outcome::AskUser,
                "autonomy level 2: shell/network/delete actions require approval",
            )),
            ToolCategory::SkillExec => None,
        },
        3 => {
            if matches!(category, ToolCategory::FileDelete | ToolCategory::ShellExec) {
                Some((
                    Outcome::AskUser,
                    "autonomy level 3: destructive actions require approval",
                ))
            } else {
                Some((
                    Outcome::Allow,
                    "autonomy level 3: non-destructive action allowed",
                ))
            }
        }
        4 => Some((Outcome::Allow, "autonomy level 4: action allowed")),
        _ => None,
    };

    decision.map(|(outcome, reason)| {
        PolicyDecision::new(outcome, "builtin:autonomy-ladder", reason)
    })
}
