//! `egress` — outbound data inspection (DLP).
//!
//! Applied to sandbox output before it crosses any external boundary.
//! Credential-shaped matches are rewritten to `[REDACTED]`; any touched host
//! outside the tool's manifest allow-list drops the whole network leg as
//! `EgressBlocked` — never a partial delivery.

use std::collections::HashSet;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::sandbox::SandboxResult;
use crate::tools::SkillManifest;

const REDACTED: &str = "[REDACTED]";

// ─── Pattern registry ─────────────────────────────────────────────────────────

/// Compiled regular expressions for known credential formats.
static SECRET_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"sk-ant-[A-Za-z0-9\-_]{20,}", "anthropic_key"),
        (r"sk-[A-Za-z0-9\-_]{20,}", "api_key"),
        (r"ghp_[A-Za-z0-9]{36}", "github_pat"),
        (r"github_pat_[A-Za-z0-9_]{82}", "github_fine_grained_pat"),
        (r"glpat-[A-Za-z0-9\-]{20}", "gitlab_pat"),
        (r"AIza[A-Za-z0-9\-_]{35}", "google_api_key"),
        (r"xox[bpas]-[A-Za-z0-9\-]+", "slack_token"),
        (r"AKIA[0-9A-Z]{16}", "aws_access_key"),
        (
            r"-----BEGIN\s+(?:RSA |EC |OPENSSH )?PRIVATE KEY-----",
            "pem_private_key",
        ),
        (
            r#"(?i)(password|secret|token|api_key|auth_key|private_key)\s*[:=]\s*["']?[A-Za-z0-9+/\-_]{8,}"#,
            "key_value_credential",
        ),
        (r"(?i)bearer\s+[A-Za-z0-9+/\-_=]{20,}", "bearer_token"),
    ]
    .iter()
    .map(|(p, name)| (Regex::new(p).expect("SECRET_PATTERNS: invalid regex"), *name))
    .collect()
});

/// Hosts whose only plausible use from an agent is data exfiltration.
pub static EXFIL_HOSTS: &[&str] = &[
    "pastebin.com",
    "hastebin.com",
    "paste.ee",
    "ghostbin.co",
    "0x0.st",
    "file.io",
    "transfer.sh",
    "temp.sh",
];

/// Detect high-entropy strings (Shannon entropy > 4.5 bits/char).
///
/// Random tokens (API keys, base64 secrets) have high entropy; natural
/// language does not.
pub fn is_high_entropy(s: &str) -> bool {
    if s.len() < 20 {
        return false;
    }
    let mut freq = [0u32; 256];
    for b in s.bytes() {
        freq[b as usize] += 1;
    }
    let len = s.len() as f64;
    let mut entropy = 0.0f64;
    for &count in freq.iter() {
        if count > 0 {
            let p = count as f64 / len;
            entropy -= p * p.log2();
        }
    }
    entropy > 4.5
}

// ─── Verdicts ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EgressVerdict {
    Clean,
    /// Output contained credential-shaped content; the named patterns were
    /// rewritten before delivery.
    Redacted { patterns: Vec<String> },
    /// A destination outside the manifest allow-list was touched. The whole
    /// network leg is dropped.
    Blocked { host: String },
}

/// Inspected output, safe to hand across the boundary.
#[derive(Debug, Clone, Serialize)]
pub struct FilteredResult {
    pub verdict: EgressVerdict,
    pub stdout: String,
    pub stderr: String,
}

// ─── Filter ───────────────────────────────────────────────────────────────────

/// Stateless pattern scanning plus a registry of vault entry names to watch
/// for (populated at unlock; names only, never values).
#[derive(Default)]
pub struct EgressFilter {
    watched_names: RwLock<HashSet<String>>,
}

impl EgressFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register vault entry names so output that embeds them gets redacted.
    pub fn watch_names<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut watched = self
            .watched_names
            .write()
            .unwrap_or_else(|e| e.into_inner());
        watched.extend(names.into_iter().map(Into::into));
    }

    /// Inspect one sandbox result against a tool's manifest.
    pub fn inspect(&self, result: &SandboxResult, manifest: &SkillManifest) -> FilteredResult {
        // Host enforcement first: a blocked destination voids the delivery.
        if let Some(host) = self.first_disallowed_host(result, manifest) {
            warn!(host = %host, "egress_blocked");
            return FilteredResult {
                verdict: EgressVerdict::Blocked { host },
                stdout: String::new(),
                stderr: String::new(),
            };
        }

        let (stdout, mut patterns) = self.redact(&result.stdout);
        let (stderr, more) = self.redact(&result.stderr);
        patterns.extend(more);
        patterns.sort();
        patterns.dedup();

        let verdict = if patterns.is_empty() {
            EgressVerdict::Clean
        } else {
            warn!(patterns = ?patterns, "egress_redacted");
            EgressVerdict::Redacted { patterns }
        };
        FilteredResult {
            verdict,
            stdout,
            stderr,
        }
    }

    fn first_disallowed_host(
        &self,
        result: &SandboxResult,
        manifest: &SkillManifest,
    ) -> Option<String> {
        for host in &result.touched.hosts {
            let lower = host.to_lowercase();
            if EXFIL_HOSTS.iter().any(|blocked| lower.contains(blocked)) {
                return Some(host.clone());
            }
            if !manifest
                .permissions
                .network
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(&lower))
            {
                return Some(host.clone());
            }
        }
        None
    }

    /// Redact credential-shaped content from a string.
    ///
    /// Returns the rewritten string and the names of the patterns that fired.
    pub fn redact(&self, input: &str) -> (String, Vec<String>) {
        let mut result = input.to_string();
        let mut fired = Vec::new();

        for (pattern, name) in SECRET_PATTERNS.iter() {
            if pattern.is_match(&result) {
                result = pattern.replace_all(&result, REDACTED).to_string();
                fired.push((*name).to_string());
            }
        }

        // Vault entry names are sensitive context even without values.
        {
            let watched = self.watched_names.read().unwrap_or_else(|e| e.into_inner());
            for name in watched.iter() {
                if result.contains(name.as_str()) {
                    result = result.replace(name.as_str(), REDACTED);
                    fired.push("vault_entry_name".to_string());
                }
            }
        }

        // High-entropy substrings of 20+ chars.
        let mut rebuilt = result.clone();
        for word in result.split_whitespace() {
            let token = word.trim_matches(|c: char| !c.is_alphanumeric() && c != '+' && c != '/');
            if token.len() >= 20 && is_high_entropy(token) {
                rebuilt = rebuilt.replace(token, REDACTED);
                fired.push("high_entropy".to_string());
            }
        }

        (rebuilt, fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{BackendKind, ExecOutcome, TouchedResources};
    use crate::tools::Permissions;

    fn result_with(stdout: &str, hosts: Vec<String>) -> SandboxResult {
        SandboxResult {
            backend: BackendKind::RestrictedProcess,
            outcome: ExecOutcome::Completed,
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
            touched: TouchedResources {
                paths: vec![],
                hosts,
            },
        }
    }

    fn manifest_allowing(hosts: Vec<&str>) -> SkillManifest {
        SkillManifest {
            permissions: Permissions {
                network: hosts.into_iter().map(String::from).collect(),
                ..Permissions::default()
            },
            ..SkillManifest::default()
        }
    }

    #[test]
    fn clean_output_passes() {
        let filter = EgressFilter::new();
        let filtered = filter.inspect(
            &result_with("tests passed: 5/5", vec![]),
            &SkillManifest::default(),
        );
        assert_eq!(filtered.verdict, EgressVerdict::Clean);
        assert_eq!(filtered.stdout, "tests passed: 5/5");
    }

    #[test]
    fn api_key_redacted() {
        let filter = EgressFilter::new();
        let filtered = filter.inspect(
            &result_with(
                "key is sk-abcdefghijklmnopqrstuvwxyz1234567890",
                vec![],
            ),
            &SkillManifest::default(),
        );
        assert!(matches!(filtered.verdict, EgressVerdict::Redacted { .. }));
        assert!(!filtered.stdout.contains("sk-abc"));
        assert!(filtered.stdout.contains(REDACTED));
    }

    #[test]
    fn disallowed_host_blocks_everything() {
        let filter = EgressFilter::new();
        let filtered = filter.inspect(
            &result_with("response body", vec!["evil.example.net".to_string()]),
            &manifest_allowing(vec!["api.example.com"]),
        );
        assert_eq!(
            filtered.verdict,
            EgressVerdict::Blocked {
                host: "evil.example.net".to_string()
            }
        );
        assert!(filtered.stdout.is_empty());
    }

    #[test]
    fn allowed_host_passes() {
        let filter = EgressFilter::new();
        let filtered = filter.inspect(
            &result_with("ok", vec!["api.example.com".to_string()]),
            &manifest_allowing(vec!["api.example.com"]),
        );
        assert_eq!(filtered.verdict, EgressVerdict::Clean);
    }

    #[test]
    fn exfil_host_blocked_even_when_allow_listed() {
        let filter = EgressFilter::new();
        let filtered = filter.inspect(
            &result_with("ok", vec!["pastebin.com".to_string()]),
            &manifest_allowing(vec!["pastebin.com"]),
        );
        assert!(matches!(filtered.verdict, EgressVerdict::Blocked { .. }));
    }

    #[test]
    fn watched_vault_name_redacted() {
        let filter = EgressFilter::new();
        filter.watch_names(["ANTHROPIC_API_KEY"]);
        let (redacted, fired) = filter.redact("found ANTHROPIC_API_KEY in env");
        assert!(!redacted.contains("ANTHROPIC_API_KEY"));
        assert!(fired.contains(&"vault_entry_name".to_string()));
    }

    #[test]
    fn high_entropy_token_redacted() {
        let filter = EgressFilter::new();
        // 32 distinct mixed-case alphanumerics — entropy well above threshold.
        let token = "aB3xK9mQ7rT2wY5zP8vN1cD4fG6hJ0lS";
        let (redacted, fired) = filter.redact(&format!("leaked {token} here"));
        assert!(!redacted.contains(token));
        assert!(fired.contains(&"high_entropy".to_string()));
    }

    #[test]
    fn prose_is_not_high_entropy() {
        assert!(!is_high_entropy("the quick brown fox jumps"));
        assert!(!is_high_entropy("short"));
    }
}
