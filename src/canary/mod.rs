//! `canary` — session-bound markers for prompt-injection detection.
//!
//! A marker is 16 random bytes, hex-encoded and wrapped in zero-width
//! characters so it is invisible in rendered context. Markers are minted when
//! context is built, checked against model output and tool-call arguments
//! before execution, and retired when the turn ends.
//!
//! Marker values are cryptographically unpredictable and never occur
//! naturally, so a positive check is treated as real leakage rather than a
//! coincidence. Only SHA-256 fingerprints of markers ever leave this module —
//! a marker value in the audit log would let a log reader forge bypasses.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand_core::{OsRng, RngCore};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// Zero-width joiner run used to hide markers in rendered text.
const MARKER_WRAP: &str = "\u{200b}\u{200c}\u{200d}";
const MARKER_BYTES: usize = 16;
const FINGERPRINT_CHARS: usize = 16;

// ─── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryPurpose {
    /// Embedded in context shown to the model.
    Prompt,
    /// Embedded in tool output before it is fed back to the model.
    ToolOutput,
}

/// An active marker. The raw value stays inside this module's store; callers
/// receive it once at mint time for injection and must not persist it.
#[derive(Clone)]
pub struct CanaryToken {
    pub value: String,
    pub session_id: String,
    pub purpose: CanaryPurpose,
    pub created_at: DateTime<Utc>,
}

impl CanaryToken {
    /// Marker wrapped for invisible embedding.
    pub fn wrapped(&self) -> String {
        format!("{MARKER_WRAP}{}{MARKER_WRAP}", self.value)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.value)
    }
}

impl std::fmt::Debug for CanaryToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The raw value must never reach logs via Debug formatting.
        f.debug_struct("CanaryToken")
            .field("fingerprint", &self.fingerprint())
            .field("session_id", &self.session_id)
            .field("purpose", &self.purpose)
            .finish()
    }
}

/// A detected marker leak. Carries the fingerprint, never the value.
#[derive(Debug, Clone, Serialize)]
pub struct CanaryHit {
    pub session_id: String,
    pub fingerprint: String,
    pub purpose: CanaryPurpose,
}

fn fingerprint(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(digest)[..FINGERPRINT_CHARS].to_string()
}

// ─── Store ────────────────────────────────────────────────────────────────────

/// Active markers across all sessions.
#[derive(Default)]
pub struct CanaryStore {
    active: RwLock<HashMap<String, CanaryToken>>,
}

impl CanaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a new marker bound to `session_id`.
    pub fn mint(&self, session_id: &str, purpose: CanaryPurpose) -> CanaryToken {
        let mut raw = [0u8; MARKER_BYTES];
        OsRng.fill_bytes(&mut raw);
        let token = CanaryToken {
            value: hex::encode(raw),
            session_id: session_id.to_string(),
            purpose,
            created_at: Utc::now(),
        };

        self.write()
            .insert(token.value.clone(), token.clone());
        info!(
            session = session_id,
            fingerprint = %token.fingerprint(),
            "canary_minted"
        );
        token
    }

    /// Mint a marker and append it, invisibly wrapped, to `context`.
    pub fn inject(&self, context: &str, session_id: &str) -> String {
        let token = self.mint(session_id, CanaryPurpose::Prompt);
        format!("{context}\n{}\n", token.wrapped())
    }

    /// Scan text that should never echo a marker back. Returns the first hit.
    pub fn check(&self, text: &str) -> Option<CanaryHit> {
        let active = self.read();
        for token in active.values() {
            if text.contains(&token.value) {
                let hit = CanaryHit {
                    session_id: token.session_id.clone(),
                    fingerprint: token.fingerprint(),
                    purpose: token.purpose,
                };
                warn!(
                    session = %hit.session_id,
                    fingerprint = %hit.fingerprint,
                    "canary_leak_detected"
                );
                return Some(hit);
            }
        }
        None
    }

    /// Retire every marker belonging to a session (end of turn).
    pub fn retire_session(&self, session_id: &str) {
        let mut active = self.write();
        let before = active.len();
        active.retain(|_, token| token.session_id != session_id);
        let retired = before - active.len();
        if retired > 0 {
            info!(session = session_id, retired, "canaries_retired");
        }
    }

    pub fn active_count(&self) -> usize {
        self.read().len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, CanaryToken>> {
        self.active.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, CanaryToken>> {
        self.active.write().unwrap_or_else(|e| e.into_inner())
    }
}

// ─── Heuristic injection patterns ─────────────────────────────────────────────

static INJECTION_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (
            r"(?i)ignore\s+(previous|above|all)\s+(instructions?|prompts?)",
            "instruction_override",
        ),
        (r"(?i)you\s+are\s+now\s+", "role_hijack"),
        (r"(?i)</?(system|prompt|instructions?)>", "xml_tag_injection"),
        (r"(?i)forget\s+(everything|all|previous)", "memory_wipe_attempt"),
        (
            r"(?i)do\s+not\s+follow\s+(the|your)\s+(rules|instructions)",
            "rule_bypass",
        ),
        (
            r"(?i)reveal\s+(your|the)\s+(system|initial)\s+prompt",
            "prompt_extraction",
        ),
        (r"\[INST\]|\[/INST\]|<<SYS>>|<</SYS>>", "llm_delimiter_injection"),
    ]
    .iter()
    .map(|(p, name)| {
        (
            Regex::new(p).expect("INJECTION_PATTERNS: invalid regex"),
            *name,
        )
    })
    .collect()
});

/// Heuristic scan for common injection phrasings. Advisory only — defense in
/// depth beside the marker check, surfaced as warnings rather than blocks.
pub fn scan_injection_patterns(text: &str) -> Vec<&'static str> {
    let detections: Vec<&'static str> = INJECTION_PATTERNS
        .iter()
        .filter(|(regex, _)| regex.is_match(text))
        .map(|(_, name)| *name)
        .collect();
    if !detections.is_empty() {
        warn!(count = detections.len(), patterns = ?detections, "injection_patterns_detected");
    }
    detections
}
