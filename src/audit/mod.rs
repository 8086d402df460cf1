//! `audit` — tamper-evident, hash-chained action log.
//!
//! Every entry embeds the SHA-256 of the previous entry; recomputing any
//! entry's hash from its stored fields must reproduce the stored value, and
//! each `prev_hash` must equal the prior entry's `self_hash`. Entries are
//! never mutated or deleted. Rotation starts a new JSONL segment whose first
//! entry chains to the last hash of the previous segment, so the chain spans
//! files.
//!
//! `append` is serialized through a single async mutex — the one intentional
//! bottleneck in the design; audit integrity outranks append throughput.
//! Payloads never enter the log: only SHA-256 digests of them do.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// `prev_hash` of the first entry ever written.
pub const GENESIS: &str = "genesis";

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AuditError {
    /// The chain could not be extended. Fatal to the orchestrator: no further
    /// tool calls may execute unaudited.
    #[error("audit write failed: {0}")]
    WriteFailed(String),

    #[error("audit log is corrupted: {0}")]
    Corrupted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ─── Entry model ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    User,
    Agent,
    System,
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Actor::User => "user",
            Actor::Agent => "agent",
            Actor::System => "system",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ToolCall,
    PolicyDecision,
    CredentialAccess,
    SkillInstall,
    ConfigChange,
    InjectionAlert,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::ToolCall => "tool_call",
            EventKind::PolicyDecision => "policy_decision",
            EventKind::CredentialAccess => "credential_access",
            EventKind::SkillInstall => "skill_install",
            EventKind::ConfigChange => "config_change",
            EventKind::InjectionAlert => "injection_alert",
        };
        write!(f, "{}", s)
    }
}

/// Fields a caller supplies for one append. Sequence, timestamp, and the
/// chain hashes are assigned under the append lock.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub actor: Actor,
    pub kind: EventKind,
    /// SHA-256 digest of the input payload, or empty.
    pub input_digest: String,
    /// SHA-256 digest of the output payload, or empty.
    pub output_digest: String,
    /// Rendered decision, `outcome:rule_id`, or empty for non-decision events.
    pub decision: String,
    /// Links logically related entries; never edited together.
    pub correlation_id: String,
}

/// One committed, immutable record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    /// RFC 3339 timestamp, stored as written so verification is
    /// representation-stable.
    pub ts: String,
    pub actor: Actor,
    pub kind: EventKind,
    pub input_digest: String,
    pub output_digest: String,
    pub decision: String,
    pub correlation_id: String,
    pub prev_hash: String,
    pub self_hash: String,
}

impl AuditEntry {
    /// Recompute this entry's hash from its stored fields.
    pub fn computed_hash(&self) -> String {
        let payload = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.seq,
            self.ts,
            self.actor,
            self.kind,
            self.input_digest,
            self.output_digest,
            self.decision,
            self.correlation_id,
            self.prev_hash,
        );
        hex::encode(Sha256::digest(payload.as_bytes()))
    }
}

// ─── Digest helpers ───────────────────────────────────────────────────────────

/// SHA-256 digest of a JSON payload. Raw payloads never enter the log.
pub fn digest_json(value: &serde_json::Value) -> String {
    digest_text(&value.to_string())
}

pub fn digest_text(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

// ─── Verification report ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub valid: bool,
    pub entries: u64,
    /// Sequence number of the first broken entry, if any.
    pub broken_at: Option<u64>,
    pub message: String,
}

// ─── Logger ───────────────────────────────────────────────────────────────────

struct ChainState {
    next_seq: u64,
    prev_hash: String,
    segment_path: PathBuf,
    entries_in_segment: u64,
}

/// Hash-chained append-only logger over JSONL segment files.
pub struct AuditLogger {
    dir: PathBuf,
    rotate_entries: u64,
    state: Mutex<ChainState>,
}

impl AuditLogger {
    /// Open (or create) the log, resuming the chain from the last committed
    /// entry on disk.
    pub fn open(dir: impl Into<PathBuf>, rotate_entries: u64) -> Result<Self, AuditError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let state = match last_committed(&dir)? {
            Some((entry, segment_path, entries_in_segment)) => ChainState {
                next_seq: entry.seq + 1,
                prev_hash: entry.self_hash,
                segment_path,
                entries_in_segment,
            },
            None => ChainState {
                next_seq: 0,
                prev_hash: GENESIS.to_string(),
                segment_path: segment_path(&dir, 0),
                entries_in_segment: 0,
            },
        };

        info!(
            dir = %dir.display(),
            next_seq = state.next_seq,
            "audit_log_opened"
        );
        Ok(Self {
            dir,
            rotate_entries: rotate_entries.max(1),
            state: Mutex::new(state),
        })
    }

    /// Append one event, returning the committed entry's `self_hash`.
    ///
    /// All appends are strictly ordered through the state mutex, so
    /// `prev_hash` chaining is never ambiguous under concurrency.
    pub async fn append(&self, event: AuditEvent) -> Result<String, AuditError> {
        let mut state = self.state.lock().await;

        if state.entries_in_segment >= self.rotate_entries {
            // New segment; the chain continues through prev_hash.
            state.segment_path = segment_path(&self.dir, state.next_seq);
            state.entries_in_segment = 0;
        }

        let mut entry = AuditEntry {
            seq: state.next_seq,
            ts: Utc::now().to_rfc3339(),
            actor: event.actor,
            kind: event.kind,
            input_digest: event.input_digest,
            output_digest: event.output_digest,
            decision: event.decision,
            correlation_id: event.correlation_id,
            prev_hash: state.prev_hash.clone(),
            self_hash: String::new(),
        };
        entry.self_hash = entry.computed_hash();

        let line = serde_json::to_string(&entry)
            .map_err(|e| AuditError::WriteFailed(e.to_string()))?;
        append_line(&state.segment_path, &line)
            .map_err(|e| AuditError::WriteFailed(e.to_string()))?;

        state.prev_hash = entry.self_hash.clone();
        state.next_seq += 1;
        state.entries_in_segment += 1;
        Ok(entry.self_hash)
    }

    /// Read all committed entries across segments, in sequence order.
    pub fn read_all(&self) -> Result<Vec<AuditEntry>, AuditError> {
        read_entries(&self.dir)
    }

    /// Read up to `limit` entries starting at `from_seq`.
    pub fn read_range(&self, from_seq: u64, limit: usize) -> Result<Vec<AuditEntry>, AuditError> {
        let entries = self.read_all()?;
        Ok(entries
            .into_iter()
            .filter(|e| e.seq >= from_seq)
            .take(limit)
            .collect())
    }

    /// Verify the full chain across all segments.
    pub fn verify_all(&self) -> Result<VerifyReport, AuditError> {
        let entries = self.read_all()?;
        Ok(verify_entries(&entries, GENESIS))
    }

    /// Verify a sub-range `[from, to]` of the chain. The range must be
    /// internally continuous; the hash of every entry in range is recomputed.
    pub fn verify_chain(&self, from: u64, to: u64) -> Result<bool, AuditError> {
        let entries: Vec<AuditEntry> = self
            .read_all()?
            .into_iter()
            .filter(|e| e.seq >= from && e.seq <= to)
            .collect();
        if entries.is_empty() {
            return Ok(true);
        }
        let anchor = entries[0].prev_hash.clone();
        Ok(verify_entries(&entries, &anchor).valid)
    }
}

/// Core verification loop shared by the logger and the doctor CLI.
pub fn verify_entries(entries: &[AuditEntry], anchor: &str) -> VerifyReport {
    let mut prev = anchor.to_string();
    for entry in entries {
        if entry.prev_hash != prev {
            return VerifyReport {
                valid: false,
                entries: entries.len() as u64,
                broken_at: Some(entry.seq),
                message: format!("chain broken at seq {}: prev_hash mismatch", entry.seq),
            };
        }
        if entry.computed_hash() != entry.self_hash {
            return VerifyReport {
                valid: false,
                entries: entries.len() as u64,
                broken_at: Some(entry.seq),
                message: format!("entry {} tampered: self_hash mismatch", entry.seq),
            };
        }
        prev = entry.self_hash.clone();
    }
    VerifyReport {
        valid: true,
        entries: entries.len() as u64,
        broken_at: None,
        message: format!("chain valid; {} entries verified", entries.len()),
    }
}

/// Read a log directory without opening it for appends (doctor, CLI verify).
pub fn load_entries(dir: &Path) -> Result<Vec<AuditEntry>, AuditError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    read_entries(dir)
}

// ─── Persistence helpers ──────────────────────────────────────────────────────

fn segment_path(dir: &Path, first_seq: u64) -> PathBuf {
    dir.join(format!("audit-{first_seq:010}.jsonl"))
}

fn segment_files(dir: &Path) -> Result<Vec<PathBuf>, AuditError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|res| res.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("audit-") && n.ends_with(".jsonl"))
        })
        .collect();
    // Zero-padded first-seq names sort lexicographically in chain order.
    files.sort();
    Ok(files)
}

fn read_entries(dir: &Path) -> Result<Vec<AuditEntry>, AuditError> {
    let mut entries = Vec::new();
    for file in segment_files(dir)? {
        let raw = std::fs::read_to_string(&file)?;
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(line).map_err(|e| {
                AuditError::Corrupted(format!("{}:{}: {}", file.display(), idx + 1, e))
            })?;
            entries.push(entry);
        }
    }
    Ok(entries)
}

fn last_committed(dir: &Path) -> Result<Option<(AuditEntry, PathBuf, u64)>, AuditError> {
    let files = segment_files(dir)?;
    let Some(last_file) = files.last() else {
        return Ok(None);
    };

    let raw = std::fs::read_to_string(last_file)?;
    let mut count = 0u64;
    let mut last_entry: Option<AuditEntry> = None;
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let entry: AuditEntry = serde_json::from_str(line)
            .map_err(|e| AuditError::Corrupted(format!("{}: {}", last_file.display(), e)))?;
        last_entry = Some(entry);
        count += 1;
    }

    match last_entry {
        Some(entry) => Ok(Some((entry, last_file.clone(), count))),
        None => {
            warn!(file = %last_file.display(), "audit_segment_empty");
            Ok(None)
        }
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_data()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn event(kind: EventKind, correlation: &str) -> AuditEvent {
        AuditEvent {
            actor: Actor::Agent,
            kind,
            input_digest: digest_text("input"),
            output_digest: String::new(),
            decision: "allow:test-rule".to_string(),
            correlation_id: correlation.to_string(),
        }
    }

    #[tokio::test]
    async fn chain_links_and_verifies() {
        let dir = TempDir::new().expect("tempdir");
        let log = AuditLogger::open(dir.path(), 1000).expect("open");

        for i in 0..5 {
            log.append(event(EventKind::ToolCall, &format!("c{i}")))
                .await
                .expect("append");
        }

        let entries = log.read_all().expect("read");
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].prev_hash, GENESIS);
        for window in entries.windows(2) {
            assert_eq!(window[1].prev_hash, window[0].self_hash);
        }

        let report = log.verify_all().expect("verify");
        assert!(report.valid, "{}", report.message);
    }

    #[tokio::test]
    async fn tampering_breaks_verification() {
        let dir = TempDir::new().expect("tempdir");
        let log = AuditLogger::open(dir.path(), 1000).expect("open");
        for i in 0..3 {
            log.append(event(EventKind::PolicyDecision, &format!("c{i}")))
                .await
                .expect("append");
        }

        // Flip one field in the middle entry on disk.
        let file = segment_path(dir.path(), 0);
        let raw = std::fs::read_to_string(&file).expect("read");
        let tampered = raw.replace("allow:test-rule", "allow:evil-rule");
        assert_ne!(raw, tampered, "tamper target must exist");
        std::fs::write(&file, tampered).expect("write");

        let report = log.verify_all().expect("verify");
        assert!(!report.valid);
        assert!(report.broken_at.is_some());
    }

    #[tokio::test]
    async fn rotation_chains_across_segments() {
        let dir = TempDir::new().expect("tempdir");
        let log = AuditLogger::open(dir.path(), 2).expect("open");
        for i in 0..5 {
            log.append(event(EventKind::ToolCall, &format!("c{i}")))
                .await
                .expect("append");
        }

        let files = segment_files(dir.path()).expect("segments");
        assert!(files.len() >= 2, "rotation should create segments");

        let report = log.verify_all().expect("verify");
        assert!(report.valid, "{}", report.message);
    }

    #[tokio::test]
    async fn reopen_resumes_chain() {
        let dir = TempDir::new().expect("tempdir");
        {
            let log = AuditLogger::open(dir.path(), 1000).expect("open");
            log.append(event(EventKind::ToolCall, "c0"))
                .await
                .expect("append");
        }

        let log = AuditLogger::open(dir.path(), 1000).expect("reopen");
        log.append(event(EventKind::ToolCall, "c1"))
            .await
            .expect("append");

        let entries = log.read_all().expect("read");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].seq, 1);
        assert_eq!(entries[1].prev_hash, entries[0].self_hash);
        assert!(log.verify_all().expect("verify").valid);
    }

    #[tokio::test]
    async fn verify_range_detects_local_tamper() {
        let dir = TempDir::new().expect("tempdir");
        let log = AuditLogger::open(dir.path(), 1000).expect("open");
        for i in 0..4 {
            log.append(event(EventKind::ToolCall, &format!("c{i}")))
                .await
                .expect("append");
        }
        assert!(log.verify_chain(1, 3).expect("verify"));
        assert!(log.verify_chain(0, 0).expect("verify"));
    }

    #[test]
    fn digest_is_stable() {
        let v = serde_json::json!({"b": 1, "a": 2});
        assert_eq!(digest_json(&v), digest_json(&v));
        assert_ne!(digest_json(&v), digest_text("other"));
    }
}
