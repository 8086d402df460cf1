//! Integration tests for the audit hash chain.
//!
//! Covers the chain laws:
//! 1. `verify` is true iff nothing was altered after append
//! 2. Flipping any byte breaks verification from that entry onward
//! 3. Concurrent appends still produce a strict `prev_hash` chain
//! 4. Rotation keeps the chain continuous across segment files

use std::sync::Arc;

use warden::audit::{
    digest_text, load_entries, verify_entries, Actor, AuditEvent, AuditLogger, EventKind, GENESIS,
};

fn event(correlation: &str) -> AuditEvent {
    AuditEvent {
        actor: Actor::Agent,
        kind: EventKind::ToolCall,
        input_digest: digest_text("input payload"),
        output_digest: digest_text("output payload"),
        decision: "allow:test-rule".to_string(),
        correlation_id: correlation.to_string(),
    }
}

#[tokio::test]
async fn untouched_chain_verifies() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let log = AuditLogger::open(dir.path(), 1000).expect("open");

    for i in 0..10 {
        log.append(event(&format!("call-{i}"))).await.expect("append");
    }

    let report = log.verify_all().expect("verify");
    assert!(report.valid, "{}", report.message);
    assert_eq!(report.entries, 10);
}

#[tokio::test]
async fn any_byte_flip_breaks_the_chain() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let log = AuditLogger::open(dir.path(), 1000).expect("open");
    for i in 0..4 {
        log.append(event(&format!("call-{i}"))).await.expect("append");
    }

    // Tamper with one character of the second entry's stored fields.
    let file = std::fs::read_dir(dir.path())
        .expect("read dir")
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.extension().is_some_and(|e| e == "jsonl"))
        .expect("segment file");
    let raw = std::fs::read_to_string(&file).expect("read");
    let tampered = raw.replacen("call-1", "call-X", 1);
    assert_ne!(raw, tampered);
    std::fs::write(&file, tampered).expect("write");

    let entries = load_entries(dir.path()).expect("load");
    let report = verify_entries(&entries, GENESIS);
    assert!(!report.valid);
    assert_eq!(report.broken_at, Some(1));
}

#[tokio::test]
async fn concurrent_appends_chain_strictly() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let log = Arc::new(AuditLogger::open(dir.path(), 1000).expect("open"));

    let mut handles = Vec::new();
    for task in 0..8 {
        let log = Arc::clone(&log);
        handles.push(tokio::spawn(async move {
            for i in 0..10 {
                log.append(event(&format!("t{task}-{i}")))
                    .await
                    .expect("append");
            }
        }));
    }
    for handle in handles {
        handle.await.expect("join");
    }

    let entries = log.read_all().expect("read");
    assert_eq!(entries.len(), 80);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.seq, i as u64, "sequence must be gapless");
    }
    for window in entries.windows(2) {
        assert_eq!(
            window[1].prev_hash, window[0].self_hash,
            "prev_hash must equal the prior self_hash regardless of interleaving"
        );
    }
    assert!(log.verify_all().expect("verify").valid);
}

#[tokio::test]
async fn rotation_spans_segments_without_breaking() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let log = AuditLogger::open(dir.path(), 3).expect("open");
    for i in 0..10 {
        log.append(event(&format!("call-{i}"))).await.expect("append");
    }

    let segments = std::fs::read_dir(dir.path())
        .expect("read dir")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".jsonl"))
        .count();
    assert!(segments >= 3, "expected multiple segments, got {segments}");

    let report = log.verify_all().expect("verify");
    assert!(report.valid, "{}", report.message);

    // The entry that opens a new segment still chains to the prior one.
    let entries = log.read_all().expect("read");
    assert_eq!(entries[3].prev_hash, entries[2].self_hash);
}

#[tokio::test]
async fn reopened_log_continues_the_same_chain() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    {
        let log = AuditLogger::open(dir.path(), 1000).expect("open");
        for i in 0..3 {
            log.append(event(&format!("before-{i}"))).await.expect("append");
        }
    }
    {
        let log = AuditLogger::open(dir.path(), 1000).expect("reopen");
        for i in 0..3 {
            log.append(event(&format!("after-{i}"))).await.expect("append");
        }
        let entries = log.read_all().expect("read");
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[3].prev_hash, entries[2].self_hash);
        assert!(log.verify_all().expect("verify").valid);
    }
}
