//! # pitboss-audit
//!
//! Append-only, SHA-256 hash-chained audit log for the pitboss Server.
//!
//! ## Overview
//!
//! Every dispatch the Server performs is handed to an `AuditSink` as an
//! `AuditEntry`. The sinks here seal it into an `AuditRecord` that links to
//! the previous line via its SHA-256 hash. Editing, removing, or reordering
//! any line breaks the chain and is detected by `chain::walk`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pitboss_audit::FileAuditSink;
//! use pitboss_core::traits::AuditSink;
//!
//! let sink = FileAuditSink::open("/var/lib/pitboss/audit.log", true)?;
//! sink.append(&entry)?;
//! assert!(FileAuditSink::verify_file(sink.path())?.is_none());
//! ```

pub mod chain;
pub mod event;
pub mod file;
pub mod memory;

pub use chain::{first_break, hash_line, hash_record, verify_lines, ChainBreak};
pub use event::AuditRecord;
pub use file::FileAuditSink;
pub use memory::InMemoryAuditSink;

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::fs;

    use pitboss_contracts::audit::{AuditEntry, OUTCOME_OK};
    use pitboss_core::traits::AuditSink;

    use super::{chain, AuditRecord, ChainBreak, FileAuditSink, InMemoryAuditSink};

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn entry(action: &str, function_id: &str) -> AuditEntry {
        let mut e = AuditEntry::new("alice", action, OUTCOME_OK).detail("approval_id", "ap-1");
        e.function_id = function_id.to_string();
        e.game_id = "g1".to_string();
        e.env = "dev".to_string();
        e.trace_id = "t-1".to_string();
        e.payload_hash = "ab".repeat(32);
        e
    }

    // ── In-memory sink ────────────────────────────────────────────────────────

    #[test]
    fn test_hash_chain_integrity() {
        let sink = InMemoryAuditSink::new();
        sink.append(&entry("invoke", "player.ban")).unwrap();
        sink.append(&entry("approve", "player.wipe")).unwrap();
        sink.append(&entry("invoke", "player.wipe")).unwrap();

        assert_eq!(sink.len(), 3);
        assert!(sink.verify_integrity(), "chain must be valid after sequential appends");
    }

    #[test]
    fn test_genesis_and_linkage() {
        let sink = InMemoryAuditSink::new();
        sink.append(&entry("invoke", "a")).unwrap();
        sink.append(&entry("invoke", "b")).unwrap();

        let lines = sink.lines();
        let records = sink.records();
        assert_eq!(records[0].prev_hash, AuditRecord::GENESIS_HASH);
        assert_eq!(records[1].prev_hash, chain::hash_line(&lines[0]));
        for (idx, record) in records.iter().enumerate() {
            assert_eq!(record.sequence, idx as u64);
        }
    }

    #[test]
    fn test_append_returns_this_hash() {
        let sink = InMemoryAuditSink::new();
        let hash = sink.append(&entry("invoke", "player.ban")).unwrap();
        let record = &sink.records()[0];
        assert_eq!(record.this_hash, hash);
        assert_eq!(chain::hash_record(record).unwrap(), hash);
        assert_eq!(record.details.get("approval_id").map(String::as_str), Some("ap-1"));
    }

    #[test]
    fn test_tamper_detection() {
        let sink = InMemoryAuditSink::new();
        sink.append(&entry("invoke", "player.ban")).unwrap();
        sink.append(&entry("invoke", "player.kick")).unwrap();
        sink.append(&entry("invoke", "player.mute")).unwrap();

        {
            let mut state = sink.state.lock().unwrap();
            state.lines[1] = state.lines[1].replace("player.kick", "player.hug");
        }

        assert_eq!(sink.first_break(), Some(ChainBreak::ThisHash { line: 1 }));
    }

    #[test]
    fn test_rehashed_tamper_breaks_the_next_link() {
        let sink = InMemoryAuditSink::new();
        sink.append(&entry("invoke", "a")).unwrap();
        sink.append(&entry("invoke", "b")).unwrap();

        // Rewrite the first record and fix up its own hash: the second
        // record's prev_hash still points at the original line.
        {
            let mut state = sink.state.lock().unwrap();
            let mut first: AuditRecord = serde_json::from_str(&state.lines[0]).unwrap();
            first.outcome = "forbidden".to_string();
            first.this_hash = chain::hash_record(&first).unwrap();
            state.lines[0] = serde_json::to_string(&first).unwrap();
        }

        assert_eq!(sink.first_break(), Some(ChainBreak::PrevHash { line: 1 }));
    }

    #[test]
    fn test_removed_line_is_detected() {
        let sink = InMemoryAuditSink::new();
        for f in ["a", "b", "c"] {
            sink.append(&entry("invoke", f)).unwrap();
        }
        sink.state.lock().unwrap().lines.remove(1);
        assert_eq!(sink.first_break(), Some(ChainBreak::Sequence { line: 1 }));
    }

    #[test]
    fn test_verify_empty() {
        assert!(InMemoryAuditSink::new().verify_integrity());
        assert!(chain::verify_lines(std::iter::empty::<&str>()));
        assert_eq!(chain::first_break(["not json"]), Some(ChainBreak::Malformed { line: 0 }));
    }

    // ── File sink ─────────────────────────────────────────────────────────────

    #[test]
    fn test_file_sink_writes_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");

        let sink = FileAuditSink::open(&path, true).unwrap();
        sink.append(&entry("invoke", "player.ban")).unwrap();
        sink.append(&entry("start_job", "reports.export")).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.ends_with('\n'));
        assert_eq!(FileAuditSink::verify_file(&path).unwrap(), None);
    }

    #[test]
    fn test_file_sink_resumes_chain_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.log");

        {
            let sink = FileAuditSink::open(&path, true).unwrap();
            sink.append(&entry("invoke", "a")).unwrap();
            sink.append(&entry("invoke", "b")).unwrap();
        }
        {
            let sink = FileAuditSink::open(&path, true).unwrap();
            sink.append(&entry("invoke", "c")).unwrap();
        }

        let contents = fs::read_to_string(&path).unwrap();
        let last: AuditRecord = serde_json::from_str(contents.lines().last().unwrap()).unwrap();
        assert_eq!(last.sequence, 2);
        assert_eq!(FileAuditSink::verify_file(&path).unwrap(), None);
    }

    #[test]
    fn test_file_sink_buffers_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");

        let sink = FileAuditSink::open(&path, false).unwrap();
        sink.append(&entry("invoke", "a")).unwrap();
        sink.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_file_sink_truncates_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");

        {
            let sink = FileAuditSink::open(&path, true).unwrap();
            sink.append(&entry("invoke", "a")).unwrap();
        }
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("{\"sequence\":1,\"timest");
        fs::write(&path, contents).unwrap();

        let sink = FileAuditSink::open(&path, true).unwrap();
        sink.append(&entry("invoke", "b")).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert_eq!(FileAuditSink::verify_file(&path).unwrap(), None);
    }

    #[test]
    fn test_file_sink_refuses_tampered_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");

        {
            let sink = FileAuditSink::open(&path, true).unwrap();
            sink.append(&entry("invoke", "player.ban")).unwrap();
            sink.append(&entry("invoke", "player.ban")).unwrap();
        }
        let tampered = fs::read_to_string(&path).unwrap().replacen("alice", "mallory", 1);
        fs::write(&path, tampered).unwrap();

        assert_eq!(
            FileAuditSink::verify_file(&path).unwrap(),
            Some(ChainBreak::ThisHash { line: 0 })
        );
        match FileAuditSink::open(&path, true) {
            Err(e) => assert!(e.to_string().contains("fails verification"), "got: {e}"),
            Ok(_) => panic!("expected a tampered log to be refused"),
        }
    }
}
