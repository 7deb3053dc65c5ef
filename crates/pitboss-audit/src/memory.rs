//! In-memory implementation of `AuditSink`.
//!
//! `InMemoryAuditSink` keeps every sealed line in a `Vec` behind a `Mutex`.
//! Lines are stored exactly as a file sink would write them, so the same
//! `chain::walk` verifies both.

use std::sync::Mutex;

use tracing::debug;

use pitboss_contracts::{
    audit::AuditEntry,
    error::{PitbossError, PitbossResult},
};
use pitboss_core::traits::AuditSink;

use crate::{
    chain::{first_break, seal, ChainBreak},
    event::{AuditRecord, ChainHead},
};

// ── Internal mutable state ────────────────────────────────────────────────────

pub(crate) struct MemoryState {
    pub(crate) lines: Vec<String>,
    pub(crate) head: ChainHead,
}

// ── Public sink ───────────────────────────────────────────────────────────────

/// An append-only audit sink that never touches disk. Used by tests and by
/// a Server started without `audit_path`.
pub struct InMemoryAuditSink {
    pub(crate) state: Mutex<MemoryState>,
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState { lines: Vec::new(), head: ChainHead::default() }),
        }
    }

    /// Every line written so far, in order.
    pub fn lines(&self) -> Vec<String> {
        self.state.lock().map(|s| s.lines.clone()).unwrap_or_default()
    }

    /// Parsed records. Lines that no longer parse are skipped.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.lines().iter().filter_map(|l| serde_json::from_str(l).ok()).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.lines.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn first_break(&self) -> Option<ChainBreak> {
        let lines = self.lines();
        first_break(lines.iter().map(String::as_str))
    }

    pub fn verify_integrity(&self) -> bool {
        self.first_break().is_none()
    }
}

// ── AuditSink impl ────────────────────────────────────────────────────────────

impl AuditSink for InMemoryAuditSink {
    fn append(&self, entry: &AuditEntry) -> PitbossResult<String> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| PitbossError::internal(format!("audit state lock poisoned: {e}")))?;

        let (record, line) = seal(entry, &mut state.head)?;
        state.lines.push(line);

        debug!(sequence = record.sequence, action = %record.action, outcome = %record.outcome, "audit record appended");
        Ok(record.this_hash)
    }

    fn flush(&self) -> PitbossResult<()> {
        Ok(())
    }
}
