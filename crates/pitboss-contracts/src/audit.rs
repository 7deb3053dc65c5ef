//! Audit entry handed to an `AuditSink`.
//!
//! The sink owns sequencing, timestamps, and hashing; callers only describe
//! what happened.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Outcome recorded for successful dispatches.
pub const OUTCOME_OK: &str = "ok";
/// Outcome recorded when a call parks as a pending approval.
pub const OUTCOME_PENDING: &str = "pending";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub actor: String,
    /// `invoke`, `start_job`, `cancel_job`, `approve`, `reject`, ...
    pub action: String,
    #[serde(default)]
    pub function_id: String,
    #[serde(default)]
    pub game_id: String,
    #[serde(default)]
    pub env: String,
    /// `ok`, `pending`, or an error kind code.
    pub outcome: String,
    #[serde(default)]
    pub trace_id: String,
    /// SHA-256 hex of the masked, canonical payload; empty when no payload.
    #[serde(default)]
    pub payload_hash: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl AuditEntry {
    pub fn new(actor: impl Into<String>, action: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            outcome: outcome.into(),
            ..Default::default()
        }
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}
