//! The sealed audit record.
//!
//! An `AuditRecord` is an `AuditEntry` after the sink has assigned it a
//! position in the chain: sequence, timestamp, and the two hashes that make
//! tampering detectable. One record serializes to exactly one NDJSON line.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pitboss_contracts::audit::AuditEntry;

/// One line of the audit log.
///
/// `prev_hash` is the SHA-256 of the previous record's line exactly as it was
/// written. `this_hash` commits to every other field of this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Position in the chain, starting at 0.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    #[serde(default)]
    pub function_id: String,
    #[serde(default)]
    pub game_id: String,
    #[serde(default)]
    pub env: String,
    pub outcome: String,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub payload_hash: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
    pub prev_hash: String,
    #[serde(default)]
    pub this_hash: String,
}

impl AuditRecord {
    /// The `prev_hash` of the first record in every log: 64 hex zeros.
    pub const GENESIS_HASH: &'static str =
        "0000000000000000000000000000000000000000000000000000000000000000";

    /// Place `entry` at `sequence`, linked to `prev_hash`. `this_hash` is
    /// left empty; `chain::seal` fills it in.
    pub fn from_entry(entry: &AuditEntry, sequence: u64, prev_hash: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            sequence,
            timestamp,
            actor: entry.actor.clone(),
            action: entry.action.clone(),
            function_id: entry.function_id.clone(),
            game_id: entry.game_id.clone(),
            env: entry.env.clone(),
            outcome: entry.outcome.clone(),
            trace_id: entry.trace_id.clone(),
            payload_hash: entry.payload_hash.clone(),
            details: entry.details.clone(),
            prev_hash: prev_hash.into(),
            this_hash: String::new(),
        }
    }
}

/// Where the next record goes: its sequence and the hash of the last line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHead {
    pub next_sequence: u64,
    pub last_line_hash: String,
}

impl Default for ChainHead {
    fn default() -> Self {
        Self {
            next_sequence: 0,
            last_line_hash: AuditRecord::GENESIS_HASH.to_string(),
        }
    }
}
