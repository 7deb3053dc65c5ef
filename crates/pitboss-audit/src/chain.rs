//! Hash-chain primitives: sealing records and verifying a log.
//!
//! Two hashes link the chain:
//!
//!   1. `this_hash` is SHA-256 over the canonical JSON of the record with the
//!      `this_hash` key removed (object keys sorted, no whitespace).
//!   2. `prev_hash` is SHA-256 over the previous record's line, byte for byte
//!      as it sits on disk, without the trailing newline.
//!
//! Verification needs nothing but the lines: recompute both hashes from the
//! first line onward.

use chrono::Utc;
use sha2::{Digest, Sha256};

use pitboss_contracts::{
    audit::AuditEntry,
    error::{PitbossError, PitbossResult},
};
use pitboss_core::masking::canonical_json;

use crate::event::{AuditRecord, ChainHead};

/// SHA-256 of a record's canonical form, excluding `this_hash`.
pub fn hash_record(record: &AuditRecord) -> PitbossResult<String> {
    let mut value = serde_json::to_value(record)
        .map_err(|e| PitbossError::internal(format!("audit record is not serializable: {e}")))?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("this_hash");
    }
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&value).as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of one log line, without its newline.
pub fn hash_line(line: &str) -> String {
    hex::encode(Sha256::digest(line.as_bytes()))
}

/// Turn `entry` into the next record after `head`, returning the record and
/// its serialized line. `head` is advanced only when sealing succeeds.
pub fn seal(entry: &AuditEntry, head: &mut ChainHead) -> PitbossResult<(AuditRecord, String)> {
    let mut record = AuditRecord::from_entry(entry, head.next_sequence, head.last_line_hash.clone(), Utc::now());
    record.this_hash = hash_record(&record)?;
    let line = serde_json::to_string(&record)
        .map_err(|e| PitbossError::internal(format!("audit record is not serializable: {e}")))?;

    head.next_sequence += 1;
    head.last_line_hash = hash_line(&line);
    Ok((record, line))
}

/// The first place a log stops being a valid chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainBreak {
    /// The line is not a record.
    Malformed { line: usize },
    /// `sequence` is not the line's position.
    Sequence { line: usize },
    /// `prev_hash` does not match the hash of the line before.
    PrevHash { line: usize },
    /// `this_hash` does not match the record's own content.
    ThisHash { line: usize },
}

impl ChainBreak {
    /// Zero-based index of the offending line.
    pub fn line(&self) -> usize {
        match self {
            ChainBreak::Malformed { line }
            | ChainBreak::Sequence { line }
            | ChainBreak::PrevHash { line }
            | ChainBreak::ThisHash { line } => *line,
        }
    }
}

impl std::fmt::Display for ChainBreak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let what = match self {
            ChainBreak::Malformed { .. } => "malformed record",
            ChainBreak::Sequence { .. } => "sequence gap",
            ChainBreak::PrevHash { .. } => "prev_hash mismatch",
            ChainBreak::ThisHash { .. } => "this_hash mismatch",
        };
        write!(f, "{what} at line {}", self.line())
    }
}

/// Walk `lines` from the first and report the first break, or the head the
/// next record should attach to.
pub fn walk<'a, I>(lines: I) -> Result<ChainHead, ChainBreak>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut head = ChainHead::default();
    for (idx, line) in lines.into_iter().enumerate() {
        let record: AuditRecord =
            serde_json::from_str(line).map_err(|_| ChainBreak::Malformed { line: idx })?;

        if record.sequence != idx as u64 {
            return Err(ChainBreak::Sequence { line: idx });
        }
        if record.prev_hash != head.last_line_hash {
            return Err(ChainBreak::PrevHash { line: idx });
        }
        match hash_record(&record) {
            Ok(hash) if hash == record.this_hash => {}
            _ => return Err(ChainBreak::ThisHash { line: idx }),
        }

        head.next_sequence = idx as u64 + 1;
        head.last_line_hash = hash_line(line);
    }
    Ok(head)
}

/// `None` when the whole log verifies. An empty log is valid.
pub fn first_break<'a, I>(lines: I) -> Option<ChainBreak>
where
    I: IntoIterator<Item = &'a str>,
{
    walk(lines).err()
}

pub fn verify_lines<'a, I>(lines: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    first_break(lines).is_none()
}
