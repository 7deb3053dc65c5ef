//! Payload verification report types.
//!
//! A `PayloadVerifier` checks a call's payload against the descriptor before
//! anything is dispatched. Only a passing report lets the call proceed.

use serde::{Deserialize, Serialize};

/// The result of checking one payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// True only if every check passed.
    pub passed: bool,
    /// All failures collected during this run. Empty on pass.
    pub failures: Vec<VerificationFailure>,
}

impl VerificationReport {
    pub fn pass() -> Self {
        Self { passed: true, failures: Vec::new() }
    }

    pub fn fail(failures: Vec<VerificationFailure>) -> Self {
        Self { passed: failures.is_empty(), failures }
    }
}

/// A single failed check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationFailure {
    /// Dotted path of the offending field, `$` for the payload root.
    pub field_path: String,
    pub message: String,
}
