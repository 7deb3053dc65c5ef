//! # pitboss-ref-game
//!
//! Reference game backend for pitboss. It hosts three moderation and
//! reporting functions over a fictional player table and runs the whole
//! control plane (Server, Agent, SDK instance) inside one tokio runtime to
//! walk through the dispatch scenarios:
//!
//! 1. **Invoke round trip**: registration, routing, provider bytes, audit.
//! 2. **Scope denial**: a caller scoped to one game asks for another.
//! 3. **Two-person rule**: a wipe is parked as a pending approval.
//! 4. **Approval race**: concurrent approve and reject, one winner.
//! 5. **Job cancel after agent restart**: the handle still routes.
//! 6. **Heartbeat expiry**: a silent agent drops out of routing.
//!
//! All data is hardcoded and fictional.

pub mod handlers;
pub mod players;
pub mod scenarios;
pub mod stack;

pub use stack::{Stack, StackOptions};

/// Access policy for the reference stack.
pub const POLICY: &str = include_str!("../policy/ref-game.toml");

/// Bundled descriptor documents, by file name.
pub const DESCRIPTOR_FILES: &[(&str, &str)] = &[
    ("player.json", include_str!("../descriptors/player.json")),
    ("reports.export.json", include_str!("../descriptors/reports.export.json")),
];

pub mod descriptors {
    use serde_json::Value;

    use pitboss_contracts::{
        descriptor::FunctionDescriptor,
        error::{PitbossError, PitbossResult},
    };

    use super::DESCRIPTOR_FILES;

    /// Parse a descriptor document: one object or an array of them.
    pub fn parse(json: &str) -> PitbossResult<Vec<FunctionDescriptor>> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| PitbossError::config(format!("descriptor document is not JSON: {e}")))?;
        let items = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        items
            .into_iter()
            .map(|item| {
                let descriptor: FunctionDescriptor = serde_json::from_value(item)
                    .map_err(|e| PitbossError::config(format!("malformed descriptor: {e}")))?;
                descriptor.validate()?;
                Ok(descriptor)
            })
            .collect()
    }

    /// Every bundled descriptor, ordered by id.
    pub fn bundled() -> PitbossResult<Vec<FunctionDescriptor>> {
        let mut out = Vec::new();
        for (name, json) in DESCRIPTOR_FILES {
            out.extend(parse(json).map_err(|e| e.with_context(name))?);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}
