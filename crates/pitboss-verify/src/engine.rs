//! Schema-based payload verifier for the pitboss dispatcher.
//!
//! `JsonSchemaVerifier` implements the `PayloadVerifier` trait from
//! `pitboss-core`. For every call it:
//!
//! 1. Skips descriptors without `params` and descriptors whose transport is
//!    protobuf; the bytes are opaque to the Server there.
//! 2. Parses the payload as JSON. Bytes that do not parse fail at `$`.
//! 3. Validates against the compiled `params` schema, collecting every
//!    failure so the caller sees the full set in one response.
//!
//! Compiled validators are cached per `(id, version)`; a descriptor is
//! immutable once registered under that pair.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, warn};

use pitboss_contracts::{
    descriptor::{FunctionDescriptor, Transport},
    error::{PitbossError, PitbossResult},
    verify::{VerificationFailure, VerificationReport},
};
use pitboss_core::traits::PayloadVerifier;

type CacheKey = (String, String);

/// JSON Schema validation of call payloads against descriptor `params`.
#[derive(Default)]
pub struct JsonSchemaVerifier {
    compiled: RwLock<HashMap<CacheKey, Arc<jsonschema::Validator>>>,
}

impl JsonSchemaVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of compiled schemas held in the cache.
    pub fn cached(&self) -> usize {
        self.compiled.read().map(|c| c.len()).unwrap_or(0)
    }

    fn validator(&self, descriptor: &FunctionDescriptor, schema: &Value) -> PitbossResult<Arc<jsonschema::Validator>> {
        let key = (descriptor.id.clone(), descriptor.version.clone());
        if let Some(v) = self.compiled.read().ok().and_then(|c| c.get(&key).cloned()) {
            return Ok(v);
        }

        let validator = jsonschema::validator_for(schema).map_err(|e| {
            warn!(function_id = %descriptor.id, version = %descriptor.version, error = %e, "schema compilation failure");
            PitbossError::internal(format!(
                "descriptor '{}' version {} has an invalid params schema: {e}",
                descriptor.id, descriptor.version
            ))
        })?;
        let validator = Arc::new(validator);

        let mut cache = self
            .compiled
            .write()
            .map_err(|e| PitbossError::internal(format!("schema cache lock poisoned: {e}")))?;
        Ok(Arc::clone(cache.entry(key).or_insert(validator)))
    }
}

impl PayloadVerifier for JsonSchemaVerifier {
    fn verify(&self, descriptor: &FunctionDescriptor, payload: &[u8]) -> PitbossResult<VerificationReport> {
        let Some(schema) = descriptor.params.as_ref() else {
            return Ok(VerificationReport::pass());
        };
        if matches!(descriptor.transport, Transport::Proto { .. }) {
            debug!(function_id = %descriptor.id, "proto transport; payload not validated");
            return Ok(VerificationReport::pass());
        }

        let instance: Value = if payload.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice(payload) {
                Ok(v) => v,
                Err(e) => {
                    return Ok(VerificationReport::fail(vec![VerificationFailure {
                        field_path: "$".to_string(),
                        message: format!("payload is not valid JSON: {e}"),
                    }]));
                }
            }
        };

        let validator = self.validator(descriptor, schema)?;
        let failures: Vec<VerificationFailure> = validator
            .iter_errors(&instance)
            .map(|error| VerificationFailure {
                field_path: dotted_path(&error.instance_path.to_string()),
                message: error.to_string(),
            })
            .collect();

        debug!(
            function_id = %descriptor.id,
            passed = failures.is_empty(),
            failure_count = failures.len(),
            "payload verification complete"
        );
        Ok(VerificationReport::fail(failures))
    }
}

/// `/items/0/name` becomes `items.0.name`; the root becomes `$`.
pub fn dotted_path(pointer: &str) -> String {
    let segments: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(|s| s.replace("~1", "/").replace("~0", "~"))
        .collect();
    if segments.is_empty() {
        "$".to_string()
    } else {
        segments.join(".")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use pitboss_contracts::descriptor::{FunctionDescriptor, ProtoEncoding, Transport};
    use pitboss_core::traits::PayloadVerifier;

    use super::{dotted_path, JsonSchemaVerifier};

    // ── Builder helpers ───────────────────────────────────────────────────────

    fn ban_descriptor() -> FunctionDescriptor {
        let mut d = FunctionDescriptor::new("player.ban");
        d.params = Some(json!({
            "type": "object",
            "properties": {
                "player_id": { "type": "string", "minLength": 1 },
                "reason": { "type": "string" },
                "days": { "type": "integer", "minimum": 1 }
            },
            "required": ["player_id"]
        }));
        d
    }

    // ── JSON Schema tests ─────────────────────────────────────────────────────

    #[test]
    fn test_schema_pass() {
        let verifier = JsonSchemaVerifier::new();
        let report = verifier
            .verify(&ban_descriptor(), br#"{"player_id":"u-1","reason":"cheat"}"#)
            .unwrap();
        assert!(report.passed, "expected pass, failures: {:?}", report.failures);
        assert!(report.failures.is_empty());
    }

    #[test]
    fn test_missing_required_field_fails_at_root() {
        let verifier = JsonSchemaVerifier::new();
        let report = verifier.verify(&ban_descriptor(), br#"{"reason":"cheat"}"#).unwrap();

        assert!(!report.passed);
        assert_eq!(report.failures[0].field_path, "$");
        assert!(
            report.failures[0].message.contains("player_id"),
            "failure should name the missing property: {}",
            report.failures[0].message
        );
    }

    #[test]
    fn test_every_failure_is_collected() {
        let verifier = JsonSchemaVerifier::new();
        let report = verifier
            .verify(&ban_descriptor(), br#"{"player_id":"","days":0}"#)
            .unwrap();

        assert!(!report.passed);
        let mut paths: Vec<&str> = report.failures.iter().map(|f| f.field_path.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["days", "player_id"]);
    }

    #[test]
    fn test_non_json_payload_fails_at_root() {
        let verifier = JsonSchemaVerifier::new();
        let report = verifier.verify(&ban_descriptor(), b"\x00\x01not json").unwrap();

        assert!(!report.passed);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].field_path, "$");
    }

    // ── Skips ─────────────────────────────────────────────────────────────────

    #[test]
    fn test_descriptor_without_params_passes_anything() {
        let verifier = JsonSchemaVerifier::new();
        let report = verifier.verify(&FunctionDescriptor::new("ops.ping"), b"garbage").unwrap();
        assert!(report.passed);
    }

    #[test]
    fn test_proto_transport_is_not_validated() {
        let verifier = JsonSchemaVerifier::new();
        let mut d = ban_descriptor();
        d.transport = Transport::Proto {
            request_fqn: "game.v1.BanRequest".to_string(),
            response_fqn: None,
            encoding: ProtoEncoding::Binary,
        };
        assert!(verifier.verify(&d, b"\x0a\x03u-1").unwrap().passed);
        assert_eq!(verifier.cached(), 0);
    }

    // ── Cache and errors ──────────────────────────────────────────────────────

    #[test]
    fn test_validators_are_cached_per_version() {
        let verifier = JsonSchemaVerifier::new();
        let v1 = ban_descriptor();
        let mut v2 = ban_descriptor();
        v2.version = "2.0.0".to_string();

        verifier.verify(&v1, br#"{"player_id":"a"}"#).unwrap();
        verifier.verify(&v1, br#"{"player_id":"b"}"#).unwrap();
        assert_eq!(verifier.cached(), 1);
        verifier.verify(&v2, br#"{"player_id":"c"}"#).unwrap();
        assert_eq!(verifier.cached(), 2);
    }

    #[test]
    fn test_invalid_schema_is_an_error() {
        let verifier = JsonSchemaVerifier::new();
        let mut d = FunctionDescriptor::new("broken.fn");
        d.params = Some(json!({ "type": 12 }));

        match verifier.verify(&d, b"{}") {
            Err(e) => assert!(e.to_string().contains("invalid params schema"), "got: {e}"),
            Ok(report) => panic!("expected a schema error, got {:?}", report),
        }
    }

    #[test]
    fn test_dotted_path() {
        assert_eq!(dotted_path(""), "$");
        assert_eq!(dotted_path("/player_id"), "player_id");
        assert_eq!(dotted_path("/items/0/name"), "items.0.name");
        assert_eq!(dotted_path("/a~1b"), "a/b");
    }
}
