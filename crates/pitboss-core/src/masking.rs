//! Sensitive-field masking and canonical payload hashing.
//!
//! Masking always runs before hashing so a payload hash never commits to a
//! sensitive value.
//!
//! Mask entries come from a descriptor's `ui.sensitive` list:
//!
//! - a dotted entry (`player.email`) names one path from the payload root;
//!   arrays along the path apply the rest of the path to every element
//! - a bare entry (`password`) masks that key at any depth
//!
//! Key comparison is ASCII case-insensitive in both forms.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Replacement written over every masked value.
pub const REDACTED: &str = "[redacted]";

/// Mask `value` in place.
pub fn mask_value(value: &mut Value, sensitive: &[String]) {
    for entry in sensitive {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if entry.contains('.') {
            let path: Vec<&str> = entry.split('.').collect();
            mask_path(value, &path);
        } else {
            mask_key_anywhere(value, entry);
        }
    }
}

fn mask_path(value: &mut Value, path: &[&str]) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if key.eq_ignore_ascii_case(head) {
                    if rest.is_empty() {
                        *child = Value::String(REDACTED.to_string());
                    } else {
                        mask_path(child, rest);
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                mask_path(item, path);
            }
        }
        _ => {}
    }
}

fn mask_key_anywhere(value: &mut Value, key: &str) {
    match value {
        Value::Object(map) => {
            for (k, child) in map.iter_mut() {
                if k.eq_ignore_ascii_case(key) {
                    *child = Value::String(REDACTED.to_string());
                } else {
                    mask_key_anywhere(child, key);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                mask_key_anywhere(item, key);
            }
        }
        _ => {}
    }
}

/// Parse `payload` as JSON and mask it. `None` for non-JSON payloads.
pub fn masked_payload(payload: &[u8], sensitive: &[String]) -> Option<Value> {
    let mut value: Value = serde_json::from_slice(payload).ok()?;
    mask_value(&mut value, sensitive);
    Some(value)
}

/// Canonical JSON: object keys sorted, no insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 hex of the masked canonical payload.
///
/// Empty payloads hash to the empty string. Payloads that are not JSON
/// (binary protobuf) cannot be masked and are hashed as raw bytes.
pub fn payload_hash(payload: &[u8], sensitive: &[String]) -> String {
    if payload.is_empty() {
        return String::new();
    }
    let bytes = match masked_payload(payload, sensitive) {
        Some(value) => canonical_json(&value).into_bytes(),
        None => payload.to_vec(),
    };
    hex::encode(Sha256::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn list(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bare_key_masks_at_any_depth_case_insensitively() {
        let mut v = json!({
            "Password": "hunter2",
            "profile": {"password": "x", "nick": "ok"},
            "history": [{"PASSWORD": "y"}]
        });
        mask_value(&mut v, &list(&["password"]));
        assert_eq!(v["Password"], REDACTED);
        assert_eq!(v["profile"]["password"], REDACTED);
        assert_eq!(v["profile"]["nick"], "ok");
        assert_eq!(v["history"][0]["PASSWORD"], REDACTED);
    }

    #[test]
    fn dotted_entry_masks_one_path_only() {
        let mut v = json!({
            "player": {"email": "a@b.c", "id": "u-1"},
            "email": "ops@studio.example"
        });
        mask_value(&mut v, &list(&["player.email"]));
        assert_eq!(v["player"]["email"], REDACTED);
        assert_eq!(v["email"], "ops@studio.example");
    }

    #[test]
    fn dotted_entry_walks_arrays() {
        let mut v = json!({"players": [{"email": "a"}, {"email": "b"}, {"id": 3}]});
        mask_value(&mut v, &list(&["players.email"]));
        assert_eq!(v["players"][0]["email"], REDACTED);
        assert_eq!(v["players"][1]["email"], REDACTED);
        assert_eq!(v["players"][2], json!({"id": 3}));
    }

    #[test]
    fn canonical_form_sorts_keys() {
        let v = json!({"b": 1, "a": {"d": [true, null], "c": "x"}});
        assert_eq!(canonical_json(&v), r#"{"a":{"c":"x","d":[true,null]},"b":1}"#);
    }

    #[test]
    fn hash_ignores_key_order_and_sensitive_values() {
        let sensitive = list(&["reason"]);
        let a = payload_hash(br#"{"player_id":"u-1","reason":"cheat"}"#, &sensitive);
        let b = payload_hash(br#"{"reason":"griefing","player_id":"u-1"}"#, &sensitive);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let c = payload_hash(br#"{"player_id":"u-2","reason":"cheat"}"#, &sensitive);
        assert_ne!(a, c);
    }

    #[test]
    fn empty_and_binary_payloads() {
        assert_eq!(payload_hash(b"", &[]), "");
        let raw = payload_hash(&[0x08, 0x96, 0x01], &list(&["x"]));
        assert_eq!(raw, hex::encode(Sha256::digest([0x08u8, 0x96, 0x01])));
    }
}
