//! Deterministic hashing
//!
//! Result hashes, request hashes and idempotency keys are all SHA-256 over
//! a canonical JSON rendering: object keys sorted recursively, absent
//! values normalized to `null`. Two results are "the same" iff their
//! hashes are byte-equal, so the canonical form must never depend on map
//! iteration order.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value canonically: object keys sorted at every level.
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
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Key serialization cannot fail for a plain string.
                out.push_str(&serde_json::to_string(key).unwrap_or_else(|_| format!("\"{}\"", key)));
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
        other => match serde_json::to_string(other) {
            Ok(s) => out.push_str(&s),
            // Non-finite floats have no JSON rendering; fall back to Display.
            Err(_) => out.push_str(&other.to_string()),
        },
    }
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash of a node result. `None` normalizes to `null`.
pub fn result_hash(result: Option<&Value>) -> String {
    let canonical = match result {
        Some(v) => canonical_json(v),
        None => "null".to_string(),
    };
    sha256_hex(&canonical)
}

/// Hash of a node's resolved request parameters.
pub fn request_hash(params: &Value) -> String {
    sha256_hex(&canonical_json(params))
}

/// Deterministic idempotency key for one node of one logical run.
///
/// Seeded from the workflow and node identity plus the trigger dedupe seed,
/// never from the execution id: a replay allocates a fresh execution id but
/// must reproduce the original keys byte-for-byte.
pub fn idempotency_key(workflow_id: &str, node_id: &str, seed: Option<&Value>) -> String {
    let seed_canonical = match seed {
        Some(v) => canonical_json(v),
        None => "null".to_string(),
    };
    let input = format!("{}\u{1f}{}\u{1f}{}", workflow_id, node_id, seed_canonical);
    format!("idk_{}", sha256_hex(&input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"z": true, "y": [1, {"k": "v", "j": 2}]}});
        let b = json!({"a": {"y": [1, {"j": 2, "k": "v"}], "z": true}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"y":[1,{"j":2,"k":"v"}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn result_hash_normalizes_absent_to_null() {
        assert_eq!(result_hash(None), result_hash(Some(&Value::Null)));
    }

    #[test]
    fn equal_values_hash_equal() {
        let a = json!({"ok": true, "v": 42});
        let b = json!({"v": 42, "ok": true});
        assert_eq!(result_hash(Some(&a)), result_hash(Some(&b)));
        assert_ne!(result_hash(Some(&a)), result_hash(Some(&json!({"v": 43, "ok": true}))));
    }

    #[test]
    fn idempotency_key_ignores_execution_identity() {
        let seed = json!({"dedupeToken": "abc"});
        let k1 = idempotency_key("wf-1", "n1", Some(&seed));
        let k2 = idempotency_key("wf-1", "n1", Some(&seed));
        assert_eq!(k1, k2);
        assert!(k1.starts_with("idk_"));

        assert_ne!(k1, idempotency_key("wf-1", "n2", Some(&seed)));
        assert_ne!(k1, idempotency_key("wf-2", "n1", Some(&seed)));
        assert_ne!(k1, idempotency_key("wf-1", "n1", None));
    }
}
