//! Canonical serialization for state hashing.
//!
//! Object keys are sorted lexicographically, no insignificant whitespace,
//! UTF-8, so hashes are reproducible across platforms and processes.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serialize `value` to its canonical JSON form.
pub fn canonical_json<T: Serialize>(value: &T) -> String {
    let v = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
    serde_json::to_string(&sort_json_keys(v)).unwrap_or_default()
}

/// SHA-256 hex digest over the canonical JSON of `value`. Used to detect
/// state changes cheaply without diffing the full struct.
pub fn state_hash<T: Serialize>(value: &T) -> String {
    let digest = Sha256::digest(canonical_json(value).as_bytes());
    format!("{:x}", digest)
}

/// Recursively sort JSON object keys so HashMap field ordering doesn't affect
/// the hash.
fn sort_json_keys(v: serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, serde_json::Value> = map
                .into_iter()
                .map(|(k, v)| (k, sort_json_keys(v)))
                .collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(sort_json_keys).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_hash() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(state_hash(&a), state_hash(&b));
    }

    #[test]
    fn canonical_form_has_no_whitespace_and_sorted_keys() {
        let v = json!({"b": 1, "a": 2});
        assert_eq!(canonical_json(&v), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn different_payloads_hash_differently() {
        let a = json!({"apps": {}});
        let b = json!({"apps": {"1": {}}});
        assert_ne!(state_hash(&a), state_hash(&b));
    }

    #[test]
    fn hash_is_stable_across_calls() {
        let v = json!({"k": [1, 2, 3]});
        assert_eq!(state_hash(&v), state_hash(&v));
    }
}
