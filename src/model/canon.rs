//! Canonical serialization and integrity checksums.
//!
//! Desired-state documents may carry a `checksum` over their canonical form.
//! Canonicalization sorts every object key and drops the `checksum` field
//! itself, so the digest is stable across YAML/JSON round trips.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Recursively sort all object keys. Arrays keep their order.
fn sort_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, sort_value(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}

/// Render a value in canonical form: sorted keys, compact separators,
/// no `checksum` field at the top level.
pub fn canonical_json(value: &Value) -> String {
    let mut value = value.clone();
    if let Value::Object(ref mut map) = value {
        map.remove("checksum");
    }
    sort_value(value).to_string()
}

/// Compute the integrity checksum of a document.
///
/// The digest is truncated for readability; collisions at this length are
/// irrelevant for integrity checking against accidental edits.
pub fn checksum(value: &Value) -> String {
    let canon = canonical_json(value);
    let digest = Sha256::digest(canon.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256:{}", &hex[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonicalization_is_idempotent() {
        let doc = json!({
            "device_id": "sw1",
            "vlans": {"100": {"name": "Servers"}},
            "mode": "patch",
        });
        let once = canonical_json(&doc);
        let twice = canonical_json(&serde_json::from_str(&once).unwrap());
        assert_eq!(once, twice);
    }

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(checksum(&a), checksum(&b));
    }

    #[test]
    fn checksum_field_is_excluded() {
        let without = json!({"device_id": "sw1", "mode": "patch"});
        let with = json!({"device_id": "sw1", "mode": "patch", "checksum": "sha256:junk"});
        assert_eq!(checksum(&without), checksum(&with));
    }

    #[test]
    fn checksum_format() {
        let c = checksum(&json!({"device_id": "sw1"}));
        assert!(c.starts_with("sha256:"));
        assert_eq!(c.len(), "sha256:".len() + 16);
    }
}
