//! Hashing helpers for cache keys and audit trails.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// MD5 hex digest of a text, used for cache keys.
pub fn md5_hex(text: &str) -> String {
    format!("{:x}", md5::compute(text.as_bytes()))
}

/// Canonicalize a JSON value: object keys sorted recursively so the same
/// logical parameters always serialize to the same bytes.
pub fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by_key(|(k, _)| k.as_str());
                let mut out = serde_json::Map::new();
                for (k, v) in entries {
                    out.insert(k.clone(), sort(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }

    sort(value).to_string()
}

/// First 16 hex characters of sha256 over the canonical JSON of `params`.
/// PII never lands in the audit log, only this prefix.
pub fn params_hash(params: &Value) -> String {
    let canonical = canonical_json(params);
    let digest = Sha256::digest(canonical.as_bytes());
    let hex = format!("{:x}", digest);
    hex[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_hash_is_16_hex_chars() {
        let hash = params_hash(&json!({"query": "披锋", "top_k": 5}));
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn params_hash_ignores_key_order() {
        let a = params_hash(&json!({"a": 1, "b": {"y": 2, "x": 3}}));
        let b = params_hash(&json!({"b": {"x": 3, "y": 2}, "a": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn different_params_hash_differently() {
        let a = params_hash(&json!({"query": "披锋"}));
        let b = params_hash(&json!({"query": "拉白"}));
        assert_ne!(a, b);
    }
}
