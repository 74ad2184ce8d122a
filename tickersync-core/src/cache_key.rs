//! Deterministic cache keys: `<namespace>:<primary>:<digest>`.
//!
//! The digest is a short BLAKE3 hash over the remaining parameters serialized
//! as JSON with object keys sorted at every depth, so the same logical request
//! maps to the same key regardless of parameter insertion order.

use serde::Serialize;
use serde_json::{Map, Value};

/// Hex characters kept from the BLAKE3 digest.
pub const DIGEST_LEN: usize = 16;

/// Build a cache key from a namespace, a primary identifier and extra params.
///
/// `params` may be any serializable value; maps and structs are canonicalized.
pub fn cache_key<P: Serialize + ?Sized>(namespace: &str, primary: &str, params: &P) -> String {
    format!("{namespace}:{primary}:{}", params_digest(params))
}

/// Short digest of the canonical JSON form of `params`.
pub fn params_digest<P: Serialize + ?Sized>(params: &P) -> String {
    let canonical = match serde_json::to_value(params) {
        Ok(value) => canonicalize(value).to_string(),
        // Params with no JSON form (maps with non-string keys) hash the error text.
        Err(e) => format!("!{e}"),
    };
    let hash = blake3::hash(canonical.as_bytes());
    hash.to_hex()[..DIGEST_LEN].to_string()
}

/// Rebuild `value` with object keys in sorted order.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
