//! Canonical cache keys for parameter sets and attribute maps.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{Attributes, Params};

/// Normalize an identity value to its string form.
///
/// Numbers and booleans are stringified, non-empty strings are kept as they
/// are. Anything else means "no identity".
pub fn identity_string(value: &Value) -> Option<String> {
  match value {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    Value::Bool(b) => Some(b.to_string()),
    _ => None,
  }
}

/// Build the canonical key for one or more parameter sets.
///
/// Later sets override earlier ones. Keys are ordered lexicographically and
/// the `id_key` value is coerced to a string, so `{id: 7}` and `{id: "7"}`
/// produce the same key.
pub fn cache_key(id_key: &str, parts: &[&Params]) -> String {
  let mut merged: BTreeMap<&str, Value> = BTreeMap::new();
  for part in parts {
    for (key, value) in part.iter() {
      merged.insert(key.as_str(), canonical(value));
    }
  }

  if let Some(id) = merged.get_mut(id_key) {
    if let Some(normalized) = identity_string(id) {
      *id = Value::String(normalized);
    }
  }

  // BTreeMap serializes in key order
  serde_json::to_string(&merged).unwrap_or_default()
}

/// Stable, fixed-length digest of a full attribute map.
///
/// Stands in for identity when an entity is not yet known to the server.
pub fn attribute_hash(id_key: &str, attributes: &Attributes) -> String {
  let input = cache_key(id_key, &[attributes]);

  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

/// Rebuild nested objects with sorted keys.
fn canonical(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let sorted: BTreeMap<&String, Value> = map.iter().map(|(k, v)| (k, canonical(v))).collect();
      Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
    }
    Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
    other => other.clone(),
  }
}
