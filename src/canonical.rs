//! JSON canonicalization for change detection.
//!
//! Two persisted issue versions are considered equal when their canonical
//! forms are byte-identical. Canonicalization sorts object keys
//! lexicographically at every depth, preserves array order, and treats an
//! absent field and an explicit `null` as the same value. The change-event
//! log is driven entirely by this comparison, so the rules here decide what
//! counts as "the issue changed".

use serde::Serialize;
use serde_json::{Map, Value};

/// Returns the canonical form of a JSON value.
///
/// Object keys are emitted in lexicographic order; `null` members are dropped
/// (absent-vs-null normalization); arrays keep their order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));

            let mut out = Map::new();
            for (key, member) in sorted {
                if member.is_null() {
                    continue;
                }
                out.insert(key.clone(), canonicalize(member));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Serializes a value to its canonical JSON byte form.
pub fn canonical_bytes<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let json = serde_json::to_value(value)?;
    serde_json::to_vec(&canonicalize(&json))
}

/// Compares two serializable values under canonical ordering.
///
/// `None` on either side is only equal to `None` on the other.
pub fn canonically_equal<T: Serialize>(a: Option<&T>, b: Option<&T>) -> serde_json::Result<bool> {
    match (a, b) {
        (None, None) => Ok(true),
        (Some(_), None) | (None, Some(_)) => Ok(false),
        (Some(a), Some(b)) => Ok(canonical_bytes(a)? == canonical_bytes(b)?),
    }
}
