//! Canonical JSON and record comparison.
//!
//! Exports are written with recursively sorted object keys so that two runs
//! over the same data produce byte-identical files. Arrays are never
//! reordered; only their elements are canonicalized.

use serde_json::{Map, Value};

use crate::sync::types::{Record, SyncResult};

/// Recursively sort object keys, leaving array order untouched.
#[must_use]
pub fn sort_object(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(sort_object).collect()),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), sort_object(&map[key]));
            }
            Value::Object(sorted)
        }
        other => other.clone(),
    }
}

/// Pretty-printed canonical JSON text.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn to_canonical_json(value: &Value) -> SyncResult<String> {
    Ok(serde_json::to_string_pretty(&sort_object(value))?)
}

/// Structural equality, independent of object key order.
#[must_use]
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| deep_equal(v, other)))
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| deep_equal(l, r))
        }
        _ => a == b,
    }
}

/// Shallow diff of `new` against `old`.
///
/// Every top-level key of `new` whose value is not deep-equal to `old`'s is
/// copied whole into the result; nested objects are not merged. Returns
/// `None` when nothing differs, and all of `new` when there is no `old`.
#[must_use]
pub fn get_diff(new: &Record, old: Option<&Record>) -> Option<Record> {
    let Some(old) = old else {
        return Some(new.clone());
    };

    let diff: Record = new
        .iter()
        .filter(|(key, value)| !old.get(*key).is_some_and(|prev| deep_equal(value, prev)))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    if diff.is_empty() { None } else { Some(diff) }
}
