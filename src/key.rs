//! Canonical encoding of request arguments into cache keys.
//!
//! Two argument values that describe the same logical request must produce
//! the same key, regardless of the order their fields were written in and
//! regardless of any fields that are set to null. The encoding is a pure
//! function of the value: composite values are reduced to their sorted,
//! null-stripped entries before serialization.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// A request argument value could not be converted to a canonical key.
///
/// The underlying serialization error is shared behind an [`Arc`] so the
/// error can be cloned and broadcast to every caller waiting on the same
/// request.
#[derive(Debug, Clone, Error)]
#[error("failed to serialize request arguments: {source}")]
pub struct KeyError {
    source: Arc<serde_json::Error>,
}

impl From<serde_json::Error> for KeyError {
    fn from(source: serde_json::Error) -> Self {
        KeyError {
            source: Arc::new(source),
        }
    }
}

/// Encodes any serializable argument value into its canonical key.
pub fn encode_args<A: Serialize>(args: &A) -> Result<String, KeyError> {
    let value = serde_json::to_value(args)?;
    Ok(args_to_key(&value))
}

/// Encodes a JSON value into its canonical key string.
///
/// Composite values (objects and arrays) are encoded as a JSON array of
/// `[key, encoded-child]` pairs: entries with null values are dropped,
/// the remaining entries are sorted by key name ascending (array indices
/// compare as strings), and each child is recursively encoded the same
/// way. A null value encodes to the empty string; primitives serialize
/// directly.
pub fn args_to_key(args: &Value) -> String {
    match args {
        Value::Null => String::new(),
        Value::Object(map) => {
            let entries = map
                .iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(key, value)| (key.clone(), value));
            encode_entries(entries)
        }
        Value::Array(items) => {
            let entries = items
                .iter()
                .enumerate()
                .filter(|(_, value)| !value.is_null())
                .map(|(index, value)| (index.to_string(), value));
            encode_entries(entries)
        }
        primitive => primitive.to_string(),
    }
}

fn encode_entries<'a>(entries: impl Iterator<Item = (String, &'a Value)>) -> String {
    let mut entries: Vec<(String, &Value)> = entries.collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let pairs: Vec<Value> = entries
        .into_iter()
        .map(|(key, value)| Value::Array(vec![Value::String(key), Value::String(args_to_key(value))]))
        .collect();

    Value::Array(pairs).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_args_produce_equal_keys() {
        assert_eq!(args_to_key(&json!({"a": 1, "b": 2})), args_to_key(&json!({"a": 1, "b": 2})));
    }

    #[test]
    fn different_args_produce_different_keys() {
        assert_ne!(args_to_key(&json!({"a": 1, "b": 2})), args_to_key(&json!({"a": 1, "b": 3})));
    }

    #[test]
    fn value_types_are_distinguished() {
        assert_ne!(
            args_to_key(&json!({"a": 1, "b": "2"})),
            args_to_key(&json!({"a": 1, "b": 2}))
        );
    }

    #[test]
    fn key_order_does_not_matter() {
        assert_eq!(
            args_to_key(&json!({"a": 1, "b": 2, "c": 3})),
            args_to_key(&json!({"c": 3, "b": 2, "a": 1}))
        );
    }

    #[test]
    fn null_entries_are_dropped() {
        assert_eq!(
            args_to_key(&json!({"a": 1, "b": null})),
            args_to_key(&json!({"a": 1}))
        );
    }

    #[test]
    fn null_root_encodes_to_empty_string() {
        assert_eq!(args_to_key(&Value::Null), "");
    }

    #[test]
    fn nested_values_are_canonicalized() {
        assert_eq!(
            args_to_key(&json!({"q": {"b": 2, "a": 1, "skip": null}})),
            args_to_key(&json!({"q": {"a": 1, "b": 2}}))
        );
    }

    #[test]
    fn encode_args_matches_json_encoding() {
        #[derive(Serialize)]
        struct Query {
            id: u32,
            tag: Option<String>,
        }

        let with_none = encode_args(&Query { id: 7, tag: None }).unwrap();
        assert_eq!(with_none, args_to_key(&json!({"id": 7})));
    }

    #[test]
    fn primitives_serialize_directly() {
        assert_eq!(args_to_key(&json!("a")), "\"a\"");
        assert_eq!(args_to_key(&json!(12)), "12");
        assert_eq!(args_to_key(&json!(true)), "true");
    }
}
