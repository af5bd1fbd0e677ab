//! Boundary normalization for values read from the remote store.
//!
//! Some backends hand back stored JSON verbatim, others decode it on the way
//! out (a REST proxy that auto-parses JSON, a RESP3 integer reply for a
//! numeric string). Everything above this module sees a single shape:
//! [`CachedValue::Missing`] or the serialized text.

use serde::Serialize;
use serde_json::{Map, Value};
use tideway_core::{Error, Result};

/// A value exactly as a store returned it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// The key does not exist (or has expired).
    Nil,
    /// Serialized text.
    Text(String),
    /// A value the backend already decoded.
    Structured(Value),
    /// Anything else: binary payloads, wrong Redis types. Carries a short
    /// description for logging.
    Unsupported(String),
}

/// A normalized cache read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedValue {
    Missing,
    Raw(String),
}

impl CachedValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CachedValue::Missing => None,
            CachedValue::Raw(text) => Some(text),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, CachedValue::Missing)
    }
}

/// Normalize a store reply.
///
/// Structured replies are re-serialized canonically, so `decode(encode(x))`
/// and `decode(x)` agree for any logical value `x`.
pub fn decode(key: &str, raw: RawValue) -> Result<CachedValue> {
    match raw {
        RawValue::Nil => Ok(CachedValue::Missing),
        RawValue::Text(text) => Ok(CachedValue::Raw(text)),
        RawValue::Structured(value) => Ok(CachedValue::Raw(canonical_string(&value))),
        RawValue::Unsupported(found) => Err(Error::unexpected_value_type(key, found)),
    }
}

/// Serialize a value for storage in canonical form.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    Ok(canonical_string(&value))
}

/// Compact JSON with object keys sorted recursively.
pub fn canonical_string(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k.clone(), canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
