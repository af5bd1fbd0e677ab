//! Self-healing shape validation for cache reads.
//!
//! Each cache category declares the shape it expects. A value that does not
//! match is deleted and the caller carries on as if the key were missing, so
//! the worst outcome of a corrupted entry is a cold cache.

use metrics::counter;
use serde_json::Value;
use tideway_core::{Error, Result};
use tracing::{error, warn};

use crate::codec::{self, CachedValue};
use crate::store::SharedStore;

const CACHE_RESETS_TOTAL: &str = "tideway_cache_resets_total";

/// The shape a cache category stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedShape {
    /// JSON array of non-negative integer Unix milliseconds.
    TimestampSequence,
    /// A number, string or boolean. Text that is not JSON counts as a string.
    Scalar,
    /// JSON object carrying at least the listed fields.
    Object { required: &'static [&'static str] },
}

impl ExpectedShape {
    pub fn describe(&self) -> &'static str {
        match self {
            ExpectedShape::TimestampSequence => "timestamp sequence",
            ExpectedShape::Scalar => "scalar",
            ExpectedShape::Object { .. } => "json object",
        }
    }
}

/// Outcome of a validated read.
#[derive(Debug, Clone, PartialEq)]
pub enum Validated {
    /// The value matched; carries the parsed JSON.
    Valid(Value),
    /// Nothing was stored.
    Missing,
    /// The entry was malformed and has been discarded.
    Reset,
}

impl Validated {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Validated::Valid(value) => Some(value),
            Validated::Missing | Validated::Reset => None,
        }
    }
}

/// A validated read plus the exact text it was parsed from.
///
/// `text` is `Some` only for [`Validated::Valid`] and is the value a
/// compare-and-swap must expect.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardedRead {
    pub value: Validated,
    pub text: Option<String>,
}

/// Check `text` against `shape` without touching the store.
pub fn check_shape(key: &str, text: &str, shape: ExpectedShape) -> Result<Value> {
    let expected = shape.describe();
    match shape {
        ExpectedShape::TimestampSequence => {
            let value: Value = serde_json::from_str(text)
                .map_err(|e| Error::corrupted(key, expected, format!("not json: {e}")))?;
            let Value::Array(items) = &value else {
                return Err(Error::corrupted(
                    key,
                    expected,
                    format!("found {}", kind_of(&value)),
                ));
            };
            if let Some(bad) = items
                .iter()
                .find(|item| item.as_i64().filter(|ts| *ts >= 0).is_none())
            {
                return Err(Error::corrupted(
                    key,
                    expected,
                    format!("element {bad} is not a unix millisecond timestamp"),
                ));
            }
            Ok(value)
        }
        ExpectedShape::Scalar => match serde_json::from_str::<Value>(text) {
            Ok(value @ (Value::Array(_) | Value::Object(_))) => Err(Error::corrupted(
                key,
                expected,
                format!("found {}", kind_of(&value)),
            )),
            Ok(value) => Ok(value),
            Err(_) => Ok(Value::String(text.to_string())),
        },
        ExpectedShape::Object { required } => {
            let value: Value = serde_json::from_str(text)
                .map_err(|e| Error::corrupted(key, expected, format!("not json: {e}")))?;
            let Value::Object(map) = &value else {
                return Err(Error::corrupted(
                    key,
                    expected,
                    format!("found {}", kind_of(&value)),
                ));
            };
            if let Some(missing) = required.iter().find(|field| !map.contains_key(**field)) {
                return Err(Error::corrupted(
                    key,
                    expected,
                    format!("missing field '{missing}'"),
                ));
            }
            Ok(value)
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Deletes malformed entries on sight.
#[derive(Clone)]
pub struct CorruptionGuard {
    store: SharedStore,
}

impl CorruptionGuard {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Validate an already decoded value, resetting the key on mismatch.
    pub async fn validate(&self, key: &str, value: &CachedValue, shape: ExpectedShape) -> Validated {
        let Some(text) = value.as_text() else {
            return Validated::Missing;
        };
        match check_shape(key, text, shape) {
            Ok(parsed) => Validated::Valid(parsed),
            Err(err) => {
                self.reset(key, shape, &err).await;
                Validated::Reset
            }
        }
    }

    /// Read `key` through the codec and validate it.
    ///
    /// Only `Error::BackendUnreachable` escapes; codec and shape failures
    /// are healed here.
    pub async fn load(&self, key: &str, shape: ExpectedShape) -> Result<GuardedRead> {
        let raw = self.store.get(key).await?;
        let decoded = match codec::decode(key, raw) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.discard_unexpected(key, &err).await;
                return Ok(GuardedRead {
                    value: Validated::Reset,
                    text: None,
                });
            }
        };
        let value = self.validate(key, &decoded, shape).await;
        let text = match (&value, decoded) {
            (Validated::Valid(_), CachedValue::Raw(text)) => Some(text),
            _ => None,
        };
        Ok(GuardedRead { value, text })
    }

    /// Expected self-healing path for a shape mismatch.
    pub async fn reset(&self, key: &str, shape: ExpectedShape, err: &Error) {
        warn!(
            key = %key,
            expected = shape.describe(),
            error = %err,
            "discarding corrupted cache entry"
        );
        counter!(CACHE_RESETS_TOTAL, "category" => shape.describe(), "reason" => "corrupted")
            .increment(1);
        self.delete_quietly(key).await;
    }

    /// Unexpected backend value type: louder than a shape mismatch, same cure.
    pub async fn discard_unexpected(&self, key: &str, err: &Error) {
        error!(key = %key, error = %err, "unexpected cache value type, deleting key");
        counter!(CACHE_RESETS_TOTAL, "category" => "any", "reason" => "unexpected_type")
            .increment(1);
        self.delete_quietly(key).await;
    }

    async fn delete_quietly(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            warn!(key = %key, error = %e, "failed to delete cache entry during reset");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB_FIELDS: ExpectedShape = ExpectedShape::Object {
        required: &["job_id", "status"],
    };

    #[test]
    fn accepts_timestamp_arrays() {
        let value = check_shape("k", "[1754820948272,1754820949001]", ExpectedShape::TimestampSequence)
            .unwrap();
        assert_eq!(value.as_array().map(Vec::len), Some(2));
        assert!(check_shape("k", "[]", ExpectedShape::TimestampSequence).is_ok());
    }

    #[test]
    fn rejects_bare_number_for_sequence() {
        let err = check_shape("k", "1754820948272", ExpectedShape::TimestampSequence).unwrap_err();
        assert!(matches!(err, Error::CorruptedEntry { .. }));
        assert!(err.to_string().contains("found number"));
    }

    #[test]
    fn rejects_non_integer_elements() {
        assert!(check_shape("k", "[1, \"x\"]", ExpectedShape::TimestampSequence).is_err());
        assert!(check_shape("k", "[1.5]", ExpectedShape::TimestampSequence).is_err());
        assert!(check_shape("k", "[-3]", ExpectedShape::TimestampSequence).is_err());
    }

    #[test]
    fn scalar_accepts_plain_text() {
        let value = check_shape("k", "not json at all", ExpectedShape::Scalar).unwrap();
        assert_eq!(value, Value::String("not json at all".into()));
        assert!(check_shape("k", "17", ExpectedShape::Scalar).is_ok());
        assert!(check_shape("k", "[17]", ExpectedShape::Scalar).is_err());
    }

    #[test]
    fn object_requires_fields() {
        assert!(check_shape("k", r#"{"job_id":"a","status":"success"}"#, JOB_FIELDS).is_ok());
        assert!(check_shape("k", r#"{"job_id":"a"}"#, JOB_FIELDS).is_err());
        assert!(check_shape("k", "plain text", JOB_FIELDS).is_err());
        assert!(check_shape("k", "[1]", JOB_FIELDS).is_err());
    }
}
