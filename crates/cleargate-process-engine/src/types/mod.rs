//! Foundational types for the event correlation and trigger core.
//!
//! Every persisted type here is `Serialize + Deserialize + Debug + Clone`.
//! All map fields use `BTreeMap` (never `HashMap`) so that correlation keys,
//! variables and job payloads serialize deterministically. Reference ids for
//! the single-instance policy are hashes of that serialization.

pub mod event;
pub mod job;
pub mod process;
pub mod subscription;

pub use event::*;
pub use job::*;
pub use process::*;
pub use subscription::*;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Scalar values
// ---------------------------------------------------------------------------

/// A scalar carried in event payloads, correlation values and process
/// variables.
///
/// Equality is type-sensitive: `Integer(1)` is not equal to `String("1")`
/// and not equal to `Double(1.0)`. Correlation matching relies on this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
}

impl EventValue {
    /// The declared type of this value, or `None` for `Null`.
    pub fn value_type(&self) -> Option<EventValueType> {
        match self {
            Self::Null => None,
            Self::Boolean(_) => Some(EventValueType::Boolean),
            Self::Integer(_) => Some(EventValueType::Integer),
            Self::Double(_) => Some(EventValueType::Double),
            Self::String(_) => Some(EventValueType::String),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<&str> for EventValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for EventValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for EventValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for EventValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<bool> for EventValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<f64> for EventValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

/// Declared type of an event parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventValueType {
    String,
    Integer,
    Boolean,
    Double,
}

impl EventValueType {
    /// Convert a raw JSON value into a typed [`EventValue`].
    ///
    /// `null` is accepted for every type. Integers are not widened to
    /// strings or vice versa; a mismatch returns `None`.
    pub fn coerce(self, raw: &serde_json::Value) -> Option<EventValue> {
        use serde_json::Value as Json;
        match (self, raw) {
            (_, Json::Null) => Some(EventValue::Null),
            (Self::String, Json::String(s)) => Some(EventValue::String(s.clone())),
            (Self::Integer, Json::Number(n)) => n.as_i64().map(EventValue::Integer),
            (Self::Double, Json::Number(n)) => n.as_f64().map(EventValue::Double),
            (Self::Boolean, Json::Bool(b)) => Some(EventValue::Boolean(*b)),
            _ => None,
        }
    }
}

impl fmt::Display for EventValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Double => "double",
        };
        f.write_str(name)
    }
}

/// Process variables: name → scalar value.
pub type Variables = BTreeMap<String, EventValue>;

/// Build a [`Variables`] map from `(name, value)` pairs.
pub fn variables<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Variables
where
    K: Into<String>,
    V: Into<EventValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equality_is_type_sensitive() {
        assert_ne!(EventValue::Integer(1), EventValue::String("1".into()));
        assert_ne!(EventValue::Integer(1), EventValue::Double(1.0));
        assert_eq!(EventValue::from("kermit"), EventValue::String("kermit".into()));
    }

    #[test]
    fn untagged_serialization_keeps_types() {
        let vars = variables([("count", EventValue::Integer(3)), ("name", "gonzo".into())]);
        let json = serde_json::to_value(&vars).unwrap();
        assert_eq!(json, json!({"count": 3, "name": "gonzo"}));

        let back: Variables = serde_json::from_value(json).unwrap();
        assert_eq!(back, vars);
    }

    #[test]
    fn double_survives_round_trip_as_double() {
        let v: EventValue = serde_json::from_str("2.5").unwrap();
        assert_eq!(v, EventValue::Double(2.5));
        let v: EventValue = serde_json::from_str("null").unwrap();
        assert!(v.is_null());
    }

    #[test]
    fn coerce_rejects_mismatched_types() {
        assert_eq!(
            EventValueType::String.coerce(&json!("abc")),
            Some(EventValue::String("abc".into()))
        );
        assert_eq!(EventValueType::Integer.coerce(&json!(7)), Some(EventValue::Integer(7)));
        assert_eq!(EventValueType::Integer.coerce(&json!("7")), None);
        assert_eq!(EventValueType::String.coerce(&json!(7)), None);
        assert_eq!(EventValueType::Integer.coerce(&json!(1.5)), None);
        assert_eq!(EventValueType::Boolean.coerce(&json!(null)), Some(EventValue::Null));
    }
}
