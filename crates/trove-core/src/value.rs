//! Metadata values and key filters.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::keys::KeyType;

/// A single metadata value. Absent keys are simply not stored; there is no
/// null value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    Binary(Bytes),
    Enum(String),
}

impl Value {
    /// The key type this value can be stored under.
    pub fn key_type(&self) -> KeyType {
        match self {
            Value::String(_) => KeyType::String,
            Value::Integer(_) => KeyType::Integer,
            Value::Float(_) => KeyType::Float,
            Value::Boolean(_) => KeyType::Boolean,
            Value::DateTime(_) => KeyType::DateTime,
            Value::Binary(_) => KeyType::Binary,
            Value::Enum(_) => KeyType::Enum,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Enum(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::DateTime(dt) => Some(dt),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Order two values of compatible types.
    ///
    /// Integers and floats compare numerically with each other; strings and
    /// enum labels lexicographically. Binary data and mixed types are
    /// unordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            }
            (Value::String(a) | Value::Enum(a), Value::String(b) | Value::Enum(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) | Value::Enum(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::DateTime(dt)
    }
}

impl From<Vec<u8>> for Value {
    fn from(data: Vec<u8>) -> Self {
        Value::Binary(Bytes::from(data))
    }
}

// ---------------------------------------------------------------------------
// KeyFilter
// ---------------------------------------------------------------------------

/// Restriction a caller places on one metadata key.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyFilter {
    /// The key must hold exactly this value.
    Exact(Value),
    /// The key must lie within the inclusive bounds; a missing bound is open.
    Range {
        min: Option<Value>,
        max: Option<Value>,
    },
}

impl KeyFilter {
    pub fn range(min: Option<Value>, max: Option<Value>) -> Self {
        KeyFilter::Range { min, max }
    }

    /// Whether a stored value (or its absence) passes this filter.
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match self {
            KeyFilter::Exact(expected) => {
                expected == value || expected.compare(value) == Some(Ordering::Equal)
            }
            KeyFilter::Range { min, max } => {
                let above = min.as_ref().map_or(true, |min| {
                    matches!(value.compare(min), Some(Ordering::Greater | Ordering::Equal))
                });
                let below = max.as_ref().map_or(true, |max| {
                    matches!(value.compare(max), Some(Ordering::Less | Ordering::Equal))
                });
                above && below
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn integer_and_float_compare_numerically() {
        assert_eq!(Value::from(3_i64).compare(&Value::from(2.5)), Some(Ordering::Greater));
        assert_eq!(Value::from(2.0).compare(&Value::from(2_i64)), Some(Ordering::Equal));
        assert_eq!(Value::from("a").compare(&Value::from(1_i64)), None);
    }

    #[test]
    fn exact_filter() {
        let filter = KeyFilter::Exact(Value::from("Beatles"));
        assert!(filter.matches(Some(&Value::from("Beatles"))));
        assert!(!filter.matches(Some(&Value::from("Stones"))));
        assert!(!filter.matches(None));
    }

    #[test]
    fn range_filter_is_inclusive_and_open_ended() {
        let filter = KeyFilter::range(Some(Value::from(60_i64)), Some(Value::from(120_i64)));
        assert!(filter.matches(Some(&Value::from(60_i64))));
        assert!(filter.matches(Some(&Value::from(120_i64))));
        assert!(!filter.matches(Some(&Value::from(121_i64))));

        let open = KeyFilter::range(None, Some(Value::from(10_i64)));
        assert!(open.matches(Some(&Value::from(-5_i64))));
        assert!(!open.matches(Some(&Value::from("text"))));
    }

    #[test]
    fn datetime_range() {
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let mid = Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap();
        let filter = KeyFilter::range(Some(start.into()), Some(end.into()));
        assert!(filter.matches(Some(&Value::from(mid))));
        assert!(!filter.matches(Some(&Value::from(end + chrono::Duration::days(1)))));
    }

    #[test]
    fn serde_is_tagged() {
        let json = serde_json::to_string(&Value::from(42_i64)).unwrap();
        assert_eq!(json, r#"{"type":"integer","value":42}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Integer(42));
    }
}
