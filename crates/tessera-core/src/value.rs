//! Dynamic SQL values.

use crate::error::{Error, TypeError};
use crate::types::SqlType;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// A dynamically-typed SQL value.
///
/// This enum represents every value the engine binds as a statement parameter
/// or reads back from a result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date (days since epoch)
    Date(i32),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Date(_) => "DATE",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::BigInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            Value::Decimal(s) | Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Int(v) => Some(f64::from(*v)),
            Value::BigInt(v) => Some(*v as f64),
            Value::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Convert this value to the canonical representation for `sql_type`.
    ///
    /// Drivers frequently hand back integer keys with a narrower or wider type
    /// than the mapped property, so identity lookups normalize first.
    #[allow(clippy::result_large_err)]
    pub fn coerce_to(self, sql_type: &SqlType) -> crate::Result<Value> {
        if self.is_null() {
            return Ok(self);
        }
        let mismatch = |actual: &Value| {
            Error::Type(TypeError {
                expected: sql_type.type_name(),
                actual: actual.type_name().to_string(),
                column: None,
                rust_type: None,
            })
        };
        match sql_type {
            SqlType::Integer => match self.as_i64().map(i32::try_from) {
                Some(Ok(v)) => Ok(Value::Int(v)),
                _ => Err(mismatch(&self)),
            },
            SqlType::BigInt => self.as_i64().map(Value::BigInt).ok_or_else(|| mismatch(&self)),
            SqlType::Double => self.as_f64().map(Value::Double).ok_or_else(|| mismatch(&self)),
            SqlType::Boolean => self.as_bool().map(Value::Bool).ok_or_else(|| mismatch(&self)),
            SqlType::VarChar(_) | SqlType::Text => match self {
                Value::Text(_) => Ok(self),
                Value::Int(v) => Ok(Value::Text(v.to_string())),
                Value::BigInt(v) => Ok(Value::Text(v.to_string())),
                other => Err(mismatch(&other)),
            },
            _ => Ok(self),
        }
    }

    /// Render this value for a bind log.
    pub fn render(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(v) => v.to_string(),
            Value::Int(v) => v.to_string(),
            Value::BigInt(v) => v.to_string(),
            Value::Double(v) => v.to_string(),
            Value::Decimal(v) => v.clone(),
            Value::Text(v) => format!("'{}'", v),
            Value::Bytes(b) => format!("[{} bytes]", b.len()),
            Value::Date(d) => format!("date({})", d),
            Value::Timestamp(ts) => format!("ts({})", ts),
            Value::Uuid(u) => u.iter().map(|b| format!("{:02x}", b)).collect(),
            Value::Json(j) => j.to_string(),
        }
    }
}

/// Hash a single value into the hasher.
///
/// Each variant is tagged so `BigInt(42)` and `Text("42")` never collide.
pub fn hash_value(v: &Value, hasher: &mut impl Hasher) {
    match v {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        // Int and BigInt hash alike so a key read as INTEGER matches one bound as BIGINT.
        Value::Int(i) => {
            2u8.hash(hasher);
            i64::from(*i).hash(hasher);
        }
        Value::BigInt(i) => {
            2u8.hash(hasher);
            i.hash(hasher);
        }
        Value::Double(f) => {
            3u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Decimal(s) => {
            4u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Text(s) => {
            5u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Bytes(b) => {
            6u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Date(d) => {
            7u8.hash(hasher);
            d.hash(hasher);
        }
        Value::Timestamp(ts) => {
            8u8.hash(hasher);
            ts.hash(hasher);
        }
        Value::Uuid(u) => {
            9u8.hash(hasher);
            u.hash(hasher);
        }
        Value::Json(j) => {
            10u8.hash(hasher);
            j.to_string().hash(hasher);
        }
    }
}

/// Key equality used by identity lookups: integers compare across widths.
pub fn key_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(_) | Value::BigInt(_), Value::Int(_) | Value::BigInt(_)) => {
            a.as_i64() == b.as_i64()
        }
        _ => a == b,
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_i64().ok_or_else(|| {
            Error::Type(TypeError {
                expected: "BIGINT",
                actual: value.type_name().to_string(),
                column: None,
                rust_type: Some("i64"),
            })
        })
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(s) | Value::Decimal(s) => Ok(s),
            other => Err(Error::Type(TypeError {
                expected: "TEXT",
                actual: other.type_name().to_string(),
                column: None,
                rust_type: Some("String"),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut hasher = DefaultHasher::new();
        hash_value(v, &mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_int_widths_hash_alike() {
        assert_eq!(hash_of(&Value::Int(7)), hash_of(&Value::BigInt(7)));
        assert!(key_eq(&Value::Int(7), &Value::BigInt(7)));
    }

    #[test]
    fn test_text_and_int_differ() {
        assert_ne!(hash_of(&Value::BigInt(42)), hash_of(&Value::Text("42".into())));
        assert!(!key_eq(&Value::BigInt(42), &Value::Text("42".into())));
    }

    #[test]
    fn test_coerce_integer_key() {
        let v = Value::BigInt(12).coerce_to(&SqlType::Integer).unwrap();
        assert_eq!(v, Value::Int(12));
        let v = Value::Int(12).coerce_to(&SqlType::BigInt).unwrap();
        assert_eq!(v, Value::BigInt(12));
        assert!(Value::Bytes(vec![1]).coerce_to(&SqlType::BigInt).is_err());
    }

    #[test]
    fn test_render_for_bind_log() {
        assert_eq!(Value::Text("a".into()).render(), "'a'");
        assert_eq!(Value::Null.render(), "null");
        assert_eq!(Value::BigInt(3).render(), "3");
    }
}
