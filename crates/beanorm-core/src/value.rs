//! Dynamic scalar values carried by beans, rows and statement binds.

use crate::error::{Error, TypeError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A dynamically-typed SQL value.
///
/// Property values, id components, bind parameters and result columns all use
/// this one representation. Equality is structural; use [`Value::key_eq`] when
/// integer widths should not matter (ids, cache keys).
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
            Value::BigInt(v) | Value::Timestamp(v) => Some(*v),
            Value::Date(v) => Some(i64::from(*v)),
            Value::Bool(v) => Some(i64::from(*v)),
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

    /// Equality that ignores integer width (`Int(1)` equals `BigInt(1)`).
    ///
    /// Ids and cache keys compare with this so a value read back from the
    /// store matches the one the application supplied.
    pub fn key_eq(&self, other: &Value) -> bool {
        match (self.integer_key(), other.integer_key()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => match (self, other) {
                (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
                _ => self == other,
            },
            _ => false,
        }
    }

    /// Feed this value into a hasher consistently with [`Value::key_eq`].
    pub fn hash_key<H: Hasher>(&self, state: &mut H) {
        if let Some(i) = self.integer_key() {
            state.write_u8(1);
            i.hash(state);
            return;
        }
        match self {
            Value::Null => state.write_u8(0),
            Value::Bool(b) => {
                state.write_u8(2);
                b.hash(state);
            }
            Value::Double(f) => {
                state.write_u8(3);
                f.to_bits().hash(state);
            }
            Value::Decimal(s) => {
                state.write_u8(4);
                s.hash(state);
            }
            Value::Text(s) => {
                state.write_u8(5);
                s.hash(state);
            }
            Value::Bytes(b) => {
                state.write_u8(6);
                b.hash(state);
            }
            Value::Date(d) => {
                state.write_u8(7);
                d.hash(state);
            }
            Value::Timestamp(t) => {
                state.write_u8(8);
                t.hash(state);
            }
            Value::Uuid(u) => {
                state.write_u8(9);
                u.hash(state);
            }
            Value::Json(j) => {
                state.write_u8(10);
                j.to_string().hash(state);
            }
            Value::Int(_) | Value::BigInt(_) => {}
        }
    }

    /// Ordering used by stores that evaluate predicates and ORDER BY in memory.
    ///
    /// NULL sorts first; values of unrelated types are incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            _ => {
                if let (Some(a), Some(b)) = (self.integer_key(), other.integer_key()) {
                    return Some(a.cmp(&b));
                }
                match (self, other) {
                    (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
                    (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
                    (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
                    (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
                    (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
                    (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
                    _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
                }
            }
        }
    }

    fn integer_key(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::BigInt(v) | Value::Timestamp(v) => write!(f, "{v}"),
            Value::Date(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Decimal(s) => f.write_str(s),
            Value::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Uuid(u) => {
                for byte in u {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::Json(j) => write!(f, "{j}"),
        }
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

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
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

fn type_error(expected: &'static str, value: &Value) -> Error {
    Error::Type(TypeError {
        expected,
        actual: value.type_name().to_string(),
        column: None,
    })
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_bool().ok_or_else(|| type_error("bool", &value))
    }
}

impl TryFrom<Value> for i32 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match &value {
            Value::Int(v) => Ok(*v),
            Value::BigInt(v) => i32::try_from(*v).map_err(|_| type_error("i32", &value)),
            _ => Err(type_error("i32", &value)),
        }
    }
}

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match &value {
            Value::Int(_) | Value::BigInt(_) | Value::Timestamp(_) => {
                value.as_i64().ok_or_else(|| type_error("i64", &value))
            }
            _ => Err(type_error("i64", &value)),
        }
    }
}

impl TryFrom<Value> for f64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_f64().ok_or_else(|| type_error("f64", &value))
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(s) | Value::Decimal(s) => Ok(s),
            other => Err(type_error("String", &other)),
        }
    }
}

impl<T> TryFrom<Value> for Option<T>
where
    T: TryFrom<Value, Error = Error>,
{
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if value.is_null() {
            Ok(None)
        } else {
            T::try_from(value).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn key_hash(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash_key(&mut h);
        h.finish()
    }

    #[test]
    fn test_key_eq_ignores_integer_width() {
        assert!(Value::Int(42).key_eq(&Value::BigInt(42)));
        assert_eq!(key_hash(&Value::Int(42)), key_hash(&Value::BigInt(42)));
        assert!(!Value::Int(42).key_eq(&Value::Text("42".into())));
        assert_ne!(Value::Int(42), Value::BigInt(42));
    }

    #[test]
    fn test_compare() {
        assert_eq!(
            Value::Int(1).compare(&Value::BigInt(2)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Null.compare(&Value::Int(0)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Text("b".into()).compare(&Value::Text("a".into())),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::Text("a".into()).compare(&Value::Bool(true)), None);
    }

    #[test]
    fn test_try_from() {
        assert_eq!(i64::try_from(Value::Int(7)).unwrap(), 7);
        assert_eq!(i32::try_from(Value::BigInt(7)).unwrap(), 7);
        assert!(i32::try_from(Value::BigInt(i64::MAX)).is_err());
        assert_eq!(String::try_from(Value::from("open")).unwrap(), "open");
        let none: Option<i64> = Option::try_from(Value::Null).unwrap();
        assert!(none.is_none());
        assert!(bool::try_from(Value::Text("x".into())).is_err());
    }

    #[test]
    fn test_display_quotes_text() {
        assert_eq!(Value::from("it's").to_string(), "'it''s'");
        assert_eq!(Value::Null.to_string(), "NULL");
        assert_eq!(Value::BigInt(3).to_string(), "3");
    }
}
