//! Declared column types and the scalar conversion contract.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;

/// SQL data types a property can be declared with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlType {
    Integer,
    BigInt,
    Double,
    Decimal { precision: u8, scale: u8 },
    Boolean,
    VarChar(u32),
    Text,
    Blob,
    Date,
    Timestamp,
    Uuid,
    Json,
}

impl SqlType {
    /// Get the SQL type name for this type.
    pub fn sql_name(&self) -> String {
        match self {
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Decimal { precision, scale } => format!("DECIMAL({}, {})", precision, scale),
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::VarChar(len) => format!("VARCHAR({})", len),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
            SqlType::Uuid => "UUID".to_string(),
            SqlType::Json => "JSON".to_string(),
        }
    }

    /// Types usable as a version column.
    pub const fn is_versionable(&self) -> bool {
        matches!(
            self,
            SqlType::Integer | SqlType::BigInt | SqlType::Timestamp
        )
    }
}

/// Converts between store column values and bean property values.
///
/// Invoked once per scalar property per materialized row (`read`) and once per
/// bound property value (`bind`).
pub trait ScalarTypeRegistry: Send + Sync {
    /// Convert a raw store value into the bean-level value for `ty`.
    fn read(&self, ty: &SqlType, raw: Value) -> Result<Value>;

    /// Convert a bean-level value into the value bound to a statement.
    fn bind(&self, ty: &SqlType, value: &Value) -> Result<Value>;
}

/// The default registry: integer widening/narrowing plus text and bool coercions.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardTypes;

impl StandardTypes {
    fn convert(ty: &SqlType, raw: Value) -> Result<Value> {
        if raw.is_null() {
            return Ok(Value::Null);
        }
        let converted = match (ty, &raw) {
            (SqlType::Integer, Value::Int(_)) => Some(raw.clone()),
            (SqlType::Integer, Value::BigInt(v)) => i32::try_from(*v).ok().map(Value::Int),
            (SqlType::Integer, Value::Bool(b)) => Some(Value::Int(i32::from(*b))),
            (SqlType::Integer, Value::Text(s)) => s.trim().parse().ok().map(Value::Int),

            (SqlType::BigInt, Value::Text(s)) => s.trim().parse().ok().map(Value::BigInt),
            (SqlType::BigInt, _) => raw.as_i64().map(Value::BigInt),

            (SqlType::Double, Value::Text(s)) => s.trim().parse().ok().map(Value::Double),
            (SqlType::Double, _) => raw.as_f64().map(Value::Double),

            (SqlType::Decimal { .. }, Value::Decimal(_)) => Some(raw.clone()),
            (SqlType::Decimal { .. }, Value::Text(s)) => Some(Value::Decimal(s.clone())),
            (SqlType::Decimal { .. }, Value::Int(_) | Value::BigInt(_) | Value::Double(_)) => {
                Some(Value::Decimal(raw.to_string()))
            }

            (SqlType::Boolean, Value::Text(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" | "yes" => Some(Value::Bool(true)),
                "false" | "f" | "0" | "no" => Some(Value::Bool(false)),
                _ => None,
            },
            (SqlType::Boolean, _) => raw.as_bool().map(Value::Bool),

            (SqlType::Text | SqlType::VarChar(_), Value::Text(_)) => Some(raw.clone()),
            (SqlType::Text | SqlType::VarChar(_), Value::Decimal(s)) => {
                Some(Value::Text(s.clone()))
            }

            (SqlType::Blob, Value::Bytes(_)) => Some(raw.clone()),
            (SqlType::Blob, Value::Text(s)) => Some(Value::Bytes(s.as_bytes().to_vec())),

            (SqlType::Date, Value::Date(_)) => Some(raw.clone()),
            (SqlType::Date, Value::Int(v)) => Some(Value::Date(*v)),
            (SqlType::Date, Value::BigInt(v)) => i32::try_from(*v).ok().map(Value::Date),

            (SqlType::Timestamp, Value::Timestamp(_)) => Some(raw.clone()),
            (SqlType::Timestamp, Value::Int(_) | Value::BigInt(_)) => {
                raw.as_i64().map(Value::Timestamp)
            }

            (SqlType::Uuid, Value::Uuid(_)) => Some(raw.clone()),
            (SqlType::Uuid, Value::Bytes(b)) => <[u8; 16]>::try_from(b.as_slice())
                .ok()
                .map(Value::Uuid),

            (SqlType::Json, Value::Json(_)) => Some(raw.clone()),
            (SqlType::Json, Value::Text(s)) => serde_json::from_str(s).ok().map(Value::Json),

            _ => None,
        };
        converted.ok_or_else(|| {
            Error::Type(TypeError {
                expected: sql_type_label(ty),
                actual: raw.type_name().to_string(),
                column: None,
            })
        })
    }
}

fn sql_type_label(ty: &SqlType) -> &'static str {
    match ty {
        SqlType::Integer => "INTEGER",
        SqlType::BigInt => "BIGINT",
        SqlType::Double => "DOUBLE",
        SqlType::Decimal { .. } => "DECIMAL",
        SqlType::Boolean => "BOOLEAN",
        SqlType::VarChar(_) | SqlType::Text => "TEXT",
        SqlType::Blob => "BLOB",
        SqlType::Date => "DATE",
        SqlType::Timestamp => "TIMESTAMP",
        SqlType::Uuid => "UUID",
        SqlType::Json => "JSON",
    }
}

impl ScalarTypeRegistry for StandardTypes {
    fn read(&self, ty: &SqlType, raw: Value) -> Result<Value> {
        Self::convert(ty, raw)
    }

    fn bind(&self, ty: &SqlType, value: &Value) -> Result<Value> {
        Self::convert(ty, value.clone())
    }
}
