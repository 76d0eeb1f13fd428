//! Backend-agnostic value type.
//!
//! [`Value`] carries field values on instances, filter arguments in
//! expressions, bound statement parameters, and decoded row cells. Typed
//! access goes through [`FromValue`].

use std::fmt;

use postmodel_core::{PostmodelError, PostmodelResult};
use rust_decimal::Decimal;

/// A backend-agnostic representation of a database value.
///
/// # Examples
///
/// ```
/// use postmodel_db::value::Value;
///
/// assert_eq!(Value::from(42_i32), Value::Int(42));
/// assert_eq!(Value::from("hello"), Value::String("hello".to_string()));
/// assert_eq!(Value::from(None::<i64>), Value::Null);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// A boolean value.
    Bool(bool),
    /// A 64-bit signed integer.
    Int(i64),
    /// A 64-bit floating-point number.
    Float(f64),
    /// An exact decimal number.
    Decimal(Decimal),
    /// A UTF-8 string.
    String(String),
    /// Raw binary data.
    Bytes(Vec<u8>),
    /// A date without time.
    Date(chrono::NaiveDate),
    /// A UTC timestamp.
    DateTime(chrono::DateTime<chrono::Utc>),
    /// A duration.
    Duration(chrono::Duration),
    /// A UUID value.
    Uuid(uuid::Uuid),
    /// A JSON document.
    Json(serde_json::Value),
    /// A list of values, used for `__in` arguments and composite keys.
    List(Vec<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Date(d) => write!(f, "{d}"),
            Self::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            Self::Duration(d) => write!(f, "{d}"),
            Self::Uuid(u) => write!(f, "{u}"),
            Self::Json(j) => write!(f, "{j}"),
            Self::List(vals) => {
                write!(f, "(")?;
                for (i, v) in vals.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
        }
    }
}

// ── From implementations ───────────────────────────────────────────────

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<chrono::NaiveDate> for Value {
    fn from(v: chrono::NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for Value {
    fn from(v: chrono::DateTime<chrono::Utc>) -> Self {
        Self::DateTime(v)
    }
}

impl From<chrono::Duration> for Value {
    fn from(v: chrono::Duration) -> Self {
        Self::Duration(v)
    }
}

impl From<uuid::Uuid> for Value {
    fn from(v: uuid::Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Builds a [`Value::List`] from any iterator of convertible items.
///
/// # Examples
///
/// ```
/// use postmodel_db::value::{list, Value};
///
/// assert_eq!(list([2, 4]), Value::List(vec![Value::Int(2), Value::Int(4)]));
/// ```
pub fn list<I, T>(items: I) -> Value
where
    I: IntoIterator<Item = T>,
    T: Into<Value>,
{
    Value::List(items.into_iter().map(Into::into).collect())
}

impl Value {
    /// Returns `true` if this value is `Null`.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Attempts to extract a boolean value.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Attempts to extract an integer value.
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Attempts to extract a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Short name of the variant, used in error messages.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Date(_) => "date",
            Self::DateTime(_) => "datetime",
            Self::Duration(_) => "duration",
            Self::Uuid(_) => "uuid",
            Self::Json(_) => "json",
            Self::List(_) => "list",
        }
    }

    /// Converts this value into a JSON document.
    ///
    /// Dates and timestamps become ISO-8601 strings, decimals and UUIDs become
    /// strings, bytes become lowercase hex, durations become microseconds.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Self::Null => J::Null,
            Self::Bool(b) => J::Bool(*b),
            Self::Int(i) => J::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map_or(J::Null, J::Number),
            Self::Decimal(d) => J::String(d.to_string()),
            Self::String(s) => J::String(s.clone()),
            Self::Bytes(b) => J::String(hex::encode(b)),
            Self::Date(d) => J::String(d.to_string()),
            Self::DateTime(dt) => J::String(dt.to_rfc3339()),
            Self::Duration(d) => d.num_microseconds().map_or(J::Null, J::from),
            Self::Uuid(u) => J::String(u.to_string()),
            Self::Json(j) => j.clone(),
            Self::List(items) => J::Array(items.iter().map(Self::to_json).collect()),
        }
    }
}

// ── Typed extraction ────────────────────────────────────────────────────

/// Trait for converting a [`Value`] to a concrete Rust type.
pub trait FromValue: Sized {
    /// Attempts to convert a value reference to this type.
    fn from_value(value: &Value) -> PostmodelResult<Self>;
}

fn mismatch<T>(expected: &str, value: &Value) -> PostmodelResult<T> {
    Err(PostmodelError::FieldValueError(format!(
        "expected {expected}, got {}",
        value.kind()
    )))
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> PostmodelResult<Self> {
        match value {
            Value::Int(i) => Ok(*i),
            _ => mismatch("int", value),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> PostmodelResult<Self> {
        let wide = i64::from_value(value)?;
        Self::try_from(wide).map_err(|e| {
            PostmodelError::FieldValueError(format!("int value out of i32 range: {e}"))
        })
    }
}

impl FromValue for i16 {
    fn from_value(value: &Value) -> PostmodelResult<Self> {
        let wide = i64::from_value(value)?;
        Self::try_from(wide).map_err(|e| {
            PostmodelError::FieldValueError(format!("int value out of i16 range: {e}"))
        })
    }
}

impl FromValue for f64 {
    #[allow(clippy::cast_precision_loss)]
    fn from_value(value: &Value) -> PostmodelResult<Self> {
        match value {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as Self),
            _ => mismatch("float", value),
        }
    }
}

impl FromValue for Decimal {
    fn from_value(value: &Value) -> PostmodelResult<Self> {
        match value {
            Value::Decimal(d) => Ok(*d),
            Value::Int(i) => Ok(Self::from(*i)),
            _ => mismatch("decimal", value),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> PostmodelResult<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            _ => mismatch("bool", value),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> PostmodelResult<Self> {
        match value {
            Value::String(s) => Ok(s.clone()),
            _ => mismatch("string", value),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> PostmodelResult<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            _ => mismatch("bytes", value),
        }
    }
}

impl FromValue for chrono::NaiveDate {
    fn from_value(value: &Value) -> PostmodelResult<Self> {
        match value {
            Value::Date(d) => Ok(*d),
            _ => mismatch("date", value),
        }
    }
}

impl FromValue for chrono::DateTime<chrono::Utc> {
    fn from_value(value: &Value) -> PostmodelResult<Self> {
        match value {
            Value::DateTime(dt) => Ok(*dt),
            _ => mismatch("datetime", value),
        }
    }
}

impl FromValue for chrono::Duration {
    fn from_value(value: &Value) -> PostmodelResult<Self> {
        match value {
            Value::Duration(d) => Ok(*d),
            _ => mismatch("duration", value),
        }
    }
}

impl FromValue for uuid::Uuid {
    fn from_value(value: &Value) -> PostmodelResult<Self> {
        match value {
            Value::Uuid(u) => Ok(*u),
            _ => mismatch("uuid", value),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> PostmodelResult<Self> {
        match value {
            Value::Json(j) => Ok(j.clone()),
            _ => mismatch("json", value),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> PostmodelResult<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> PostmodelResult<Self> {
        match value {
            Value::Null => Ok(None),
            _ => T::from_value(value).map(Some),
        }
    }
}
