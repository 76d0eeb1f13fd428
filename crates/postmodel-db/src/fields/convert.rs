//! Value coercion between caller values, instance values and storage values.
//!
//! Both directions pass `Null` through, accept values already of the right
//! type unchanged, convert values that have an obvious reading (a numeric
//! string for an integer field) and reject everything else with
//! [`PostmodelError::FieldValueError`].

use std::str::FromStr;

use postmodel_core::{PostmodelError, PostmodelResult};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use super::types::{FieldDef, FieldType};
use crate::value::Value;

impl FieldDef {
    /// Converts a storage (or caller-supplied) value to the instance representation.
    pub fn from_storage(&self, value: &Value) -> PostmodelResult<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let converted = match self.field_type {
            FieldType::Int => to_int(value).and_then(|i| i32::try_from(i).ok()).map(Value::from),
            FieldType::SmallInt => to_int(value).and_then(|i| i16::try_from(i).ok()).map(Value::from),
            FieldType::BigInt | FieldType::Auto | FieldType::DataVersion => {
                to_int(value).map(Value::Int)
            }
            FieldType::Char { .. } | FieldType::Text => to_text(value).map(Value::String),
            FieldType::Boolean => to_bool(value).map(Value::Bool),
            FieldType::Decimal { decimal_places, .. } => {
                to_decimal(value).map(|d| Value::Decimal(d.round_dp(decimal_places)))
            }
            FieldType::Datetime { .. } => to_datetime(value).map(Value::DateTime),
            FieldType::Date => to_date(value).map(Value::Date),
            FieldType::TimeDelta => match value {
                Value::Duration(d) => Some(Value::Duration(*d)),
                _ => to_int(value).map(|us| Value::Duration(chrono::Duration::microseconds(us))),
            },
            FieldType::Float => to_float(value).map(Value::Float),
            FieldType::Json => return to_json(value).map(Value::Json),
            FieldType::Uuid => match value {
                Value::Uuid(u) => Some(Value::Uuid(*u)),
                Value::String(s) => uuid::Uuid::parse_str(s).ok().map(Value::Uuid),
                _ => None,
            },
            FieldType::Binary => match value {
                Value::Bytes(b) => Some(Value::Bytes(b.clone())),
                Value::String(s) => Some(Value::Bytes(s.as_bytes().to_vec())),
                _ => None,
            },
        };
        converted.ok_or_else(|| self.value_error(value))
    }

    /// Converts an instance (or caller-supplied) value to the bound parameter.
    pub fn to_storage(&self, value: &Value) -> PostmodelResult<Value> {
        match self.from_storage(value)? {
            Value::Duration(d) => d
                .num_microseconds()
                .map(Value::Int)
                .ok_or_else(|| self.value_error(value)),
            other => Ok(other),
        }
    }

    fn value_error(&self, value: &Value) -> PostmodelError {
        PostmodelError::FieldValueError(format!(
            "field '{}' ({:?}) cannot accept {} value '{value}'",
            self.name,
            self.field_type,
            value.kind()
        ))
    }
}

fn to_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::Float(f) if f.fract().abs() < f64::EPSILON => f.to_i64(),
        Value::Decimal(d) if d.fract().is_zero() => d.to_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Float(f) => Some(*f),
        Value::Int(i) => Some(*i as f64),
        Value::Decimal(d) => d.to_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Decimal(d) => Some(*d),
        Value::Int(i) => Some(Decimal::from(*i)),
        Value::Float(f) => Decimal::from_f64(*f),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn to_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Int(_) | Value::Float(_) | Value::Decimal(_) | Value::Bool(_) | Value::Uuid(_) => {
            Some(value.to_string())
        }
        _ => None,
    }
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Int(0) => Some(false),
        Value::Int(1) => Some(true),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "t" | "1" => Some(true),
            "false" | "f" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn to_datetime(value: &Value) -> Option<chrono::DateTime<chrono::Utc>> {
    match value {
        Value::DateTime(dt) => Some(*dt),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&chrono::Utc)),
        _ => None,
    }
}

fn to_date(value: &Value) -> Option<chrono::NaiveDate> {
    match value {
        Value::Date(d) => Some(*d),
        Value::DateTime(dt) => Some(dt.date_naive()),
        Value::String(s) => chrono::NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok(),
        _ => None,
    }
}

fn to_json(value: &Value) -> PostmodelResult<serde_json::Value> {
    match value {
        Value::String(s) => serde_json::from_str(s).map_err(|e| {
            PostmodelError::FieldValueError(format!("invalid JSON document: {e}"))
        }),
        Value::Bytes(_) | Value::Duration(_) => Err(PostmodelError::FieldValueError(format!(
            "cannot store {} value as JSON",
            value.kind()
        ))),
        other => Ok(other.to_json()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(field_type: FieldType) -> FieldDef {
        FieldDef::new("f", field_type).nullable()
    }

    #[test]
    fn test_null_passthrough() {
        for ft in [FieldType::Int, FieldType::Json, FieldType::TimeDelta, FieldType::Uuid] {
            let f = field(ft);
            assert_eq!(f.to_storage(&Value::Null).unwrap(), Value::Null);
            assert_eq!(f.from_storage(&Value::Null).unwrap(), Value::Null);
        }
    }

    #[test]
    fn test_int_conversions() {
        let f = field(FieldType::Int);
        assert_eq!(f.from_storage(&Value::Int(5)).unwrap(), Value::Int(5));
        assert_eq!(f.from_storage(&Value::from("12")).unwrap(), Value::Int(12));
        assert!(matches!(
            f.from_storage(&Value::from("abc")),
            Err(PostmodelError::FieldValueError(_))
        ));
        assert!(f.from_storage(&Value::Int(i64::MAX)).is_err());
    }

    #[test]
    fn test_text_accepts_numbers() {
        let f = field(FieldType::Char { max_length: 10 });
        assert_eq!(f.to_storage(&Value::Int(42)).unwrap(), Value::from("42"));
        assert!(f.to_storage(&Value::Bytes(vec![1])).is_err());
    }

    #[test]
    fn test_timedelta_roundtrip() {
        let f = field(FieldType::TimeDelta);
        let stored = Value::Int(1_500_000);
        let loaded = f.from_storage(&stored).unwrap();
        assert_eq!(loaded, Value::Duration(chrono::Duration::microseconds(1_500_000)));
        assert_eq!(f.to_storage(&loaded).unwrap(), stored);
        // idempotent on already-stored values
        assert_eq!(f.to_storage(&stored).unwrap(), stored);
    }

    #[test]
    fn test_json_parses_strings() {
        let f = field(FieldType::Json);
        let v = f.from_storage(&Value::from(r#"{"a": [1, 2]}"#)).unwrap();
        assert_eq!(v, Value::Json(serde_json::json!({"a": [1, 2]})));
        assert!(f.from_storage(&Value::from("{bad")).is_err());
        let doc = Value::Json(serde_json::json!(["book", "pen"]));
        assert_eq!(f.to_storage(&doc).unwrap(), doc);
    }

    #[test]
    fn test_uuid_from_string() {
        let f = field(FieldType::Uuid);
        let u = uuid::Uuid::new_v4();
        assert_eq!(f.from_storage(&Value::from(u.to_string())).unwrap(), Value::Uuid(u));
        assert!(f.from_storage(&Value::from("not-a-uuid")).is_err());
    }

    #[test]
    fn test_decimal_rounds_to_places() {
        let f = field(FieldType::Decimal {
            max_digits: 10,
            decimal_places: 2,
        });
        assert_eq!(
            f.from_storage(&Value::from("3.14159")).unwrap(),
            Value::Decimal(Decimal::new(314, 2))
        );
        let stored = Value::Decimal(Decimal::new(1999, 2));
        assert_eq!(f.to_storage(&f.from_storage(&stored).unwrap()).unwrap(), stored);
    }

    #[test]
    fn test_bool_and_date() {
        assert_eq!(
            field(FieldType::Boolean).from_storage(&Value::from("t")).unwrap(),
            Value::Bool(true)
        );
        let d = field(FieldType::Date).from_storage(&Value::from("2024-02-29")).unwrap();
        assert_eq!(
            d,
            Value::Date(chrono::NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
    }

    #[test]
    fn test_datetime_from_rfc3339() {
        let f = field(FieldType::Datetime {
            auto_now: false,
            auto_now_add: false,
        });
        let v = f.from_storage(&Value::from("2020-01-01T10:00:00+02:00")).unwrap();
        match v {
            Value::DateTime(dt) => assert_eq!(dt.to_rfc3339(), "2020-01-01T08:00:00+00:00"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
