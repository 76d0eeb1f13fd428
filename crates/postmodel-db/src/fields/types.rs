//! Field types and the [`FieldDef`] builder.

use std::fmt;

use postmodel_core::{PostmodelError, PostmodelResult};

use crate::value::Value;

/// The semantic type of a model field.
///
/// Each variant maps to one PostgreSQL storage type via
/// [`FieldType::pg_column_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// 32-bit integer.
    Int,
    /// 64-bit integer.
    BigInt,
    /// 16-bit integer.
    SmallInt,
    /// Server-generated 64-bit primary key (`BIGSERIAL`).
    Auto,
    /// Optimistic-concurrency counter, bumped by one on every save.
    DataVersion,
    /// Bounded string.
    Char {
        /// Maximum length in characters, at least 1.
        max_length: u32,
    },
    /// Unbounded string.
    Text,
    /// Boolean.
    Boolean,
    /// Exact decimal.
    Decimal {
        /// Total number of digits, at least 1.
        max_digits: u32,
        /// Digits after the decimal point.
        decimal_places: u32,
    },
    /// UTC timestamp.
    Datetime {
        /// Overwrite with the current time on every save.
        auto_now: bool,
        /// Set to the current time on first save only.
        auto_now_add: bool,
    },
    /// Calendar date.
    Date,
    /// Duration, stored as microseconds.
    TimeDelta,
    /// Double precision float.
    Float,
    /// JSON document (`JSONB`).
    Json,
    /// UUID.
    Uuid,
    /// Raw bytes.
    Binary,
}

impl FieldType {
    /// Returns the SQL column type on PostgreSQL.
    pub fn pg_column_type(&self) -> String {
        match self {
            Self::Int => "INT".to_string(),
            Self::BigInt | Self::DataVersion | Self::TimeDelta => "BIGINT".to_string(),
            Self::SmallInt => "SMALLINT".to_string(),
            Self::Auto => "BIGSERIAL".to_string(),
            Self::Char { max_length } => format!("VARCHAR({max_length})"),
            Self::Text => "TEXT".to_string(),
            Self::Boolean => "BOOL".to_string(),
            Self::Decimal {
                max_digits,
                decimal_places,
            } => format!("DECIMAL({max_digits},{decimal_places})"),
            Self::Datetime { .. } => "TIMESTAMPTZ".to_string(),
            Self::Date => "DATE".to_string(),
            Self::Float => "DOUBLE PRECISION".to_string(),
            Self::Json => "JSONB".to_string(),
            Self::Uuid => "UUID".to_string(),
            Self::Binary => "BYTEA".to_string(),
        }
    }

    /// Returns `true` for string-valued types, which get text lookups.
    pub const fn is_textual(&self) -> bool {
        matches!(self, Self::Char { .. } | Self::Text)
    }

    /// Returns `true` if the column can be compared and indexed.
    pub const fn is_indexable(&self) -> bool {
        !matches!(self, Self::Binary)
    }

    /// Returns `true` if the value is generated by the server on insert.
    pub const fn is_db_generated(&self) -> bool {
        matches!(self, Self::Auto)
    }

    /// Returns `true` if the field is filled in on save.
    pub const fn has_auto_value(&self) -> bool {
        match self {
            Self::DataVersion => true,
            Self::Datetime {
                auto_now,
                auto_now_add,
            } => *auto_now || *auto_now_add,
            _ => false,
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::Char { max_length } if *max_length < 1 => {
                Err("'max_length' must be >= 1".to_string())
            }
            Self::Decimal { max_digits, .. } if *max_digits < 1 => {
                Err("'max_digits' must be >= 1".to_string())
            }
            Self::Decimal {
                max_digits,
                decimal_places,
            } if decimal_places > max_digits => {
                Err("'decimal_places' must not exceed 'max_digits'".to_string())
            }
            Self::Datetime {
                auto_now: true,
                auto_now_add: true,
            } => Err("You can choose only 'auto_now' or 'auto_now_add'".to_string()),
            _ => Ok(()),
        }
    }
}

/// The default value of a field: a literal, or a generator called per instance.
#[derive(Clone)]
pub enum FieldDefault {
    /// A literal value, cloned into each new instance.
    Value(Value),
    /// A zero-argument generator, called once per new instance.
    Generator(fn() -> Value),
}

impl FieldDefault {
    /// Produces the default for a new instance.
    pub fn produce(&self) -> Value {
        match self {
            Self::Value(v) => v.clone(),
            Self::Generator(f) => f(),
        }
    }
}

impl fmt::Debug for FieldDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Generator(_) => f.write_str("Generator(..)"),
        }
    }
}

fn new_uuid() -> Value {
    Value::Uuid(uuid::Uuid::new_v4())
}

/// Complete definition of a model field.
///
/// # Examples
///
/// ```
/// use postmodel_db::fields::{FieldDef, FieldType};
///
/// let f = FieldDef::new("name", FieldType::Char { max_length: 255 })
///     .db_index()
///     .nullable();
/// assert_eq!(f.column, "name");
/// assert!(f.null);
/// assert!(f.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// The attribute name of this field.
    pub name: &'static str,
    /// The database column name (defaults to `name`).
    pub column: String,
    /// The semantic type of this field.
    pub field_type: FieldType,
    /// Whether this field is the (single-column) primary key.
    pub primary_key: bool,
    /// Whether NULL is allowed.
    pub null: bool,
    /// Default value for new instances.
    pub default: Option<FieldDefault>,
    /// Whether a UNIQUE constraint is applied.
    pub unique: bool,
    /// Whether a database index should be created.
    pub db_index: bool,
    /// Column comment.
    pub description: Option<String>,
}

impl FieldDef {
    /// Creates a new non-null field with no default.
    ///
    /// Version counters default to 0. Call [`FieldDef::validate`] (the model
    /// builder does) to check type-specific constraints.
    pub fn new(name: &'static str, field_type: FieldType) -> Self {
        let default = match field_type {
            FieldType::DataVersion => Some(FieldDefault::Value(Value::Int(0))),
            _ => None,
        };
        Self {
            name,
            column: name.to_string(),
            field_type,
            primary_key: false,
            null: false,
            default,
            unique: false,
            db_index: false,
            description: None,
        }
    }

    /// Sets the database column name.
    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Marks this field as the primary key.
    ///
    /// A UUID primary key with no explicit default gets a random v4 generator.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        if self.field_type == FieldType::Uuid && self.default.is_none() {
            self.default = Some(FieldDefault::Generator(new_uuid));
        }
        self
    }

    /// Allows NULL values.
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.null = true;
        self
    }

    /// Marks this field as having a database index.
    #[must_use]
    pub const fn db_index(mut self) -> Self {
        self.db_index = true;
        self
    }

    /// Marks this field as having a UNIQUE constraint.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Sets a literal default value.
    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(FieldDefault::Value(value.into()));
        self
    }

    /// Sets a generator called once per new instance.
    #[must_use]
    pub fn default_fn(mut self, generator: fn() -> Value) -> Self {
        self.default = Some(FieldDefault::Generator(generator));
        self
    }

    /// Sets the column comment.
    #[must_use]
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    /// Checks the type-specific constraints of this field.
    pub fn validate(&self) -> PostmodelResult<()> {
        self.field_type
            .validate()
            .map_err(|msg| PostmodelError::ConfigurationError(format!("field '{}': {msg}", self.name)))
    }

    /// The value a freshly constructed instance holds for this field.
    pub fn default_value(&self) -> Value {
        self.default.as_ref().map_or(Value::Null, FieldDefault::produce)
    }

    /// Returns `true` if the caller must supply a value.
    pub const fn required(&self) -> bool {
        self.default.is_none() && !self.null && !self.field_type.is_db_generated()
    }

    /// Computes the value written on save, or `None` to leave it untouched.
    ///
    /// Version counters increment by exactly one; a counter already at
    /// `i64::MAX` is a [`PostmodelError::FieldValueError`]. `auto_now`
    /// timestamps always refresh; `auto_now_add` timestamps fill in only
    /// before the first write.
    pub fn auto_value(&self, current: &Value, persisted: bool) -> PostmodelResult<Option<Value>> {
        Ok(match self.field_type {
            FieldType::DataVersion => {
                let next = current.as_int().unwrap_or(0).checked_add(1).ok_or_else(|| {
                    PostmodelError::FieldValueError(format!(
                        "{} cannot be incremented past {}",
                        self.name,
                        i64::MAX
                    ))
                })?;
                Some(Value::Int(next))
            }
            FieldType::Datetime { auto_now: true, .. } => Some(Value::DateTime(chrono::Utc::now())),
            FieldType::Datetime {
                auto_now_add: true, ..
            } if !persisted || current.is_null() => Some(Value::DateTime(chrono::Utc::now())),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_def_new_defaults() {
        let f = FieldDef::new("first_name", FieldType::Text);
        assert_eq!(f.name, "first_name");
        assert_eq!(f.column, "first_name");
        assert!(!f.primary_key);
        assert!(!f.null);
        assert!(f.default.is_none());
        assert!(!f.unique);
        assert!(!f.db_index);
        assert!(f.required());
    }

    #[test]
    fn test_field_def_builder() {
        let f = FieldDef::new("email", FieldType::Char { max_length: 200 })
            .column("email_address")
            .unique()
            .db_index()
            .description("contact address");
        assert_eq!(f.column, "email_address");
        assert!(f.unique);
        assert!(f.db_index);
        assert_eq!(f.description.as_deref(), Some("contact address"));
    }

    #[test]
    fn test_pg_column_types() {
        assert_eq!(FieldType::Int.pg_column_type(), "INT");
        assert_eq!(FieldType::Auto.pg_column_type(), "BIGSERIAL");
        assert_eq!(FieldType::DataVersion.pg_column_type(), "BIGINT");
        assert_eq!(FieldType::TimeDelta.pg_column_type(), "BIGINT");
        assert_eq!(FieldType::Char { max_length: 50 }.pg_column_type(), "VARCHAR(50)");
        assert_eq!(
            FieldType::Decimal {
                max_digits: 10,
                decimal_places: 2
            }
            .pg_column_type(),
            "DECIMAL(10,2)"
        );
        assert_eq!(
            FieldType::Datetime {
                auto_now: false,
                auto_now_add: false
            }
            .pg_column_type(),
            "TIMESTAMPTZ"
        );
        assert_eq!(FieldType::Json.pg_column_type(), "JSONB");
        assert_eq!(FieldType::Binary.pg_column_type(), "BYTEA");
    }

    #[test]
    fn test_validate_char_length() {
        let f = FieldDef::new("c", FieldType::Char { max_length: 0 });
        assert!(matches!(f.validate(), Err(PostmodelError::ConfigurationError(_))));
    }

    #[test]
    fn test_validate_decimal() {
        let bad_digits = FieldDef::new(
            "d",
            FieldType::Decimal {
                max_digits: 0,
                decimal_places: 0,
            },
        );
        assert!(bad_digits.validate().is_err());
        let ok = FieldDef::new(
            "d",
            FieldType::Decimal {
                max_digits: 5,
                decimal_places: 0,
            },
        );
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_validate_datetime_flags_exclusive() {
        let f = FieldDef::new(
            "ts",
            FieldType::Datetime {
                auto_now: true,
                auto_now_add: true,
            },
        );
        let err = f.validate().unwrap_err();
        assert!(err.to_string().contains("auto_now"));
    }

    #[test]
    fn test_uuid_pk_gets_generator() {
        let f = FieldDef::new("id", FieldType::Uuid).primary_key();
        let a = f.default_value();
        let b = f.default_value();
        assert!(matches!(a, Value::Uuid(_)));
        assert_ne!(a, b);
    }

    #[test]
    fn test_uuid_pk_keeps_explicit_default() {
        let fixed = uuid::Uuid::nil();
        let f = FieldDef::new("id", FieldType::Uuid).default(fixed).primary_key();
        assert_eq!(f.default_value(), Value::Uuid(fixed));
    }

    #[test]
    fn test_data_version_bump() {
        let f = FieldDef::new("data_ver", FieldType::DataVersion);
        assert_eq!(f.default_value(), Value::Int(0));
        assert_eq!(f.auto_value(&Value::Int(0), false).unwrap(), Some(Value::Int(1)));
        assert_eq!(f.auto_value(&Value::Int(41), true).unwrap(), Some(Value::Int(42)));
    }

    #[test]
    fn test_data_version_at_max_is_an_error() {
        let f = FieldDef::new("data_ver", FieldType::DataVersion);
        let err = f.auto_value(&Value::Int(i64::MAX), true).unwrap_err();
        assert!(matches!(err, PostmodelError::FieldValueError(_)), "{err}");
        assert!(err.to_string().contains("data_ver"));
    }

    #[test]
    fn test_auto_now_add_only_first_save() {
        let f = FieldDef::new(
            "created",
            FieldType::Datetime {
                auto_now: false,
                auto_now_add: true,
            },
        );
        assert!(f.auto_value(&Value::Null, false).unwrap().is_some());
        let now = Value::DateTime(chrono::Utc::now());
        assert!(f.auto_value(&now, true).unwrap().is_none());
    }

    #[test]
    fn test_auto_field_not_required() {
        let f = FieldDef::new("id", FieldType::Auto).primary_key();
        assert!(!f.required());
        assert!(f.field_type.is_db_generated());
    }
}
