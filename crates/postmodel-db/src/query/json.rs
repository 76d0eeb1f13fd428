//! Filters and sort keys that reach inside JSON fields.
//!
//! A key such as `data.info.age__gt` names a JSON field (`data`), a path of
//! object keys or array indexes (`info`, `age`) and an optional operator
//! suffix. Path segments are inlined as escaped literals; operands are always
//! bound, as `jsonb` unless the operator works on text or key names.
//!
//! | Suffix | SQL |
//! |---|---|
//! | *(none)* | `path = $n` |
//! | `__not` | `(path <> $n OR path IS NULL)` |
//! | `__gt` `__gte` `__lt` `__lte` | `path > $n` ... |
//! | `__in` / `__not_in` | `path = ANY($n)` / negated, matching NULL |
//! | `__isnull` / `__not_isnull` | `path IS NULL` / `path IS NOT NULL` |
//! | `__has_key` | `path ? $n` |
//! | `__has_keys` / `__has_anykeys` | `path ?& $n` / `path ?\| $n` |
//! | `__contains` / `__contained_by` | `path @> $n` / `path <@ $n` |
//! | `__startswith` `__endswith` `__icontains` `__iexact` ... | text of path `LIKE` ... |

use postmodel_core::utils::text::{quote_ident, quote_literal};
use postmodel_core::{PostmodelError, PostmodelResult};

use super::lookups::{escape_like, text_of, truthy};
use crate::fields::FieldType;
use crate::model::ModelMeta;
use crate::value::Value;

/// Operator applied at the end of a JSON path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonOp {
    /// Equality of the JSON value.
    Exact,
    /// Inequality, also matching a missing value.
    Not,
    /// Membership in a list of JSON values.
    In,
    /// Non-membership, also matching a missing value.
    NotIn,
    /// Missing or SQL NULL.
    IsNull,
    /// Present and not SQL NULL.
    NotIsNull,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// The object has the key.
    HasKey,
    /// The object has all of the keys.
    HasKeys,
    /// The object has any of the keys.
    HasAnyKeys,
    /// JSON containment, `@>`.
    Contains,
    /// JSON containment the other way round, `<@`.
    ContainedBy,
    /// Text of the value starts with the argument.
    StartsWith,
    /// Text of the value ends with the argument.
    EndsWith,
    /// Case-insensitive `StartsWith`.
    IStartsWith,
    /// Case-insensitive `EndsWith`.
    IEndsWith,
    /// Case-insensitive substring match on the text of the value.
    IContains,
    /// Case-insensitive equality of the text of the value.
    IExact,
}

impl JsonOp {
    fn from_suffix(suffix: &str) -> Option<Self> {
        Some(match suffix {
            "not" => Self::Not,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            "isnull" => Self::IsNull,
            "not_isnull" => Self::NotIsNull,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "has_key" => Self::HasKey,
            "has_keys" => Self::HasKeys,
            "has_anykeys" => Self::HasAnyKeys,
            "contains" => Self::Contains,
            "contained_by" => Self::ContainedBy,
            "startswith" => Self::StartsWith,
            "endswith" => Self::EndsWith,
            "istartswith" => Self::IStartsWith,
            "iendswith" => Self::IEndsWith,
            "icontains" => Self::IContains,
            "iexact" => Self::IExact,
            _ => return None,
        })
    }
}

/// A resolved path into a JSON column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    /// Attribute name of the JSON field.
    pub field: &'static str,
    /// Column of the JSON field.
    pub column: String,
    /// Object keys and array indexes, outermost first.
    pub segments: Vec<String>,
}

impl JsonPath {
    /// Resolves `field.seg.seg` against `meta`.
    ///
    /// Returns `Ok(None)` when the first segment is not a JSON field, so the
    /// caller can report the key as unknown.
    pub fn resolve(meta: &ModelMeta, dotted: &str) -> PostmodelResult<Option<Self>> {
        let mut parts = dotted.split('.');
        let Some(field) = parts.next().and_then(|name| meta.field(name)) else {
            return Ok(None);
        };
        if field.field_type != FieldType::Json {
            return Ok(None);
        }
        let segments: Vec<String> = parts.map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(PostmodelError::FieldError(format!(
                "empty segment in JSON path '{dotted}'"
            )));
        }
        Ok(Some(Self {
            field: field.name,
            column: field.column.clone(),
            segments,
        }))
    }

    /// The value at the path, as `jsonb`.
    pub fn jsonb_sql(&self) -> String {
        let mut sql = quote_ident(&self.column);
        for segment in &self.segments {
            sql.push_str("->");
            sql.push_str(&segment_sql(segment));
        }
        sql
    }

    /// The value at the path, as `text`.
    pub fn text_sql(&self) -> String {
        let column = quote_ident(&self.column);
        match self.segments.split_last() {
            None => format!("{column} #>> '{{}}'"),
            Some((last, init)) => {
                let mut sql = column;
                for segment in init {
                    sql.push_str("->");
                    sql.push_str(&segment_sql(segment));
                }
                sql.push_str("->>");
                sql.push_str(&segment_sql(last));
                sql
            }
        }
    }
}

/// A filter on a JSON path, parsed from a filter key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonFilter {
    /// Where the value is read from.
    pub path: JsonPath,
    /// How it is compared.
    pub op: JsonOp,
}

impl JsonFilter {
    /// Parses a filter key such as `data.info.age__gte`.
    ///
    /// Returns `Ok(None)` when the key does not start with a JSON field.
    pub fn parse(meta: &ModelMeta, key: &str) -> PostmodelResult<Option<Self>> {
        let (dotted, op) = match key.rsplit_once("__") {
            Some((head, suffix)) => match JsonOp::from_suffix(suffix) {
                Some(op) => (head, op),
                None => (key, JsonOp::Exact),
            },
            None => (key, JsonOp::Exact),
        };
        Ok(JsonPath::resolve(meta, dotted)?.map(|path| Self { path, op }))
    }

    /// Renders the condition, pushing its operand onto `params`.
    pub fn compile(&self, value: &Value, params: &mut Vec<Value>) -> PostmodelResult<String> {
        let path = self.path.jsonb_sql();
        let sql = match self.op {
            JsonOp::Exact if value.is_null() => format!("{path} IS NULL"),
            JsonOp::Not if value.is_null() => format!("{path} IS NOT NULL"),
            JsonOp::Exact => format!("{path} = {}", bind(params, jsonb(value))),
            JsonOp::Not => {
                let p = bind(params, jsonb(value));
                format!("({path} <> {p} OR {path} IS NULL)")
            }
            JsonOp::In | JsonOp::NotIn => {
                let Value::List(items) = value else {
                    return Err(self.expected_list(value));
                };
                let p = bind(params, Value::List(items.iter().map(jsonb).collect()));
                if self.op == JsonOp::In {
                    format!("{path} = ANY({p})")
                } else {
                    format!("(NOT ({path} = ANY({p})) OR {path} IS NULL)")
                }
            }
            JsonOp::IsNull | JsonOp::NotIsNull => {
                if truthy(value) == (self.op == JsonOp::IsNull) {
                    format!("{path} IS NULL")
                } else {
                    format!("{path} IS NOT NULL")
                }
            }
            JsonOp::Gt => format!("{path} > {}", bind(params, jsonb(value))),
            JsonOp::Gte => format!("{path} >= {}", bind(params, jsonb(value))),
            JsonOp::Lt => format!("{path} < {}", bind(params, jsonb(value))),
            JsonOp::Lte => format!("{path} <= {}", bind(params, jsonb(value))),
            JsonOp::HasKey => {
                format!("{path} ? {}", bind(params, Value::String(text_of(value))))
            }
            JsonOp::HasKeys | JsonOp::HasAnyKeys => {
                let keys = match value {
                    Value::List(items) => items.iter().map(|v| Value::String(text_of(v))).collect(),
                    Value::String(s) => vec![Value::String(s.clone())],
                    other => return Err(self.expected_list(other)),
                };
                let operator = if self.op == JsonOp::HasKeys { "?&" } else { "?|" };
                format!("{path} {operator} {}", bind(params, Value::List(keys)))
            }
            JsonOp::Contains => format!("{path} @> {}", bind(params, jsonb(value))),
            JsonOp::ContainedBy => format!("{path} <@ {}", bind(params, jsonb(value))),
            JsonOp::StartsWith | JsonOp::EndsWith => {
                let text = self.path.text_sql();
                let escaped = escape_like(&text_of(value));
                let pattern = if self.op == JsonOp::StartsWith {
                    format!("{escaped}%")
                } else {
                    format!("%{escaped}")
                };
                format!("{text} LIKE {}", bind(params, Value::String(pattern)))
            }
            JsonOp::IStartsWith | JsonOp::IEndsWith | JsonOp::IContains => {
                let text = self.path.text_sql();
                let escaped = escape_like(&text_of(value));
                let pattern = match self.op {
                    JsonOp::IStartsWith => format!("{escaped}%"),
                    JsonOp::IEndsWith => format!("%{escaped}"),
                    _ => format!("%{escaped}%"),
                };
                format!("UPPER({text}) LIKE UPPER({})", bind(params, Value::String(pattern)))
            }
            JsonOp::IExact => {
                let text = self.path.text_sql();
                format!("UPPER({text}) = UPPER({})", bind(params, Value::String(text_of(value))))
            }
        };
        Ok(sql)
    }

    fn expected_list(&self, value: &Value) -> PostmodelError {
        PostmodelError::ParamsError(format!(
            "JSON lookup on '{}' expects a list, got {}",
            self.path.field,
            value.kind()
        ))
    }
}

/// Pushes `value` and returns its placeholder.
pub(crate) fn bind(params: &mut Vec<Value>, value: Value) -> String {
    params.push(value);
    format!("${}", params.len())
}

fn jsonb(value: &Value) -> Value {
    match value {
        Value::Json(doc) => Value::Json(doc.clone()),
        other => Value::Json(other.to_json()),
    }
}

fn segment_sql(segment: &str) -> String {
    if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
        segment.to_string()
    } else {
        quote_literal(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldDef;
    use serde_json::json;

    fn meta() -> ModelMeta {
        ModelMeta::builder("JsonModel")
            .field(FieldDef::new("id", FieldType::Auto).primary_key())
            .field(FieldDef::new("value", FieldType::Json))
            .field(FieldDef::new("name", FieldType::Text))
            .build()
            .unwrap()
    }

    fn compile(key: &str, value: Value) -> (String, Vec<Value>) {
        let meta = meta();
        let filter = JsonFilter::parse(&meta, key).unwrap().unwrap();
        let mut params = Vec::new();
        let sql = filter.compile(&value, &mut params).unwrap();
        (sql, params)
    }

    #[test]
    fn test_non_json_field_is_not_a_path() {
        let meta = meta();
        assert!(JsonFilter::parse(&meta, "name.first").unwrap().is_none());
        assert!(JsonFilter::parse(&meta, "missing__gt").unwrap().is_none());
        assert!(JsonFilter::parse(&meta, "value..x").is_err());
    }

    #[test]
    fn test_nested_comparison_binds_jsonb() {
        let (sql, params) = compile("value.info.age__gt", Value::Int(20));
        assert_eq!(sql, "\"value\"->'info'->'age' > $1");
        assert_eq!(params, vec![Value::Json(json!(20))]);
    }

    #[test]
    fn test_array_index_segment() {
        let (sql, _) = compile("value.tags.0", Value::from("book"));
        assert_eq!(sql, "\"value\"->'tags'->0 = $1");
    }

    #[test]
    fn test_segments_are_escaped() {
        let (sql, _) = compile("value.it's", Value::Int(1));
        assert_eq!(sql, "\"value\"->'it''s' = $1");
    }

    #[test]
    fn test_key_operators() {
        let (sql, params) = compile("value__has_key", Value::from("info"));
        assert_eq!(sql, "\"value\" ? $1");
        assert_eq!(params, vec![Value::from("info")]);

        let (sql, params) = compile("value.info__has_keys", crate::value::list(["a", "b"]));
        assert_eq!(sql, "\"value\"->'info' ?& $1");
        assert_eq!(params.len(), 1);

        let (sql, _) = compile("value__has_anykeys", Value::from("a"));
        assert_eq!(sql, "\"value\" ?| $1");
    }

    #[test]
    fn test_containment() {
        let (sql, params) = compile("value__contains", Value::Json(json!({"tags": ["pen"]})));
        assert_eq!(sql, "\"value\" @> $1");
        assert_eq!(params, vec![Value::Json(json!({"tags": ["pen"]}))]);
    }

    #[test]
    fn test_text_operators_use_text_extraction() {
        let (sql, params) = compile("value.info.name__istartswith", Value::from("jo"));
        assert_eq!(sql, "UPPER(\"value\"->'info'->>'name') LIKE UPPER($1)");
        assert_eq!(params, vec![Value::from("jo%")]);
    }

    #[test]
    fn test_null_checks_bind_nothing() {
        let (sql, params) = compile("value.info__isnull", Value::Bool(true));
        assert_eq!(sql, "\"value\"->'info' IS NULL");
        assert!(params.is_empty());
        let (sql, params) = compile("value.info", Value::Null);
        assert_eq!(sql, "\"value\"->'info' IS NULL");
        assert!(params.is_empty());
    }

    #[test]
    fn test_in_requires_list() {
        let meta = meta();
        let filter = JsonFilter::parse(&meta, "value.a__in").unwrap().unwrap();
        let mut params = Vec::new();
        assert!(matches!(
            filter.compile(&Value::Int(1), &mut params),
            Err(PostmodelError::ParamsError(_))
        ));
        let sql = filter.compile(&crate::value::list([1, 2]), &mut params).unwrap();
        assert_eq!(sql, "\"value\"->'a' = ANY($1)");
        assert_eq!(
            params,
            vec![Value::List(vec![Value::Json(json!(1)), Value::Json(json!(2))])]
        );
    }

    #[test]
    fn test_unknown_suffix_is_part_of_path() {
        let meta = meta();
        let filter = JsonFilter::parse(&meta, "value.a__b").unwrap().unwrap();
        assert_eq!(filter.op, JsonOp::Exact);
        assert_eq!(filter.path.segments, vec!["a__b".to_string()]);
    }

    #[test]
    fn test_text_sql_whole_document() {
        let meta = meta();
        let path = JsonPath::resolve(&meta, "value").unwrap().unwrap();
        assert_eq!(path.text_sql(), "\"value\" #>> '{}'");
    }
}
