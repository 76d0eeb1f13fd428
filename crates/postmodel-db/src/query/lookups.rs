//! The per-field filter catalog.
//!
//! For every model field `f` the catalog holds one [`FilterInfo`] per lookup
//! key (`f`, `f__not`, `f__in`, `f__gt`, `f__icontains`, ...). Each entry
//! names the target column, the comparison ([`Lookup`]) and the
//! [`ValueEncoder`] applied to the caller's argument before binding.
//!
//! | Suffix | SQL |
//! |---|---|
//! | *(none)* | `col = $n` |
//! | `__not` | `(col <> $n OR col IS NULL)` |
//! | `__in` | `col = ANY($n)` |
//! | `__not_in` | `(NOT (col = ANY($n)) OR col IS NULL)` |
//! | `__isnull` / `__not_isnull` | `col IS NULL` / `col IS NOT NULL` (no parameter) |
//! | `__gt` `__gte` `__lt` `__lte` | `col > $n` ... |
//! | `__contains` `__startswith` `__endswith` | `col LIKE $n` |
//! | `__iexact` | `UPPER(col) = UPPER($n)` |
//! | `__icontains` `__istartswith` `__iendswith` | `UPPER(col) LIKE UPPER($n)` |

use postmodel_core::{PostmodelError, PostmodelResult};

use crate::fields::FieldDef;
use crate::value::Value;

/// The comparison a catalog entry performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// `col = x`
    Exact,
    /// `col <> x`, also matching NULL.
    NotExact,
    /// `col = ANY(list)`
    In,
    /// Not in the list, also matching NULL.
    NotIn,
    /// `IS NULL` when the flag is true, `IS NOT NULL` otherwise.
    IsNull,
    /// `IS NOT NULL` when the flag is true, `IS NULL` otherwise.
    NotIsNull,
    /// `col > x`
    Gt,
    /// `col >= x`
    Gte,
    /// `col < x`
    Lt,
    /// `col <= x`
    Lte,
    /// `col LIKE pattern`
    Like,
    /// `UPPER(col) = UPPER(x)`
    IExact,
    /// `UPPER(col) LIKE UPPER(pattern)`
    ILike,
}

/// Where a LIKE pattern places its wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikePattern {
    /// `%value%`
    Contains,
    /// `value%`
    StartsWith,
    /// `%value`
    EndsWith,
}

/// Transformation applied to a filter argument before it is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueEncoder {
    /// The field's own storage conversion.
    Field,
    /// Storage conversion applied to each element of a list.
    FieldList,
    /// Truthiness; selects the SQL form and binds nothing.
    Bool,
    /// String conversion.
    Text,
    /// String conversion, LIKE-escaped and wrapped in wildcards.
    Like(LikePattern),
}

/// An encoded filter argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Encoded {
    /// A value to bind as the next positional parameter.
    Param(Value),
    /// A flag consumed at compile time; nothing is bound.
    Flag(bool),
}

/// One entry of a model's filter catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterInfo {
    /// Attribute name of the filtered field.
    pub field: &'static str,
    /// Column the condition applies to.
    pub column: String,
    /// The comparison.
    pub lookup: Lookup,
    /// The argument encoder.
    pub encoder: ValueEncoder,
}

impl FilterInfo {
    /// Encodes a caller-supplied argument for this entry.
    pub fn encode(&self, field: &FieldDef, value: &Value) -> PostmodelResult<Encoded> {
        let encoded = match self.encoder {
            ValueEncoder::Field => Encoded::Param(field.to_storage(value)?),
            ValueEncoder::FieldList => {
                let Value::List(items) = value else {
                    return Err(PostmodelError::ParamsError(format!(
                        "lookup on '{}' expects a list, got {}",
                        self.field,
                        value.kind()
                    )));
                };
                let converted = items
                    .iter()
                    .map(|item| field.to_storage(item))
                    .collect::<PostmodelResult<Vec<_>>>()?;
                Encoded::Param(Value::List(converted))
            }
            ValueEncoder::Bool => Encoded::Flag(truthy(value)),
            ValueEncoder::Text => Encoded::Param(Value::String(text_of(value))),
            ValueEncoder::Like(pattern) => {
                let escaped = escape_like(&text_of(value));
                let wrapped = match pattern {
                    LikePattern::Contains => format!("%{escaped}%"),
                    LikePattern::StartsWith => format!("{escaped}%"),
                    LikePattern::EndsWith => format!("%{escaped}"),
                };
                Encoded::Param(Value::String(wrapped))
            }
        };
        Ok(encoded)
    }
}

impl Lookup {
    /// Renders the condition for an already-quoted column expression.
    ///
    /// `param` is the placeholder of the bound argument; `flag` is used by
    /// the null checks, which bind nothing.
    pub fn render(self, column: &str, param: Option<&str>, flag: bool) -> String {
        let p = param.unwrap_or("NULL");
        match self {
            Self::Exact => format!("{column} = {p}"),
            Self::NotExact => format!("({column} <> {p} OR {column} IS NULL)"),
            Self::In => format!("{column} = ANY({p})"),
            Self::NotIn => format!("(NOT ({column} = ANY({p})) OR {column} IS NULL)"),
            Self::IsNull | Self::NotIsNull => {
                if flag == (self == Self::IsNull) {
                    format!("{column} IS NULL")
                } else {
                    format!("{column} IS NOT NULL")
                }
            }
            Self::Gt => format!("{column} > {p}"),
            Self::Gte => format!("{column} >= {p}"),
            Self::Lt => format!("{column} < {p}"),
            Self::Lte => format!("{column} <= {p}"),
            Self::Like => format!("{column} LIKE {p}"),
            Self::IExact => format!("UPPER({column}) = UPPER({p})"),
            Self::ILike => format!("UPPER({column}) LIKE UPPER({p})"),
        }
    }
}

/// Builds the catalog entries for one field, registered under `alias`.
///
/// `alias` is the field's attribute name, or `pk` for the primary key alias.
pub fn filters_for_field(field: &FieldDef, alias: &str) -> Vec<(String, FilterInfo)> {
    let mut entries: Vec<(&str, Lookup, ValueEncoder)> = vec![
        ("", Lookup::Exact, ValueEncoder::Field),
        ("__not", Lookup::NotExact, ValueEncoder::Field),
        ("__in", Lookup::In, ValueEncoder::FieldList),
        ("__not_in", Lookup::NotIn, ValueEncoder::FieldList),
        ("__isnull", Lookup::IsNull, ValueEncoder::Bool),
        ("__not_isnull", Lookup::NotIsNull, ValueEncoder::Bool),
    ];
    if field.field_type.is_indexable() {
        entries.extend([
            ("__gt", Lookup::Gt, ValueEncoder::Field),
            ("__gte", Lookup::Gte, ValueEncoder::Field),
            ("__lt", Lookup::Lt, ValueEncoder::Field),
            ("__lte", Lookup::Lte, ValueEncoder::Field),
        ]);
    }
    if field.field_type.is_textual() {
        entries.extend([
            ("__contains", Lookup::Like, ValueEncoder::Like(LikePattern::Contains)),
            ("__startswith", Lookup::Like, ValueEncoder::Like(LikePattern::StartsWith)),
            ("__endswith", Lookup::Like, ValueEncoder::Like(LikePattern::EndsWith)),
            ("__iexact", Lookup::IExact, ValueEncoder::Text),
            ("__icontains", Lookup::ILike, ValueEncoder::Like(LikePattern::Contains)),
            ("__istartswith", Lookup::ILike, ValueEncoder::Like(LikePattern::StartsWith)),
            ("__iendswith", Lookup::ILike, ValueEncoder::Like(LikePattern::EndsWith)),
        ]);
    }
    entries
        .into_iter()
        .map(|(suffix, lookup, encoder)| {
            (
                format!("{alias}{suffix}"),
                FilterInfo {
                    field: field.name,
                    column: field.column.clone(),
                    lookup,
                    encoder,
                },
            )
        })
        .collect()
}

/// Escapes LIKE metacharacters so the argument matches literally.
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub(crate) fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::String(s) => !s.is_empty(),
        Value::List(items) => !items.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldType;

    fn catalog(field: &FieldDef) -> std::collections::HashMap<String, FilterInfo> {
        filters_for_field(field, field.name).into_iter().collect()
    }

    #[test]
    fn test_common_suffixes_present() {
        let f = FieldDef::new("id", FieldType::Int);
        let c = catalog(&f);
        for key in ["id", "id__not", "id__in", "id__not_in", "id__isnull", "id__gte"] {
            assert!(c.contains_key(key), "missing {key}");
        }
        assert!(!c.contains_key("id__contains"));
    }

    #[test]
    fn test_text_suffixes_only_for_textual() {
        let f = FieldDef::new("name", FieldType::Char { max_length: 20 });
        let c = catalog(&f);
        assert_eq!(c["name__icontains"].lookup, Lookup::ILike);
        assert_eq!(c["name__iexact"].encoder, ValueEncoder::Text);
    }

    #[test]
    fn test_binary_not_ordered() {
        let f = FieldDef::new("blob", FieldType::Binary);
        assert!(!catalog(&f).contains_key("blob__gt"));
    }

    #[test]
    fn test_pk_alias_points_at_field() {
        let f = FieldDef::new("foo_id", FieldType::Int).column("fid");
        let entries: std::collections::HashMap<_, _> =
            filters_for_field(&f, "pk").into_iter().collect();
        assert_eq!(entries["pk__in"].field, "foo_id");
        assert_eq!(entries["pk__in"].column, "fid");
    }

    #[test]
    fn test_render_negated_exact_matches_null() {
        assert_eq!(
            Lookup::NotExact.render("\"tag\"", Some("$1"), false),
            "(\"tag\" <> $1 OR \"tag\" IS NULL)"
        );
        assert_eq!(
            Lookup::NotIn.render("\"id\"", Some("$2"), false),
            "(NOT (\"id\" = ANY($2)) OR \"id\" IS NULL)"
        );
    }

    #[test]
    fn test_render_null_checks() {
        assert_eq!(Lookup::IsNull.render("c", None, true), "c IS NULL");
        assert_eq!(Lookup::IsNull.render("c", None, false), "c IS NOT NULL");
        assert_eq!(Lookup::NotIsNull.render("c", None, true), "c IS NOT NULL");
        assert_eq!(Lookup::NotIsNull.render("c", None, false), "c IS NULL");
    }

    #[test]
    fn test_like_encoder_escapes() {
        let f = FieldDef::new("name", FieldType::Text);
        let info = &catalog(&f)["name__contains"];
        assert_eq!(
            info.encode(&f, &Value::from("50%_off")).unwrap(),
            Encoded::Param(Value::from("%50\\%\\_off%"))
        );
        let info = &catalog(&f)["name__istartswith"];
        assert_eq!(
            info.encode(&f, &Value::from("ab")).unwrap(),
            Encoded::Param(Value::from("ab%"))
        );
    }

    #[test]
    fn test_list_encoder_converts_elements() {
        let f = FieldDef::new("id", FieldType::Int);
        let info = &catalog(&f)["id__in"];
        let encoded = info
            .encode(&f, &Value::List(vec![Value::from("2"), Value::Int(4)]))
            .unwrap();
        assert_eq!(
            encoded,
            Encoded::Param(Value::List(vec![Value::Int(2), Value::Int(4)]))
        );
        assert!(matches!(
            info.encode(&f, &Value::Int(2)),
            Err(PostmodelError::ParamsError(_))
        ));
    }

    #[test]
    fn test_bool_encoder_binds_nothing() {
        let f = FieldDef::new("tag", FieldType::Text).nullable();
        let info = &catalog(&f)["tag__isnull"];
        assert_eq!(info.encode(&f, &Value::Bool(true)).unwrap(), Encoded::Flag(true));
        assert_eq!(info.encode(&f, &Value::Int(0)).unwrap(), Encoded::Flag(false));
    }
}
