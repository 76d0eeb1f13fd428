//! Query building and SQL compilation.
//!
//! - [`expression`] - The [`Q`] filter algebra
//! - [`lookups`] - The per-field filter catalog
//! - [`json`] - Filters and sort keys inside JSON fields
//! - [`compiler`] - SQL generation for queries and row statements
//! - [`queryset`] - [`Manager`], [`QuerySet`] and the bulk update/delete/count queries

pub mod compiler;
pub mod expression;
pub mod json;
pub mod lookups;
pub mod queryset;

pub use compiler::{Compiled, SqlCompiler};
pub use expression::{JoinType, Q};
pub use queryset::{CountQuery, DeleteQuery, Manager, QuerySet, UpdateQuery};

/// One sort key: a field name, `pk`, or a dotted JSON path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    /// The key without its direction prefix.
    pub key: String,
    /// Whether the key was prefixed with `-`.
    pub descending: bool,
}

impl OrderBy {
    /// Parses `name` (ascending) or `-name` (descending).
    pub fn parse(spec: &str) -> Self {
        spec.strip_prefix('-').map_or_else(
            || Self {
                key: spec.to_string(),
                descending: false,
            },
            |key| Self {
                key: key.to_string(),
                descending: true,
            },
        )
    }
}

/// Filtering, ordering and windowing shared by every query kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParts {
    /// Conditions, AND-ed together.
    pub filters: Vec<Q>,
    /// Sort keys in priority order.
    pub ordering: Vec<OrderBy>,
    /// `LIMIT`, if any.
    pub limit: Option<u64>,
    /// `OFFSET`, if any.
    pub offset: Option<u64>,
    /// `SELECT DISTINCT`.
    pub distinct: bool,
}

impl QueryParts {
    /// Returns `true` if a count over these parts must use a subquery.
    pub const fn is_windowed(&self) -> bool {
        self.limit.is_some() || self.offset.is_some() || self.distinct
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_by_parse() {
        assert_eq!(
            OrderBy::parse("-value.info.age"),
            OrderBy {
                key: "value.info.age".into(),
                descending: true
            }
        );
        assert!(!OrderBy::parse("name").descending);
    }
}
