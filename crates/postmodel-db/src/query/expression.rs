//! Boolean filter expressions.
//!
//! A [`Q`] is either a leaf holding `key -> value` conditions, implicitly
//! AND-ed together, or a node joining child expressions with AND or OR.
//! Negation toggles a flag on the node rather than restructuring the tree, so
//! `!!q == q`.
//!
//! # Examples
//!
//! ```
//! use postmodel_db::q;
//! use postmodel_db::query::expression::{JoinType, Q};
//! use postmodel_db::value::list;
//!
//! let active = q!("tag__isnull" => false);
//! let ids = Q::filter("id__in", list([2, 4]));
//! let either = active.clone() | ids;
//! assert_eq!(either.join_type(), JoinType::Or);
//! assert_eq!(!!active.clone(), active);
//! ```

use std::fmt;
use std::ops;
use std::str::FromStr;

use postmodel_core::PostmodelError;

use crate::value::Value;

/// How the children of an expression node are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum JoinType {
    /// All children must hold.
    #[default]
    And,
    /// At least one child must hold.
    Or,
}

impl JoinType {
    /// The SQL keyword.
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for JoinType {
    type Err = PostmodelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AND" => Ok(Self::And),
            "OR" => Ok(Self::Or),
            _ => Err(PostmodelError::OperationalError(format!(
                "join_type must be AND or OR, got '{s}'"
            ))),
        }
    }
}

/// A composable filter expression.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Q {
    children: Vec<Q>,
    filters: Vec<(String, Value)>,
    join_type: JoinType,
    negated: bool,
}

impl Q {
    /// An empty expression, which matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// A leaf with one condition.
    pub fn filter(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            filters: vec![(key.into(), value.into())],
            ..Self::default()
        }
    }

    /// A leaf with several conditions, AND-ed together.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            filters: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            ..Self::default()
        }
    }

    /// A node joining `children` with `join_type`.
    pub fn compound(children: Vec<Self>, join_type: JoinType) -> Self {
        Self {
            children,
            join_type,
            ..Self::default()
        }
    }

    /// A node with both child expressions and direct conditions.
    ///
    /// The conditions become one more child, so the node stays either a pure
    /// leaf or a pure branch.
    pub fn with_children_and_filters(
        mut children: Vec<Self>,
        join_type: JoinType,
        filters: Vec<(String, Value)>,
    ) -> Self {
        if children.is_empty() {
            return Self {
                filters,
                join_type,
                ..Self::default()
            };
        }
        if !filters.is_empty() {
            children.push(Self {
                filters,
                ..Self::default()
            });
        }
        Self::compound(children, join_type)
    }

    /// Adds another condition to a leaf.
    ///
    /// On a branch node the condition is added as a new leaf child.
    #[must_use]
    pub fn and_filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if self.children.is_empty() {
            self.filters.push((key.into(), value.into()));
            self
        } else {
            self & Self::filter(key, value)
        }
    }

    /// Toggles the negation flag in place.
    pub fn negate(&mut self) {
        self.negated = !self.negated;
    }

    /// Returns `true` if the compiled condition is wrapped in `NOT`.
    pub const fn is_negated(&self) -> bool {
        self.negated
    }

    /// The join type of this node.
    pub const fn join_type(&self) -> JoinType {
        self.join_type
    }

    /// Child expressions (empty for a leaf).
    pub fn children(&self) -> &[Self] {
        &self.children
    }

    /// Leaf conditions (empty for a branch).
    pub fn filters(&self) -> &[(String, Value)] {
        &self.filters
    }

    /// Returns `true` if the expression has no conditions at all.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.children.iter().all(Self::is_empty)
    }

    /// Number of leaf conditions in the whole tree.
    pub fn condition_count(&self) -> usize {
        self.filters.len() + self.children.iter().map(Self::condition_count).sum::<usize>()
    }
}

impl ops::BitAnd for Q {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self::compound(vec![self, rhs], JoinType::And)
    }
}

impl ops::BitOr for Q {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self::compound(vec![self, rhs], JoinType::Or)
    }
}

impl ops::Not for Q {
    type Output = Self;

    fn not(mut self) -> Self::Output {
        self.negate();
        self
    }
}

/// Builds a leaf [`Q`] from `key => value` pairs.
///
/// ```
/// use postmodel_db::q;
///
/// let q = q!("name__startswith" => "Jo", "age__gte" => 18);
/// assert_eq!(q.filters().len(), 2);
/// ```
#[macro_export]
macro_rules! q {
    ($($key:expr => $value:expr),+ $(,)?) => {
        $crate::query::expression::Q::from_pairs([
            $(($key.to_string(), $crate::value::Value::from($value))),+
        ])
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_and_or_build_nodes() {
        let a = Q::filter("a", 1);
        let b = Q::filter("b", 2);
        let and = a.clone() & b.clone();
        assert_eq!(and.join_type(), JoinType::And);
        assert_eq!(and.children(), &[a.clone(), b.clone()]);
        let or = a | b;
        assert_eq!(or.join_type(), JoinType::Or);
    }

    #[test]
    fn test_not_toggles_flag() {
        let q = Q::filter("id", 1);
        let once = !q.clone();
        assert!(once.is_negated());
        let twice = !once;
        assert!(!twice.is_negated());
        assert_eq!(twice, q);
    }

    #[test]
    fn test_not_keeps_structure() {
        let q = Q::filter("a", 1) | Q::filter("b", 2);
        let negated = !q.clone();
        assert_eq!(negated.children(), q.children());
        assert_eq!(negated.join_type(), JoinType::Or);
    }

    #[test]
    fn test_join_type_parse() {
        assert_eq!("and".parse::<JoinType>().unwrap(), JoinType::And);
        assert_eq!("OR".parse::<JoinType>().unwrap(), JoinType::Or);
        let err = "XOR".parse::<JoinType>().unwrap_err();
        assert!(matches!(err, PostmodelError::OperationalError(_)));
    }

    #[test]
    fn test_children_and_filters_become_extra_child() {
        let q = Q::with_children_and_filters(
            vec![Q::filter("a", 1), Q::filter("b", 2)],
            JoinType::Or,
            vec![("c".into(), Value::Int(3))],
        );
        assert_eq!(q.children().len(), 3);
        assert!(q.filters().is_empty());
        assert_eq!(q.condition_count(), 3);
    }

    #[test]
    fn test_and_filter_on_branch() {
        let q = (Q::filter("a", 1) | Q::filter("b", 2)).and_filter("c", 3);
        assert_eq!(q.join_type(), JoinType::And);
        assert_eq!(q.children().len(), 2);
    }

    #[test]
    fn test_macro() {
        let q = q!("name" => "x", "id__in" => vec![Value::Int(1)]);
        assert_eq!(q.filters()[0], ("name".to_string(), Value::from("x")));
        assert!(!q.is_empty());
        assert!(Q::new().is_empty());
    }
}
