//! SQL generation.
//!
//! [`SqlCompiler`] turns a model's metadata plus query parts into
//! parameterized PostgreSQL statements with `$1, $2, ...` placeholders.
//! Placeholders are numbered in the order parameters are pushed, so every
//! compiled statement carries exactly as many parameters as placeholders.
//!
//! Row statements (`INSERT` of one instance, `UPDATE`/`DELETE` by primary
//! key) depend only on the model and the set of fields involved; the
//! [`Mapper`](crate::mapper::Mapper) caches their text.

use postmodel_core::utils::text::quote_ident;
use postmodel_core::{PostmodelError, PostmodelResult};

use super::expression::Q;
use super::json::{bind, JsonFilter, JsonPath};
use super::lookups::Encoded;
use super::{OrderBy, QueryParts};
use crate::model::ModelMeta;
use crate::value::Value;

/// A statement with its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Compiled {
    /// SQL text with `$n` placeholders.
    pub sql: String,
    /// Parameters, `params[n - 1]` for placeholder `$n`.
    pub params: Vec<Value>,
}

/// Compiles statements for one model.
#[derive(Debug, Clone, Copy)]
pub struct SqlCompiler<'m> {
    meta: &'m ModelMeta,
}

impl<'m> SqlCompiler<'m> {
    /// Creates a compiler for `meta`.
    pub const fn new(meta: &'m ModelMeta) -> Self {
        Self { meta }
    }

    fn table(&self) -> String {
        quote_ident(&self.meta.table)
    }

    fn column(&self, position: usize) -> String {
        quote_ident(&self.meta.fields()[position].column)
    }

    /// The projected columns, in declaration order.
    pub fn column_list(&self) -> String {
        self.meta
            .fields()
            .iter()
            .map(|f| quote_ident(&f.column))
            .collect::<Vec<_>>()
            .join(", ")
    }

    // ── Conditions ───────────────────────────────────────────────────

    /// Compiles a list of expressions, AND-ed together.
    ///
    /// Returns `None` when no condition remains (every expression empty).
    pub fn compile_where(&self, filters: &[Q], params: &mut Vec<Value>) -> PostmodelResult<Option<String>> {
        let mut parts = Vec::with_capacity(filters.len());
        for q in filters {
            if let Some(sql) = self.compile_q(q, params)? {
                parts.push(sql);
            }
        }
        Ok(match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(parts.join(" AND ")),
        })
    }

    /// Compiles one expression tree.
    pub fn compile_q(&self, q: &Q, params: &mut Vec<Value>) -> PostmodelResult<Option<String>> {
        let mut parts = Vec::new();
        if q.children().is_empty() {
            for (key, value) in q.filters() {
                parts.push(self.compile_condition(key, value, params)?);
            }
        } else {
            for child in q.children() {
                if let Some(sql) = self.compile_q(child, params)? {
                    parts.push(sql);
                }
            }
        }
        let joined = match parts.len() {
            0 => return Ok(None),
            1 => parts.remove(0),
            _ => {
                let glue = if q.children().is_empty() {
                    " AND ".to_string()
                } else {
                    format!(" {} ", q.join_type().as_sql())
                };
                format!("({})", parts.join(&glue))
            }
        };
        Ok(Some(if q.is_negated() {
            format!("NOT ({joined})")
        } else {
            joined
        }))
    }

    fn compile_condition(&self, key: &str, value: &Value, params: &mut Vec<Value>) -> PostmodelResult<String> {
        if let Some(info) = self.meta.filter(key) {
            let field = self.meta.field(info.field).ok_or_else(|| unknown_filter(key))?;
            let column = quote_ident(&info.column);
            return Ok(match info.encode(field, value)? {
                Encoded::Param(param) => {
                    let placeholder = bind(params, param);
                    info.lookup.render(&column, Some(&placeholder), false)
                }
                Encoded::Flag(flag) => info.lookup.render(&column, None, flag),
            });
        }
        match JsonFilter::parse(self.meta, key)? {
            Some(filter) => filter.compile(value, params),
            None => Err(unknown_filter(key)),
        }
    }

    fn order_clause(&self, ordering: &[OrderBy]) -> PostmodelResult<String> {
        let mut terms = Vec::with_capacity(ordering.len());
        for order in ordering {
            let dir = if order.descending { "DESC" } else { "ASC" };
            let exprs: Vec<String> = if order.key == "pk" {
                self.meta.pk_positions().iter().map(|&i| self.column(i)).collect()
            } else if let Some(field) = self.meta.field(&order.key) {
                vec![quote_ident(&field.column)]
            } else if let Some(path) = JsonPath::resolve(self.meta, &order.key)? {
                vec![path.jsonb_sql()]
            } else {
                return Err(PostmodelError::FieldError(format!(
                    "Unknown field '{}' for model '{}' in order_by",
                    order.key, self.meta.name
                )));
            };
            terms.extend(exprs.into_iter().map(|e| format!("{e} {dir}")));
        }
        Ok(terms.join(", "))
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// `SELECT` over the projected columns.
    pub fn select(&self, parts: &QueryParts) -> PostmodelResult<Compiled> {
        let mut params = Vec::new();
        let mut sql = String::from("SELECT ");
        if parts.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&self.column_list());
        sql.push_str(&format!(" FROM {}", self.table()));

        // WHERE
        if let Some(clause) = self.compile_where(&parts.filters, &mut params)? {
            sql.push_str(&format!(" WHERE {clause}"));
        }

        // ORDER BY
        if !parts.ordering.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", self.order_clause(&parts.ordering)?));
        }

        // LIMIT / OFFSET
        if let Some(limit) = parts.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = parts.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        Ok(Compiled { sql, params })
    }

    /// `SELECT COUNT(*)`. Windowed or distinct queries are counted through a
    /// subquery so the window applies before counting.
    pub fn count(&self, parts: &QueryParts) -> PostmodelResult<Compiled> {
        if parts.is_windowed() {
            let inner = self.select(&QueryParts {
                ordering: Vec::new(),
                ..parts.clone()
            })?;
            return Ok(Compiled {
                sql: format!("SELECT COUNT(*) FROM ({}) AS \"_sub\"", inner.sql),
                params: inner.params,
            });
        }
        let mut params = Vec::new();
        let mut sql = format!("SELECT COUNT(*) FROM {}", self.table());
        if let Some(clause) = self.compile_where(&parts.filters, &mut params)? {
            sql.push_str(&format!(" WHERE {clause}"));
        }
        Ok(Compiled { sql, params })
    }

    /// `EXPLAIN (FORMAT JSON)` of the select.
    pub fn explain(&self, parts: &QueryParts) -> PostmodelResult<Compiled> {
        let select = self.select(parts)?;
        Ok(Compiled {
            sql: format!("EXPLAIN (FORMAT JSON) {}", select.sql),
            params: select.params,
        })
    }

    /// `UPDATE ... SET` for every row matching `filters`.
    ///
    /// `assignments` pairs a field position with its storage value.
    pub fn update_where(&self, assignments: &[(usize, Value)], filters: &[Q]) -> PostmodelResult<Compiled> {
        if assignments.is_empty() {
            return Err(PostmodelError::ParamsError(
                "update requires at least one field".to_string(),
            ));
        }
        let mut params = Vec::with_capacity(assignments.len());
        let sets: Vec<String> = assignments
            .iter()
            .map(|(pos, value)| format!("{} = {}", self.column(*pos), bind(&mut params, value.clone())))
            .collect();
        let mut sql = format!("UPDATE {} SET {}", self.table(), sets.join(", "));
        if let Some(clause) = self.compile_where(filters, &mut params)? {
            sql.push_str(&format!(" WHERE {clause}"));
        }
        Ok(Compiled { sql, params })
    }

    /// `DELETE` of every row matching `filters`.
    pub fn delete_where(&self, filters: &[Q]) -> PostmodelResult<Compiled> {
        let mut params = Vec::new();
        let mut sql = format!("DELETE FROM {}", self.table());
        if let Some(clause) = self.compile_where(filters, &mut params)? {
            sql.push_str(&format!(" WHERE {clause}"));
        }
        Ok(Compiled { sql, params })
    }

    // ── Row statements ───────────────────────────────────────────────

    /// Fields written by `INSERT`: all but server-generated ones.
    pub fn insert_positions(&self) -> Vec<usize> {
        (0..self.meta.fields().len())
            .filter(|&i| !self.meta.fields()[i].field_type.is_db_generated())
            .collect()
    }

    /// Fields read back through `RETURNING`.
    pub fn returning_positions(&self) -> Vec<usize> {
        (0..self.meta.fields().len())
            .filter(|&i| self.meta.fields()[i].field_type.is_db_generated())
            .collect()
    }

    /// `INSERT` of one row.
    pub fn insert_sql(&self) -> String {
        let positions = self.insert_positions();
        let mut sql = format!("INSERT INTO {}", self.table());
        if positions.is_empty() {
            sql.push_str(" DEFAULT VALUES");
        } else {
            let columns: Vec<String> = positions.iter().map(|&i| self.column(i)).collect();
            let values: Vec<String> = (1..=positions.len()).map(|n| format!("${n}")).collect();
            sql.push_str(&format!(" ({}) VALUES ({})", columns.join(", "), values.join(", ")));
        }
        let returning = self.returning_positions();
        if !returning.is_empty() {
            let columns: Vec<String> = returning.iter().map(|&i| self.column(i)).collect();
            sql.push_str(&format!(" RETURNING {}", columns.join(", ")));
        }
        sql
    }

    /// `UPDATE` of one row by primary key.
    ///
    /// Parameters are the `fields` values, then the primary key values, then
    /// the `conditions` values, in that order.
    pub fn update_row_sql(&self, fields: &[usize], conditions: &[usize]) -> String {
        let mut n = 0;
        let mut next = || {
            n += 1;
            format!("${n}")
        };
        let sets: Vec<String> = fields.iter().map(|&i| format!("{} = {}", self.column(i), next())).collect();
        let wheres: Vec<String> = self
            .meta
            .pk_positions()
            .iter()
            .chain(conditions)
            .map(|&i| format!("{} = {}", self.column(i), next()))
            .collect();
        format!(
            "UPDATE {} SET {} WHERE {}",
            self.table(),
            sets.join(", "),
            wheres.join(" AND ")
        )
    }

    /// `DELETE` of one row by primary key.
    pub fn delete_row_sql(&self) -> String {
        format!("DELETE FROM {} WHERE {}", self.table(), self.pk_condition())
    }

    /// `SELECT` of one row by primary key.
    pub fn select_by_pk_sql(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE {}",
            self.column_list(),
            self.table(),
            self.pk_condition()
        )
    }

    fn pk_condition(&self) -> String {
        self.meta
            .pk_positions()
            .iter()
            .enumerate()
            .map(|(n, &i)| format!("{} = ${}", self.column(i), n + 1))
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

fn unknown_filter(key: &str) -> PostmodelError {
    PostmodelError::FieldError(format!("Unknown filter param '{key}'"))
}
