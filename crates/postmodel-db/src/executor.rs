//! The seam between the mapping layer and a concrete database engine.
//!
//! Engines live in `postmodel-db-backends`; everything in this crate talks to
//! them through these traits. A [`Database`] is a named, pooled engine; a
//! [`TransactedConnection`] is one connection pinned for the lifetime of a
//! transaction block.

use std::sync::Arc;

use async_trait::async_trait;
use postmodel_core::{PostmodelError, PostmodelResult};

use crate::value::{FromValue, Value};

/// Runs SQL statements.
///
/// Every statement carries positional `$n` placeholders and a matching
/// parameter slice.
#[async_trait]
pub trait DbExecutor: Send + Sync {
    /// Runs a statement that returns no rows and reports the affected row count.
    async fn execute_sql(&self, sql: &str, params: &[Value]) -> PostmodelResult<u64>;

    /// Runs a query and returns every result row.
    async fn query(&self, sql: &str, params: &[Value]) -> PostmodelResult<Vec<Row>>;

    /// Runs the same statement once per parameter row.
    ///
    /// Engines override this to prepare once and wrap the batch in a
    /// transaction when none is active.
    async fn execute_many(&self, sql: &str, rows: &[Vec<Value>]) -> PostmodelResult<u64> {
        let mut total = 0;
        for params in rows {
            total += self.execute_sql(sql, params).await?;
        }
        Ok(total)
    }

    /// Runs a parameterless script of one or more statements.
    async fn execute_script(&self, sql: &str) -> PostmodelResult<()>;
}

/// A named database engine.
#[async_trait]
pub trait Database: DbExecutor {
    /// The name the engine was registered under.
    fn name(&self) -> &str;

    /// Closes the pool. Later operations fail with `OperationalError`.
    async fn close(&self) -> PostmodelResult<()>;

    /// Checks out a connection and issues `BEGIN` on it.
    async fn begin(&self) -> PostmodelResult<Arc<dyn TransactedConnection>>;
}

/// A connection held for the duration of one transaction block.
#[async_trait]
pub trait TransactedConnection: DbExecutor {
    /// Issues `COMMIT`.
    async fn commit(&self) -> PostmodelResult<()>;

    /// Issues `ROLLBACK`.
    async fn rollback(&self) -> PostmodelResult<()>;

    /// Returns the connection to its pool. Called exactly once per block.
    async fn release(&self);

    /// Closes the connection instead of returning it to the pool.
    ///
    /// Called when a transaction block is abandoned before it could commit
    /// or roll back: its future was dropped or it panicked. The server rolls
    /// the open transaction back when the connection goes away.
    fn discard(&self);
}

/// One result row: column names with their decoded values.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a row. Rows decoded from the same statement share `columns`.
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Takes the values out of the row.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value of the named column.
    pub fn get_value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    /// Typed value of the named column.
    pub fn get<T: FromValue>(&self, column: &str) -> PostmodelResult<T> {
        let value = self.get_value(column).ok_or_else(|| {
            PostmodelError::DatabaseError(format!("column '{column}' not found in row"))
        })?;
        T::from_value(value)
    }

    /// Typed value at a column index.
    pub fn get_by_index<T: FromValue>(&self, idx: usize) -> PostmodelResult<T> {
        let value = self.values.get(idx).ok_or_else(|| {
            PostmodelError::DatabaseError(format!(
                "column index {idx} out of bounds (row has {} columns)",
                self.values.len()
            ))
        })?;
        T::from_value(value)
    }
}
