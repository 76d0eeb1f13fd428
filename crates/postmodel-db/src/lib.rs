//! # postmodel-db
//!
//! The ORM layer of postmodel: model metadata, instances, query expressions,
//! SQL compilation, DDL generation, transactions and the registry. The
//! database itself sits behind the [`Database`](executor::Database) trait;
//! `postmodel-db-backends` provides the PostgreSQL implementation.
//!
//! ## Architecture
//!
//! Queries are lazy. A [`QuerySet`](query::QuerySet) accumulates filters,
//! ordering and a window through method chaining. SQL is generated only when
//! a terminal method (`fetch_all`, `count`, `update`, ...) is awaited with the
//! [`Postmodel`](registry::Postmodel) registry, which hands out the cached
//! [`Mapper`](mapper::Mapper) for the model and database.
//!
//! ## Module Overview
//!
//! - [`model`] - The [`Model`](model::Model) trait and [`ModelMeta`](model::ModelMeta)
//! - [`fields`] - Field definitions and storage conversion
//! - [`value`] - The dynamic [`Value`](value::Value) enum
//! - [`instance`] - Row values with change tracking and save/delete/refresh
//! - [`query`] - `Q` expressions, lookups, JSON paths, compilation, querysets
//! - [`schema`] - `CREATE TABLE` / index / comment generation
//! - [`executor`] - The database and transaction traits, result rows
//! - [`mapper`] - Per-model statement execution with statement caching
//! - [`transactions`] - Task-scoped transactions
//! - [`registry`] - Databases, registered models and mappers

// - struct_excessive_bools: FieldDef carries one flag per column option
// - result_large_err: PostmodelError is used consistently across the crates
// - doc_markdown: backtick requirements for documentation items are too strict
// - significant_drop_tightening: false positives with std Mutex guards
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::result_large_err)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::future_not_send)]

pub mod executor;
pub mod fields;
pub mod instance;
pub mod mapper;
pub mod model;
pub mod query;
pub mod registry;
pub mod schema;
pub mod transactions;
pub mod value;

#[cfg(test)]
mod testing;

// Re-export the most commonly used types at the crate root.
pub use executor::{Database, DbExecutor, Row, TransactedConnection};
pub use fields::{FieldDef, FieldDefault, FieldType};
pub use instance::{Instance, SaveOptions};
pub use mapper::Mapper;
pub use model::{Model, ModelMeta, ModelMetaBuilder};
pub use query::{
    CountQuery, DeleteQuery, JoinType, Manager, OrderBy, QueryParts, QuerySet, SqlCompiler,
    UpdateQuery, Q,
};
pub use registry::Postmodel;
pub use schema::SchemaGenerator;
pub use transactions::{current_connection, in_transaction, is_in_transaction, NestedTransaction};
pub use value::{list, FromValue, Value};
