//! Test doubles: a recording in-memory [`Database`] and a few models.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use async_trait::async_trait;
use postmodel_core::{PostmodelError, PostmodelResult};

use crate::executor::{Database, DbExecutor, Row, TransactedConnection};
use crate::fields::{FieldDef, FieldType};
use crate::model::{Model, ModelMeta};
use crate::transactions::current_connection;
use crate::value::Value;

#[derive(Default)]
struct Script {
    statements: Vec<String>,
    params: Vec<Vec<Value>>,
    rows: VecDeque<Vec<Row>>,
    counts: VecDeque<u64>,
}

/// Records every statement and answers with scripted rows and row counts.
///
/// Queries with nothing scripted return no rows; statements with nothing
/// scripted report one affected row. Statements run inside a transaction
/// scope are recorded with a `[tx] ` prefix.
pub struct MockDb {
    name: String,
    script: Arc<Mutex<Script>>,
    closed: AtomicBool,
}

impl MockDb {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Arc::new(Mutex::new(Script::default())),
            closed: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    pub fn params(&self) -> Vec<Vec<Value>> {
        self.lock().params.clone()
    }

    pub fn push_rows(&self, columns: &[&str], rows: Vec<Vec<Value>>) {
        let columns: Arc<[String]> = columns.iter().map(|c| (*c).to_string()).collect();
        let rows = rows.into_iter().map(|values| Row::new(Arc::clone(&columns), values)).collect();
        self.lock().rows.push_back(rows);
    }

    pub fn push_count(&self, count: u64) {
        self.lock().counts.push_back(count);
    }

    pub fn clear(&self) {
        let mut script = self.lock();
        script.statements.clear();
        script.params.clear();
    }

    fn check_open(&self) -> PostmodelResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PostmodelError::OperationalError(format!(
                "database '{}' is closed",
                self.name
            )));
        }
        Ok(())
    }
}

fn record(script: &Mutex<Script>, sql: String, params: &[Value]) {
    let mut script = script.lock().unwrap_or_else(PoisonError::into_inner);
    script.statements.push(sql);
    script.params.push(params.to_vec());
}

fn next_count(script: &Mutex<Script>) -> u64 {
    script
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .counts
        .pop_front()
        .unwrap_or(1)
}

fn next_rows(script: &Mutex<Script>) -> Vec<Row> {
    script
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .rows
        .pop_front()
        .unwrap_or_default()
}

#[async_trait]
impl DbExecutor for MockDb {
    async fn execute_sql(&self, sql: &str, params: &[Value]) -> PostmodelResult<u64> {
        self.check_open()?;
        if let Some(tx) = current_connection(&self.name) {
            return tx.execute_sql(sql, params).await;
        }
        record(&self.script, sql.to_string(), params);
        Ok(next_count(&self.script))
    }

    async fn query(&self, sql: &str, params: &[Value]) -> PostmodelResult<Vec<Row>> {
        self.check_open()?;
        if let Some(tx) = current_connection(&self.name) {
            return tx.query(sql, params).await;
        }
        record(&self.script, sql.to_string(), params);
        Ok(next_rows(&self.script))
    }

    async fn execute_script(&self, sql: &str) -> PostmodelResult<()> {
        self.check_open()?;
        record(&self.script, sql.to_string(), &[]);
        Ok(())
    }
}

#[async_trait]
impl Database for MockDb {
    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) -> PostmodelResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn begin(&self) -> PostmodelResult<Arc<dyn TransactedConnection>> {
        self.check_open()?;
        record(&self.script, "BEGIN".to_string(), &[]);
        Ok(Arc::new(MockTx {
            script: Arc::clone(&self.script),
        }))
    }
}

struct MockTx {
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl DbExecutor for MockTx {
    async fn execute_sql(&self, sql: &str, params: &[Value]) -> PostmodelResult<u64> {
        record(&self.script, format!("[tx] {sql}"), params);
        Ok(next_count(&self.script))
    }

    async fn query(&self, sql: &str, params: &[Value]) -> PostmodelResult<Vec<Row>> {
        record(&self.script, format!("[tx] {sql}"), params);
        Ok(next_rows(&self.script))
    }

    async fn execute_script(&self, sql: &str) -> PostmodelResult<()> {
        record(&self.script, format!("[tx] {sql}"), &[]);
        Ok(())
    }
}

#[async_trait]
impl TransactedConnection for MockTx {
    async fn commit(&self) -> PostmodelResult<()> {
        record(&self.script, "COMMIT".to_string(), &[]);
        Ok(())
    }

    async fn rollback(&self) -> PostmodelResult<()> {
        record(&self.script, "ROLLBACK".to_string(), &[]);
        Ok(())
    }

    async fn release(&self) {
        record(&self.script, "RELEASE".to_string(), &[]);
    }

    fn discard(&self) {
        record(&self.script, "DISCARD".to_string(), &[]);
    }
}

// ── Models ───────────────────────────────────────────────────────────

/// `id` auto key, `title`, `data_ver` version counter.
pub struct Book;

impl Model for Book {
    fn meta() -> &'static ModelMeta {
        static META: LazyLock<ModelMeta> = LazyLock::new(|| {
            ModelMeta::builder("Book")
                .field(FieldDef::new("id", FieldType::Auto).primary_key())
                .field(FieldDef::new("title", FieldType::Char { max_length: 200 }))
                .field(FieldDef::new("data_ver", FieldType::DataVersion))
                .build()
                .expect("Book metadata")
        });
        &META
    }
}

/// Composite key `(foo_id, name)` and a nullable `tag`.
pub struct MultiPrimaryFoo;

impl Model for MultiPrimaryFoo {
    fn meta() -> &'static ModelMeta {
        static META: LazyLock<ModelMeta> = LazyLock::new(|| {
            ModelMeta::builder("MultiPrimaryFoo")
                .field(FieldDef::new("foo_id", FieldType::Int))
                .field(FieldDef::new("name", FieldType::Char { max_length: 255 }))
                .field(FieldDef::new("tag", FieldType::Char { max_length: 128 }).nullable())
                .primary_key(&["foo_id", "name"])
                .build()
                .expect("MultiPrimaryFoo metadata")
        });
        &META
    }
}

/// Explicit integer key and a JSON document.
pub struct JsonModel;

impl Model for JsonModel {
    fn meta() -> &'static ModelMeta {
        static META: LazyLock<ModelMeta> = LazyLock::new(|| {
            ModelMeta::builder("JsonModel")
                .field(FieldDef::new("id", FieldType::Int).primary_key())
                .field(FieldDef::new("value", FieldType::Json))
                .build()
                .expect("JsonModel metadata")
        });
        &META
    }
}
