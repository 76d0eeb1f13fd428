//! PostgreSQL engine using `tokio-postgres` and `deadpool-postgres`.
//!
//! [`PostgresEngine`] owns one connection pool. Statements are prepared
//! through the per-connection statement cache and parameters are encoded
//! against the types the server reports for each placeholder, so a
//! [`Value::Int`] binds equally well to `SMALLINT`, `INTEGER`, `BIGINT` or
//! `NUMERIC` columns. While a transaction block is open for the engine's
//! name, every statement is routed to the pinned connection instead of the
//! pool.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use deadpool_postgres::{
    ClientWrapper, ManagerConfig, Object, Pool, PoolConfig, PoolError, RecyclingMethod, Runtime,
};
use postmodel_core::logging::{query_span, DB_TARGET};
use postmodel_core::utils::text::quote_ident;
use postmodel_core::{PostmodelError, PostmodelResult};
use postmodel_db::executor::{Database, DbExecutor, Row, TransactedConnection};
use postmodel_db::transactions::current_connection;
use postmodel_db::value::Value;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::private::BytesMut;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, Kind, ToSql, Type};
use tokio_postgres::{CancelToken, NoTls, Row as PgRow};
use tracing::Instrument;

use crate::config::{DbConfig, SslMode};

/// How long [`Database::close`] waits for checked-out connections before
/// terminating them, unless [`PostgresEngine::with_drain_timeout`] says
/// otherwise.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The maintenance database used for `CREATE DATABASE` / `DROP DATABASE`.
const MAINTENANCE_DB: &str = "postgres";

// ── Error translation ────────────────────────────────────────────────

/// Maps a driver error onto the error taxonomy by SQLSTATE class.
pub(crate) fn translate(err: tokio_postgres::Error) -> PostmodelError {
    let Some(db_err) = err.as_db_error() else {
        let io = err.source().and_then(|s| s.downcast_ref::<std::io::Error>()).is_some();
        return if err.is_closed() || io {
            PostmodelError::DbConnectionError(err.to_string())
        } else {
            PostmodelError::DatabaseError(err.to_string())
        };
    };
    let message = match db_err.detail() {
        Some(detail) => format!("{}: {detail}", db_err.message()),
        None => db_err.message().to_string(),
    };
    let code = db_err.code().code();
    match code.get(..2).unwrap_or_default() {
        "23" => PostmodelError::IntegrityError(message),
        "42" | "57" => PostmodelError::OperationalError(message),
        "25" | "2D" => PostmodelError::TransactionManagementError(message),
        "08" | "28" | "3D" => PostmodelError::DbConnectionError(message),
        _ => PostmodelError::DatabaseError(format!("{message} (SQLSTATE {code})")),
    }
}

fn pool_error(db: &str, err: PoolError) -> PostmodelError {
    match err {
        PoolError::Backend(e) => translate(e),
        PoolError::Closed => closed_error(db),
        PoolError::Timeout(_) => PostmodelError::OperationalError(format!(
            "timed out waiting for a connection to '{db}'"
        )),
        other => PostmodelError::DbConnectionError(format!("{db}: {other}")),
    }
}

fn closed_error(db: &str) -> PostmodelError {
    PostmodelError::OperationalError(format!("database '{db}' is closed"))
}

fn is_unknown_database(err: &PoolError) -> bool {
    matches!(err, PoolError::Backend(e) if e.code() == Some(&SqlState::INVALID_CATALOG_NAME))
}

// ── Parameter binding ────────────────────────────────────────────────

/// A [`Value`] encoded against the parameter type the server expects.
#[derive(Debug)]
pub(crate) struct PgParam<'a>(pub(crate) &'a Value);

type BoxError = Box<dyn StdError + Sync + Send>;

fn mismatch(value: &Value, ty: &Type) -> BoxError {
    format!("cannot bind a {} value to a {ty} parameter", value.kind()).into()
}

impl<'a> PgParam<'a> {
    fn wrap(params: &'a [Value]) -> Vec<Self> {
        params.iter().map(PgParam).collect()
    }

    fn refs<'p>(params: &'p [Self]) -> Vec<&'p (dyn ToSql + Sync)> {
        params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
    }
}

impl ToSql for PgParam<'_> {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        if let Kind::Array(_) = ty.kind() {
            return match self.0 {
                Value::Null => Ok(IsNull::Yes),
                Value::List(items) => PgParam::wrap(items).to_sql(ty, out),
                other => Err(mismatch(other, ty)),
            };
        }
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => match *ty {
                Type::BOOL => b.to_sql(ty, out),
                Type::JSON | Type::JSONB => serde_json::Value::Bool(*b).to_sql(ty, out),
                _ => Err(mismatch(self.0, ty)),
            },
            Value::Int(i) => match *ty {
                Type::INT8 => i.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::NUMERIC => Decimal::from(*i).to_sql(ty, out),
                Type::JSON | Type::JSONB => serde_json::Value::from(*i).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR => i.to_string().to_sql(ty, out),
                _ => Err(mismatch(self.0, ty)),
            },
            Value::Float(f) => match *ty {
                Type::FLOAT8 => f.to_sql(ty, out),
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                Type::NUMERIC => Decimal::try_from(*f)?.to_sql(ty, out),
                Type::JSON | Type::JSONB => serde_json::Value::from(*f).to_sql(ty, out),
                _ => Err(mismatch(self.0, ty)),
            },
            Value::Decimal(d) => match *ty {
                Type::NUMERIC => d.to_sql(ty, out),
                Type::FLOAT8 => d
                    .to_f64()
                    .ok_or_else(|| mismatch(self.0, ty))?
                    .to_sql(ty, out),
                Type::TEXT | Type::VARCHAR => d.to_string().to_sql(ty, out),
                _ => Err(mismatch(self.0, ty)),
            },
            Value::String(s) => match *ty {
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
                    s.as_str().to_sql(ty, out)
                }
                Type::JSON | Type::JSONB => serde_json::Value::String(s.clone()).to_sql(ty, out),
                Type::UUID => uuid::Uuid::parse_str(s)?.to_sql(ty, out),
                _ => Err(mismatch(self.0, ty)),
            },
            Value::Bytes(b) => match *ty {
                Type::BYTEA => b.as_slice().to_sql(ty, out),
                _ => Err(mismatch(self.0, ty)),
            },
            Value::Date(d) => match *ty {
                Type::DATE => d.to_sql(ty, out),
                _ => Err(mismatch(self.0, ty)),
            },
            Value::DateTime(dt) => match *ty {
                Type::TIMESTAMPTZ => dt.to_sql(ty, out),
                Type::TIMESTAMP => dt.naive_utc().to_sql(ty, out),
                _ => Err(mismatch(self.0, ty)),
            },
            Value::Duration(d) => match *ty {
                Type::INT8 => d
                    .num_microseconds()
                    .ok_or_else(|| mismatch(self.0, ty))?
                    .to_sql(ty, out),
                _ => Err(mismatch(self.0, ty)),
            },
            Value::Uuid(u) => match *ty {
                Type::UUID => u.to_sql(ty, out),
                Type::TEXT | Type::VARCHAR => u.to_string().to_sql(ty, out),
                _ => Err(mismatch(self.0, ty)),
            },
            Value::Json(j) => match *ty {
                Type::JSON | Type::JSONB => j.to_sql(ty, out),
                Type::TEXT | Type::VARCHAR => j.to_string().to_sql(ty, out),
                _ => Err(mismatch(self.0, ty)),
            },
            Value::List(_) => match *ty {
                Type::JSON | Type::JSONB => self.0.to_json().to_sql(ty, out),
                _ => Err(mismatch(self.0, ty)),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

// ── Row decoding ─────────────────────────────────────────────────────

fn cell<'a, T, F>(row: &'a PgRow, idx: usize, wrap: F) -> PostmodelResult<Value>
where
    T: FromSql<'a>,
    F: FnOnce(T) -> Value,
{
    Ok(row
        .try_get::<_, Option<T>>(idx)
        .map_err(translate)?
        .map_or(Value::Null, wrap))
}

fn array<'a, T, F>(row: &'a PgRow, idx: usize, wrap: F) -> PostmodelResult<Value>
where
    T: FromSql<'a>,
    F: Fn(T) -> Value,
{
    let items = row
        .try_get::<_, Option<Vec<Option<T>>>>(idx)
        .map_err(translate)?;
    Ok(items.map_or(Value::Null, |items| {
        Value::List(
            items
                .into_iter()
                .map(|item| item.map_or(Value::Null, &wrap))
                .collect(),
        )
    }))
}

fn decode_value(row: &PgRow, idx: usize) -> PostmodelResult<Value> {
    let column = &row.columns()[idx];
    match *column.type_() {
        Type::BOOL => cell(row, idx, Value::Bool),
        Type::INT2 => cell(row, idx, |v: i16| Value::Int(i64::from(v))),
        Type::INT4 => cell(row, idx, |v: i32| Value::Int(i64::from(v))),
        Type::INT8 => cell(row, idx, Value::Int),
        Type::OID => cell(row, idx, |v: u32| Value::Int(i64::from(v))),
        Type::FLOAT4 => cell(row, idx, |v: f32| Value::Float(f64::from(v))),
        Type::FLOAT8 => cell(row, idx, Value::Float),
        Type::NUMERIC => cell(row, idx, Value::Decimal),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            cell(row, idx, Value::String)
        }
        Type::BYTEA => cell(row, idx, Value::Bytes),
        Type::UUID => cell(row, idx, Value::Uuid),
        Type::DATE => cell(row, idx, Value::Date),
        Type::TIMESTAMPTZ => cell(row, idx, Value::DateTime),
        Type::TIMESTAMP => cell(row, idx, |v: NaiveDateTime| Value::DateTime(v.and_utc())),
        Type::JSON | Type::JSONB => cell(row, idx, Value::Json),
        Type::BOOL_ARRAY => array(row, idx, Value::Bool),
        Type::INT2_ARRAY => array(row, idx, |v: i16| Value::Int(i64::from(v))),
        Type::INT4_ARRAY => array(row, idx, |v: i32| Value::Int(i64::from(v))),
        Type::INT8_ARRAY => array(row, idx, Value::Int),
        Type::FLOAT8_ARRAY => array(row, idx, Value::Float),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => array(row, idx, Value::String),
        Type::UUID_ARRAY => array(row, idx, Value::Uuid),
        Type::JSON_ARRAY | Type::JSONB_ARRAY => array(row, idx, Value::Json),
        ref other => Err(PostmodelError::DatabaseError(format!(
            "unsupported column type '{other}' for column '{}'",
            column.name()
        ))),
    }
}

fn decode_row(row: &PgRow, columns: &Arc<[String]>) -> PostmodelResult<Row> {
    let values = (0..row.len())
        .map(|idx| decode_value(row, idx))
        .collect::<PostmodelResult<Vec<_>>>()?;
    Ok(Row::new(Arc::clone(columns), values))
}

// ── Statement helpers ────────────────────────────────────────────────

async fn execute_on(client: &ClientWrapper, sql: &str, params: &[Value]) -> PostmodelResult<u64> {
    tracing::debug!(target: DB_TARGET, params = params.len(), "{sql}");
    let stmt = client.prepare_cached(sql).await.map_err(translate)?;
    let args = PgParam::wrap(params);
    client
        .execute(&stmt, &PgParam::refs(&args))
        .await
        .map_err(translate)
}

async fn query_on(client: &ClientWrapper, sql: &str, params: &[Value]) -> PostmodelResult<Vec<Row>> {
    tracing::debug!(target: DB_TARGET, params = params.len(), "{sql}");
    let stmt = client.prepare_cached(sql).await.map_err(translate)?;
    let args = PgParam::wrap(params);
    let rows = client
        .query(&stmt, &PgParam::refs(&args))
        .await
        .map_err(translate)?;
    let columns: Arc<[String]> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
    rows.iter().map(|row| decode_row(row, &columns)).collect()
}

async fn execute_many_on(client: &ClientWrapper, sql: &str, rows: &[Vec<Value>]) -> PostmodelResult<u64> {
    tracing::debug!(target: DB_TARGET, rows = rows.len(), "{sql}");
    let stmt = client.prepare_cached(sql).await.map_err(translate)?;
    let mut total = 0;
    for params in rows {
        let args = PgParam::wrap(params);
        total += client
            .execute(&stmt, &PgParam::refs(&args))
            .await
            .map_err(translate)?;
    }
    Ok(total)
}

async fn script_on(client: &ClientWrapper, sql: &str) -> PostmodelResult<()> {
    tracing::debug!(target: DB_TARGET, "{sql}");
    client.batch_execute(sql).await.map_err(translate)
}

// ── Checkout tracking ────────────────────────────────────────────────

/// Connections currently checked out of one engine's pool.
///
/// [`Database::close`] uses this to reach connections whose holders do not
/// hand them back in time: idle transaction connections are detached and
/// closed, statements still running are cancelled on the server.
#[derive(Default)]
struct Checkouts {
    next_id: AtomicU64,
    cancel: StdMutex<HashMap<u64, CancelToken>>,
    pinned: StdMutex<Vec<Weak<PgTransactedConnection>>>,
}

impl Checkouts {
    fn track(self: &Arc<Self>, object: Object) -> Checkout {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, object.cancel_token());
        Checkout {
            object,
            _ticket: Ticket {
                id,
                owner: Arc::clone(self),
            },
        }
    }

    fn pin(&self, conn: &Arc<PgTransactedConnection>) {
        let mut pinned = self.pinned.lock().unwrap_or_else(PoisonError::into_inner);
        pinned.retain(|weak| weak.strong_count() > 0);
        pinned.push(Arc::downgrade(conn));
    }

    fn in_use(&self) -> usize {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn terminate(&self, db: &str) {
        let pinned = std::mem::take(&mut *self.pinned.lock().unwrap_or_else(PoisonError::into_inner));
        for conn in pinned.iter().filter_map(Weak::upgrade) {
            conn.discard();
        }
        let tokens: Vec<CancelToken> = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for token in tokens {
            if let Err(e) = token.cancel_query(NoTls).await {
                tracing::debug!(target: DB_TARGET, db, error = %e, "cancel request failed");
            }
        }
    }
}

struct Ticket {
    id: u64,
    owner: Arc<Checkouts>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.owner
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// A pooled connection, registered with its engine until dropped.
struct Checkout {
    object: Object,
    _ticket: Ticket,
}

impl Checkout {
    /// Closes the connection instead of returning it to the pool.
    fn discard(self) {
        drop(Object::take(self.object));
    }
}

impl Deref for Checkout {
    type Target = Object;

    fn deref(&self) -> &Object {
        &self.object
    }
}

// ── Engine ───────────────────────────────────────────────────────────

/// A pooled PostgreSQL database.
///
/// The pool is opened by [`init`](Self::init); repeated calls are no-ops.
/// After [`close`](Database::close) every operation fails, including
/// statements on transaction connections that were open at the time.
pub struct PostgresEngine {
    config: DbConfig,
    pool: RwLock<Option<Pool>>,
    closed: Arc<AtomicBool>,
    checkouts: Arc<Checkouts>,
    drain_timeout: Duration,
}

impl PostgresEngine {
    /// An engine for `config`. No connection is made until [`init`](Self::init).
    pub fn new(config: DbConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
            closed: Arc::new(AtomicBool::new(false)),
            checkouts: Arc::default(),
            drain_timeout: DRAIN_TIMEOUT,
        }
    }

    /// Sets how long [`close`](Database::close) waits for checked-out
    /// connections before terminating them.
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// The parsed configuration.
    pub const fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Returns `true` once the pool is open and until it is closed.
    pub fn is_initialized(&self) -> bool {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn pg_config(&self, dbname: &str) -> deadpool_postgres::Config {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some(self.config.host.clone());
        cfg.port = Some(self.config.port);
        cfg.user.clone_from(&self.config.user);
        cfg.password.clone_from(&self.config.password);
        cfg.dbname = Some(dbname.to_string());
        cfg.application_name.clone_from(&self.config.application_name);
        cfg.connect_timeout = self.config.connect_timeout;
        cfg.ssl_mode = Some(match self.config.ssl_mode {
            SslMode::Disable => deadpool_postgres::SslMode::Disable,
            SslMode::Prefer => deadpool_postgres::SslMode::Prefer,
        });
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let mut pool = PoolConfig::new(self.config.max_size);
        pool.timeouts.wait = self.config.timeout;
        pool.timeouts.create = self.config.connect_timeout;
        cfg.pool = Some(pool);
        cfg
    }

    fn build_pool(&self) -> PostmodelResult<Pool> {
        self.pg_config(&self.config.database)
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| {
                PostmodelError::ConfigurationError(format!(
                    "failed to create pool for '{}': {e}",
                    self.config.name
                ))
            })
    }

    /// Opens `min_size` connections to check the server is reachable.
    async fn warm_up(&self, pool: &Pool) -> Result<(), PoolError> {
        let mut held = Vec::with_capacity(self.config.min_size);
        for _ in 0..self.config.min_size {
            held.push(pool.get().await?);
        }
        tracing::debug!(target: DB_TARGET, db = %self.config.name, connections = held.len(), "pool warmed up");
        Ok(())
    }

    /// Opens the pool.
    ///
    /// If the server does not know the database and `create_db` is set, the
    /// database is created first.
    pub async fn init(&self) -> PostmodelResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error(&self.config.name));
        }
        if self.is_initialized() {
            return Ok(());
        }
        let pool = self.build_pool()?;
        match self.warm_up(&pool).await {
            Ok(()) => {}
            Err(err) if self.config.create_db && is_unknown_database(&err) => {
                self.db_create().await?;
                self.warm_up(&pool)
                    .await
                    .map_err(|e| self.connection_error(&e))?;
            }
            Err(err) => return Err(self.connection_error(&err)),
        }
        let mut slot = self.pool.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(pool);
            tracing::info!(
                target: DB_TARGET,
                db = %self.config.name,
                url = %self.config.redacted_url(),
                max_size = self.config.max_size,
                "database initialized"
            );
        }
        Ok(())
    }

    fn connection_error(&self, err: &PoolError) -> PostmodelError {
        PostmodelError::DbConnectionError(format!(
            "can't establish connection to database {}: {err}",
            self.config.database
        ))
    }

    fn pool(&self) -> PostmodelResult<Pool> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error(&self.config.name));
        }
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                PostmodelError::OperationalError(format!(
                    "database '{}' is not initialized",
                    self.config.name
                ))
            })
    }

    async fn client(&self) -> PostmodelResult<Checkout> {
        let object = self
            .pool()?
            .get()
            .await
            .map_err(|e| pool_error(&self.config.name, e))?;
        Ok(self.checkouts.track(object))
    }

    /// A one-off connection to the maintenance database.
    async fn admin_client(&self) -> PostmodelResult<tokio_postgres::Client> {
        let pg = self
            .pg_config(MAINTENANCE_DB)
            .get_pg_config()
            .map_err(|e| PostmodelError::ConfigurationError(e.to_string()))?;
        let (client, connection) = pg.connect(NoTls).await.map_err(translate)?;
        let name = self.config.name.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(target: DB_TARGET, db = %name, error = %e, "maintenance connection error");
            }
        });
        Ok(client)
    }

    /// Creates the configured database, owned by the configured user.
    pub async fn db_create(&self) -> PostmodelResult<()> {
        let client = self.admin_client().await?;
        let mut sql = format!("CREATE DATABASE {}", quote_ident(&self.config.database));
        if let Some(user) = &self.config.user {
            sql.push_str(&format!(" OWNER {}", quote_ident(user)));
        }
        tracing::info!(target: DB_TARGET, db = %self.config.name, "{sql}");
        client.batch_execute(&sql).await.map_err(|e| {
            PostmodelError::OperationalError(format!(
                "create database {}, error: {e}",
                self.config.database
            ))
        })
    }

    /// Closes the pool and drops the configured database.
    pub async fn db_delete(&self) -> PostmodelResult<()> {
        self.close().await?;
        let client = self.admin_client().await?;
        let sql = format!("DROP DATABASE {}", quote_ident(&self.config.database));
        tracing::info!(target: DB_TARGET, db = %self.config.name, "{sql}");
        client.batch_execute(&sql).await.map_err(|e| {
            PostmodelError::OperationalError(format!(
                "drop database {}, error: {e}",
                self.config.database
            ))
        })
    }
}

impl std::fmt::Debug for PostgresEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresEngine")
            .field("config", &self.config)
            .field("initialized", &self.is_initialized())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

#[async_trait]
impl DbExecutor for PostgresEngine {
    async fn execute_sql(&self, sql: &str, params: &[Value]) -> PostmodelResult<u64> {
        if let Some(tx) = current_connection(&self.config.name) {
            return tx.execute_sql(sql, params).await;
        }
        let client = self.client().await?;
        execute_on(&client, sql, params)
            .instrument(query_span(&self.config.name))
            .await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> PostmodelResult<Vec<Row>> {
        if let Some(tx) = current_connection(&self.config.name) {
            return tx.query(sql, params).await;
        }
        let client = self.client().await?;
        query_on(&client, sql, params)
            .instrument(query_span(&self.config.name))
            .await
    }

    async fn execute_many(&self, sql: &str, rows: &[Vec<Value>]) -> PostmodelResult<u64> {
        if let Some(tx) = current_connection(&self.config.name) {
            return tx.execute_many(sql, rows).await;
        }
        let client = self.client().await?;
        let span = query_span(&self.config.name);
        script_on(&client, "BEGIN").instrument(span.clone()).await?;
        match execute_many_on(&client, sql, rows).instrument(span.clone()).await {
            Ok(total) => {
                script_on(&client, "COMMIT").instrument(span).await?;
                Ok(total)
            }
            Err(err) => {
                if let Err(rollback_err) = script_on(&client, "ROLLBACK").instrument(span).await {
                    tracing::warn!(target: DB_TARGET, db = %self.config.name, error = %rollback_err, "rollback after failed batch failed; discarding connection");
                    client.discard();
                }
                Err(err)
            }
        }
    }

    async fn execute_script(&self, sql: &str) -> PostmodelResult<()> {
        if let Some(tx) = current_connection(&self.config.name) {
            return tx.execute_script(sql).await;
        }
        let client = self.client().await?;
        script_on(&client, sql)
            .instrument(query_span(&self.config.name))
            .await
    }
}

#[async_trait]
impl Database for PostgresEngine {
    fn name(&self) -> &str {
        &self.config.name
    }

    /// Closes the pool, waiting up to the drain timeout for checked-out
    /// connections to come back.
    ///
    /// When the timeout expires, idle transaction connections still held are
    /// closed (the server rolls their transactions back) and statements
    /// still running are cancelled. Either way the engine is unusable once
    /// this returns.
    async fn close(&self) -> PostmodelResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        let pool = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(pool) = pool else {
            return Ok(());
        };
        pool.close();
        let deadline = Instant::now() + self.drain_timeout;
        while pool.status().size > 0 {
            if Instant::now() >= deadline {
                tracing::warn!(
                    target: DB_TARGET,
                    db = %self.config.name,
                    in_use = self.checkouts.in_use(),
                    "pool drain timed out; terminating connections still in use"
                );
                self.checkouts.terminate(&self.config.name).await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tracing::info!(target: DB_TARGET, db = %self.config.name, "database closed");
        Ok(())
    }

    async fn begin(&self) -> PostmodelResult<Arc<dyn TransactedConnection>> {
        let client = self.client().await?;
        script_on(&client, "BEGIN")
            .instrument(query_span(&self.config.name))
            .await?;
        let conn = Arc::new(PgTransactedConnection::new(
            &self.config.name,
            client,
            Arc::clone(&self.closed),
        ));
        self.checkouts.pin(&conn);
        Ok(conn)
    }
}

// ── Transaction-scoped connection ────────────────────────────────────

/// A pooled connection pinned to one transaction block.
///
/// The lock serializes statements if the handle is shared between tasks.
/// A connection whose transaction was never finished is closed rather than
/// returned to the pool, whether it is released, discarded or dropped.
pub struct PgTransactedConnection {
    name: String,
    conn: Mutex<Option<Checkout>>,
    finished: AtomicBool,
    engine_closed: Arc<AtomicBool>,
}

impl PgTransactedConnection {
    fn new(name: &str, client: Checkout, engine_closed: Arc<AtomicBool>) -> Self {
        Self {
            name: name.to_string(),
            conn: Mutex::new(Some(client)),
            finished: AtomicBool::new(false),
            engine_closed,
        }
    }

    fn released(&self) -> PostmodelError {
        PostmodelError::TransactionManagementError(format!(
            "transaction connection for '{}' was already released",
            self.name
        ))
    }

    fn usable<'a>(&self, slot: &'a Option<Checkout>) -> PostmodelResult<&'a Checkout> {
        if self.engine_closed.load(Ordering::SeqCst) {
            return Err(closed_error(&self.name));
        }
        slot.as_ref().ok_or_else(|| self.released())
    }

    async fn finish(&self, sql: &str) -> PostmodelResult<()> {
        let guard = self.conn.lock().await;
        let client = self.usable(&guard)?;
        script_on(client, sql).instrument(query_span(&self.name)).await?;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl DbExecutor for PgTransactedConnection {
    async fn execute_sql(&self, sql: &str, params: &[Value]) -> PostmodelResult<u64> {
        let guard = self.conn.lock().await;
        let client = self.usable(&guard)?;
        execute_on(client, sql, params).instrument(query_span(&self.name)).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> PostmodelResult<Vec<Row>> {
        let guard = self.conn.lock().await;
        let client = self.usable(&guard)?;
        query_on(client, sql, params).instrument(query_span(&self.name)).await
    }

    async fn execute_many(&self, sql: &str, rows: &[Vec<Value>]) -> PostmodelResult<u64> {
        let guard = self.conn.lock().await;
        let client = self.usable(&guard)?;
        execute_many_on(client, sql, rows).instrument(query_span(&self.name)).await
    }

    async fn execute_script(&self, sql: &str) -> PostmodelResult<()> {
        let guard = self.conn.lock().await;
        let client = self.usable(&guard)?;
        script_on(client, sql).instrument(query_span(&self.name)).await
    }
}

#[async_trait]
impl TransactedConnection for PgTransactedConnection {
    async fn commit(&self) -> PostmodelResult<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(&self) -> PostmodelResult<()> {
        self.finish("ROLLBACK").await
    }

    /// Returns the connection to the pool. A connection whose transaction
    /// was neither committed nor rolled back is closed instead.
    async fn release(&self) {
        let Some(client) = self.conn.lock().await.take() else {
            return;
        };
        if !self.finished.load(Ordering::SeqCst) {
            tracing::warn!(target: DB_TARGET, db = %self.name, "discarding connection with an unfinished transaction");
            client.discard();
        }
    }

    /// Closes the connection now unless a statement is running on it; in
    /// that case the connection is closed when the last handle is dropped.
    fn discard(&self) {
        let Ok(mut slot) = self.conn.try_lock() else {
            return;
        };
        if let Some(client) = slot.take() {
            tracing::warn!(target: DB_TARGET, db = %self.name, "closing transaction connection");
            client.discard();
        }
    }
}

impl Drop for PgTransactedConnection {
    fn drop(&mut self) {
        let Some(client) = self.conn.get_mut().take() else {
            return;
        };
        if !*self.finished.get_mut() {
            tracing::warn!(target: DB_TARGET, db = %self.name, "dropping connection with an unfinished transaction");
            client.discard();
        }
    }
}
