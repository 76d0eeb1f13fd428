//! Per-model, per-database statement execution.
//!
//! A [`Mapper`] compiles statements for model `M`, runs them on one
//! [`Database`] and turns result rows back into [`Instance`]s. Row statement
//! text depends only on which fields are involved, so it is cached: `INSERT`,
//! `DELETE` and select-by-key once per mapper, `UPDATE` once per
//! (set fields, condition fields) shape.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use postmodel_core::{PostmodelError, PostmodelResult};

use crate::executor::Database;
use crate::instance::Instance;
use crate::model::{Model, ModelMeta};
use crate::query::compiler::SqlCompiler;
use crate::query::expression::Q;
use crate::query::QueryParts;
use crate::schema::SchemaGenerator;
use crate::value::Value;

type UpdateShape = (Vec<usize>, Vec<usize>);

/// Executes statements for model `M` on one database.
pub struct Mapper<M: Model> {
    db: Arc<dyn Database>,
    insert_sql: OnceLock<String>,
    delete_sql: OnceLock<String>,
    select_pk_sql: OnceLock<String>,
    update_sql: Mutex<HashMap<UpdateShape, Arc<str>>>,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> Mapper<M> {
    /// Creates a mapper bound to `db`.
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            insert_sql: OnceLock::new(),
            delete_sql: OnceLock::new(),
            select_pk_sql: OnceLock::new(),
            update_sql: Mutex::new(HashMap::new()),
            _model: PhantomData,
        }
    }

    fn meta() -> &'static ModelMeta {
        M::meta()
    }

    fn compiler() -> SqlCompiler<'static> {
        SqlCompiler::new(M::meta())
    }

    /// The database this mapper runs on.
    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Number of cached `UPDATE` shapes.
    pub fn cached_update_shapes(&self) -> usize {
        self.update_sql.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn storage_values(instance: &Instance<M>, positions: &[usize]) -> PostmodelResult<Vec<Value>> {
        let fields = Self::meta().fields();
        positions
            .iter()
            .map(|&i| fields[i].to_storage(&instance.values()[i]))
            .collect()
    }

    fn decode(&self, rows: Vec<crate::executor::Row>) -> PostmodelResult<Vec<Instance<M>>> {
        rows.into_iter()
            .map(|row| Instance::from_storage_row(row.into_values(), self.db.name()))
            .collect()
    }

    // ── Schema ───────────────────────────────────────────────────────

    /// Creates the table, its indexes and comments.
    pub async fn create_table(&self, safe: bool) -> PostmodelResult<()> {
        let script = SchemaGenerator::new(Self::meta()).create_script(safe);
        self.db.execute_script(&script).await
    }

    /// Deletes every row of the table.
    pub async fn clear_table(&self) -> PostmodelResult<u64> {
        let sql = SchemaGenerator::new(Self::meta()).clear_table_sql();
        self.db.execute_sql(&sql, &[]).await
    }

    /// Drops the table if it exists.
    pub async fn delete_table(&self) -> PostmodelResult<()> {
        let sql = SchemaGenerator::new(Self::meta()).drop_table_sql();
        self.db.execute_script(&sql).await
    }

    // ── Rows ─────────────────────────────────────────────────────────

    /// Inserts one instance, reading server-generated values back into it.
    pub async fn insert(&self, instance: &mut Instance<M>) -> PostmodelResult<()> {
        let compiler = Self::compiler();
        let sql = self.insert_sql.get_or_init(|| compiler.insert_sql());
        let params = Self::storage_values(instance, &compiler.insert_positions())?;
        let returning = compiler.returning_positions();
        if returning.is_empty() {
            self.db.execute_sql(sql, &params).await?;
            return Ok(());
        }
        let row = self
            .db
            .query(sql, &params)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PostmodelError::DatabaseError("INSERT returned no row".to_string()))?;
        let fields = Self::meta().fields();
        for (k, &pos) in returning.iter().enumerate() {
            let raw = row.values().get(k).cloned().unwrap_or(Value::Null);
            instance.values_mut()[pos] = fields[pos].from_storage(&raw)?;
        }
        Ok(())
    }

    /// Inserts many instances with one prepared statement.
    ///
    /// Server-generated values are not read back.
    pub async fn bulk_insert(&self, instances: &[Instance<M>]) -> PostmodelResult<u64> {
        if instances.is_empty() {
            return Ok(0);
        }
        let compiler = Self::compiler();
        let sql = self.insert_sql.get_or_init(|| compiler.insert_sql());
        let positions = compiler.insert_positions();
        let rows = instances
            .iter()
            .map(|instance| Self::storage_values(instance, &positions))
            .collect::<PostmodelResult<Vec<_>>>()?;
        self.db.execute_many(sql, &rows).await
    }

    /// Updates `fields` of one row, matched by primary key plus `conditions`.
    ///
    /// Returns the affected row count; zero means the conditions no longer hold.
    pub async fn update(
        &self,
        instance: &Instance<M>,
        fields: &[usize],
        conditions: &[(usize, Value)],
    ) -> PostmodelResult<u64> {
        let condition_positions: Vec<usize> = conditions.iter().map(|(pos, _)| *pos).collect();
        let shape = (fields.to_vec(), condition_positions);
        let sql = {
            let mut cache = self.update_sql.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(cache.entry(shape).or_insert_with_key(|(set, cond)| {
                Arc::from(Self::compiler().update_row_sql(set, cond))
            }))
        };

        let meta = Self::meta();
        let mut params = Self::storage_values(instance, fields)?;
        params.extend(Self::storage_values(instance, meta.pk_positions())?);
        for (pos, value) in conditions {
            params.push(meta.fields()[*pos].to_storage(value)?);
        }
        self.db.execute_sql(&sql, &params).await
    }

    /// Deletes one row by primary key.
    pub async fn delete(&self, instance: &Instance<M>) -> PostmodelResult<u64> {
        let sql = self.delete_sql.get_or_init(|| Self::compiler().delete_row_sql());
        let params = Self::storage_values(instance, Self::meta().pk_positions())?;
        self.db.execute_sql(sql, &params).await
    }

    /// Loads one row by its full primary key, in key order.
    pub async fn load_by_pk(&self, pk: Vec<Value>) -> PostmodelResult<Option<Instance<M>>> {
        let meta = Self::meta();
        if pk.len() != meta.pk_positions().len() {
            return Err(PostmodelError::PrimaryKeyIntegrityError(format!(
                "'{}' has a {}-field primary key, got {} value(s)",
                meta.name,
                meta.pk_positions().len(),
                pk.len()
            )));
        }
        let params = meta
            .pk_positions()
            .iter()
            .zip(&pk)
            .map(|(&i, v)| meta.fields()[i].to_storage(v))
            .collect::<PostmodelResult<Vec<_>>>()?;
        let sql = self.select_pk_sql.get_or_init(|| Self::compiler().select_by_pk_sql());
        Ok(self.decode(self.db.query(sql, &params).await?)?.into_iter().next())
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Runs a `SELECT` and decodes every row.
    pub async fn select(&self, parts: &QueryParts) -> PostmodelResult<Vec<Instance<M>>> {
        let compiled = Self::compiler().select(parts)?;
        let rows = self.db.query(&compiled.sql, &compiled.params).await?;
        self.decode(rows)
    }

    /// Counts matching rows.
    pub async fn count(&self, parts: &QueryParts) -> PostmodelResult<u64> {
        let compiled = Self::compiler().count(parts)?;
        let rows = self.db.query(&compiled.sql, &compiled.params).await?;
        let count = rows
            .first()
            .map(|row| row.get_by_index::<i64>(0))
            .transpose()?
            .unwrap_or(0);
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Sets `values` on every row matching `filters`.
    pub async fn update_where(&self, values: &[(String, Value)], filters: &[Q]) -> PostmodelResult<u64> {
        let meta = Self::meta();
        let assignments = values
            .iter()
            .map(|(name, value)| {
                let pos = meta.position(name)?;
                Ok((pos, meta.fields()[pos].to_storage(value)?))
            })
            .collect::<PostmodelResult<Vec<_>>>()?;
        let compiled = Self::compiler().update_where(&assignments, filters)?;
        self.db.execute_sql(&compiled.sql, &compiled.params).await
    }

    /// Deletes every row matching `filters`.
    pub async fn delete_where(&self, filters: &[Q]) -> PostmodelResult<u64> {
        let compiled = Self::compiler().delete_where(filters)?;
        self.db.execute_sql(&compiled.sql, &compiled.params).await
    }

    /// The server's plan for the select, as JSON.
    pub async fn explain(&self, parts: &QueryParts) -> PostmodelResult<serde_json::Value> {
        let compiled = Self::compiler().explain(parts)?;
        let rows = self.db.query(&compiled.sql, &compiled.params).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_values().into_iter().next())
            .map_or(serde_json::Value::Null, |v| v.to_json()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Book, MockDb};

    fn persisted_book(id: i64, title: &str, version: i64) -> Instance<Book> {
        Instance::from_storage_row(
            vec![Value::Int(id), Value::from(title), Value::Int(version)],
            "default",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_reads_back_auto_pk() {
        let db = MockDb::new("default");
        db.push_rows(&["id"], vec![vec![Value::Int(41)]]);
        let mapper = Mapper::<Book>::new(db.clone());
        let mut book = Instance::<Book>::from_pairs([("title", "Dune")]).unwrap();
        mapper.insert(&mut book).await.unwrap();
        assert_eq!(book.pk(), Value::Int(41));
        assert_eq!(
            db.statements(),
            vec!["INSERT INTO \"book\" (\"title\", \"data_ver\") VALUES ($1, $2) RETURNING \"id\""]
        );
        assert_eq!(db.params()[0], vec![Value::from("Dune"), Value::Int(0)]);
    }

    #[tokio::test]
    async fn test_update_cache_keyed_by_shape() {
        let db = MockDb::new("default");
        let mapper = Mapper::<Book>::new(db.clone());
        let book = persisted_book(1, "a", 1);
        mapper.update(&book, &[1], &[]).await.unwrap();
        mapper.update(&book, &[1], &[]).await.unwrap();
        assert_eq!(mapper.cached_update_shapes(), 1);
        mapper.update(&book, &[1, 2], &[(2, Value::Int(1))]).await.unwrap();
        assert_eq!(mapper.cached_update_shapes(), 2);
        assert_eq!(
            db.statements()[2],
            "UPDATE \"book\" SET \"title\" = $1, \"data_ver\" = $2 WHERE \"id\" = $3 AND \"data_ver\" = $4"
        );
        assert_eq!(
            db.params()[2],
            vec![Value::from("a"), Value::Int(1), Value::Int(1), Value::Int(1)]
        );
    }

    #[tokio::test]
    async fn test_select_decodes_persisted_instances() {
        let db = MockDb::new("default");
        db.push_rows(
            &["id", "title", "data_ver"],
            vec![
                vec![Value::Int(1), Value::from("a"), Value::Int(1)],
                vec![Value::Int(2), Value::from("b"), Value::Int(3)],
            ],
        );
        let mapper = Mapper::<Book>::new(db.clone());
        let books = mapper.select(&QueryParts::default()).await.unwrap();
        assert_eq!(books.len(), 2);
        assert!(books.iter().all(|b| b.is_persisted() && b.changed().is_empty()));
    }

    #[tokio::test]
    async fn test_load_by_pk_checks_arity() {
        let db = MockDb::new("default");
        let mapper = Mapper::<Book>::new(db.clone());
        let err = mapper.load_by_pk(vec![]).await.unwrap_err();
        assert!(matches!(err, PostmodelError::PrimaryKeyIntegrityError(_)));
        assert!(mapper.load_by_pk(vec![Value::Int(9)]).await.unwrap().is_none());
        assert_eq!(
            db.statements(),
            vec!["SELECT \"id\", \"title\", \"data_ver\" FROM \"book\" WHERE \"id\" = $1"]
        );
    }

    #[tokio::test]
    async fn test_bulk_insert_reuses_insert_sql() {
        let db = MockDb::new("default");
        let mapper = Mapper::<Book>::new(db.clone());
        let books: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|t| Instance::<Book>::from_pairs([("title", *t)]).unwrap())
            .collect();
        assert_eq!(mapper.bulk_insert(&books).await.unwrap(), 3);
        let statements = db.statements();
        assert_eq!(statements.len(), 3);
        assert!(statements.iter().all(|s| s == &statements[0]));
        assert_eq!(mapper.bulk_insert(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_count_and_explain() {
        let db = MockDb::new("default");
        db.push_rows(&["count"], vec![vec![Value::Int(5)]]);
        db.push_rows(&["QUERY PLAN"], vec![vec![Value::Json(serde_json::json!([{"Plan": {}}]))]]);
        let mapper = Mapper::<Book>::new(db.clone());
        assert_eq!(mapper.count(&QueryParts::default()).await.unwrap(), 5);
        let plan = mapper.explain(&QueryParts::default()).await.unwrap();
        assert!(plan[0]["Plan"].is_object());
        assert!(db.statements()[1].starts_with("EXPLAIN (FORMAT JSON) SELECT"));
    }

    #[tokio::test]
    async fn test_update_where_rejects_unknown_field() {
        let db = MockDb::new("default");
        let mapper = Mapper::<Book>::new(db.clone());
        let err = mapper
            .update_where(&[("nope".into(), Value::Int(1))], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PostmodelError::FieldError(_)));
        assert!(db.statements().is_empty());
    }
}
