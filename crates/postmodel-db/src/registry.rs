//! The explicit registry of databases, models and mappers.
//!
//! A [`Postmodel`] is built by an engine bootstrap (see
//! `postmodel_db_backends::init`) or directly from [`Database`] handles, and
//! passed by reference to every terminal query method. It owns:
//!
//! - the named databases (`default` plus any extras),
//! - the models registered for schema generation,
//! - one [`Mapper`] per (model type, database name), created on first use
//!   and kept until [`Postmodel::close`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use postmodel_core::logging::DB_TARGET;
use postmodel_core::{PostmodelError, PostmodelResult, DEFAULT_DB};

use crate::executor::Database;
use crate::mapper::Mapper;
use crate::model::{Model, ModelMeta};
use crate::schema::SchemaGenerator;
use crate::transactions;

type MapperKey = (TypeId, String);

/// Databases, registered models and cached mappers.
pub struct Postmodel {
    databases: RwLock<HashMap<String, Arc<dyn Database>>>,
    models: RwLock<Vec<&'static ModelMeta>>,
    mappers: Mutex<HashMap<MapperKey, Arc<dyn Any + Send + Sync>>>,
    inited: AtomicBool,
}

impl Postmodel {
    /// An empty registry with no databases. Schema generation fails until
    /// databases are added.
    pub fn new() -> Self {
        Self {
            databases: RwLock::new(HashMap::new()),
            models: RwLock::new(Vec::new()),
            mappers: Mutex::new(HashMap::new()),
            inited: AtomicBool::new(false),
        }
    }

    /// A registry over already-connected databases.
    pub fn with_databases(databases: impl IntoIterator<Item = Arc<dyn Database>>) -> Self {
        let pm = Self::new();
        for db in databases {
            pm.add_database(db);
        }
        pm
    }

    /// Adds (or replaces) a database under its own name.
    pub fn add_database(&self, db: Arc<dyn Database>) {
        let name = db.name().to_string();
        self.databases
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), db);
        self.mappers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(_, db_name), _| db_name != &name);
        self.inited.store(true, Ordering::SeqCst);
    }

    /// Returns `true` while at least one database is attached and the
    /// registry has not been closed.
    pub fn is_inited(&self) -> bool {
        self.inited.load(Ordering::SeqCst)
    }

    /// Registers a model for [`generate_schemas`](Self::generate_schemas).
    pub fn register_model<M: Model>(&self) {
        let meta = M::meta();
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        if !models.iter().any(|m| std::ptr::eq(*m, meta)) {
            models.push(meta);
        }
    }

    /// Names of the registered models.
    pub fn model_names(&self) -> Vec<&'static str> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|m| m.name)
            .collect()
    }

    /// Names of the attached databases.
    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// The database registered as `name`.
    pub fn database(&self, name: &str) -> PostmodelResult<Arc<dyn Database>> {
        if !self.is_inited() {
            return Err(PostmodelError::ConfigurationError(
                "postmodel is not initialized; call init() first".to_string(),
            ));
        }
        self.databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| PostmodelError::ConfigurationError(format!("unknown database '{name}'")))
    }

    /// The `default` database.
    pub fn default_database(&self) -> PostmodelResult<Arc<dyn Database>> {
        self.database(DEFAULT_DB)
    }

    /// The mapper of model `M` on database `db_name`, created on first use.
    pub fn get_mapper<M: Model>(&self, db_name: &str) -> PostmodelResult<Arc<Mapper<M>>> {
        let key = (TypeId::of::<M>(), db_name.to_string());
        let mut mappers = self.mappers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = mappers.get(&key) {
            if let Ok(mapper) = Arc::clone(existing).downcast::<Mapper<M>>() {
                return Ok(mapper);
            }
        }
        let mapper = Arc::new(Mapper::<M>::new(self.database(db_name)?));
        mappers.insert(key, Arc::clone(&mapper) as Arc<dyn Any + Send + Sync>);
        Ok(mapper)
    }

    /// Number of cached mappers.
    pub fn mapper_count(&self) -> usize {
        self.mappers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Creates the tables of every registered, non-abstract model.
    ///
    /// With `safe` existing tables are left alone. Nothing is migrated: a
    /// table that exists with a different shape stays as it is.
    pub async fn generate_schemas(&self, safe: bool) -> PostmodelResult<()> {
        if !self.is_inited() {
            return Err(PostmodelError::ConfigurationError(
                "you have to call init() before generating schemas".to_string(),
            ));
        }
        let models: Vec<&'static ModelMeta> = self
            .models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .filter(|m| !m.abstract_model)
            .collect();
        for meta in models {
            let db = self.database(&meta.db_name)?;
            tracing::info!(target: DB_TARGET, model = meta.name, db = db.name(), "creating table");
            db.execute_script(&SchemaGenerator::new(meta).create_script(safe))
                .await?;
        }
        Ok(())
    }

    /// Runs `f` in a transaction on `db_name`.
    pub async fn in_transaction<F, Fut, T>(&self, db_name: &str, f: F) -> PostmodelResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PostmodelResult<T>>,
    {
        transactions::in_transaction(self.database(db_name)?, f).await
    }

    /// Closes every database and drops all cached mappers.
    ///
    /// The registry reports not initialized afterwards. Every database is
    /// closed even if an earlier one fails; the first error is returned.
    pub async fn close(&self) -> PostmodelResult<()> {
        let databases: Vec<Arc<dyn Database>> = self
            .databases
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, db)| db)
            .collect();
        self.mappers.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.inited.store(false, Ordering::SeqCst);

        let mut first_err = None;
        for db in databases {
            if let Err(err) = db.close().await {
                tracing::warn!(target: DB_TARGET, db = db.name(), error = %err, "close failed");
                first_err.get_or_insert(err);
            }
        }
        tracing::info!(target: DB_TARGET, "postmodel closed");
        first_err.map_or(Ok(()), Err)
    }
}

impl Default for Postmodel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Postmodel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Postmodel")
            .field("databases", &self.database_names())
            .field("models", &self.model_names())
            .field("inited", &self.is_inited())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Book, JsonModel, MockDb, MultiPrimaryFoo};

    #[test]
    fn test_uninitialized_registry() {
        let pm = Postmodel::new();
        assert!(!pm.is_inited());
        assert!(matches!(
            pm.get_mapper::<Book>("default"),
            Err(PostmodelError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_close_without_databases() {
        let pm = Postmodel::new();
        tokio_test::block_on(pm.close()).unwrap();
        assert!(!pm.is_inited());
        assert!(pm.database_names().is_empty());
    }

    #[tokio::test]
    async fn test_generate_schemas_requires_init() {
        let pm = Postmodel::new();
        pm.register_model::<Book>();
        let err = pm.generate_schemas(true).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_generate_schemas_runs_each_model() {
        let db = MockDb::new("default");
        let pm = Postmodel::with_databases([db.clone() as Arc<dyn Database>]);
        pm.register_model::<Book>();
        pm.register_model::<MultiPrimaryFoo>();
        pm.register_model::<Book>();
        assert_eq!(pm.model_names(), vec!["Book", "MultiPrimaryFoo"]);
        pm.generate_schemas(true).await.unwrap();
        let statements = db.statements();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS \"book\""));
        assert!(statements[1].contains("PRIMARY KEY (\"foo_id\", \"name\")"));
    }

    #[test]
    fn test_mapper_cached_per_model_and_db() {
        let pm = Postmodel::with_databases([
            MockDb::new("default") as Arc<dyn Database>,
            MockDb::new("other") as Arc<dyn Database>,
        ]);
        let a = pm.get_mapper::<Book>("default").unwrap();
        let b = pm.get_mapper::<Book>("default").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        pm.get_mapper::<Book>("other").unwrap();
        pm.get_mapper::<JsonModel>("default").unwrap();
        assert_eq!(pm.mapper_count(), 3);
        assert!(pm.get_mapper::<Book>("missing").is_err());
    }

    #[tokio::test]
    async fn test_close_wipes_state() {
        let db = MockDb::new("default");
        let pm = Postmodel::with_databases([db.clone() as Arc<dyn Database>]);
        pm.get_mapper::<Book>("default").unwrap();
        pm.close().await.unwrap();
        assert!(!pm.is_inited());
        assert_eq!(pm.mapper_count(), 0);
        assert!(pm.database("default").is_err());
        let err = crate::executor::DbExecutor::execute_sql(db.as_ref(), "SELECT 1", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PostmodelError::OperationalError(_)));
    }

    #[tokio::test]
    async fn test_in_transaction_through_registry() {
        let db = MockDb::new("default");
        let pm = Postmodel::with_databases([db.clone() as Arc<dyn Database>]);
        pm.in_transaction("default", || async { Ok(()) }).await.unwrap();
        assert_eq!(db.statements(), vec!["BEGIN", "COMMIT", "RELEASE"]);
    }
}
