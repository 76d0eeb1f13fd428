//! Deferred queries and the per-model manager.
//!
//! Builders ([`QuerySet::filter`], [`QuerySet::order_by`], ...) only
//! accumulate state; nothing touches the database until a terminal method
//! that takes the [`Postmodel`] registry is awaited.
//!
//! ```ignore
//! let adults = Person::objects()
//!     .filter(q!("age__gte" => 18))
//!     .exclude(q!("name__isnull" => true))
//!     .order_by(&["-age"])
//!     .limit(10)
//!     .fetch_all(&pm)
//!     .await?;
//! ```

use std::marker::PhantomData;

use postmodel_core::{PostmodelError, PostmodelResult};

use super::expression::Q;
use super::{OrderBy, QueryParts};
use crate::instance::Instance;
use crate::model::Model;
use crate::registry::Postmodel;
use crate::value::Value;

fn db_or_default<M: Model>(db: Option<&String>) -> &str {
    db.map_or(M::meta().db_name.as_str(), String::as_str)
}

// ── QuerySet ─────────────────────────────────────────────────────────

/// A deferred `SELECT` over model `M`.
pub struct QuerySet<M: Model> {
    db: Option<String>,
    parts: QueryParts,
    expect_exactly_one: bool,
    single_or_none: bool,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> Clone for QuerySet<M> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            parts: self.parts.clone(),
            expect_exactly_one: self.expect_exactly_one,
            single_or_none: self.single_or_none,
            _model: PhantomData,
        }
    }
}

impl<M: Model> std::fmt::Debug for QuerySet<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySet")
            .field("model", &M::meta().name)
            .field("db", &self.db)
            .field("parts", &self.parts)
            .field("expect_exactly_one", &self.expect_exactly_one)
            .field("single_or_none", &self.single_or_none)
            .finish()
    }
}

impl<M: Model> Default for QuerySet<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Model> QuerySet<M> {
    /// A query over every row.
    pub fn new() -> Self {
        Self {
            db: None,
            parts: QueryParts::default(),
            expect_exactly_one: false,
            single_or_none: false,
            _model: PhantomData,
        }
    }

    /// Keeps rows matching `q`.
    #[must_use]
    pub fn filter(mut self, q: Q) -> Self {
        self.parts.filters.push(q);
        self
    }

    /// Drops rows matching `q`.
    #[must_use]
    pub fn exclude(mut self, q: Q) -> Self {
        self.parts.filters.push(!q);
        self
    }

    /// Replaces the ordering. Prefix a key with `-` for descending order.
    #[must_use]
    pub fn order_by(mut self, keys: &[&str]) -> Self {
        self.parts.ordering = keys.iter().map(|k| OrderBy::parse(k)).collect();
        self
    }

    /// Caps the number of rows.
    #[must_use]
    pub const fn limit(mut self, limit: u64) -> Self {
        self.parts.limit = Some(limit);
        self
    }

    /// Skips rows.
    #[must_use]
    pub const fn offset(mut self, offset: u64) -> Self {
        self.parts.offset = Some(offset);
        self
    }

    /// Returns only distinct rows.
    #[must_use]
    pub const fn distinct(mut self) -> Self {
        self.parts.distinct = true;
        self
    }

    /// Runs on `db` instead of the model's database.
    #[must_use]
    pub fn using(mut self, db: impl Into<String>) -> Self {
        self.db = Some(db.into());
        self
    }

    /// Filters by `q` and expects exactly one row.
    #[must_use]
    pub fn get(mut self, q: Q) -> Self {
        self.expect_exactly_one = true;
        self.filter(q)
    }

    /// Returns the first row, or none.
    #[must_use]
    pub const fn first(mut self) -> Self {
        self.single_or_none = true;
        self
    }

    /// The accumulated parts.
    pub const fn parts(&self) -> &QueryParts {
        &self.parts
    }

    /// The database the query runs on.
    pub fn db_name(&self) -> &str {
        db_or_default::<M>(self.db.as_ref())
    }

    /// Parts with the limit applied by the single-result modes.
    fn effective_parts(&self) -> QueryParts {
        let mut parts = self.parts.clone();
        let cap = if self.expect_exactly_one {
            Some(2)
        } else if self.single_or_none {
            Some(1)
        } else {
            None
        };
        if let Some(cap) = cap {
            parts.limit = Some(parts.limit.map_or(cap, |l| l.min(cap)));
        }
        parts
    }

    fn resolve_single(&self, mut rows: Vec<Instance<M>>) -> PostmodelResult<Option<Instance<M>>> {
        let name = M::meta().name;
        match rows.len() {
            0 if self.single_or_none || !self.expect_exactly_one => Ok(None),
            0 => Err(PostmodelError::DoesNotExist(format!(
                "{name} matching query does not exist"
            ))),
            1 => Ok(rows.pop()),
            _ if self.expect_exactly_one => Err(PostmodelError::MultipleObjectsReturned(format!(
                "more than one {name} matches the query"
            ))),
            _ => Ok(Some(rows.swap_remove(0))),
        }
    }

    // ── Terminals ────────────────────────────────────────────────────

    /// Runs the query and returns every row.
    ///
    /// In a single-result mode the row count is checked the same way as in
    /// [`fetch_optional`](Self::fetch_optional).
    pub async fn fetch_all(&self, pm: &Postmodel) -> PostmodelResult<Vec<Instance<M>>> {
        let mapper = pm.get_mapper::<M>(self.db_name())?;
        let rows = mapper.select(&self.effective_parts()).await?;
        if self.expect_exactly_one || self.single_or_none {
            return Ok(self.resolve_single(rows)?.into_iter().collect());
        }
        Ok(rows)
    }

    /// Runs the query expecting exactly one row.
    pub async fn fetch_one(&self, pm: &Postmodel) -> PostmodelResult<Instance<M>> {
        let mut query = self.clone();
        query.expect_exactly_one = true;
        query.single_or_none = false;
        let rows = pm.get_mapper::<M>(query.db_name())?.select(&query.effective_parts()).await?;
        query.resolve_single(rows)?.ok_or_else(|| {
            PostmodelError::DoesNotExist(format!("{} matching query does not exist", M::meta().name))
        })
    }

    /// Runs the query returning the first row, if any.
    ///
    /// Combined with [`get`](Self::get) more than one row is still an error.
    pub async fn fetch_optional(&self, pm: &Postmodel) -> PostmodelResult<Option<Instance<M>>> {
        let mut query = self.clone();
        query.single_or_none = true;
        let rows = pm.get_mapper::<M>(query.db_name())?.select(&query.effective_parts()).await?;
        query.resolve_single(rows)
    }

    /// Counts matching rows.
    pub async fn count(&self, pm: &Postmodel) -> PostmodelResult<u64> {
        self.to_count().execute(pm).await
    }

    /// Returns `true` if any row matches.
    pub async fn exists(&self, pm: &Postmodel) -> PostmodelResult<bool> {
        let head = self.clone().limit(1);
        Ok(!pm.get_mapper::<M>(head.db_name())?.select(&head.parts).await?.is_empty())
    }

    /// Sets fields on every matching row. Returns the affected row count.
    pub async fn update<I, K, V>(&self, pm: &Postmodel, values: I) -> PostmodelResult<u64>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.to_update(values).execute(pm).await
    }

    /// Deletes every matching row. Returns the deleted row count.
    pub async fn delete(&self, pm: &Postmodel) -> PostmodelResult<u64> {
        self.to_delete().execute(pm).await
    }

    /// The server's plan for this query.
    pub async fn explain(&self, pm: &Postmodel) -> PostmodelResult<serde_json::Value> {
        pm.get_mapper::<M>(self.db_name())?.explain(&self.effective_parts()).await
    }

    /// A count query over the same rows.
    pub fn to_count(&self) -> CountQuery<M> {
        CountQuery {
            db: self.db.clone(),
            parts: self.parts.clone(),
            _model: PhantomData,
        }
    }

    /// An update query over the same rows.
    pub fn to_update<I, K, V>(&self, values: I) -> UpdateQuery<M>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        UpdateQuery {
            db: self.db.clone(),
            filters: self.parts.filters.clone(),
            values: values.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            _model: PhantomData,
        }
    }

    /// A delete query over the same rows.
    pub fn to_delete(&self) -> DeleteQuery<M> {
        DeleteQuery {
            db: self.db.clone(),
            filters: self.parts.filters.clone(),
            _model: PhantomData,
        }
    }
}

// ── Bulk queries ─────────────────────────────────────────────────────

/// A deferred `UPDATE ... WHERE`.
pub struct UpdateQuery<M: Model> {
    db: Option<String>,
    filters: Vec<Q>,
    values: Vec<(String, Value)>,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> UpdateQuery<M> {
    /// Runs the update. Returns the affected row count.
    pub async fn execute(&self, pm: &Postmodel) -> PostmodelResult<u64> {
        pm.get_mapper::<M>(db_or_default::<M>(self.db.as_ref()))?
            .update_where(&self.values, &self.filters)
            .await
    }
}

/// A deferred `DELETE ... WHERE`.
pub struct DeleteQuery<M: Model> {
    db: Option<String>,
    filters: Vec<Q>,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> DeleteQuery<M> {
    /// Runs the delete. Returns the deleted row count.
    pub async fn execute(&self, pm: &Postmodel) -> PostmodelResult<u64> {
        pm.get_mapper::<M>(db_or_default::<M>(self.db.as_ref()))?
            .delete_where(&self.filters)
            .await
    }
}

/// A deferred `SELECT COUNT(*)`.
pub struct CountQuery<M: Model> {
    db: Option<String>,
    parts: QueryParts,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> CountQuery<M> {
    /// Runs the count.
    pub async fn execute(&self, pm: &Postmodel) -> PostmodelResult<u64> {
        pm.get_mapper::<M>(db_or_default::<M>(self.db.as_ref()))?
            .count(&self.parts)
            .await
    }
}

// ── Manager ──────────────────────────────────────────────────────────

/// Entry point for queries and row creation on model `M`.
///
/// Obtained through [`Model::objects`].
pub struct Manager<M: Model> {
    db: Option<String>,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> Default for Manager<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Model> Manager<M> {
    /// A manager on the model's own database.
    pub const fn new() -> Self {
        Self {
            db: None,
            _model: PhantomData,
        }
    }

    /// A manager on `db`.
    #[must_use]
    pub fn using(mut self, db: impl Into<String>) -> Self {
        self.db = Some(db.into());
        self
    }

    fn db_name(&self) -> &str {
        db_or_default::<M>(self.db.as_ref())
    }

    /// A query over every row.
    pub fn all(&self) -> QuerySet<M> {
        let qs = QuerySet::new();
        match &self.db {
            Some(db) => qs.using(db.clone()),
            None => qs,
        }
    }

    /// A query over rows matching `q`.
    pub fn filter(&self, q: Q) -> QuerySet<M> {
        self.all().filter(q)
    }

    /// A query over rows not matching `q`.
    pub fn exclude(&self, q: Q) -> QuerySet<M> {
        self.all().exclude(q)
    }

    /// A query over every row in the given order.
    pub fn order_by(&self, keys: &[&str]) -> QuerySet<M> {
        self.all().order_by(keys)
    }

    /// Builds, validates and inserts a new row.
    pub async fn create<I, K, V>(&self, pm: &Postmodel, values: I) -> PostmodelResult<Instance<M>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let mut instance = Instance::<M>::from_pairs(values)?.using(self.db_name());
        instance.save(pm).await?;
        Ok(instance)
    }

    /// Inserts many new instances with one prepared statement.
    ///
    /// Auto values are applied first. Server-generated keys are not read
    /// back, so instances of models with an auto key should be re-fetched
    /// before being saved again.
    pub async fn bulk_create(&self, pm: &Postmodel, mut instances: Vec<Instance<M>>) -> PostmodelResult<Vec<Instance<M>>> {
        for instance in &mut instances {
            instance.apply_auto_values()?;
            instance.check_required()?;
        }
        pm.get_mapper::<M>(self.db_name())?.bulk_insert(&instances).await?;
        let db = self.db_name().to_string();
        for instance in &mut instances {
            instance.mark_persisted(&db);
        }
        Ok(instances)
    }

    /// The single row matching `q`.
    pub async fn get(&self, pm: &Postmodel, q: Q) -> PostmodelResult<Instance<M>> {
        self.filter(q).fetch_one(pm).await
    }

    /// The single row matching `q`, or none. More than one match is an error.
    pub async fn get_or_none(&self, pm: &Postmodel, q: Q) -> PostmodelResult<Option<Instance<M>>> {
        self.all().get(q).fetch_optional(pm).await
    }

    /// The row matching `lookup`, created from `lookup` and `defaults` when
    /// absent. The flag is `true` if the row was created.
    ///
    /// A concurrent insert that wins the race surfaces as an integrity error
    /// on create; the lookup is then retried once.
    pub async fn get_or_create(
        &self,
        pm: &Postmodel,
        lookup: Vec<(&'static str, Value)>,
        defaults: Vec<(&'static str, Value)>,
    ) -> PostmodelResult<(Instance<M>, bool)> {
        let q = Q::from_pairs(lookup.iter().map(|(k, v)| (*k, v.clone())));
        if let Some(found) = self.get_or_none(pm, q.clone()).await? {
            return Ok((found, false));
        }
        let values = defaults.into_iter().chain(lookup);
        match self.create(pm, values).await {
            Ok(created) => Ok((created, true)),
            Err(err) if err.is_integrity() => Ok((self.get(pm, q).await?, false)),
            Err(err) => Err(err),
        }
    }

    /// The first row, if any.
    pub async fn first(&self, pm: &Postmodel) -> PostmodelResult<Option<Instance<M>>> {
        self.all().first().fetch_optional(pm).await
    }

    /// Number of rows.
    pub async fn count(&self, pm: &Postmodel) -> PostmodelResult<u64> {
        self.all().count(pm).await
    }

    /// Loads a row by its primary key: a single value, or a list in key
    /// order for a composite key.
    pub async fn load(&self, pm: &Postmodel, pk: impl Into<Value>) -> PostmodelResult<Instance<M>> {
        let values = match pk.into() {
            Value::List(items) if M::meta().is_composite_pk() => items,
            single => vec![single],
        };
        pm.get_mapper::<M>(self.db_name())?
            .load_by_pk(values)
            .await?
            .ok_or_else(|| PostmodelError::DoesNotExist(format!("{} matching pk does not exist", M::meta().name)))
    }

    /// Loads a row by named primary key fields. Every key field must be given.
    pub async fn get_by_pk(&self, pm: &Postmodel, key: &[(&str, Value)]) -> PostmodelResult<Instance<M>> {
        let meta = M::meta();
        let mut values = Vec::with_capacity(meta.pk_positions().len());
        for name in meta.pk_names() {
            let value = key.iter().find(|(k, _)| *k == name).map(|(_, v)| v.clone());
            match value {
                Some(v) => values.push(v),
                None => {
                    return Err(PostmodelError::PrimaryKeyIntegrityError(format!(
                        "'{}' primary key needs {:?}, missing '{name}'",
                        meta.name,
                        meta.pk_names()
                    )))
                }
            }
        }
        if let Some((extra, _)) = key.iter().find(|(k, _)| !meta.pk_names().contains(k)) {
            return Err(PostmodelError::PrimaryKeyIntegrityError(format!(
                "'{extra}' is not a primary key field of '{}'",
                meta.name
            )));
        }
        pm.get_mapper::<M>(self.db_name())?
            .load_by_pk(values)
            .await?
            .ok_or_else(|| PostmodelError::DoesNotExist(format!("{} matching pk does not exist", meta.name)))
    }
}
