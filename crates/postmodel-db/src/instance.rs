//! Model instances: one row's values plus synchronization bookkeeping.
//!
//! An [`Instance`] stores a value per field in declaration order, whether the
//! row exists in storage, and a snapshot of the values as of the last load or
//! successful write. [`Instance::changed`] diffs against that snapshot, and
//! [`Instance::save`] writes only what changed.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use postmodel_core::{PostmodelError, PostmodelResult};

use crate::model::{Model, ModelMeta};
use crate::registry::Postmodel;
use crate::value::{FromValue, Value};

/// Options for [`Instance::save_with`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Fields written in addition to the changed ones.
    pub update_fields: Vec<&'static str>,
    /// Skip auto values and the version check.
    pub force: bool,
}

impl SaveOptions {
    /// Forced save: no version condition, no auto values.
    pub fn force() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    /// Adds fields that are always written.
    #[must_use]
    pub fn update_fields(mut self, names: &[&'static str]) -> Self {
        self.update_fields.extend_from_slice(names);
        self
    }
}

/// One row of model `M`.
pub struct Instance<M: Model> {
    values: Vec<Value>,
    persisted: bool,
    snapshot: Option<Vec<Value>>,
    db: Option<String>,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> Instance<M> {
    /// A new, unsaved instance with every field at its default.
    pub fn new() -> Self {
        Self {
            values: M::meta().fields().iter().map(crate::fields::FieldDef::default_value).collect(),
            persisted: false,
            snapshot: None,
            db: None,
            _model: PhantomData,
        }
    }

    /// A new instance with the given fields set.
    ///
    /// Fails on unknown names, inconvertible values, and required fields left
    /// unset.
    pub fn from_pairs<I, K, V>(pairs: I) -> PostmodelResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let mut instance = Self::new();
        for (name, value) in pairs {
            instance.set(name.as_ref(), value)?;
        }
        instance.check_required()?;
        Ok(instance)
    }

    /// Builds a persisted instance from projected storage values.
    pub(crate) fn from_storage_row(raw: Vec<Value>, db: &str) -> PostmodelResult<Self> {
        let meta = M::meta();
        if raw.len() != meta.fields().len() {
            return Err(PostmodelError::DatabaseError(format!(
                "expected {} columns for '{}', got {}",
                meta.fields().len(),
                meta.name,
                raw.len()
            )));
        }
        let values = meta
            .fields()
            .iter()
            .zip(&raw)
            .map(|(field, value)| field.from_storage(value))
            .collect::<PostmodelResult<Vec<_>>>()?;
        let mut instance = Self {
            values,
            persisted: true,
            snapshot: None,
            db: Some(db.to_string()),
            _model: PhantomData,
        };
        instance.make_snapshot();
        Ok(instance)
    }

    /// The model's metadata.
    pub fn meta() -> &'static ModelMeta {
        M::meta()
    }

    /// The value of a field.
    pub fn get(&self, name: &str) -> PostmodelResult<&Value> {
        let pos = M::meta().position(name)?;
        Ok(&self.values[pos])
    }

    /// The typed value of a field.
    pub fn get_as<T: FromValue>(&self, name: &str) -> PostmodelResult<T> {
        T::from_value(self.get(name)?)
    }

    /// Assigns a field, converting the value to the field's type.
    ///
    /// Primary key fields of a persisted instance cannot change.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> PostmodelResult<()> {
        let meta = M::meta();
        let pos = meta.position(name)?;
        let field = &meta.fields()[pos];
        let value = field.from_storage(&value.into())?;
        if value.is_null() && !field.null && !field.field_type.is_db_generated() {
            return Err(PostmodelError::FieldValueError(format!(
                "{name} is non nullable field, but null was passed"
            )));
        }
        if self.persisted && meta.pk_positions().contains(&pos) && value != self.values[pos] {
            return Err(PostmodelError::PrimaryKeyChanged(format!(
                "{}: primary key field '{name}' of a persisted instance cannot be changed",
                meta.name
            )));
        }
        self.values[pos] = value;
        Ok(())
    }

    /// Values in field declaration order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub(crate) fn values_mut(&mut self) -> &mut [Value] {
        &mut self.values
    }

    /// The primary key: the value itself, or a list for a composite key.
    pub fn pk(&self) -> Value {
        match self.pk_values().as_slice() {
            [single] => single.clone(),
            many => Value::List(many.to_vec()),
        }
    }

    /// Primary key values in key order.
    pub fn pk_values(&self) -> Vec<Value> {
        M::meta()
            .pk_positions()
            .iter()
            .map(|&i| self.values[i].clone())
            .collect()
    }

    /// Returns `true` once the row has been written or loaded.
    pub const fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// The database this instance reads from and writes to.
    pub fn db_name(&self) -> &str {
        self.db.as_deref().unwrap_or(&M::meta().db_name)
    }

    /// Routes this instance to another database.
    #[must_use]
    pub fn using(mut self, db: impl Into<String>) -> Self {
        self.db = Some(db.into());
        self
    }

    /// Names of fields that differ from the snapshot (all of them before the
    /// first write).
    pub fn changed(&self) -> Vec<&'static str> {
        let fields = M::meta().fields();
        self.changed_positions()
            .into_iter()
            .map(|i| fields[i].name)
            .collect()
    }

    pub(crate) fn changed_positions(&self) -> Vec<usize> {
        match &self.snapshot {
            None => (0..self.values.len()).collect(),
            Some(snapshot) => (0..self.values.len())
                .filter(|&i| snapshot[i] != self.values[i])
                .collect(),
        }
    }

    pub(crate) fn make_snapshot(&mut self) {
        self.snapshot = Some(self.values.clone());
    }

    pub(crate) fn mark_persisted(&mut self, db: &str) {
        self.persisted = true;
        self.db = Some(db.to_string());
        self.make_snapshot();
    }

    /// Fills in version counters and automatic timestamps. On error no
    /// field is changed.
    pub(crate) fn apply_auto_values(&mut self) -> PostmodelResult<()> {
        let meta = M::meta();
        let mut updates = Vec::with_capacity(meta.auto_fields().len());
        for &pos in meta.auto_fields() {
            if let Some(value) = meta.fields()[pos].auto_value(&self.values[pos], self.persisted)? {
                updates.push((pos, value));
            }
        }
        for (pos, value) in updates {
            self.values[pos] = value;
        }
        Ok(())
    }

    /// Rejects NULL in fields that neither allow it nor get it from the server.
    pub(crate) fn check_required(&self) -> PostmodelResult<()> {
        for (field, value) in M::meta().fields().iter().zip(&self.values) {
            if value.is_null() && !field.null && !field.field_type.is_db_generated() {
                return Err(PostmodelError::FieldValueError(format!(
                    "{} is non nullable field, but null was passed",
                    field.name
                )));
            }
        }
        Ok(())
    }

    /// Field name to value.
    pub fn to_map(&self) -> BTreeMap<&'static str, Value> {
        M::meta()
            .fields()
            .iter()
            .zip(&self.values)
            .map(|(f, v)| (f.name, v.clone()))
            .collect()
    }

    /// A JSON object of the field values.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = M::meta()
            .fields()
            .iter()
            .zip(&self.values)
            .map(|(f, v)| (f.name.to_string(), v.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }

    // ── Row operations ───────────────────────────────────────────────

    /// Writes the instance: `INSERT` if new, else `UPDATE` of changed fields.
    pub async fn save(&mut self, pm: &Postmodel) -> PostmodelResult<()> {
        self.save_with(pm, SaveOptions::default()).await
    }

    /// [`save`](Self::save) with options.
    ///
    /// With no changes since the snapshot nothing is executed. Otherwise,
    /// unless forced, auto values are applied and, when the model has a
    /// version counter, the `UPDATE` is conditioned on the version recorded
    /// in the snapshot. Zero affected rows is a
    /// [`PostmodelError::StaleObjectError`] and leaves the instance as it was.
    pub async fn save_with(&mut self, pm: &Postmodel, options: SaveOptions) -> PostmodelResult<()> {
        let meta = M::meta();
        let mut fields = self.changed_positions();
        if fields.is_empty() {
            return Ok(());
        }
        for name in &options.update_fields {
            let pos = meta.position(name)?;
            if !fields.contains(&pos) {
                fields.push(pos);
            }
        }
        let db = self.db_name().to_string();
        let mapper = pm.get_mapper::<M>(&db)?;
        let before = self.values.clone();

        if !self.persisted {
            self.apply_auto_values()?;
            let inserted = match self.check_required() {
                Ok(()) => mapper.insert(self).await,
                Err(err) => Err(err),
            };
            return match inserted {
                Ok(()) => {
                    self.mark_persisted(&db);
                    Ok(())
                }
                Err(err) => {
                    self.values = before;
                    Err(err)
                }
            };
        }

        let mut conditions = Vec::new();
        if !options.force {
            if let Some(pos) = meta.data_version_position() {
                let observed = self
                    .snapshot
                    .as_ref()
                    .map_or_else(|| self.values[pos].clone(), |s| s[pos].clone());
                conditions.push((pos, observed));
            }
            self.apply_auto_values()?;
            for &pos in meta.auto_fields() {
                if self.values[pos] != before[pos] && !fields.contains(&pos) {
                    fields.push(pos);
                }
            }
        }
        fields.sort_unstable();

        match mapper.update(self, &fields, &conditions).await {
            Ok(0) => {
                self.values = before;
                Err(PostmodelError::StaleObjectError(format!(
                    "{} with pk {} was modified or deleted since it was loaded",
                    meta.name,
                    self.pk()
                )))
            }
            Ok(_) => {
                self.make_snapshot();
                Ok(())
            }
            Err(err) => {
                self.values = before;
                Err(err)
            }
        }
    }

    /// Deletes the row. The instance becomes unpersisted.
    pub async fn delete(&mut self, pm: &Postmodel) -> PostmodelResult<u64> {
        if !self.persisted {
            return Err(PostmodelError::OperationalError(format!(
                "can't delete unpersisted record of '{}'",
                M::meta().name
            )));
        }
        let mapper = pm.get_mapper::<M>(self.db_name())?;
        let deleted = mapper.delete(self).await?;
        self.persisted = false;
        self.snapshot = None;
        Ok(deleted)
    }

    /// Reloads every field from storage.
    pub async fn refresh(&mut self, pm: &Postmodel) -> PostmodelResult<()> {
        let mapper = pm.get_mapper::<M>(self.db_name())?;
        let fresh = mapper
            .load_by_pk(self.pk_values())
            .await?
            .ok_or_else(|| PostmodelError::DoesNotExist(format!("{self} no longer exists")))?;
        self.values = fresh.values;
        self.persisted = true;
        self.make_snapshot();
        Ok(())
    }
}

impl<M: Model> Default for Instance<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Model> Clone for Instance<M> {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
            persisted: self.persisted,
            snapshot: self.snapshot.clone(),
            db: self.db.clone(),
            _model: PhantomData,
        }
    }
}

impl<M: Model> fmt::Debug for Instance<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(M::meta().name);
        for (field, value) in M::meta().fields().iter().zip(&self.values) {
            s.field(field.name, value);
        }
        s.finish()
    }
}

impl<M: Model> fmt::Display for Instance<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}: {}>", M::meta().name, self.pk())
    }
}

impl<M: Model> PartialEq for Instance<M> {
    fn eq(&self, other: &Self) -> bool {
        self.pk() == other.pk()
    }
}

impl<M: Model> Eq for Instance<M> {}

impl<M: Model> Hash for Instance<M> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        M::meta().name.hash(state);
        self.pk().to_string().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Book, MultiPrimaryFoo};

    #[test]
    fn test_new_fills_defaults() {
        let book = Instance::<Book>::new();
        assert_eq!(book.get("data_ver").unwrap(), &Value::Int(0));
        assert_eq!(book.get("id").unwrap(), &Value::Null);
        assert!(!book.is_persisted());
        assert_eq!(book.changed().len(), Book::meta().fields().len());
    }

    #[test]
    fn test_from_pairs_requires_fields() {
        let err = Instance::<Book>::from_pairs([("data_ver", 3)]).unwrap_err();
        assert!(err.to_string().contains("non nullable"));
        let book = Instance::<Book>::from_pairs([("title", "Dune")]).unwrap();
        assert_eq!(book.get_as::<String>("title").unwrap(), "Dune");
    }

    #[test]
    fn test_set_validates() {
        let mut book = Instance::<Book>::new();
        assert!(matches!(book.set("nope", 1), Err(PostmodelError::FieldError(_))));
        assert!(matches!(book.set("title", Value::Null), Err(PostmodelError::FieldValueError(_))));
        book.set("data_ver", "7").unwrap();
        assert_eq!(book.get_as::<i64>("data_ver").unwrap(), 7);
    }

    #[test]
    fn test_pk_change_rejected_after_persist() {
        let mut foo = Instance::<MultiPrimaryFoo>::from_storage_row(
            vec![Value::Int(1), Value::from("a"), Value::Null],
            "default",
        )
        .unwrap();
        assert!(foo.changed().is_empty());
        assert_eq!(foo.pk(), Value::List(vec![Value::Int(1), Value::from("a")]));
        assert!(matches!(foo.set("foo_id", 2), Err(PostmodelError::PrimaryKeyChanged(_))));
        assert!(matches!(foo.set("name", "b"), Err(PostmodelError::PrimaryKeyChanged(_))));
        foo.set("foo_id", 1).unwrap();
        foo.set("tag", "t").unwrap();
        assert_eq!(foo.changed(), vec!["tag"]);
    }

    #[test]
    fn test_display_eq_hash() {
        let a = Instance::<Book>::from_storage_row(
            vec![Value::Int(3), Value::from("x"), Value::Int(1)],
            "default",
        )
        .unwrap();
        let mut b = a.clone();
        b.set("title", "other").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "<Book: 3>");
        let set: std::collections::HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_to_json() {
        let book = Instance::<Book>::from_pairs([("title", "Dune")]).unwrap();
        assert_eq!(
            book.to_json(),
            serde_json::json!({"id": null, "title": "Dune", "data_ver": 0})
        );
        assert_eq!(book.to_map()["title"], Value::from("Dune"));
    }

    #[test]
    fn test_apply_auto_values_bumps_version() {
        let mut book = Instance::<Book>::from_pairs([("title", "Dune")]).unwrap();
        book.apply_auto_values().unwrap();
        assert_eq!(book.get_as::<i64>("data_ver").unwrap(), 1);
    }

    #[test]
    fn test_exhausted_version_leaves_instance_unchanged() {
        let mut book =
            Instance::<Book>::from_pairs([("title", Value::from("Dune")), ("data_ver", Value::Int(i64::MAX))]).unwrap();
        book.persisted = true;
        let err = book.apply_auto_values().unwrap_err();
        assert!(matches!(err, PostmodelError::FieldValueError(_)), "{err}");
        assert_eq!(book.get_as::<i64>("data_ver").unwrap(), i64::MAX);
    }
}
