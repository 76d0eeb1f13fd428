//! Model trait and metadata.
//!
//! A model is a type implementing [`Model`], whose only job is to hand out its
//! static [`ModelMeta`]. Metadata is assembled once through
//! [`ModelMeta::builder`], which validates the definition and precomputes the
//! column projection and the filter catalog. Row values live in
//! [`Instance`](crate::instance::Instance).

use std::collections::{HashMap, HashSet};

use postmodel_core::utils::text::camel_to_snake;
use postmodel_core::{PostmodelError, PostmodelResult, DEFAULT_DB};

use crate::fields::{FieldDef, FieldType};
use crate::query::lookups::{filters_for_field, FilterInfo};
use crate::query::queryset::Manager;

/// The core trait for all models.
///
/// # Examples
///
/// ```
/// use std::sync::LazyLock;
/// use postmodel_db::fields::{FieldDef, FieldType};
/// use postmodel_db::model::{Model, ModelMeta};
///
/// struct Article;
///
/// impl Model for Article {
///     fn meta() -> &'static ModelMeta {
///         static META: LazyLock<ModelMeta> = LazyLock::new(|| {
///             ModelMeta::builder("Article")
///                 .field(FieldDef::new("id", FieldType::Auto).primary_key())
///                 .field(FieldDef::new("title", FieldType::Char { max_length: 200 }))
///                 .build()
///                 .expect("valid model")
///         });
///         &META
///     }
/// }
///
/// assert_eq!(Article::meta().table, "article");
/// ```
pub trait Model: Sized + Send + Sync + 'static {
    /// Returns the static metadata for this model type.
    fn meta() -> &'static ModelMeta;

    /// Returns a manager, the entry point for queries on this model.
    fn objects() -> Manager<Self> {
        Manager::new()
    }
}

/// Immutable table description of a model.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    /// The model's type name.
    pub name: &'static str,
    /// The database table name.
    pub table: String,
    /// The database this model lives in unless a query picks another.
    pub db_name: String,
    /// Abstract models only donate fields to others.
    pub abstract_model: bool,
    /// Table comment.
    pub description: Option<String>,
    /// Groups of fields that must be unique together.
    pub unique_together: Vec<Vec<&'static str>>,
    /// Groups of fields that get a plain index.
    pub indexes: Vec<Vec<&'static str>>,
    fields: Vec<FieldDef>,
    pk: Vec<usize>,
    by_name: HashMap<&'static str, usize>,
    by_column: HashMap<String, usize>,
    auto_fields: Vec<usize>,
    data_version: Option<usize>,
    filters: HashMap<String, FilterInfo>,
}

impl ModelMeta {
    /// Starts building metadata for the model called `name`.
    pub fn builder(name: &'static str) -> ModelMetaBuilder {
        ModelMetaBuilder::new(name)
    }

    /// All fields in declaration order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Looks up a field by attribute name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    /// Position of a field in declaration order.
    pub fn position(&self, name: &str) -> PostmodelResult<usize> {
        self.by_name.get(name).copied().ok_or_else(|| {
            PostmodelError::FieldError(format!("model '{}' has no field '{name}'", self.name))
        })
    }

    /// Looks up a field by column name.
    pub fn field_for_column(&self, column: &str) -> Option<&FieldDef> {
        self.by_column.get(column).map(|&i| &self.fields[i])
    }

    /// Positions of the primary key fields (one, or several for a composite key).
    pub fn pk_positions(&self) -> &[usize] {
        &self.pk
    }

    /// Attribute names of the primary key fields.
    pub fn pk_names(&self) -> Vec<&'static str> {
        self.pk.iter().map(|&i| self.fields[i].name).collect()
    }

    /// Returns `true` when the primary key spans several columns.
    pub fn is_composite_pk(&self) -> bool {
        self.pk.len() > 1
    }

    /// Positions of the fields filled in on save.
    pub fn auto_fields(&self) -> &[usize] {
        &self.auto_fields
    }

    /// The version-counter field, if the model has one.
    pub fn data_version_field(&self) -> Option<&FieldDef> {
        self.data_version.map(|i| &self.fields[i])
    }

    /// Position of the version-counter field.
    pub const fn data_version_position(&self) -> Option<usize> {
        self.data_version
    }

    /// Resolves a filter key against the static catalog.
    pub fn filter(&self, key: &str) -> Option<&FilterInfo> {
        self.filters.get(key)
    }

    /// Number of catalog entries.
    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }
}

/// Builder for [`ModelMeta`].
#[derive(Debug, Clone)]
pub struct ModelMetaBuilder {
    name: &'static str,
    table: Option<String>,
    db_name: String,
    abstract_model: bool,
    description: Option<String>,
    fields: Vec<FieldDef>,
    parent_fields: Vec<FieldDef>,
    parent_pk: Vec<&'static str>,
    primary_key: Vec<&'static str>,
    unique_together: Vec<Vec<&'static str>>,
    indexes: Vec<Vec<&'static str>>,
}

impl ModelMetaBuilder {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            table: None,
            db_name: DEFAULT_DB.to_string(),
            abstract_model: false,
            description: None,
            fields: Vec::new(),
            parent_fields: Vec::new(),
            parent_pk: Vec::new(),
            primary_key: Vec::new(),
            unique_together: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Sets the table name (defaults to the snake-cased model name).
    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Sets the database name used by default for this model.
    #[must_use]
    pub fn db_name(mut self, db_name: impl Into<String>) -> Self {
        self.db_name = db_name.into();
        self
    }

    /// Marks the model abstract.
    #[must_use]
    pub const fn abstract_model(mut self) -> Self {
        self.abstract_model = true;
        self
    }

    /// Sets the table comment.
    #[must_use]
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    /// Adds a field.
    #[must_use]
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Adds several fields.
    #[must_use]
    pub fn fields(mut self, fields: impl IntoIterator<Item = FieldDef>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Inherits the fields and primary key of `parent`.
    ///
    /// Fields declared on this builder replace parent fields of the same name.
    #[must_use]
    pub fn extends(mut self, parent: &ModelMeta) -> Self {
        self.parent_fields.extend(parent.fields.iter().cloned());
        if parent.is_composite_pk() {
            self.parent_pk = parent.pk_names();
        }
        self
    }

    /// Declares a composite primary key.
    #[must_use]
    pub fn primary_key(mut self, names: &[&'static str]) -> Self {
        self.primary_key = names.to_vec();
        self
    }

    /// Adds a group of fields that must be unique together.
    #[must_use]
    pub fn unique_together(mut self, names: &[&'static str]) -> Self {
        self.unique_together.push(names.to_vec());
        self
    }

    /// Adds a multi-column index.
    #[must_use]
    pub fn index(mut self, names: &[&'static str]) -> Self {
        self.indexes.push(names.to_vec());
        self
    }

    /// Validates the definition and produces the metadata.
    pub fn build(self) -> PostmodelResult<ModelMeta> {
        let name = self.name;
        let config_err = |msg: String| PostmodelError::ConfigurationError(format!("{name}: {msg}"));

        let mut fields: Vec<FieldDef> = Vec::with_capacity(self.parent_fields.len() + self.fields.len());
        let mut inherited_pk = false;
        for parent_field in self.parent_fields {
            if self.fields.iter().all(|f| f.name != parent_field.name) {
                inherited_pk |= parent_field.primary_key;
                fields.push(parent_field);
            }
        }
        let mut seen = HashSet::new();
        for field in self.fields {
            if !seen.insert(field.name) {
                return Err(config_err(format!("field '{}' declared twice", field.name)));
            }
            fields.push(field);
        }
        for field in &fields {
            field.validate()?;
        }

        let by_name: HashMap<&'static str, usize> =
            fields.iter().enumerate().map(|(i, f)| (f.name, i)).collect();
        let mut by_column = HashMap::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            if by_column.insert(field.column.clone(), i).is_some() {
                return Err(config_err(format!("column '{}' used twice", field.column)));
            }
        }
        let lookup = |n: &str| {
            by_name
                .get(n)
                .copied()
                .ok_or_else(|| config_err(format!("unknown field '{n}'")))
        };

        // Primary key: per-field flags, or one composite declaration.
        let flagged: Vec<usize> = (0..fields.len()).filter(|&i| fields[i].primary_key).collect();
        let declared = if self.primary_key.is_empty() {
            self.parent_pk
        } else {
            if !self.parent_pk.is_empty() || inherited_pk {
                return Err(config_err("duplicated pk not allowed.".to_string()));
            }
            self.primary_key
        };
        let pk: Vec<usize> = if declared.is_empty() {
            if flagged.len() > 1 {
                return Err(config_err("duplicated pk not allowed.".to_string()));
            }
            flagged
        } else {
            if !flagged.is_empty() {
                return Err(config_err("duplicated pk not allowed.".to_string()));
            }
            let positions = declared.iter().map(|n| lookup(*n)).collect::<PostmodelResult<Vec<_>>>()?;
            if positions.iter().collect::<HashSet<_>>().len() != positions.len() {
                return Err(config_err("primary key names a field twice".to_string()));
            }
            positions
        };

        let abstract_model = self.abstract_model || fields.is_empty();
        if !abstract_model && pk.is_empty() {
            return Err(config_err("model must have pk or be abstract.".to_string()));
        }
        if let Some(&i) = pk.iter().find(|&&i| fields[i].null) {
            return Err(config_err(format!("primary key field '{}' cannot be nullable", fields[i].name)));
        }

        let versions: Vec<usize> = (0..fields.len())
            .filter(|&i| fields[i].field_type == FieldType::DataVersion)
            .collect();
        if versions.len() > 1 {
            return Err(config_err("model class can only have one DataVersionField.".to_string()));
        }

        for (kind, groups) in [("unique_together", &self.unique_together), ("indexes", &self.indexes)] {
            for group in groups {
                if group.is_empty() {
                    return Err(config_err(format!("'{kind}' entries must name at least one field")));
                }
                for n in group {
                    lookup(*n).map_err(|_| {
                        config_err(format!("'{kind}' refers to nonexistent field '{n}'"))
                    })?;
                }
            }
        }

        let mut filters = HashMap::new();
        for field in &fields {
            filters.extend(filters_for_field(field, field.name));
        }
        if let [single] = pk[..] {
            if fields[single].name != "pk" {
                filters.extend(filters_for_field(&fields[single], "pk"));
            }
        }

        let auto_fields = (0..fields.len())
            .filter(|&i| fields[i].field_type.has_auto_value())
            .collect();

        Ok(ModelMeta {
            name,
            table: self.table.unwrap_or_else(|| camel_to_snake(name)),
            db_name: self.db_name,
            abstract_model,
            description: self.description,
            unique_together: self.unique_together,
            indexes: self.indexes,
            fields,
            pk,
            by_name,
            by_column,
            auto_fields,
            data_version: versions.first().copied(),
            filters,
        })
    }
}
