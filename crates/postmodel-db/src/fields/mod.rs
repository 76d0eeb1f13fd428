//! Field definitions for postmodel models.
//!
//! A [`FieldDef`] describes one column: its [`FieldType`], nullability,
//! default, uniqueness and indexing. Fields are immutable once a model's
//! metadata has been built. Value coercion lives in [`convert`].

pub mod convert;
pub mod types;

pub use types::{FieldDef, FieldDefault, FieldType};
