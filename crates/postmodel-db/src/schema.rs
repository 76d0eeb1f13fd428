//! Table DDL.
//!
//! [`SchemaGenerator`] emits the `CREATE TABLE`, `CREATE INDEX` and
//! `COMMENT ON` statements for one model. Generation is pure; executing the
//! script is the registry's job. Nothing here diffs against a live schema.

use sha2::{Digest, Sha256};

use postmodel_core::utils::text::{quote_ident, quote_literal};

use crate::model::ModelMeta;

/// Longest identifier the generated constraint and index names may use.
pub const MAX_IDENTIFIER_LEN: usize = 30;

/// Builds a deterministic constraint or index name.
///
/// The name is `{prefix}_{table}_{first field}_{hash}`, with the table cut to
/// 11 characters, the first field to 7, and a 6-digit hex digest of the table
/// and every field name, so tables sharing a prefix still get distinct names.
/// The result is at most [`MAX_IDENTIFIER_LEN`] bytes; when the readable part
/// is too long it is shortened at a character boundary and the digest is kept.
///
/// ```
/// use postmodel_db::schema::index_name;
///
/// let name = index_name("idx", "book_catalog_entries", &["published_at", "title"]);
/// assert!(name.starts_with("idx_book_catalo_publish_"));
/// assert!(name.len() <= 30);
/// ```
pub fn index_name(prefix: &str, table: &str, fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{table};{}", fields.join(";")).as_bytes());
    let digest = hex::encode(hasher.finalize());
    let hash = &digest[..6];
    let table_part: String = table.chars().take(11).collect();
    let field_part: String = fields
        .first()
        .map(|f| f.chars().take(7).collect())
        .unwrap_or_default();
    let head = format!("{prefix}_{table_part}_{field_part}");
    let head = truncate_bytes(&head, MAX_IDENTIFIER_LEN - hash.len() - 1);
    format!("{head}_{hash}")
}

/// The longest prefix of `s` no longer than `max` bytes.
fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Generates DDL for one model.
#[derive(Debug, Clone, Copy)]
pub struct SchemaGenerator<'m> {
    meta: &'m ModelMeta,
}

impl<'m> SchemaGenerator<'m> {
    /// Creates a generator for `meta`.
    pub const fn new(meta: &'m ModelMeta) -> Self {
        Self { meta }
    }

    fn columns_of(&self, names: &[&str]) -> Vec<String> {
        names
            .iter()
            .filter_map(|n| self.meta.field(n))
            .map(|f| quote_ident(&f.column))
            .collect()
    }

    fn column_names(&self, names: &[&str]) -> Vec<String> {
        names
            .iter()
            .filter_map(|n| self.meta.field(n))
            .map(|f| f.column.clone())
            .collect()
    }

    /// The `CREATE TABLE` statement.
    ///
    /// With `safe` the statement carries `IF NOT EXISTS`.
    pub fn create_table_sql(&self, safe: bool) -> String {
        let meta = self.meta;
        let composite = meta.is_composite_pk();
        let mut defs: Vec<String> = meta
            .fields()
            .iter()
            .map(|f| {
                let mut def = format!("{} {}", quote_ident(&f.column), f.field_type.pg_column_type());
                if !f.null {
                    def.push_str(" NOT NULL");
                }
                if f.unique && !f.primary_key {
                    def.push_str(" UNIQUE");
                }
                if f.primary_key && !composite {
                    def.push_str(" PRIMARY KEY");
                }
                def
            })
            .collect();

        if composite {
            let pk: Vec<String> = meta
                .pk_positions()
                .iter()
                .map(|&i| quote_ident(&meta.fields()[i].column))
                .collect();
            defs.push(format!("PRIMARY KEY ({})", pk.join(", ")));
        }

        for group in &meta.unique_together {
            let columns = self.column_names(group);
            let refs: Vec<&str> = columns.iter().map(String::as_str).collect();
            let name = index_name("uid", &meta.table, &refs);
            defs.push(format!(
                "CONSTRAINT {} UNIQUE ({})",
                quote_ident(&name),
                self.columns_of(group).join(", ")
            ));
        }

        let exists = if safe { "IF NOT EXISTS " } else { "" };
        format!(
            "CREATE TABLE {exists}{} (\n    {}\n);",
            quote_ident(&meta.table),
            defs.join(",\n    ")
        )
    }

    /// `CREATE INDEX` statements for `db_index` fields and declared indexes.
    pub fn create_indexes_sql(&self, safe: bool) -> Vec<String> {
        let meta = self.meta;
        let exists = if safe { "IF NOT EXISTS " } else { "" };
        let single = meta
            .fields()
            .iter()
            .filter(|f| f.db_index && !f.primary_key && !f.unique)
            .map(|f| vec![f.column.clone()]);
        let declared = meta.indexes.iter().map(|group| self.column_names(group));
        single
            .chain(declared)
            .map(|columns| {
                let refs: Vec<&str> = columns.iter().map(String::as_str).collect();
                let name = index_name("idx", &meta.table, &refs);
                let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
                format!(
                    "CREATE INDEX {exists}{} ON {} ({});",
                    quote_ident(&name),
                    quote_ident(&meta.table),
                    quoted.join(", ")
                )
            })
            .collect()
    }

    /// `COMMENT ON` statements for the table and column descriptions.
    pub fn comments_sql(&self) -> Vec<String> {
        let meta = self.meta;
        let table = quote_ident(&meta.table);
        let mut out = Vec::new();
        if let Some(text) = &meta.description {
            out.push(format!("COMMENT ON TABLE {table} IS {};", quote_literal(text)));
        }
        for f in meta.fields() {
            if let Some(text) = &f.description {
                out.push(format!(
                    "COMMENT ON COLUMN {table}.{} IS {};",
                    quote_ident(&f.column),
                    quote_literal(text)
                ));
            }
        }
        out
    }

    /// The full script: table, indexes, comments.
    pub fn create_script(&self, safe: bool) -> String {
        let mut statements = vec![self.create_table_sql(safe)];
        statements.extend(self.create_indexes_sql(safe));
        statements.extend(self.comments_sql());
        statements.join("\n")
    }

    /// Removes every row.
    pub fn clear_table_sql(&self) -> String {
        format!("DELETE FROM {};", quote_ident(&self.meta.table))
    }

    /// Drops the table if it exists.
    pub fn drop_table_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {};", quote_ident(&self.meta.table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FieldDef, FieldType};

    fn book() -> ModelMeta {
        ModelMeta::builder("Book")
            .description("Books on the shelf")
            .field(FieldDef::new("id", FieldType::Auto).primary_key())
            .field(FieldDef::new("title", FieldType::Char { max_length: 200 }).db_index())
            .field(FieldDef::new("isbn", FieldType::Char { max_length: 13 }).unique())
            .field(FieldDef::new("note", FieldType::Text).nullable().description("free text"))
            .field(FieldDef::new("data_ver", FieldType::DataVersion))
            .unique_together(&["title", "note"])
            .index(&["note", "title"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_create_table() {
        let meta = book();
        let sql = SchemaGenerator::new(&meta).create_table_sql(true);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"book\" ("));
        assert!(sql.contains("\"id\" BIGSERIAL NOT NULL PRIMARY KEY"));
        assert!(sql.contains("\"isbn\" VARCHAR(13) NOT NULL UNIQUE"));
        assert!(sql.contains("\"note\" TEXT,"));
        assert!(sql.contains("\"data_ver\" BIGINT NOT NULL"));
        assert!(sql.contains("UNIQUE (\"title\", \"note\")"));
        let strict = SchemaGenerator::new(&meta).create_table_sql(false);
        assert!(strict.starts_with("CREATE TABLE \"book\""));
    }

    #[test]
    fn test_composite_pk_trailing_constraint() {
        let meta = ModelMeta::builder("MultiPrimaryFoo")
            .field(FieldDef::new("foo_id", FieldType::Int))
            .field(FieldDef::new("name", FieldType::Char { max_length: 255 }))
            .primary_key(&["foo_id", "name"])
            .build()
            .unwrap();
        let sql = SchemaGenerator::new(&meta).create_table_sql(true);
        assert!(!sql.contains(" PRIMARY KEY,"));
        assert!(sql.contains("PRIMARY KEY (\"foo_id\", \"name\")"));
    }

    #[test]
    fn test_indexes_and_comments() {
        let meta = book();
        let generator = SchemaGenerator::new(&meta);
        let indexes = generator.create_indexes_sql(true);
        assert_eq!(indexes.len(), 2);
        assert!(indexes[0].starts_with("CREATE INDEX IF NOT EXISTS \"idx_book_title_"));
        assert!(indexes[0].ends_with("ON \"book\" (\"title\");"));
        assert!(indexes[1].ends_with("(\"note\", \"title\");"));
        let comments = generator.comments_sql();
        assert_eq!(comments[0], "COMMENT ON TABLE \"book\" IS 'Books on the shelf';");
        assert_eq!(comments[1], "COMMENT ON COLUMN \"book\".\"note\" IS 'free text';");
        assert_eq!(generator.create_script(true).lines().filter(|l| l.ends_with(';')).count(), 5);
    }

    #[test]
    fn test_index_names_stable_and_bounded() {
        let a = index_name("idx", "a_really_long_table_name", &["some_long_field", "other"]);
        let b = index_name("idx", "a_really_long_table_name", &["some_long_field", "other"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), MAX_IDENTIFIER_LEN);
        let c = index_name("idx", "a_really_long_table_other", &["some_long_field", "other"]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_index_names_bounded_in_bytes_for_multibyte_names() {
        let a = index_name("idx", "каталог_книг", &["название", "автор"]);
        let b = index_name("idx", "каталог_книжный", &["название", "автор"]);
        assert!(a.len() <= MAX_IDENTIFIER_LEN, "{a} is {} bytes", a.len());
        assert!(a.starts_with("idx_каталог"));
        let hash = &a[a.len() - 6..];
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);

        let long_prefix = index_name("a_very_long_prefix_ß", "t", &["f"]);
        assert!(long_prefix.len() <= MAX_IDENTIFIER_LEN);
        assert_eq!(long_prefix.as_bytes()[long_prefix.len() - 7], b'_');
    }

    #[test]
    fn test_clear_and_drop() {
        let meta = book();
        let generator = SchemaGenerator::new(&meta);
        assert_eq!(generator.clear_table_sql(), "DELETE FROM \"book\";");
        assert_eq!(generator.drop_table_sql(), "DROP TABLE IF EXISTS \"book\";");
    }
}
