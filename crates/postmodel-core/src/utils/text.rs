//! String helpers used when deriving names from model definitions.

/// Converts a `CamelCase` model name to `snake_case`, the default table name.
///
/// Runs of capitals are treated as one word, so acronyms stay together.
///
/// # Examples
///
/// ```
/// use postmodel_core::utils::text::camel_to_snake;
///
/// assert_eq!(camel_to_snake("CharFieldsModel"), "char_fields_model");
/// assert_eq!(camel_to_snake("HTTPResponse"), "http_response");
/// assert_eq!(camel_to_snake("foo"), "foo");
/// ```
pub fn camel_to_snake(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(char::is_ascii_lowercase);
            let after_word = prev.is_ascii_lowercase() || prev.is_ascii_digit();
            if prev != '_' && (after_word || next_is_lower) {
                out.push('_');
            }
        }
        out.push(c.to_ascii_lowercase());
    }
    out
}

/// Escapes a string for use inside a single-quoted SQL literal.
///
/// # Examples
///
/// ```
/// use postmodel_core::utils::text::quote_literal;
///
/// assert_eq!(quote_literal("it's"), "'it''s'");
/// ```
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Quotes an SQL identifier, doubling embedded double quotes.
pub fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camel_to_snake() {
        assert_eq!(camel_to_snake("Foo"), "foo");
        assert_eq!(camel_to_snake("FooJsonModel"), "foo_json_model");
        assert_eq!(camel_to_snake("MultiPrimaryFoo"), "multi_primary_foo");
        assert_eq!(camel_to_snake("Book2Model"), "book2_model");
        assert_eq!(camel_to_snake("already_snake"), "already_snake");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("age"), "'age'");
        assert_eq!(quote_literal("a'); DROP TABLE x; --"), "'a''); DROP TABLE x; --'");
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("name"), "\"name\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
