//! SQL literal and name-pattern escaping
//!
//! These are used wherever values end up inside dynamically built SQL text
//! (metadata lookups, virtual table expansion) and wherever table or schema
//! names are handed to introspection calls that treat them as LIKE patterns.

use regex::{Captures, Regex};

use crate::error::{FeatureStoreError, Result};

/// Escape a value for use inside a single-quoted SQL literal
///
/// Single quotes are always doubled. Backslashes are doubled only when
/// `escape_backslash` is set, double quotes are backslash-prefixed only when
/// `escape_double_quote` is set. Both are dialect decisions the caller makes.
///
/// # Example
/// ```
/// use runtara_feature_store::sql::escape_literal;
///
/// assert_eq!(escape_literal("O'Brien", false, false), "O''Brien");
/// assert_eq!(escape_literal(r"C:\tmp", true, false), r"C:\\tmp");
/// ```
pub fn escape_literal(value: &str, escape_backslash: bool, escape_double_quote: bool) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    for ch in value.chars() {
        match ch {
            '\'' => escaped.push_str("''"),
            '\\' if escape_backslash => escaped.push_str("\\\\"),
            '"' if escape_double_quote => escaped.push_str("\\\""),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Strict, dialect-agnostic escaping
///
/// Doubles single and double quotes and deletes backslashes outright.
///
/// # Example
/// ```
/// use runtara_feature_store::sql::escape_sql;
///
/// assert_eq!(escape_sql("a'b\"c\\d"), "a''b\"\"cd");
/// ```
pub fn escape_sql(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    for ch in value.chars() {
        match ch {
            '\'' => escaped.push_str("''"),
            '"' => escaped.push_str("\"\""),
            '\\' => {}
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Escapes LIKE wildcards in table, schema and column names
///
/// Every occurrence of the escape string itself, `_` and `%` is prefixed with
/// the escape string. An empty escape string disables escaping.
#[derive(Debug, Clone)]
pub struct NamePatternEscaper {
    escape: String,
    pattern: Option<Regex>,
}

impl NamePatternEscaper {
    /// Create an escaper for the given escape string
    pub fn new(escape: impl Into<String>) -> Result<Self> {
        let escape = escape.into();
        let pattern = if escape.is_empty() {
            None
        } else {
            let re = Regex::new(&format!("({}|_|%)", regex::escape(&escape))).map_err(|e| {
                FeatureStoreError::invalid_argument(format!(
                    "Invalid name pattern escape '{}': {}",
                    escape, e
                ))
            })?;
            Some(re)
        };
        Ok(Self { escape, pattern })
    }

    /// The configured escape string
    pub fn escape_string(&self) -> &str {
        &self.escape
    }

    /// Escape a name; names without special characters come back unchanged
    pub fn escape(&self, name: &str) -> String {
        match &self.pattern {
            Some(re) if re.is_match(name) => re
                .replace_all(name, |caps: &Captures<'_>| {
                    format!("{}{}", self.escape, &caps[1])
                })
                .into_owned(),
            _ => name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // escape_literal Tests
    // =========================================================================

    #[test]
    fn test_escape_literal_single_quotes() {
        assert_eq!(escape_literal("O'Brien", false, false), "O''Brien");
        assert_eq!(escape_literal("''", false, false), "''''");
        assert_eq!(escape_literal("plain", false, false), "plain");
    }

    #[test]
    fn test_escape_literal_backslash_flag() {
        assert_eq!(escape_literal("a\\b", false, false), "a\\b");
        assert_eq!(escape_literal("a\\b", true, false), "a\\\\b");
    }

    #[test]
    fn test_escape_literal_double_quote_flag() {
        assert_eq!(escape_literal("say \"hi\"", false, false), "say \"hi\"");
        assert_eq!(
            escape_literal("say \"hi\"", false, true),
            "say \\\"hi\\\""
        );
    }

    #[test]
    fn test_escape_literal_all_flags() {
        // the backslash added for the quote must not be doubled again
        assert_eq!(escape_literal("'\\\"", true, true), "''\\\\\\\"");
    }

    #[test]
    fn test_escape_literal_unicode() {
        assert_eq!(escape_literal("l'été", false, false), "l''été");
    }

    // =========================================================================
    // escape_sql Tests
    // =========================================================================

    #[test]
    fn test_escape_sql_mixed() {
        assert_eq!(escape_sql("a'b\"c\\d"), "a''b\"\"cd");
    }

    #[test]
    fn test_escape_sql_removes_every_backslash() {
        assert_eq!(escape_sql("\\\\x\\"), "x");
        assert_eq!(escape_sql("\\'; DROP TABLE t; --"), "''; DROP TABLE t; --");
    }

    #[test]
    fn test_escape_sql_passthrough() {
        assert_eq!(escape_sql("roads_2024"), "roads_2024");
        assert_eq!(escape_sql(""), "");
    }

    // =========================================================================
    // NamePatternEscaper Tests
    // =========================================================================

    #[test]
    fn test_name_pattern_backslash() {
        let escaper = NamePatternEscaper::new("\\").unwrap();
        assert_eq!(escaper.escape("100%_done"), "100\\%\\_done");
        assert_eq!(escaper.escape("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_name_pattern_no_special_chars() {
        let escaper = NamePatternEscaper::new("\\").unwrap();
        assert_eq!(escaper.escape("roads"), "roads");
    }

    #[test]
    fn test_name_pattern_empty_escape_is_passthrough() {
        let escaper = NamePatternEscaper::new("").unwrap();
        assert_eq!(escaper.escape("100%_done"), "100%_done");
        assert_eq!(escaper.escape_string(), "");
    }

    #[test]
    fn test_name_pattern_multi_char_escape() {
        let escaper = NamePatternEscaper::new("!!").unwrap();
        assert_eq!(escaper.escape("my_table"), "my!!_table");
        assert_eq!(escaper.escape("a!!b"), "a!!!!b");
    }

    #[test]
    fn test_name_pattern_regex_metachar_escape() {
        let escaper = NamePatternEscaper::new("$").unwrap();
        assert_eq!(escaper.escape("a_b"), "a$_b");
        assert_eq!(escaper.escape("cost$"), "cost$$");
    }
}
