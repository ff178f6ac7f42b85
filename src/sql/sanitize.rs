//! SQL Identifier Sanitization Utilities
//!
//! Provides functions to safely quote SQL identifiers and to validate the
//! names that are substituted into virtual table SQL.

use regex::Regex;

/// Quote a SQL identifier to make it safe for use in queries
///
/// # Arguments
/// * `identifier` - The identifier to quote
///
/// # Returns
/// The identifier wrapped in double quotes with escaped internal quotes
///
/// # Example
/// ```
/// use runtara_feature_store::sql::quote_identifier;
///
/// let quoted = quote_identifier("my_table");
/// assert_eq!(quoted, "\"my_table\"");
/// ```
pub fn quote_identifier(identifier: &str) -> String {
    // Escape any double quotes in the identifier by doubling them
    let escaped = identifier.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Quote a table name, prefixing the quoted schema when one is set
///
/// # Example
/// ```
/// use runtara_feature_store::sql::quote_qualified;
///
/// assert_eq!(quote_qualified(Some("gis"), "roads"), "\"gis\".\"roads\"");
/// assert_eq!(quote_qualified(None, "roads"), "\"roads\"");
/// ```
pub fn quote_qualified(schema: Option<&str>, table: &str) -> String {
    match schema {
        Some(schema) => format!("{}.{}", quote_identifier(schema), quote_identifier(table)),
        None => quote_identifier(table),
    }
}

/// Validate a virtual table parameter name
///
/// Rules:
/// - Must start with a letter or underscore
/// - Can only contain letters, numbers, and underscores
///
/// # Example
/// ```
/// use runtara_feature_store::sql::validate_parameter_name;
///
/// assert!(validate_parameter_name("min_population").is_ok());
/// assert!(validate_parameter_name("1st").is_err());
/// assert!(validate_parameter_name("a%b").is_err());
/// ```
pub fn validate_parameter_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Parameter name cannot be empty".to_string());
    }

    let re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").map_err(|e| e.to_string())?;
    if !re.is_match(name) {
        return Err(format!(
            "Parameter name '{}' is invalid. Must start with a letter or underscore and contain only letters, numbers, and underscores.",
            name
        ));
    }

    Ok(())
}
