//! Virtual tables: named SQL queries exposed like tables
//!
//! The SQL may contain `%name%` placeholders. Each placeholder is declared as a
//! [`VirtualTableParameter`] with an optional default and an optional
//! [`ParameterValidator`]. Expansion picks the supplied value, falls back to
//! the default, validates it and escapes it with [`escape_sql`] before it is
//! substituted. A rejected value aborts the expansion; it never falls back to
//! the default.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::error::{FeatureStoreError, Result};
use crate::primary_key::{PrimaryKey, PrimaryKeyColumn};
use crate::sql::{escape_sql, validate_parameter_name};
use crate::types::ColumnType;

/// Check applied to a parameter value before it is placed into SQL
pub trait ParameterValidator: Send + Sync {
    /// Reject with [`FeatureStoreError::InvalidArgument`]
    fn validate(&self, name: &str, value: &str) -> Result<()>;
}

/// Accepts values fully matching a regular expression
#[derive(Debug, Clone)]
pub struct RegexValidator {
    pattern: Regex,
}

impl RegexValidator {
    pub fn new(pattern: &str) -> Result<Self> {
        let anchored = format!("^(?:{})$", pattern);
        let pattern = Regex::new(&anchored).map_err(|e| {
            FeatureStoreError::invalid_argument(format!("Invalid validator pattern '{}': {}", pattern, e))
        })?;
        Ok(Self { pattern })
    }
}

impl ParameterValidator for RegexValidator {
    fn validate(&self, name: &str, value: &str) -> Result<()> {
        if self.pattern.is_match(value) {
            Ok(())
        } else {
            Err(FeatureStoreError::invalid_argument(format!(
                "Value '{}' for parameter '{}' does not match {}",
                value,
                name,
                self.pattern.as_str()
            )))
        }
    }
}

/// A named, defaulted, validated substitution value
#[derive(Clone)]
pub struct VirtualTableParameter {
    name: String,
    default_value: Option<String>,
    validator: Option<Arc<dyn ParameterValidator>>,
}

impl VirtualTableParameter {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_parameter_name(&name).map_err(FeatureStoreError::InvalidArgument)?;
        Ok(Self {
            name,
            default_value: None,
            validator: None,
        })
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn ParameterValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_value(&self) -> Option<&str> {
        self.default_value.as_deref()
    }

    /// Value to substitute, already validated and escaped
    fn resolve(&self, supplied: Option<&String>) -> Result<String> {
        let value = supplied
            .map(String::as_str)
            .or(self.default_value.as_deref())
            .ok_or_else(|| {
                FeatureStoreError::invalid_argument(format!(
                    "Missing value for parameter '{}' and no default is declared",
                    self.name
                ))
            })?;
        if let Some(validator) = &self.validator {
            validator.validate(&self.name, value)?;
        }
        Ok(escape_sql(value))
    }
}

impl fmt::Debug for VirtualTableParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualTableParameter")
            .field("name", &self.name)
            .field("default_value", &self.default_value)
            .field("validated", &self.validator.is_some())
            .finish()
    }
}

/// A SQL query exposed as a table
#[derive(Debug, Clone)]
pub struct VirtualTable {
    name: String,
    sql: String,
    parameters: Vec<VirtualTableParameter>,
    primary_key_columns: Vec<String>,
}

impl VirtualTable {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let sql = sql.into();
        if name.trim().is_empty() {
            return Err(FeatureStoreError::invalid_argument("Virtual table name cannot be empty"));
        }
        if sql.trim().is_empty() {
            return Err(FeatureStoreError::invalid_argument(format!(
                "Virtual table '{}' has no SQL",
                name
            )));
        }
        Ok(Self {
            name,
            sql,
            parameters: Vec::new(),
            primary_key_columns: Vec::new(),
        })
    }

    /// Declare a parameter, replacing one with the same name
    pub fn with_parameter(mut self, parameter: VirtualTableParameter) -> Self {
        self.parameters.retain(|p| p.name != parameter.name);
        self.parameters.push(parameter);
        self
    }

    /// Declare the identity columns of the query's rows
    pub fn with_primary_key_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn parameters(&self) -> &[VirtualTableParameter] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&VirtualTableParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Declared key; no key columns gives a null key
    pub fn primary_key(&self) -> PrimaryKey {
        let columns = self
            .primary_key_columns
            .iter()
            .map(|c| PrimaryKeyColumn::non_incrementing(c, ColumnType::String))
            .collect();
        PrimaryKey::new(&self.name, columns)
    }

    /// Substitute every declared parameter into the SQL
    ///
    /// Supplied names that are not declared are ignored. Fails with
    /// [`FeatureStoreError::InvalidArgument`] before any SQL is produced when a
    /// value is missing or rejected.
    pub fn expand(&self, values: &HashMap<String, String>) -> Result<String> {
        let mut sql = self.sql.clone();
        for parameter in &self.parameters {
            let value = parameter.resolve(values.get(&parameter.name))?;
            sql = sql.replace(&format!("%{}%", parameter.name), &value);
        }
        Ok(sql)
    }
}
