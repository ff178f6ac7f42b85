//! Core type definitions for Feature Store
//!
//! Column value types and the column descriptions returned by introspection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Value type of a table column
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ColumnType {
    /// Text (TEXT, VARCHAR, CHAR, UUID, ...)
    String,

    /// Whole number (SMALLINT, INTEGER, BIGINT)
    Integer,

    /// Exact or floating numeric (NUMERIC, REAL, DOUBLE PRECISION)
    Decimal,

    /// BOOLEAN
    Boolean,

    /// Timestamp or date, exchanged as text (RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]`
    /// or `YYYY-MM-DD`)
    Timestamp,

    /// JSON / JSONB
    Json,
}

impl ColumnType {
    /// Map an `information_schema.columns.data_type` value to a column type
    pub fn from_sql_type(data_type: &str) -> Self {
        let lower = data_type.to_lowercase();
        match lower.as_str() {
            "smallint" | "integer" | "bigint" | "int" | "int2" | "int4" | "int8" | "serial"
            | "bigserial" | "smallserial" => ColumnType::Integer,
            "numeric" | "decimal" | "real" | "double precision" | "float4" | "float8" => {
                ColumnType::Decimal
            }
            "boolean" | "bool" => ColumnType::Boolean,
            "json" | "jsonb" => ColumnType::Json,
            t if t.starts_with("timestamp") || t == "date" => ColumnType::Timestamp,
            _ => ColumnType::String,
        }
    }

    /// Convert a raw text value (e.g. a decoded feature id part) into a JSON value
    /// of this column type
    pub fn coerce(&self, raw: &str) -> Result<Value, String> {
        match self {
            ColumnType::String => Ok(Value::String(raw.to_string())),
            ColumnType::Integer => raw
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("Cannot convert '{}' to integer", raw)),
            ColumnType::Decimal => raw
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("Cannot convert '{}' to decimal", raw)),
            ColumnType::Boolean => match raw.to_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Value::Bool(true)),
                "false" | "0" | "no" => Ok(Value::Bool(false)),
                _ => Err(format!("Cannot convert '{}' to boolean", raw)),
            },
            ColumnType::Timestamp if is_timestamp_text(raw) => Ok(Value::String(raw.to_string())),
            ColumnType::Timestamp => Err(format!("Invalid timestamp format: '{}'", raw)),
            ColumnType::Json => {
                Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
            }
        }
    }
}

/// Text forms the PostgreSQL adapter produces for TIMESTAMPTZ, TIMESTAMP and DATE
fn is_timestamp_text(raw: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(raw).is_ok()
        || chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").is_ok()
        || chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok()
}

/// Render a JSON value as the text used inside feature ids
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Column description returned by connection introspection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,

    /// Column value type
    #[serde(flatten)]
    pub column_type: ColumnType,

    /// Whether the database assigns the value itself (identity / auto increment)
    #[serde(default)]
    pub auto_increment: bool,
}

impl ColumnInfo {
    /// Create a new column description
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            auto_increment: false,
        }
    }

    /// Mark the column as database-assigned
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }
}
