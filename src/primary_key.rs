//! Primary keys: the identity columns of a table
//!
//! A table either has one or more identity columns ([`PrimaryKey::Columns`]) or
//! none at all ([`PrimaryKey::Null`]). The null variant keeps every call site
//! total: it has an empty column list and synthesizes a fresh id on each fetch.
//!
//! # Synthesized ids are not persistent
//!
//! Ids produced for a [`PrimaryKey::Null`] table are generated per fetch. Reading
//! the same physical row twice, whether through one cursor or two, yields two
//! different ids, and such ids cannot be decoded back into key values.

use serde_json::Value;
use uuid::Uuid;

use crate::error::{FeatureStoreError, Result};
use crate::types::{ColumnType, value_to_text};

/// How values for a key column come into existence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyGeneration {
    /// Assigned by the database (identity / auto increment)
    AutoGenerated,
    /// Drawn from a named sequence
    Sequenced { sequence: String },
    /// Supplied by the user
    NonIncrementing,
}

/// One identity column of a table
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryKeyColumn {
    pub name: String,
    pub column_type: ColumnType,
    pub generation: KeyGeneration,
}

impl PrimaryKeyColumn {
    pub fn auto_generated(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            generation: KeyGeneration::AutoGenerated,
        }
    }

    pub fn sequenced(
        name: impl Into<String>,
        column_type: ColumnType,
        sequence: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            column_type,
            generation: KeyGeneration::Sequenced {
                sequence: sequence.into(),
            },
        }
    }

    pub fn non_incrementing(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            generation: KeyGeneration::NonIncrementing,
        }
    }

    /// Whether the database provides values for this column
    pub fn is_generated(&self) -> bool {
        !matches!(self.generation, KeyGeneration::NonIncrementing)
    }
}

/// Identity of a table
#[derive(Debug, Clone, PartialEq)]
pub enum PrimaryKey {
    /// Ordered identity columns; order matches the encoded id layout
    Columns {
        table_name: String,
        columns: Vec<PrimaryKeyColumn>,
    },
    /// No identity columns; each instance is distinct
    Null { table_name: String, instance: Uuid },
}

impl PrimaryKey {
    /// Build a key from its columns; an empty list yields a null key
    pub fn new(table_name: impl Into<String>, columns: Vec<PrimaryKeyColumn>) -> Self {
        let table_name = table_name.into();
        if columns.is_empty() {
            Self::null(table_name)
        } else {
            Self::Columns {
                table_name,
                columns,
            }
        }
    }

    /// A fresh null key bound to `table_name`
    pub fn null(table_name: impl Into<String>) -> Self {
        Self::Null {
            table_name: table_name.into(),
            instance: Uuid::new_v4(),
        }
    }

    pub fn table_name(&self) -> &str {
        match self {
            Self::Columns { table_name, .. } | Self::Null { table_name, .. } => table_name,
        }
    }

    /// Identity columns, empty for a null key
    pub fn columns(&self) -> &[PrimaryKeyColumn] {
        match self {
            Self::Columns { columns, .. } => columns,
            Self::Null { .. } => &[],
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns().iter().map(|c| c.name.as_str()).collect()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null { .. })
    }

    /// True when every column is filled in by the database
    pub fn is_generated(&self) -> bool {
        !self.is_null() && self.columns().iter().all(PrimaryKeyColumn::is_generated)
    }

    /// Encode key values into a feature id: `{table}.{v1}.{v2}...`
    ///
    /// `%` and `.` inside values are percent-escaped so composite ids split
    /// back into the same values.
    pub fn encode_fid(&self, values: &[Value]) -> Result<String> {
        if self.is_null() {
            return Ok(self.synthesize_fid());
        }
        if values.len() != self.columns().len() {
            return Err(FeatureStoreError::invalid_argument(format!(
                "Expected {} key values for '{}' but got {}",
                self.columns().len(),
                self.table_name(),
                values.len()
            )));
        }

        let encoded: Vec<String> = values
            .iter()
            .map(|v| escape_fid_part(&value_to_text(v)))
            .collect();
        Ok(format!("{}.{}", self.table_name(), encoded.join(".")))
    }

    /// Decode a feature id into typed key values
    ///
    /// A leading `{table}.` is optional.
    pub fn decode_fid(&self, fid: &str) -> Result<Vec<Value>> {
        if self.is_null() {
            return Err(FeatureStoreError::invalid_argument(format!(
                "Table '{}' has no primary key; id '{}' cannot be decoded",
                self.table_name(),
                fid
            )));
        }

        let prefix = format!("{}.", self.table_name());
        let body = fid.strip_prefix(&prefix).unwrap_or(fid);

        let parts: Vec<&str> = if self.columns().len() > 1 {
            body.split('.').collect()
        } else {
            vec![body]
        };
        if parts.len() != self.columns().len() {
            return Err(FeatureStoreError::invalid_argument(format!(
                "Illegal fid: {}. Expected {} values but got {}",
                fid,
                self.columns().len(),
                parts.len()
            )));
        }

        parts
            .iter()
            .zip(self.columns())
            .map(|(part, column)| {
                let raw = unescape_fid_part(part);
                column.column_type.coerce(&raw).map_err(|e| {
                    FeatureStoreError::invalid_argument(format!(
                        "Value '{}' illegal for key column '{}': {}",
                        raw, column.name, e
                    ))
                })
            })
            .collect()
    }

    /// A new, non-persistent id for a row of a null-key table
    pub fn synthesize_fid(&self) -> String {
        format!("{}.fid-{}", self.table_name(), Uuid::new_v4().simple())
    }
}

fn escape_fid_part(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '.' => out.push_str("%2E"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape_fid_part(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    let mut rest = part;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("%25") {
            out.push('%');
            rest = &tail[3..];
        } else if tail.starts_with("%2E") || tail.starts_with("%2e") {
            out.push('.');
            rest = &tail[3..];
        } else {
            out.push('%');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn composite_key() -> PrimaryKey {
        PrimaryKey::new(
            "parcels",
            vec![
                PrimaryKeyColumn::non_incrementing("district", ColumnType::String),
                PrimaryKeyColumn::non_incrementing("lot", ColumnType::Integer),
            ],
        )
    }

    // =========================================================================
    // Construction Tests
    // =========================================================================

    #[test]
    fn test_empty_columns_yield_null_key() {
        let key = PrimaryKey::new("logs", vec![]);
        assert!(key.is_null());
        assert!(key.columns().is_empty());
        assert_eq!(key.table_name(), "logs");
    }

    #[test]
    fn test_null_keys_are_distinct() {
        assert_ne!(PrimaryKey::null("logs"), PrimaryKey::null("logs"));
    }

    #[test]
    fn test_column_order_preserved() {
        assert_eq!(composite_key().column_names(), vec!["district", "lot"]);
    }

    #[test]
    fn test_is_generated() {
        let auto = PrimaryKey::new(
            "roads",
            vec![
                PrimaryKeyColumn::auto_generated("gid", ColumnType::Integer),
                PrimaryKeyColumn::sequenced("seq", ColumnType::Integer, "roads_seq"),
            ],
        );
        assert!(auto.is_generated());
        assert!(!composite_key().is_generated());
        assert!(!PrimaryKey::null("logs").is_generated());
    }

    // =========================================================================
    // FID Codec Tests
    // =========================================================================

    #[test]
    fn test_encode_single_column() {
        let key = PrimaryKey::new(
            "roads",
            vec![PrimaryKeyColumn::auto_generated("gid", ColumnType::Integer)],
        );
        assert_eq!(key.encode_fid(&[json!(17)]).unwrap(), "roads.17");
        assert_eq!(key.decode_fid("roads.17").unwrap(), vec![json!(17)]);
        assert_eq!(key.decode_fid("17").unwrap(), vec![json!(17)]);
    }

    #[test]
    fn test_composite_with_dots_round_trips() {
        let key = composite_key();
        let fid = key.encode_fid(&[json!("north.east"), json!(4)]).unwrap();
        assert_eq!(fid, "parcels.north%2Eeast.4");
        assert_eq!(
            key.decode_fid(&fid).unwrap(),
            vec![json!("north.east"), json!(4)]
        );
    }

    #[test]
    fn test_percent_in_value_round_trips() {
        let key = composite_key();
        let fid = key.encode_fid(&[json!("50%2E"), json!(1)]).unwrap();
        assert_eq!(
            key.decode_fid(&fid).unwrap(),
            vec![json!("50%2E"), json!(1)]
        );
    }

    #[test]
    fn test_timestamp_and_date_keys_round_trip() {
        let key = PrimaryKey::new(
            "events",
            vec![
                PrimaryKeyColumn::non_incrementing("at", ColumnType::Timestamp),
                PrimaryKeyColumn::non_incrementing("day", ColumnType::Timestamp),
            ],
        );
        let values = vec![json!("2024-01-15 10:30:00.5"), json!("2024-01-15")];

        let fid = key.encode_fid(&values).unwrap();
        assert_eq!(fid, "events.2024-01-15 10:30:00%2E5.2024-01-15");
        assert_eq!(key.decode_fid(&fid).unwrap(), values);

        let rfc = vec![json!("2024-01-15T10:30:00+01:00"), json!("2024-01-16")];
        let fid = key.encode_fid(&rfc).unwrap();
        assert_eq!(key.decode_fid(&fid).unwrap(), rfc);
    }

    #[test]
    fn test_decode_wrong_arity() {
        let err = composite_key().decode_fid("parcels.only").unwrap_err();
        assert!(matches!(err, FeatureStoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_decode_bad_type() {
        let err = composite_key().decode_fid("parcels.north.four").unwrap_err();
        assert!(err.to_string().contains("lot"));
    }

    #[test]
    fn test_encode_wrong_arity() {
        assert!(composite_key().encode_fid(&[json!("x")]).is_err());
    }

    #[test]
    fn test_null_key_synthesizes_fresh_ids() {
        let key = PrimaryKey::null("logs");
        let a = key.encode_fid(&[]).unwrap();
        let b = key.synthesize_fid();
        assert!(a.starts_with("logs.fid-"));
        assert_ne!(a, b);
        assert!(key.decode_fid(&a).is_err());
    }
}
