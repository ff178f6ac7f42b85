//! Primary key resolution strategies
//!
//! A [`PrimaryKeyFinder`] answers "which columns identify this table?" or
//! declines with `Ok(None)`. Finders are combined with
//! [`CompositePrimaryKeyFinder`], which asks each in turn until one answers.
//!
//! Finders only ever receive a [`ConnectionView`], so they can query and
//! introspect a connection that may already be enlisted in the caller's
//! transaction without being able to end that transaction.

use std::sync::Arc;

use serde_json::Value;

use crate::config::DialectConfig;
use crate::connection::ConnectionView;
use crate::error::{FeatureStoreError, Result};
use crate::primary_key::{PrimaryKey, PrimaryKeyColumn};
use crate::sql::{NamePatternEscaper, escape_literal, quote_qualified};
use crate::types::ColumnInfo;

/// Strategy that resolves the primary key of a table
pub trait PrimaryKeyFinder: Send + Sync {
    /// Resolve the key of `schema.table`, or `Ok(None)` when this strategy has no opinion
    fn find(
        &self,
        schema: Option<&str>,
        table: &str,
        connection: &mut ConnectionView<'_>,
    ) -> Result<Option<PrimaryKey>>;

    /// Name used when logging this finder
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Ordered chain of finders; the first one to answer wins
///
/// Data-access failures of a single finder are logged and skipped. Any other
/// error (a usage error) stops the chain and is returned.
#[derive(Default)]
pub struct CompositePrimaryKeyFinder {
    finders: Vec<Arc<dyn PrimaryKeyFinder>>,
}

impl CompositePrimaryKeyFinder {
    pub fn new(finders: Vec<Arc<dyn PrimaryKeyFinder>>) -> Self {
        Self { finders }
    }

    pub fn push(&mut self, finder: Arc<dyn PrimaryKeyFinder>) {
        self.finders.push(finder);
    }

    pub fn len(&self) -> usize {
        self.finders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.finders.is_empty()
    }
}

impl PrimaryKeyFinder for CompositePrimaryKeyFinder {
    fn find(
        &self,
        schema: Option<&str>,
        table: &str,
        connection: &mut ConnectionView<'_>,
    ) -> Result<Option<PrimaryKey>> {
        for finder in &self.finders {
            match finder.find(schema, table, connection) {
                Ok(Some(key)) => return Ok(Some(key)),
                Ok(None) => continue,
                Err(e) if e.is_data_access() => {
                    tracing::warn!(
                        finder = finder.name(),
                        table = table,
                        error = %e,
                        "Primary key finder failed, trying the next one"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn name(&self) -> &str {
        "composite"
    }
}

/// Resolve a column's generation strategy from introspection
///
/// Identity columns are auto generated, columns fed by a sequence are
/// sequenced, everything else is supplied by the user. A failed sequence lookup
/// is logged and treated as "no sequence".
fn classify_column(
    column: &ColumnInfo,
    schema: Option<&str>,
    table: &str,
    connection: &mut ConnectionView<'_>,
) -> PrimaryKeyColumn {
    if column.auto_increment {
        return PrimaryKeyColumn::auto_generated(&column.name, column.column_type.clone());
    }

    match connection.sequence_for_column(schema, table, &column.name) {
        Ok(Some(sequence)) => {
            PrimaryKeyColumn::sequenced(&column.name, column.column_type.clone(), sequence)
        }
        Ok(None) => PrimaryKeyColumn::non_incrementing(&column.name, column.column_type.clone()),
        Err(e) => {
            tracing::warn!(
                table = table,
                column = %column.name,
                error = %e,
                "Sequence lookup failed, treating key column as user supplied"
            );
            PrimaryKeyColumn::non_incrementing(&column.name, column.column_type.clone())
        }
    }
}

/// Resolves keys from database metadata
///
/// Uses the primary key constraint when there is one, otherwise the first
/// unique index.
#[derive(Debug, Clone)]
pub struct HeuristicPrimaryKeyFinder {
    escaper: NamePatternEscaper,
}

impl HeuristicPrimaryKeyFinder {
    pub fn new(escaper: NamePatternEscaper) -> Self {
        Self { escaper }
    }
}

impl PrimaryKeyFinder for HeuristicPrimaryKeyFinder {
    fn find(
        &self,
        schema: Option<&str>,
        table: &str,
        connection: &mut ConnectionView<'_>,
    ) -> Result<Option<PrimaryKey>> {
        let schema_pattern = schema.map(|s| self.escaper.escape(s));
        let table_pattern = self.escaper.escape(table);

        let mut columns = connection.primary_key_columns(schema_pattern.as_deref(), &table_pattern)?;
        if columns.is_empty() {
            tracing::debug!(table = table, "No primary key constraint, looking for a unique index");
            columns = connection.unique_index_columns(schema_pattern.as_deref(), &table_pattern)?;
        }
        if columns.is_empty() {
            return Ok(None);
        }

        let key_columns = columns
            .iter()
            .map(|c| classify_column(c, schema, table, connection))
            .collect();
        Ok(Some(PrimaryKey::new(table, key_columns)))
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

/// Resolves keys from a user maintained metadata table
///
/// The table has the columns `table_schema`, `table_name`, `pk_column`,
/// `pk_column_idx`, `pk_policy` (`assigned`, `sequence` or `autogenerated`)
/// and `pk_sequence`. A missing metadata table surfaces as a data-access
/// error, which the composite chain skips.
#[derive(Debug, Clone)]
pub struct MetadataTablePrimaryKeyFinder {
    metadata_table: String,
    escaper: NamePatternEscaper,
    dialect: DialectConfig,
}

impl MetadataTablePrimaryKeyFinder {
    /// `metadata_table` may be schema-qualified (`schema.table`)
    pub fn new(metadata_table: impl Into<String>, escaper: NamePatternEscaper) -> Self {
        Self {
            metadata_table: metadata_table.into(),
            escaper,
            dialect: DialectConfig::default(),
        }
    }

    pub fn with_dialect(mut self, dialect: DialectConfig) -> Self {
        self.dialect = dialect;
        self
    }

    fn literal(&self, value: &str) -> String {
        format!(
            "'{}'",
            escape_literal(
                value,
                self.dialect.escape_backslash,
                self.dialect.escape_double_quote
            )
        )
    }

    /// Lookup query for one table
    pub fn lookup_sql(&self, schema: Option<&str>, table: &str) -> String {
        let metadata_table = match self.metadata_table.split_once('.') {
            Some((s, t)) => quote_qualified(Some(s), t),
            None => quote_qualified(None, &self.metadata_table),
        };
        let schema_clause = match schema {
            Some(s) => format!("table_schema = {}", self.literal(s)),
            None => "table_schema IS NULL".to_string(),
        };
        format!(
            "SELECT pk_column, pk_policy, pk_sequence FROM {} WHERE {} AND table_name = {} ORDER BY pk_column_idx",
            metadata_table,
            schema_clause,
            self.literal(table)
        )
    }
}

fn text_field<'a>(row: &'a crate::feature::Row, name: &str) -> Option<&'a str> {
    match row.get(name) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim()),
        _ => None,
    }
}

impl PrimaryKeyFinder for MetadataTablePrimaryKeyFinder {
    fn find(
        &self,
        schema: Option<&str>,
        table: &str,
        connection: &mut ConnectionView<'_>,
    ) -> Result<Option<PrimaryKey>> {
        let rows = connection.query(&self.lookup_sql(schema, table))?;
        if rows.is_empty() {
            return Ok(None);
        }

        let schema_pattern = schema.map(|s| self.escaper.escape(s));
        let table_columns = connection.columns(schema_pattern.as_deref(), &self.escaper.escape(table))?;
        let context = format!("primary key metadata for '{}'", table);

        let mut key_columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let column_name = text_field(row, "pk_column").ok_or_else(|| {
                FeatureStoreError::data_access(&context, "pk_column is empty")
            })?;
            let column_type = table_columns
                .iter()
                .find(|c| c.name == column_name)
                .map(|c| c.column_type.clone())
                .ok_or_else(|| {
                    FeatureStoreError::data_access(
                        &context,
                        format!("column '{}' does not exist in '{}'", column_name, table),
                    )
                })?;

            let policy = text_field(row, "pk_policy")
                .unwrap_or("assigned")
                .to_lowercase();
            let column = match policy.as_str() {
                "assigned" => PrimaryKeyColumn::non_incrementing(column_name, column_type),
                "autogenerated" => PrimaryKeyColumn::auto_generated(column_name, column_type),
                "sequence" => {
                    let sequence = text_field(row, "pk_sequence").ok_or_else(|| {
                        FeatureStoreError::data_access(
                            &context,
                            format!("column '{}' uses policy 'sequence' without a sequence", column_name),
                        )
                    })?;
                    PrimaryKeyColumn::sequenced(column_name, column_type, sequence)
                }
                other => {
                    return Err(FeatureStoreError::data_access(
                        &context,
                        format!("unknown key policy '{}'", other),
                    ));
                }
            };
            key_columns.push(column);
        }

        Ok(Some(PrimaryKey::new(table, key_columns)))
    }

    fn name(&self) -> &str {
        "metadata-table"
    }
}

/// Fallback used when the whole chain declines: a null key bound to `table`
pub(crate) fn resolve_or_null(
    finder: &dyn PrimaryKeyFinder,
    schema: Option<&str>,
    table: &str,
    connection: &mut ConnectionView<'_>,
) -> Result<PrimaryKey> {
    match finder.find(schema, table, connection)? {
        Some(key) => Ok(key),
        None => {
            tracing::warn!(
                table = table,
                "No primary key or unique index found; feature ids will be synthesized and are not persistent"
            );
            Ok(PrimaryKey::null(table))
        }
    }
}
