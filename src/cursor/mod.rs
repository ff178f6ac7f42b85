//! Forward-only cursors over table rows
//!
//! - [`ReadCursor`] - plain read over a [`RowSource`]
//! - [`JoinFilterCursor`] - drops rows rejected by per-branch filters
//! - [`UpdateInsertWriter`] - updates existing rows, then appends new ones
//!
//! Rows come from a [`RowSource`] and are turned into [`Feature`]s by a
//! [`FeatureBuilder`], which derives each feature id from the table's
//! [`PrimaryKey`].

mod join;
mod reader;
mod writer;

use std::collections::VecDeque;

pub use join::{JoinBranch, JoinFilterCursor};
pub use reader::ReadCursor;
pub use writer::{
    InsertCursor, StatementHandle, StatementView, UpdateCursor, UpdateInsertWriter, WriterPhase,
};

use serde_json::Value;

use crate::error::{FeatureStoreError, Result};
use crate::feature::{Feature, Row};
use crate::primary_key::PrimaryKey;

/// Producer of raw rows
pub trait RowSource: Send {
    /// Next row, or `None` once the source is exhausted
    fn advance(&mut self) -> Result<Option<Row>>;

    /// Release whatever the source holds
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Rows already fetched into memory
#[derive(Debug, Default)]
pub struct RowBuffer {
    rows: VecDeque<Row>,
}

impl RowBuffer {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows: rows.into() }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl From<Vec<Row>> for RowBuffer {
    fn from(rows: Vec<Row>) -> Self {
        Self::new(rows)
    }
}

impl RowSource for RowBuffer {
    fn advance(&mut self) -> Result<Option<Row>> {
        Ok(self.rows.pop_front())
    }

    fn close(&mut self) -> Result<()> {
        self.rows.clear();
        Ok(())
    }
}

/// Read access to a sequence of features
pub trait FeatureReader: Send {
    /// Whether another feature is available; repeated calls do not advance
    fn has_next(&mut self) -> Result<bool>;

    /// The next feature; requires a preceding `has_next` that returned true
    fn next(&mut self) -> Result<Feature>;

    /// Release the underlying resources; closing twice is a no-op
    fn close(&mut self) -> Result<()>;
}

/// Read/write access to a sequence of features
pub trait FeatureWriter: Send {
    fn has_next(&mut self) -> Result<bool>;

    /// The feature to modify; changes are persisted by [`FeatureWriter::write`]
    fn next(&mut self) -> Result<&mut Feature>;

    fn write(&mut self) -> Result<()>;

    fn remove(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Statement collaborator used by writers to persist features
///
/// Building the UPDATE / INSERT / DELETE text belongs to the implementor.
pub trait FeatureStatement: Send {
    fn update(&mut self, key: &PrimaryKey, feature: &Feature) -> Result<()>;

    /// Insert a new feature; implementors may replace `feature.id` with the
    /// id derived from generated key values
    fn insert(&mut self, key: &PrimaryKey, feature: &mut Feature) -> Result<()>;

    fn delete(&mut self, key: &PrimaryKey, feature: &Feature) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Name the table behind a row source failure; contract violations pass through
pub(crate) fn fetch_error(table: &str, e: FeatureStoreError) -> FeatureStoreError {
    if e.is_data_access() {
        FeatureStoreError::data_access_from(format!("fetching from '{}'", table), e)
    } else {
        e
    }
}

/// Turns raw rows into features of one table
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    key: PrimaryKey,
    expose_primary_keys: bool,
}

impl FeatureBuilder {
    pub fn new(key: PrimaryKey, expose_primary_keys: bool) -> Self {
        Self {
            key,
            expose_primary_keys,
        }
    }

    pub fn key(&self) -> &PrimaryKey {
        &self.key
    }

    pub fn table_name(&self) -> &str {
        self.key.table_name()
    }

    /// Build a feature from a row
    ///
    /// Key columns are removed from the properties unless primary keys are
    /// exposed. Rows of null-key tables get a freshly synthesized id.
    pub fn build(&self, mut row: Row) -> Result<Feature> {
        if self.key.is_null() {
            return Ok(Feature::new(self.key.synthesize_fid(), row));
        }

        let mut values = Vec::with_capacity(self.key.columns().len());
        for column in self.key.columns() {
            let value = if self.expose_primary_keys {
                row.get(&column.name).cloned()
            } else {
                row.remove(&column.name)
            };
            match value {
                Some(Value::Null) | None => {
                    return Err(FeatureStoreError::data_access(
                        format!("building feature of '{}'", self.table_name()),
                        format!("row has no value for key column '{}'", column.name),
                    ));
                }
                Some(v) => values.push(v),
            }
        }

        let id = self.key.encode_fid(&values)?;
        Ok(Feature::new(id, row))
    }

    /// A blank feature for appending
    pub fn blank(&self) -> Feature {
        Feature::empty(self.key.synthesize_fid())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Row source that counts advances and closes
    pub struct CountingSource {
        pub rows: VecDeque<Row>,
        pub advances: Arc<AtomicUsize>,
        pub closes: Arc<AtomicUsize>,
    }

    impl CountingSource {
        pub fn new(rows: Vec<Row>) -> Self {
            Self {
                rows: rows.into(),
                advances: Arc::new(AtomicUsize::new(0)),
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl RowSource for CountingSource {
        fn advance(&mut self) -> Result<Option<Row>> {
            self.advances.fetch_add(1, Ordering::SeqCst);
            Ok(self.rows.pop_front())
        }

        fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Row source that yields its rows, then fails like a dropped server connection
    pub struct FailingSource {
        pub rows: VecDeque<Row>,
        pub closes: Arc<AtomicUsize>,
    }

    impl FailingSource {
        pub fn new(rows: Vec<Row>) -> Self {
            Self {
                rows: rows.into(),
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl RowSource for FailingSource {
        fn advance(&mut self) -> Result<Option<Row>> {
            match self.rows.pop_front() {
                Some(row) => Ok(Some(row)),
                None => Err(FeatureStoreError::data_access(
                    "reading result set",
                    "server closed the connection unexpectedly",
                )),
            }
        }

        fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Calls observed by a [`SpyStatement`]
    #[derive(Default)]
    pub struct StatementLog {
        pub calls: Mutex<Vec<String>>,
        pub closes: AtomicUsize,
    }

    impl StatementLog {
        pub fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    /// Records "update:{id}", "insert:{id}" and "delete:{id}"
    pub struct SpyStatement {
        pub log: Arc<StatementLog>,
        next_id: i64,
    }

    impl SpyStatement {
        pub fn new(log: Arc<StatementLog>) -> Self {
            Self { log, next_id: 100 }
        }
    }

    impl FeatureStatement for SpyStatement {
        fn update(&mut self, _key: &PrimaryKey, feature: &Feature) -> Result<()> {
            self.log.calls.lock().push(format!("update:{}", feature.id));
            Ok(())
        }

        fn insert(&mut self, key: &PrimaryKey, feature: &mut Feature) -> Result<()> {
            if !key.is_null() {
                feature.id = key.encode_fid(&[Value::from(self.next_id)])?;
                self.next_id += 1;
            }
            self.log.calls.lock().push(format!("insert:{}", feature.id));
            Ok(())
        }

        fn delete(&mut self, _key: &PrimaryKey, feature: &Feature) -> Result<()> {
            self.log.calls.lock().push(format!("delete:{}", feature.id));
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.log.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub fn row(gid: i64, name: &str) -> Row {
        let mut row = Row::new();
        row.insert("gid".to_string(), Value::from(gid));
        row.insert("name".to_string(), Value::from(name));
        row
    }
}
