//! Physical connection contracts
//!
//! - [`Connection`] - a blocking physical database connection
//! - [`ConnectionPool`] - hands out connections and takes them back
//! - [`ConnectionView`] - a borrowed handle that can query and introspect but
//!   cannot commit, roll back or close. Finders and listeners only ever see a view.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::Result;
use crate::feature::Row;
use crate::types::ColumnInfo;

/// A blocking physical database connection
///
/// Introspection methods take `schema` and `table` as LIKE patterns; callers
/// escape wildcard characters with [`NamePatternEscaper`](crate::sql::NamePatternEscaper).
pub trait Connection: Send {
    /// Switch between auto-commit and manual transaction control
    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    /// Close the physical connection
    fn close(&mut self) -> Result<()>;

    /// Run a statement, returning the number of affected rows
    fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Run a query and collect its rows
    fn query(&mut self, sql: &str) -> Result<Vec<Row>>;

    /// All columns of a table, in ordinal order
    fn columns(&mut self, schema: Option<&str>, table: &str) -> Result<Vec<ColumnInfo>>;

    /// Columns of the primary key constraint, in key order
    fn primary_key_columns(&mut self, schema: Option<&str>, table: &str)
    -> Result<Vec<ColumnInfo>>;

    /// Columns of the first unique index, in index order
    fn unique_index_columns(
        &mut self,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ColumnInfo>>;

    /// Sequence feeding a column, if any
    fn sequence_for_column(
        &mut self,
        schema: Option<&str>,
        table: &str,
        column: &str,
    ) -> Result<Option<String>>;
}

/// Source of physical connections
pub trait ConnectionPool: Send + Sync {
    fn acquire(&self) -> Result<Box<dyn Connection>>;

    /// Return a connection. Must be called at most once per acquisition.
    fn release(&self, connection: Box<dyn Connection>) -> Result<()>;
}

/// A connection owned by the caller and shared with the store
pub type SharedConnection = Arc<Mutex<Box<dyn Connection>>>;

/// Wrap a caller-owned connection for [`FeatureStore::build_transaction`](crate::FeatureStore::build_transaction)
pub fn shared_connection(connection: Box<dyn Connection>) -> SharedConnection {
    Arc::new(Mutex::new(connection))
}

enum ViewTarget<'a> {
    Direct(&'a mut (dyn Connection + 'static)),
    Locked(MutexGuard<'a, Box<dyn Connection>>),
}

/// Borrowed, non-owning access to a connection
///
/// Exposes queries and introspection only. Transaction boundaries and closing
/// stay with whoever owns the connection.
pub struct ConnectionView<'a> {
    target: ViewTarget<'a>,
}

impl<'a> ConnectionView<'a> {
    pub fn new(connection: &'a mut (dyn Connection + 'static)) -> Self {
        Self {
            target: ViewTarget::Direct(connection),
        }
    }

    pub(crate) fn locked(guard: MutexGuard<'a, Box<dyn Connection>>) -> Self {
        Self {
            target: ViewTarget::Locked(guard),
        }
    }

    fn connection(&mut self) -> &mut (dyn Connection + 'static) {
        match &mut self.target {
            ViewTarget::Direct(connection) => &mut **connection,
            ViewTarget::Locked(guard) => &mut ***guard,
        }
    }

    pub fn execute(&mut self, sql: &str) -> Result<u64> {
        self.connection().execute(sql)
    }

    pub fn query(&mut self, sql: &str) -> Result<Vec<Row>> {
        self.connection().query(sql)
    }

    pub fn columns(&mut self, schema: Option<&str>, table: &str) -> Result<Vec<ColumnInfo>> {
        self.connection().columns(schema, table)
    }

    pub fn primary_key_columns(
        &mut self,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ColumnInfo>> {
        self.connection().primary_key_columns(schema, table)
    }

    pub fn unique_index_columns(
        &mut self,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ColumnInfo>> {
        self.connection().unique_index_columns(schema, table)
    }

    pub fn sequence_for_column(
        &mut self,
        schema: Option<&str>,
        table: &str,
        column: &str,
    ) -> Result<Option<String>> {
        self.connection().sequence_for_column(schema, table, column)
    }
}

/// In-memory connection and pool doubles shared by the unit tests
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::error::FeatureStoreError;

    /// Calls observed by a [`SpyConnection`]
    #[derive(Default)]
    pub struct SpyLog {
        pub commits: AtomicUsize,
        pub rollbacks: AtomicUsize,
        pub closes: AtomicUsize,
        pub auto_commit: Mutex<Option<bool>>,
        pub statements: Mutex<Vec<String>>,
        pub patterns: Mutex<Vec<String>>,
    }

    impl SpyLog {
        pub fn commits(&self) -> usize {
            self.commits.load(Ordering::SeqCst)
        }

        pub fn rollbacks(&self) -> usize {
            self.rollbacks.load(Ordering::SeqCst)
        }

        pub fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    /// Records every call; introspection answers come from the maps
    #[derive(Default)]
    pub struct SpyConnection {
        pub log: Arc<SpyLog>,
        pub primary_keys: HashMap<String, Vec<ColumnInfo>>,
        pub unique_indexes: HashMap<String, Vec<ColumnInfo>>,
        pub columns: HashMap<String, Vec<ColumnInfo>>,
        pub sequences: HashMap<String, String>,
        pub query_rows: Vec<Row>,
        pub fail_commit: bool,
        pub fail_queries: bool,
    }

    impl SpyConnection {
        pub fn new(log: Arc<SpyLog>) -> Self {
            Self {
                log,
                ..Default::default()
            }
        }
    }

    impl Connection for SpyConnection {
        fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
            *self.log.auto_commit.lock() = Some(auto_commit);
            Ok(())
        }

        fn commit(&mut self) -> Result<()> {
            self.log.commits.fetch_add(1, Ordering::SeqCst);
            if self.fail_commit {
                return Err(FeatureStoreError::data_access("commit", "connection reset"));
            }
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            self.log.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.log.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn execute(&mut self, sql: &str) -> Result<u64> {
            self.log.statements.lock().push(sql.to_string());
            Ok(0)
        }

        fn query(&mut self, sql: &str) -> Result<Vec<Row>> {
            self.log.statements.lock().push(sql.to_string());
            if self.fail_queries {
                return Err(FeatureStoreError::data_access(
                    "query",
                    "relation does not exist",
                ));
            }
            Ok(self.query_rows.clone())
        }

        fn columns(&mut self, _schema: Option<&str>, table: &str) -> Result<Vec<ColumnInfo>> {
            self.log.patterns.lock().push(table.to_string());
            Ok(self.columns.get(table).cloned().unwrap_or_default())
        }

        fn primary_key_columns(
            &mut self,
            _schema: Option<&str>,
            table: &str,
        ) -> Result<Vec<ColumnInfo>> {
            self.log.patterns.lock().push(table.to_string());
            Ok(self.primary_keys.get(table).cloned().unwrap_or_default())
        }

        fn unique_index_columns(
            &mut self,
            _schema: Option<&str>,
            table: &str,
        ) -> Result<Vec<ColumnInfo>> {
            Ok(self.unique_indexes.get(table).cloned().unwrap_or_default())
        }

        fn sequence_for_column(
            &mut self,
            _schema: Option<&str>,
            table: &str,
            column: &str,
        ) -> Result<Option<String>> {
            Ok(self.sequences.get(&format!("{}.{}", table, column)).cloned())
        }
    }

    /// Pool handing out spy connections that share one log
    #[derive(Default)]
    pub struct SpyPool {
        pub log: Arc<SpyLog>,
        pub acquired: AtomicUsize,
        pub released: AtomicUsize,
    }

    impl SpyPool {
        pub fn acquired(&self) -> usize {
            self.acquired.load(Ordering::SeqCst)
        }

        pub fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }
    }

    impl ConnectionPool for SpyPool {
        fn acquire(&self) -> Result<Box<dyn Connection>> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(SpyConnection::new(self.log.clone())))
        }

        fn release(&self, mut connection: Box<dyn Connection>) -> Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            connection.close()
        }
    }
}
