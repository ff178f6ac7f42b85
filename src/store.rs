//! FeatureStore - main entry point for transactional feature access
//!
//! This module provides the `FeatureStore` struct that resolves table
//! identities, hands out transactions and opens cursors over table rows.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::StoreConfig;
use crate::connection::{ConnectionPool, ConnectionView, SharedConnection};
use crate::cursor::{
    FeatureBuilder, FeatureStatement, JoinBranch, JoinFilterCursor, ReadCursor, RowBuffer,
    RowSource, UpdateInsertWriter,
};
use crate::error::{FeatureStoreError, Result};
use crate::feature::Row;
use crate::finder::{
    CompositePrimaryKeyFinder, HeuristicPrimaryKeyFinder, MetadataTablePrimaryKeyFinder,
    PrimaryKeyFinder, resolve_or_null,
};
use crate::listener::{
    ConnectionLifecycleListener, LifecycleEvent, ListenerChain, ListenerFailure,
};
use crate::pool::{ConnectionLease, PooledConnection, StoreContext};
use crate::postgres::PgConnectionPool;
use crate::primary_key::PrimaryKey;
use crate::sql::{NamePatternEscaper, escape_literal, quote_identifier, quote_qualified};
use crate::transaction::Transaction;
use crate::virtual_table::VirtualTable;

/// What a caller may ask of queries against one table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryCapabilities {
    /// Sorting by feature id is meaningful (false for tables without a key)
    pub natural_order_sort: bool,
    pub limit: bool,
    pub offset: bool,
}

/// Everything a cursor needs from its query
struct Loaded {
    key: PrimaryKey,
    rows: Vec<Row>,
    lease: ConnectionLease,
    failures: Vec<ListenerFailure>,
}

fn query_error(table: &str, e: FeatureStoreError) -> FeatureStoreError {
    if e.is_data_access() {
        FeatureStoreError::data_access_from(format!("querying '{}'", table), e)
    } else {
        e
    }
}

/// Transactional, identity-bearing access to relational tables
///
/// Primary keys are resolved once per table through the finder chain and
/// cached. Virtual tables take precedence over physical tables of the same name.
pub struct FeatureStore {
    /// Pool, listeners and connection tracking shared with transactions and cursors
    context: Arc<StoreContext>,
    /// Store configuration
    config: StoreConfig,
    finder: Arc<dyn PrimaryKeyFinder>,
    escaper: NamePatternEscaper,
    primary_keys: Mutex<HashMap<String, PrimaryKey>>,
    virtual_tables: RwLock<HashMap<String, VirtualTable>>,
}

impl FeatureStore {
    /// Connect to PostgreSQL using the configuration
    pub fn connect(config: StoreConfig) -> Result<Self> {
        let pool =
            PgConnectionPool::connect_with_escape(&config.database_url, &config.name_pattern_escape)?;
        Self::with_pool(config, Arc::new(pool))
    }

    /// Create a store over an existing connection pool
    pub fn with_pool(config: StoreConfig, pool: Arc<dyn ConnectionPool>) -> Result<Self> {
        let escaper = NamePatternEscaper::new(config.name_pattern_escape.clone())?;
        let finder = CompositePrimaryKeyFinder::new(vec![
            Arc::new(
                MetadataTablePrimaryKeyFinder::new(
                    config.primary_key_metadata_table.clone(),
                    escaper.clone(),
                )
                .with_dialect(config.dialect.clone()),
            ),
            Arc::new(HeuristicPrimaryKeyFinder::new(escaper.clone())),
        ]);

        Ok(Self {
            context: Arc::new(StoreContext::new(
                pool,
                Arc::new(ListenerChain::new()),
                config.track_connections,
            )),
            config,
            finder: Arc::new(finder),
            escaper,
            primary_keys: Mutex::new(HashMap::new()),
            virtual_tables: RwLock::new(HashMap::new()),
        })
    }

    /// Replace the primary key finder; cached keys are discarded
    pub fn with_primary_key_finder(mut self, finder: Arc<dyn PrimaryKeyFinder>) -> Self {
        self.finder = finder;
        self.primary_keys.lock().clear();
        self
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionLifecycleListener>) {
        self.context.listeners.register(listener);
    }

    pub fn listeners(&self) -> &ListenerChain {
        &self.context.listeners
    }

    // =========================================================================
    // Primary keys
    // =========================================================================

    /// Primary key of `table`, resolved on an auto-commit connection when not cached
    ///
    /// Never resolved on a transaction's connection: a failed catalog or
    /// metadata lookup would abort that transaction on PostgreSQL.
    pub fn primary_key(&self, table: &str) -> Result<PrimaryKey> {
        if let Some(key) = self.cached_key(table) {
            return Ok(key);
        }
        let mut connection = self.auto_commit_connection()?;
        let resolved = connection
            .view()
            .and_then(|mut view| self.resolve_key(table, &mut view));
        connection.release()?;
        resolved
    }

    fn cached_key(&self, table: &str) -> Option<PrimaryKey> {
        if let Some(key) = self.primary_keys.lock().get(table) {
            return Some(key.clone());
        }
        let key = self.virtual_tables.read().get(table).map(VirtualTable::primary_key)?;
        self.primary_keys.lock().insert(table.to_string(), key.clone());
        Some(key)
    }

    fn resolve_key(&self, table: &str, connection: &mut ConnectionView<'_>) -> Result<PrimaryKey> {
        if let Some(key) = self.cached_key(table) {
            return Ok(key);
        }
        let key = resolve_or_null(
            self.finder.as_ref(),
            self.config.database_schema.as_deref(),
            table,
            connection,
        )?;
        tracing::debug!(table = table, columns = ?key.column_names(), "Resolved primary key");
        self.primary_keys.lock().insert(table.to_string(), key.clone());
        Ok(key)
    }

    // =========================================================================
    // Virtual tables
    // =========================================================================

    /// Register a virtual table, replacing one with the same name
    pub fn add_virtual_table(&self, table: VirtualTable) {
        let name = table.name().to_string();
        self.primary_keys.lock().remove(&name);
        self.virtual_tables.write().insert(name, table);
    }

    pub fn remove_virtual_table(&self, name: &str) -> Option<VirtualTable> {
        self.primary_keys.lock().remove(name);
        self.virtual_tables.write().remove(name)
    }

    pub fn virtual_table(&self, name: &str) -> Option<VirtualTable> {
        self.virtual_tables.read().get(name).cloned()
    }

    /// Table reference for a FROM clause
    ///
    /// Physical tables come back schema-qualified and quoted; virtual tables as
    /// their expanded SQL wrapped in a sub-select.
    pub fn encode_table_name(
        &self,
        table: &str,
        parameters: &HashMap<String, String>,
    ) -> Result<String> {
        match self.virtual_tables.read().get(table) {
            Some(virtual_table) => Ok(format!(
                "({}) {}",
                virtual_table.expand(parameters)?,
                quote_identifier("vtable")
            )),
            None => Ok(quote_qualified(self.config.database_schema.as_deref(), table)),
        }
    }

    // =========================================================================
    // Transactions and connections
    // =========================================================================

    /// Start a transaction on a pooled connection
    pub fn transaction(&self) -> Result<Transaction> {
        Transaction::begin(Arc::clone(&self.context))
    }

    /// Start a transaction on a connection the caller keeps owning
    ///
    /// Commit, rollback and close of the connection stay with the caller.
    pub fn build_transaction(&self, connection: SharedConnection) -> Result<Transaction> {
        Transaction::on_external(Arc::clone(&self.context), connection)
    }

    /// Query/introspection access to the transaction's connection
    pub fn connection<'t>(&self, tx: &'t mut Transaction) -> Result<ConnectionView<'t>> {
        tx.state_mut().view()
    }

    /// Borrow an auto-commit connection; the caller must release it
    pub fn auto_commit_connection(&self) -> Result<PooledConnection> {
        PooledConnection::acquire(&self.context)
    }

    // =========================================================================
    // Cursors
    // =========================================================================

    fn feature_builder(&self, key: PrimaryKey) -> FeatureBuilder {
        FeatureBuilder::new(key, self.config.expose_primary_keys)
    }

    /// Reader over rows the caller already produces
    pub fn reader(&self, table: &str, rows: Box<dyn RowSource>) -> Result<ReadCursor> {
        let key = self.primary_key(table)?;
        Ok(ReadCursor::new(rows, self.feature_builder(key))
            .with_listeners(Arc::clone(&self.context.listeners)))
    }

    fn run_query(
        &self,
        table: &str,
        sql: &str,
        connection: &mut ConnectionView<'_>,
    ) -> Result<(Vec<Row>, Vec<ListenerFailure>)> {
        let failures = self
            .context
            .listeners
            .dispatch(LifecycleEvent::Query, |l| l.on_query(table, sql));
        tracing::debug!(table = table, sql = sql, "Running feature query");
        let rows = connection.query(sql).map_err(|e| query_error(table, e))?;
        Ok((rows, failures))
    }

    /// Resolve the key, then run `sql` inside `tx`, or on an auto-commit
    /// connection held until the cursor closes
    fn load_with_lease(
        &self,
        tx: Option<&mut Transaction>,
        table: &str,
        sql: &str,
    ) -> Result<Loaded> {
        let key = self.primary_key(table)?;
        match tx {
            Some(tx) => {
                let (rows, failures) = self.run_query(table, sql, &mut tx.state_mut().view()?)?;
                Ok(Loaded {
                    key,
                    rows,
                    lease: ConnectionLease::Transaction,
                    failures,
                })
            }
            None => {
                let mut connection = self.auto_commit_connection()?;
                let mut failures = connection.take_listener_failures();
                let queried = connection
                    .view()
                    .and_then(|mut view| self.run_query(table, sql, &mut view));
                match queried {
                    Ok((rows, query_failures)) => {
                        failures.extend(query_failures);
                        Ok(Loaded {
                            key,
                            rows,
                            lease: ConnectionLease::AutoCommit(connection),
                            failures,
                        })
                    }
                    Err(e) => {
                        connection.release()?;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Reader over the rows `sql` returns for `table`
    pub fn query_reader(
        &self,
        tx: Option<&mut Transaction>,
        table: &str,
        sql: &str,
    ) -> Result<ReadCursor> {
        let loaded = self.load_with_lease(tx, table, sql)?;
        Ok(
            ReadCursor::new(Box::new(RowBuffer::new(loaded.rows)), self.feature_builder(loaded.key))
                .with_lease(loaded.lease)
                .with_listeners(Arc::clone(&self.context.listeners))
                .with_listener_failures(loaded.failures),
        )
    }

    /// Reader that keeps only rows every branch filter accepts
    pub fn join_reader(
        &self,
        tx: Option<&mut Transaction>,
        table: &str,
        sql: &str,
        branches: Vec<JoinBranch>,
    ) -> Result<JoinFilterCursor<ReadCursor>> {
        let inner = self.query_reader(tx, table, sql)?;
        Ok(JoinFilterCursor::new(inner, branches))
    }

    /// Writer that updates the rows `sql` returns, then appends new features
    ///
    /// Tables without a primary key are read-only.
    pub fn update_insert_writer(
        &self,
        tx: Option<&mut Transaction>,
        table: &str,
        sql: &str,
        mut statement: Box<dyn FeatureStatement>,
    ) -> Result<UpdateInsertWriter> {
        let Loaded {
            key,
            rows,
            lease,
            failures,
        } = match self.load_with_lease(tx, table, sql) {
            Ok(loaded) => loaded,
            Err(e) => {
                statement.close()?;
                return Err(e);
            }
        };

        if key.is_null() {
            statement.close()?;
            lease.release()?;
            return Err(FeatureStoreError::invalid_state(format!(
                "Table '{}' has no primary key and is read-only",
                table
            )));
        }

        Ok(UpdateInsertWriter::new(
            Box::new(RowBuffer::new(rows)),
            self.feature_builder(key),
            statement,
        )
        .with_lease(lease)
        .with_listener_failures(failures))
    }

    // =========================================================================
    // Dialect helpers
    // =========================================================================

    pub fn capabilities(&self, table: &str) -> Result<QueryCapabilities> {
        let key = self.primary_key(table)?;
        let paging = self.config.dialect.limit_offset_supported;
        Ok(QueryCapabilities {
            natural_order_sort: !key.is_null(),
            limit: paging,
            offset: paging,
        })
    }

    /// Escape a value for a SQL literal using the configured dialect flags
    pub fn escape_literal(&self, value: &str) -> String {
        escape_literal(
            value,
            self.config.dialect.escape_backslash,
            self.config.dialect.escape_double_quote,
        )
    }

    /// Escape LIKE wildcards in a table, schema or column name
    pub fn escape_name_pattern(&self, name: &str) -> String {
        self.escaper.escape(name)
    }

    // =========================================================================
    // Connection tracking
    // =========================================================================

    pub fn outstanding_connections(&self) -> usize {
        self.context.tracker.outstanding()
    }

    pub fn leaked_connections(&self) -> usize {
        self.context.tracker.leaked()
    }

    /// Fails when connections are still checked out; meant for test teardown
    pub fn assert_no_outstanding_connections(&self) -> Result<()> {
        if !self.context.tracker.is_enabled() {
            tracing::warn!("Connection tracking is disabled, nothing to assert");
        }
        self.context.tracker.assert_none_outstanding()
    }
}
