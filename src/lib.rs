//! # runtara-feature-store
//!
//! Transactional, identity-bearing row access over relational tables.
//!
//! Every row of a table is surfaced as a [`Feature`] with a stable string id
//! derived from the table's primary key. The store resolves that key through a
//! chain of finders, binds connections to transactions, notifies lifecycle
//! listeners and hands out cursors that read, filter, update and append rows.
//!
//! ## Features
//!
//! - **Primary Key Discovery**: metadata table first, database catalog second, null key last
//! - **Transactions**: pooled connections owned by the store, or external connections owned by the caller
//! - **Lifecycle Listeners**: borrow / release / commit / rollback hooks that cannot end a transaction
//! - **Cursors**: read, join-filter and update-then-insert cursors with strict `has_next` / `next` semantics
//! - **Virtual Tables**: parameterized SQL exposed as tables, with validated and escaped substitution
//! - **Leak Tracking**: connections that are never released are logged and counted
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use runtara_feature_store::{FeatureReader, FeatureStore, StoreConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StoreConfig::builder("postgres://localhost/gis")
//!         .database_schema("public")
//!         .build();
//!     let store = FeatureStore::connect(config)?;
//!
//!     let mut tx = store.transaction()?;
//!     let mut roads = store.query_reader(Some(&mut tx), "roads", "SELECT * FROM roads")?;
//!     while roads.has_next()? {
//!         let road = roads.next()?;
//!         println!("{} {:?}", road.id, road.get("name"));
//!     }
//!     roads.close()?;
//!     tx.commit()?;
//!     tx.close()?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! The store is configured using `StoreConfig`:
//!
//! ```rust
//! use runtara_feature_store::StoreConfig;
//!
//! let config = StoreConfig::builder("postgres://localhost/gis")
//!     .database_schema("public")              // Schema holding the tables
//!     .primary_key_metadata_table("pk_meta")  // Declared keys for views
//!     .expose_primary_keys(false)             // Keep key columns out of properties
//!     .name_pattern_escape("\\")              // LIKE escape for catalog lookups
//!     .track_connections(true)                // Count outstanding connections
//!     .build();
//! ```
//!
//! ## Blocking API
//!
//! The store is synchronous. The PostgreSQL adapter drives sqlx on its own
//! current-thread runtime, so it must not be called from inside an async task.

pub mod config;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod feature;
pub mod finder;
pub mod listener;
pub mod pool;
pub mod postgres;
pub mod primary_key;
pub mod sql;
pub mod store;
pub mod transaction;
pub mod types;
pub mod virtual_table;

// Re-export main types for convenience
pub use config::{DialectConfig, StoreConfig, StoreConfigBuilder};
pub use connection::{
    Connection, ConnectionPool, ConnectionView, SharedConnection, shared_connection,
};
pub use cursor::{
    FeatureBuilder, FeatureReader, FeatureStatement, FeatureWriter, InsertCursor, JoinBranch,
    JoinFilterCursor, ReadCursor, RowBuffer, RowSource, StatementHandle, StatementView,
    UpdateCursor, UpdateInsertWriter, WriterPhase,
};
pub use error::{FeatureStoreError, Result};
pub use feature::{Feature, FeatureFilter, Row};
pub use finder::{
    CompositePrimaryKeyFinder, HeuristicPrimaryKeyFinder, MetadataTablePrimaryKeyFinder,
    PrimaryKeyFinder,
};
pub use listener::{ConnectionLifecycleListener, LifecycleEvent, ListenerChain, ListenerFailure};
pub use pool::{ConnectionLease, ConnectionTracker, PooledConnection, StoreContext};
pub use postgres::{PgConnection, PgConnectionPool};
pub use primary_key::{KeyGeneration, PrimaryKey, PrimaryKeyColumn};
pub use store::{FeatureStore, QueryCapabilities};
pub use transaction::{Transaction, TransactionId, TransactionState};
pub use types::{ColumnInfo, ColumnType};
pub use virtual_table::{ParameterValidator, RegexValidator, VirtualTable, VirtualTableParameter};

// Re-export SQL utilities for advanced users
pub use sql::escape::{NamePatternEscaper, escape_literal, escape_sql};
pub use sql::sanitize::{quote_identifier, quote_qualified};
