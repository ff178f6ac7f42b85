//! Configuration for FeatureStore
//!
//! Provides a builder pattern for configuring the feature store.

/// Dialect-dependent behaviour the store cannot infer on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialectConfig {
    /// Whether the database supports LIMIT/OFFSET paging
    pub limit_offset_supported: bool,
    /// Whether backslashes in string literals must be doubled
    pub escape_backslash: bool,
    /// Whether double quotes in string literals must be backslash-prefixed
    pub escape_double_quote: bool,
}

impl Default for DialectConfig {
    fn default() -> Self {
        Self {
            limit_offset_supported: true,
            escape_backslash: false,
            escape_double_quote: false,
        }
    }
}

/// Configuration for the feature store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// PostgreSQL database URL
    pub database_url: String,
    /// Schema holding the feature tables (None: connection default)
    pub database_schema: Option<String>,
    /// Whether primary key columns are also exposed as feature properties
    pub expose_primary_keys: bool,
    /// Table declaring primary keys for tables the database cannot describe
    pub primary_key_metadata_table: String,
    /// Escape string used when names are matched as LIKE patterns (empty: no escaping)
    pub name_pattern_escape: String,
    /// Count checked-out connections so leaks can be asserted on
    pub track_connections: bool,
    /// Dialect flags
    pub dialect: DialectConfig,
}

impl StoreConfig {
    /// Create a new configuration builder
    pub fn builder(database_url: impl Into<String>) -> StoreConfigBuilder {
        StoreConfigBuilder::new(database_url)
    }
}

/// Builder for StoreConfig
#[derive(Debug)]
pub struct StoreConfigBuilder {
    database_url: String,
    database_schema: Option<String>,
    expose_primary_keys: bool,
    primary_key_metadata_table: String,
    name_pattern_escape: String,
    track_connections: bool,
    dialect: DialectConfig,
}

impl StoreConfigBuilder {
    /// Create a new builder with the database URL
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            database_schema: None,
            expose_primary_keys: false,
            primary_key_metadata_table: "pk_metadata".to_string(),
            name_pattern_escape: "\\".to_string(),
            track_connections: cfg!(debug_assertions),
            dialect: DialectConfig::default(),
        }
    }

    /// Set the database schema (default: connection default)
    pub fn database_schema(mut self, schema: impl Into<String>) -> Self {
        self.database_schema = Some(schema.into());
        self
    }

    /// Expose primary key columns as feature properties (default: false)
    pub fn expose_primary_keys(mut self, enabled: bool) -> Self {
        self.expose_primary_keys = enabled;
        self
    }

    /// Set the primary key metadata table name (default: "pk_metadata")
    pub fn primary_key_metadata_table(mut self, name: impl Into<String>) -> Self {
        self.primary_key_metadata_table = name.into();
        self
    }

    /// Set the LIKE-pattern escape string (default: "\")
    pub fn name_pattern_escape(mut self, escape: impl Into<String>) -> Self {
        self.name_pattern_escape = escape.into();
        self
    }

    /// Enable or disable connection tracking (default: on in debug builds)
    pub fn track_connections(mut self, enabled: bool) -> Self {
        self.track_connections = enabled;
        self
    }

    /// Enable or disable LIMIT/OFFSET support (default: true)
    pub fn limit_offset_supported(mut self, enabled: bool) -> Self {
        self.dialect.limit_offset_supported = enabled;
        self
    }

    /// Double backslashes in escaped literals (default: false)
    pub fn escape_backslash(mut self, enabled: bool) -> Self {
        self.dialect.escape_backslash = enabled;
        self
    }

    /// Backslash-prefix double quotes in escaped literals (default: false)
    pub fn escape_double_quote(mut self, enabled: bool) -> Self {
        self.dialect.escape_double_quote = enabled;
        self
    }

    /// Replace all dialect flags at once
    pub fn dialect(mut self, dialect: DialectConfig) -> Self {
        self.dialect = dialect;
        self
    }

    /// Build the configuration
    pub fn build(self) -> StoreConfig {
        StoreConfig {
            database_url: self.database_url,
            database_schema: self.database_schema,
            expose_primary_keys: self.expose_primary_keys,
            primary_key_metadata_table: self.primary_key_metadata_table,
            name_pattern_escape: self.name_pattern_escape,
            track_connections: self.track_connections,
            dialect: self.dialect,
        }
    }
}
