//! Error types for Feature Store operations

use thiserror::Error;

/// Boxed cause carried by data-access errors
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during feature store operations
#[derive(Debug, Error)]
pub enum FeatureStoreError {
    /// Caller broke a usage contract (double attach, use after close, ...)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Data access error ({context}): {source}")]
    DataAccess {
        context: String,
        #[source]
        source: BoxError,
    },

    /// `next` was called without a preceding successful `has_next`
    #[error("Cursor exhausted: {0}")]
    Exhausted(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Commit, rollback or release failed on the physical connection
    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: Box<FeatureStoreError>,
    },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FeatureStoreError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::Exhausted(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Data-access failure with a plain message as its cause
    pub fn data_access(context: impl Into<String>, msg: impl Into<String>) -> Self {
        let msg: String = msg.into();
        Self::DataAccess {
            context: context.into(),
            source: msg.into(),
        }
    }

    /// Wrap an arbitrary error as a data-access failure
    pub fn data_access_from<E>(context: impl Into<String>, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::DataAccess {
            context: context.into(),
            source: Box::new(err),
        }
    }

    /// Wrap a failure of `operation` into the I/O kind, keeping the original cause
    pub fn io(operation: impl Into<String>, source: FeatureStoreError) -> Self {
        Self::Io {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Whether this failure came from the database / connection layer
    pub fn is_data_access(&self) -> bool {
        matches!(
            self,
            Self::DataAccess { .. } | Self::Io { .. } | Self::Connection(_) | Self::Sql(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FeatureStoreError>;
