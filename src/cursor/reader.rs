//! Plain forward-only reader
//!
//! Wraps a [`RowSource`] and hands out one [`Feature`] per row. The cursor owns
//! the auto-commit connection its rows came from, if any, and releases it on
//! close.

use std::sync::Arc;

use crate::cursor::{FeatureBuilder, FeatureReader, RowSource, fetch_error};
use crate::error::{FeatureStoreError, Result};
use crate::feature::Feature;
use crate::listener::{LifecycleEvent, ListenerChain, ListenerFailure};
use crate::pool::ConnectionLease;

/// Forward-only reader over a row source
///
/// `has_next` prefetches at most one row and keeps it until `next` consumes it,
/// so calling it repeatedly never skips rows. Listeners are told about every
/// feature handed out; their failures are collected, never raised.
pub struct ReadCursor {
    source: Box<dyn RowSource>,
    builder: FeatureBuilder,
    pending: Option<Feature>,
    exhausted: bool,
    closed: bool,
    lease: Option<ConnectionLease>,
    listeners: Option<Arc<ListenerChain>>,
    failures: Vec<ListenerFailure>,
}

impl ReadCursor {
    pub fn new(source: Box<dyn RowSource>, builder: FeatureBuilder) -> Self {
        Self {
            source,
            builder,
            pending: None,
            exhausted: false,
            closed: false,
            lease: None,
            listeners: None,
            failures: Vec::new(),
        }
    }

    /// Hold `lease` until the cursor is closed
    pub fn with_lease(mut self, lease: ConnectionLease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Dispatch fetch events to `listeners`
    pub fn with_listeners(mut self, listeners: Arc<ListenerChain>) -> Self {
        self.listeners = Some(listeners);
        self
    }

    /// Start from failures reported while the rows were queried
    pub fn with_listener_failures(mut self, failures: Vec<ListenerFailure>) -> Self {
        self.failures = failures;
        self
    }

    /// Listener failures of borrow, query, fetch and release, in order
    pub fn listener_failures(&self) -> &[ListenerFailure] {
        &self.failures
    }

    pub fn take_listener_failures(&mut self) -> Vec<ListenerFailure> {
        std::mem::take(&mut self.failures)
    }

    pub fn table_name(&self) -> &str {
        self.builder.table_name()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(FeatureStoreError::invalid_state(format!(
                "Reader on '{}' is closed",
                self.table_name()
            )));
        }
        Ok(())
    }
}

impl FeatureReader for ReadCursor {
    fn has_next(&mut self) -> Result<bool> {
        self.ensure_open()?;
        if self.pending.is_some() {
            return Ok(true);
        }
        if self.exhausted {
            return Ok(false);
        }

        let advanced = self
            .source
            .advance()
            .map_err(|e| fetch_error(self.builder.table_name(), e))?;
        match advanced {
            Some(row) => {
                self.pending = Some(self.builder.build(row)?);
                Ok(true)
            }
            None => {
                self.exhausted = true;
                Ok(false)
            }
        }
    }

    fn next(&mut self) -> Result<Feature> {
        self.ensure_open()?;
        let feature = self.pending.take().ok_or_else(|| {
            FeatureStoreError::exhausted(format!(
                "No feature pending on '{}'; call has_next first",
                self.table_name()
            ))
        })?;

        if let Some(listeners) = &self.listeners {
            let table = self.builder.table_name();
            let failures =
                listeners.dispatch(LifecycleEvent::Fetch, |l| l.on_fetch(table, &feature.id));
            self.failures.extend(failures);
        }
        Ok(feature)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending = None;

        let source_result = self.source.close();
        let lease_result = match self.lease.take() {
            Some(lease) => lease.release().map(|failures| self.failures.extend(failures)),
            None => Ok(()),
        };
        source_result.and(lease_result)
    }
}

impl Drop for ReadCursor {
    fn drop(&mut self) {
        if !self.closed {
            tracing::debug!(table = self.table_name(), "Reader dropped without close, closing");
            if let Err(e) = self.close() {
                tracing::error!(error = %e, "Failed to close dropped reader");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use parking_lot::Mutex;

    use super::*;
    use crate::connection::testing::SpyPool;
    use crate::cursor::testing::{CountingSource, FailingSource, row};
    use crate::listener::testing::JournalListener;
    use crate::pool::{PooledConnection, StoreContext};
    use crate::primary_key::{PrimaryKey, PrimaryKeyColumn};
    use crate::types::ColumnType;

    fn builder() -> FeatureBuilder {
        FeatureBuilder::new(
            PrimaryKey::new(
                "roads",
                vec![PrimaryKeyColumn::auto_generated("gid", ColumnType::Integer)],
            ),
            false,
        )
    }

    #[test]
    fn test_reads_rows_in_order() {
        let source = CountingSource::new(vec![row(1, "a"), row(2, "b")]);
        let mut cursor = ReadCursor::new(Box::new(source), builder());

        let mut ids = Vec::new();
        while cursor.has_next().unwrap() {
            ids.push(cursor.next().unwrap().id);
        }
        assert_eq!(ids, vec!["roads.1", "roads.2"]);
        cursor.close().unwrap();
    }

    #[test]
    fn test_has_next_is_idempotent() {
        let source = CountingSource::new(vec![row(1, "a"), row(2, "b")]);
        let advances = source.advances.clone();
        let mut cursor = ReadCursor::new(Box::new(source), builder());

        assert!(cursor.has_next().unwrap());
        assert!(cursor.has_next().unwrap());
        assert!(cursor.has_next().unwrap());
        assert_eq!(advances.load(Ordering::SeqCst), 1);
        assert_eq!(cursor.next().unwrap().id, "roads.1");
    }

    #[test]
    fn test_exhaustion_is_sticky() {
        let source = CountingSource::new(vec![]);
        let advances = source.advances.clone();
        let mut cursor = ReadCursor::new(Box::new(source), builder());

        assert!(!cursor.has_next().unwrap());
        assert!(!cursor.has_next().unwrap());
        assert_eq!(advances.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_next_without_has_next_is_exhausted() {
        let source = CountingSource::new(vec![row(1, "a")]);
        let mut cursor = ReadCursor::new(Box::new(source), builder());

        let err = cursor.next().unwrap_err();
        assert!(matches!(err, FeatureStoreError::Exhausted(_)));

        assert!(cursor.has_next().unwrap());
        cursor.next().unwrap();
        let err = cursor.next().unwrap_err();
        assert!(matches!(err, FeatureStoreError::Exhausted(_)));
    }

    #[test]
    fn test_close_twice_closes_source_once() {
        let source = CountingSource::new(vec![row(1, "a")]);
        let closes = source.closes.clone();
        let mut cursor = ReadCursor::new(Box::new(source), builder());

        cursor.close().unwrap();
        cursor.close().unwrap();
        drop(cursor);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_use_after_close_is_invalid_state() {
        let mut cursor = ReadCursor::new(Box::new(CountingSource::new(vec![])), builder());
        cursor.close().unwrap();
        assert!(matches!(
            cursor.has_next().unwrap_err(),
            FeatureStoreError::InvalidState(_)
        ));
    }

    #[test]
    fn test_fetch_listeners_see_each_feature() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let listeners = Arc::new(ListenerChain::new());
        listeners.register(Arc::new(JournalListener::new("audit", journal.clone())));

        let source = CountingSource::new(vec![row(1, "a"), row(2, "b")]);
        let mut cursor = ReadCursor::new(Box::new(source), builder()).with_listeners(listeners);
        while cursor.has_next().unwrap() {
            cursor.next().unwrap();
        }

        assert_eq!(journal.lock().as_slice(), ["audit:fetch", "audit:fetch"]);
    }

    #[test]
    fn test_fetch_listener_failure_is_collected() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let listeners = Arc::new(ListenerChain::new());
        listeners.register(Arc::new(
            JournalListener::new("audit", journal).failing_on(LifecycleEvent::Fetch),
        ));

        let source = CountingSource::new(vec![row(1, "a"), row(2, "b")]);
        let mut cursor = ReadCursor::new(Box::new(source), builder()).with_listeners(listeners);
        while cursor.has_next().unwrap() {
            cursor.next().unwrap();
        }
        cursor.close().unwrap();

        let failures = cursor.take_listener_failures();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| f.event == LifecycleEvent::Fetch));
        assert!(cursor.listener_failures().is_empty());
    }

    #[test]
    fn test_source_failure_mid_stream_names_table_and_releases_once() {
        let pool = Arc::new(SpyPool::default());
        let ctx = Arc::new(StoreContext::new(pool.clone(), Arc::new(ListenerChain::new()), true));
        let lease = ConnectionLease::AutoCommit(PooledConnection::acquire(&ctx).unwrap());

        let source = FailingSource::new(vec![row(1, "a")]);
        let closes = source.closes.clone();
        let mut cursor = ReadCursor::new(Box::new(source), builder()).with_lease(lease);

        assert!(cursor.has_next().unwrap());
        assert_eq!(cursor.next().unwrap().id, "roads.1");
        let err = cursor.has_next().unwrap_err();
        assert!(err.is_data_access());
        assert!(err.to_string().contains("fetching from 'roads'"));

        cursor.close().unwrap();
        cursor.close().unwrap();
        drop(cursor);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.released(), 1);
        assert_eq!(ctx.tracker().leaked(), 0);
        assert!(ctx.tracker().assert_none_outstanding().is_ok());
    }

    #[test]
    fn test_drop_closes_source() {
        let source = CountingSource::new(vec![row(1, "a")]);
        let closes = source.closes.clone();
        drop(ReadCursor::new(Box::new(source), builder()));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
