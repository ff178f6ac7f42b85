//! Owned connections borrowed from the pool
//!
//! [`PooledConnection`] is the only type that gives a connection back to the
//! pool. It notifies listeners on borrow and release, and it is counted by the
//! [`ConnectionTracker`] while checked out. Dropping one without calling
//! [`PooledConnection::release`] is a leak: it is logged at error level and the
//! connection is still handed back as a last resort.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::connection::{Connection, ConnectionPool, ConnectionView};
use crate::error::{FeatureStoreError, Result};
use crate::listener::{LifecycleEvent, ListenerChain, ListenerFailure};

/// Counts connections that are checked out and connections recovered from leaks
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    enabled: bool,
    outstanding: AtomicUsize,
    leaked: AtomicUsize,
}

impl ConnectionTracker {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn checkout(&self) {
        if self.enabled {
            self.outstanding.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn checkin(&self) {
        if self.enabled {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn record_leak(&self) {
        self.leaked.fetch_add(1, Ordering::SeqCst);
    }

    /// Connections currently checked out (0 when tracking is disabled)
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Connections that were dropped without an explicit release
    pub fn leaked(&self) -> usize {
        self.leaked.load(Ordering::SeqCst)
    }

    /// Fails when any tracked connection is still checked out
    pub fn assert_none_outstanding(&self) -> Result<()> {
        let outstanding = self.outstanding();
        if outstanding > 0 {
            return Err(FeatureStoreError::invalid_state(format!(
                "{} connection(s) still checked out",
                outstanding
            )));
        }
        Ok(())
    }
}

/// What every connection-owning object needs from the store
pub struct StoreContext {
    pub(crate) pool: Arc<dyn ConnectionPool>,
    pub(crate) listeners: Arc<ListenerChain>,
    pub(crate) tracker: ConnectionTracker,
}

impl StoreContext {
    pub fn new(pool: Arc<dyn ConnectionPool>, listeners: Arc<ListenerChain>, track: bool) -> Self {
        Self {
            pool,
            listeners,
            tracker: ConnectionTracker::new(track),
        }
    }

    pub fn listeners(&self) -> &Arc<ListenerChain> {
        &self.listeners
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }
}

impl fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreContext")
            .field("listeners", &self.listeners)
            .field("tracker", &self.tracker)
            .finish()
    }
}

/// A connection checked out of the pool; releasing it is this type's job alone
pub struct PooledConnection {
    context: Arc<StoreContext>,
    connection: Option<Box<dyn Connection>>,
    /// Borrow-time listener failures not yet handed on
    failures: Vec<ListenerFailure>,
}

impl PooledConnection {
    /// Borrow a connection from the pool and notify listeners
    pub fn acquire(context: &Arc<StoreContext>) -> Result<Self> {
        let mut connection = context.pool.acquire()?;
        context.tracker.checkout();
        tracing::debug!("Borrowed connection from pool");

        let failures = context.listeners.dispatch(LifecycleEvent::Borrow, |l| {
            l.on_borrow(&mut ConnectionView::new(connection.as_mut()))
        });

        Ok(Self {
            context: context.clone(),
            connection: Some(connection),
            failures,
        })
    }

    /// Borrow-time listener failures, handed over once
    pub fn take_listener_failures(&mut self) -> Vec<ListenerFailure> {
        std::mem::take(&mut self.failures)
    }

    pub fn connection(&mut self) -> Result<&mut (dyn Connection + 'static)> {
        match self.connection.as_mut() {
            Some(connection) => Ok(connection.as_mut()),
            None => Err(FeatureStoreError::invalid_state(
                "connection already released",
            )),
        }
    }

    pub fn view(&mut self) -> Result<ConnectionView<'_>> {
        Ok(ConnectionView::new(self.connection()?))
    }

    /// Give the connection back to the pool
    ///
    /// Listener failures of the borrow not yet taken and of the release are
    /// returned; a pool failure is wrapped as an I/O error.
    pub fn release(mut self) -> Result<Vec<ListenerFailure>> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<Vec<ListenerFailure>> {
        let Some(mut connection) = self.connection.take() else {
            return Ok(Vec::new());
        };

        let mut failures = std::mem::take(&mut self.failures);
        failures.extend(self.context.listeners.dispatch(LifecycleEvent::Release, |l| {
            l.on_release(&mut ConnectionView::new(connection.as_mut()))
        }));
        self.context.tracker.checkin();
        tracing::debug!("Releasing connection to pool");

        self.context
            .pool
            .release(connection)
            .map_err(|e| FeatureStoreError::io("release", e))?;
        Ok(failures)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.connection.is_some() {
            tracing::error!(
                "Pooled connection dropped without being released; returning it to the pool. \
                 Every borrowed connection must be released explicitly"
            );
            self.context.tracker.record_leak();
            if let Err(e) = self.release_inner() {
                tracing::error!(error = %e, "Failed to release leaked connection");
            }
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("open", &self.connection.is_some())
            .finish()
    }
}

/// How a cursor relates to the connection its rows came from
#[derive(Debug)]
pub enum ConnectionLease {
    /// The connection belongs to a transaction; closing the cursor leaves it alone
    Transaction,
    /// The cursor owns an auto-commit connection and releases it on close
    AutoCommit(PooledConnection),
}

impl ConnectionLease {
    /// Release whatever this lease owns, returning listener failures
    pub fn release(self) -> Result<Vec<ListenerFailure>> {
        match self {
            ConnectionLease::Transaction => Ok(Vec::new()),
            ConnectionLease::AutoCommit(connection) => connection.release(),
        }
    }
}
