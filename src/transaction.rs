//! Logical transactions and their binding to physical connections
//!
//! A [`TransactionState`] ties one logical transaction to one physical
//! connection. Pooled connections are owned by the state: it commits, rolls
//! back and finally releases them. External connections stay with the caller,
//! so commit, rollback and close are no-ops here.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::connection::{ConnectionView, SharedConnection};
use crate::error::{FeatureStoreError, Result};
use crate::listener::{LifecycleEvent, ListenerFailure};
use crate::pool::{PooledConnection, StoreContext};

/// Identifier of a logical transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

enum Binding {
    Pooled(PooledConnection),
    External(SharedConnection),
}

/// Binds one logical transaction to one physical connection
pub struct TransactionState {
    context: Arc<StoreContext>,
    transaction: Option<TransactionId>,
    connection: Option<Binding>,
    external: bool,
    failures: Vec<ListenerFailure>,
}

impl TransactionState {
    /// State that borrows a pool connection when a transaction is attached
    pub fn pooled(context: Arc<StoreContext>) -> Self {
        Self {
            context,
            transaction: None,
            connection: None,
            external: false,
            failures: Vec::new(),
        }
    }

    /// State over a caller-owned connection
    pub fn external(context: Arc<StoreContext>, connection: SharedConnection) -> Self {
        Self {
            context,
            transaction: None,
            connection: Some(Binding::External(connection)),
            external: true,
            failures: Vec::new(),
        }
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn transaction(&self) -> Option<TransactionId> {
        self.transaction
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// Listener failures observed so far, in the order they happened
    pub fn listener_failures(&self) -> &[ListenerFailure] {
        &self.failures
    }

    pub fn take_listener_failures(&mut self) -> Vec<ListenerFailure> {
        std::mem::take(&mut self.failures)
    }

    /// Attach a logical transaction
    ///
    /// Fails with [`FeatureStoreError::InvalidState`] when another transaction is
    /// still attached. A pooled state borrows its connection here and switches it
    /// to manual commit.
    pub fn attach(&mut self, transaction: TransactionId) -> Result<()> {
        if let Some(current) = self.transaction {
            return Err(FeatureStoreError::invalid_state(format!(
                "Transaction {} is already attached; detach it before attaching {}",
                current, transaction
            )));
        }

        if self.connection.is_none() {
            if self.external {
                return Err(FeatureStoreError::invalid_state(
                    "External connection was already detached from this state",
                ));
            }
            let mut pooled = PooledConnection::acquire(&self.context)?;
            self.failures.extend(pooled.take_listener_failures());
            if let Err(e) = pooled.connection()?.set_auto_commit(false) {
                self.failures.extend(pooled.release()?);
                return Err(e);
            }
            self.connection = Some(Binding::Pooled(pooled));
        }

        tracing::debug!(transaction = %transaction, external = self.external, "Attached transaction");
        self.transaction = Some(transaction);
        Ok(())
    }

    /// Detach the current transaction
    ///
    /// A pooled connection is released exactly once; an external one is left
    /// open with a warning. The connection reference is cleared either way.
    pub fn detach(&mut self) -> Result<()> {
        let transaction = self.transaction.take();

        match self.connection.take() {
            Some(Binding::Pooled(pooled)) => {
                tracing::debug!(transaction = ?transaction, "Releasing transaction connection");
                let failures = pooled.release()?;
                self.failures.extend(failures);
                Ok(())
            }
            Some(Binding::External(_)) => {
                tracing::warn!(
                    transaction = ?transaction,
                    "Transaction is using an external connection; close was requested but \
                     skipped, the connection stays open and belongs to the caller"
                );
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn commit(&mut self) -> Result<()> {
        self.end(LifecycleEvent::Commit)
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.end(LifecycleEvent::Rollback)
    }

    fn end(&mut self, event: LifecycleEvent) -> Result<()> {
        if self.external {
            tracing::debug!(event = %event, "External connection, skipping");
            return Ok(());
        }
        let operation = event.to_string();
        let Some(Binding::Pooled(pooled)) = self.connection.as_mut() else {
            return Err(FeatureStoreError::invalid_state(format!(
                "Cannot {} a transaction without a connection",
                operation
            )));
        };
        let connection = pooled.connection()?;

        let failures = self.context.listeners.dispatch(event, |l| {
            let mut view = ConnectionView::new(&mut *connection);
            match event {
                LifecycleEvent::Commit => l.on_commit(&mut view),
                _ => l.on_rollback(&mut view),
            }
        });
        self.failures.extend(failures);

        tracing::debug!(transaction = ?self.transaction, "Transaction {}", operation);
        let outcome = match event {
            LifecycleEvent::Commit => connection.commit(),
            _ => connection.rollback(),
        };
        outcome.map_err(|e| FeatureStoreError::io(operation, e))
    }

    /// Read/introspect access to the bound connection
    pub fn view(&mut self) -> Result<ConnectionView<'_>> {
        match self.connection.as_mut() {
            Some(Binding::Pooled(pooled)) => pooled.view(),
            Some(Binding::External(shared)) => Ok(ConnectionView::locked(shared.lock())),
            None => Err(FeatureStoreError::invalid_state(
                "Transaction state holds no connection",
            )),
        }
    }
}

impl Drop for TransactionState {
    fn drop(&mut self) {
        let Some(Binding::Pooled(mut pooled)) = self.connection.take() else {
            return;
        };
        tracing::error!(
            transaction = ?self.transaction,
            "Transaction state dropped while still holding a pooled connection; rolling back \
             and releasing it. Close every transaction explicitly"
        );
        self.context.tracker.record_leak();
        if let Ok(connection) = pooled.connection() {
            if let Err(e) = connection.rollback() {
                tracing::error!(error = %e, "Rollback of leaked connection failed");
            }
        }
        if let Err(e) = pooled.release() {
            tracing::error!(error = %e, "Release of leaked connection failed");
        }
    }
}

impl fmt::Debug for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionState")
            .field("transaction", &self.transaction)
            .field("external", &self.external)
            .field("connected", &self.connection.is_some())
            .finish()
    }
}

/// A caller-visible unit of work
///
/// Must be ended with [`Transaction::close`]; dropping an open transaction is
/// reported as a connection leak.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
}

impl Transaction {
    /// Start a transaction on a pooled connection
    pub(crate) fn begin(context: Arc<StoreContext>) -> Result<Self> {
        let id = TransactionId::new();
        let mut state = TransactionState::pooled(context);
        state.attach(id)?;
        Ok(Self { id, state })
    }

    /// Start a transaction on a caller-owned connection
    pub(crate) fn on_external(context: Arc<StoreContext>, connection: SharedConnection) -> Result<Self> {
        let id = TransactionId::new();
        let mut state = TransactionState::external(context, connection);
        state.attach(id)?;
        Ok(Self { id, state })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn is_external(&self) -> bool {
        self.state.is_external()
    }

    pub fn commit(&mut self) -> Result<()> {
        self.state.commit()
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.state.rollback()
    }

    pub fn state(&self) -> &TransactionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut TransactionState {
        &mut self.state
    }

    /// Detach the transaction and release its connection
    pub fn close(mut self) -> Result<Vec<ListenerFailure>> {
        self.state.detach()?;
        Ok(self.state.take_listener_failures())
    }
}
