//! Update-then-insert writer
//!
//! [`UpdateInsertWriter`] walks the existing rows of a table first
//! ([`WriterPhase::Updating`]). Once they run out it switches, exactly once, to
//! appending new features ([`WriterPhase::Inserting`]) until it is closed
//! ([`WriterPhase::Closed`]). Phases only ever move forward.
//!
//! The writer owns the statement through a [`StatementHandle`]; the phase
//! cursors only get a [`StatementView`], which can run statements but has no
//! way to close them. The one real close happens in [`UpdateInsertWriter::close`].

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cursor::{FeatureBuilder, FeatureStatement, FeatureWriter, RowSource, fetch_error};
use crate::error::{FeatureStoreError, Result};
use crate::feature::Feature;
use crate::listener::ListenerFailure;
use crate::primary_key::PrimaryKey;
use crate::pool::ConnectionLease;

type SharedStatement = Arc<Mutex<Option<Box<dyn FeatureStatement>>>>;

/// Owning handle to a statement; the only way to close it
pub struct StatementHandle {
    statement: SharedStatement,
}

impl StatementHandle {
    pub fn new(statement: Box<dyn FeatureStatement>) -> Self {
        Self {
            statement: Arc::new(Mutex::new(Some(statement))),
        }
    }

    /// A non-owning view for cursors that borrow the statement
    pub fn view(&self) -> StatementView {
        StatementView {
            statement: Arc::clone(&self.statement),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.statement.lock().is_none()
    }

    /// Close the statement; later calls are no-ops
    pub fn close(&mut self) -> Result<()> {
        match self.statement.lock().take() {
            Some(mut statement) => statement.close(),
            None => Ok(()),
        }
    }
}

impl Drop for StatementHandle {
    fn drop(&mut self) {
        if !self.is_closed() {
            tracing::error!("Statement handle dropped while open, closing it");
            if let Err(e) = self.close() {
                tracing::error!(error = %e, "Failed to close dropped statement");
            }
        }
    }
}

impl fmt::Debug for StatementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Borrowed access to a statement owned by a [`StatementHandle`]
#[derive(Clone)]
pub struct StatementView {
    statement: SharedStatement,
}

impl StatementView {
    fn with<T>(&self, f: impl FnOnce(&mut dyn FeatureStatement) -> Result<T>) -> Result<T> {
        let mut guard = self.statement.lock();
        match guard.as_mut() {
            Some(statement) => f(statement.as_mut()),
            None => Err(FeatureStoreError::invalid_state("Statement is closed")),
        }
    }

    pub fn update(&self, key: &PrimaryKey, feature: &Feature) -> Result<()> {
        self.with(|s| s.update(key, feature))
    }

    pub fn insert(&self, key: &PrimaryKey, feature: &mut Feature) -> Result<()> {
        self.with(|s| s.insert(key, feature))
    }

    pub fn delete(&self, key: &PrimaryKey, feature: &Feature) -> Result<()> {
        self.with(|s| s.delete(key, feature))
    }
}

impl fmt::Debug for StatementView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementView").finish_non_exhaustive()
    }
}

/// Updates or deletes existing rows in place
pub struct UpdateCursor {
    source: Box<dyn RowSource>,
    builder: FeatureBuilder,
    statement: StatementView,
    pending: Option<Feature>,
    current: Option<Feature>,
    exhausted: bool,
}

impl UpdateCursor {
    pub fn new(source: Box<dyn RowSource>, builder: FeatureBuilder, statement: StatementView) -> Self {
        Self {
            source,
            builder,
            statement,
            pending: None,
            current: None,
            exhausted: false,
        }
    }

    pub fn has_next(&mut self) -> Result<bool> {
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

    pub fn next(&mut self) -> Result<&mut Feature> {
        let feature = self.pending.take().ok_or_else(|| {
            FeatureStoreError::exhausted(format!(
                "No row pending on '{}'; call has_next first",
                self.builder.table_name()
            ))
        })?;
        Ok(self.current.insert(feature))
    }

    /// Persist changes to the current feature, if it has any
    pub fn write(&mut self) -> Result<()> {
        let feature = self
            .current
            .as_mut()
            .ok_or_else(|| FeatureStoreError::invalid_state("No current feature to write"))?;
        if feature.is_modified() {
            self.statement.update(self.builder.key(), feature)?;
            feature.mark_clean();
        }
        Ok(())
    }

    pub fn remove(&mut self) -> Result<()> {
        let feature = self
            .current
            .take()
            .ok_or_else(|| FeatureStoreError::invalid_state("No current feature to remove"))?;
        self.statement.delete(self.builder.key(), &feature)
    }

    /// Close the row source; the statement is left to its owner
    pub fn close(&mut self) -> Result<()> {
        self.pending = None;
        self.current = None;
        self.source.close()
    }
}

/// Appends new features
///
/// `has_next` is always false: there are no existing rows to walk. Each `next`
/// hands out a blank feature that `write` inserts.
pub struct InsertCursor {
    builder: FeatureBuilder,
    statement: Option<StatementView>,
    current: Option<Feature>,
}

impl InsertCursor {
    pub fn new(builder: FeatureBuilder, statement: StatementView) -> Self {
        Self {
            builder,
            statement: Some(statement),
            current: None,
        }
    }

    fn statement(&self) -> Result<&StatementView> {
        self.statement
            .as_ref()
            .ok_or_else(|| FeatureStoreError::invalid_state("Insert cursor was released"))
    }

    pub fn has_next(&mut self) -> Result<bool> {
        self.statement()?;
        Ok(false)
    }

    pub fn next(&mut self) -> Result<&mut Feature> {
        self.statement()?;
        Ok(self.current.insert(self.builder.blank()))
    }

    pub fn write(&mut self) -> Result<()> {
        let mut feature = self
            .current
            .take()
            .ok_or_else(|| FeatureStoreError::invalid_state("No new feature to write"))?;
        self.statement()?.insert(self.builder.key(), &mut feature)?;
        tracing::debug!(table = self.builder.table_name(), feature = %feature.id, "Inserted feature");
        Ok(())
    }

    /// Discard the feature handed out by `next`; nothing was persisted yet
    pub fn remove(&mut self) -> Result<()> {
        self.current
            .take()
            .map(|_| ())
            .ok_or_else(|| FeatureStoreError::invalid_state("No new feature to remove"))
    }

    /// Drop the borrowed statement without closing it
    pub fn release_borrowed(&mut self) {
        self.current = None;
        self.statement = None;
    }
}

/// Phases of an [`UpdateInsertWriter`], in the only order they can occur
pub enum WriterPhase {
    Updating(UpdateCursor),
    Inserting(InsertCursor),
    Closed,
}

impl WriterPhase {
    fn ordinal(&self) -> u8 {
        match self {
            WriterPhase::Updating(_) => 0,
            WriterPhase::Inserting(_) => 1,
            WriterPhase::Closed => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WriterPhase::Updating(_) => "updating",
            WriterPhase::Inserting(_) => "inserting",
            WriterPhase::Closed => "closed",
        }
    }
}

impl fmt::Debug for WriterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Writer that updates existing rows and then appends new ones
#[derive(Debug)]
pub struct UpdateInsertWriter {
    phase: WriterPhase,
    builder: FeatureBuilder,
    statement: StatementHandle,
    lease: Option<ConnectionLease>,
    failures: Vec<ListenerFailure>,
}

impl UpdateInsertWriter {
    pub fn new(
        source: Box<dyn RowSource>,
        builder: FeatureBuilder,
        statement: Box<dyn FeatureStatement>,
    ) -> Self {
        let statement = StatementHandle::new(statement);
        let update = UpdateCursor::new(source, builder.clone(), statement.view());
        Self {
            phase: WriterPhase::Updating(update),
            builder,
            statement,
            lease: None,
            failures: Vec::new(),
        }
    }

    /// Hold `lease` until the writer is closed
    pub fn with_lease(mut self, lease: ConnectionLease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Start from failures reported while the rows were queried
    pub fn with_listener_failures(mut self, failures: Vec<ListenerFailure>) -> Self {
        self.failures = failures;
        self
    }

    /// Listener failures of borrow, query and release, in order
    pub fn listener_failures(&self) -> &[ListenerFailure] {
        &self.failures
    }

    pub fn phase(&self) -> &WriterPhase {
        &self.phase
    }

    /// Move to `next`, finishing the phase being left
    ///
    /// Moving backwards or staying put is a usage error.
    fn transition(&mut self, next: WriterPhase) -> Result<()> {
        if next.ordinal() <= self.phase.ordinal() {
            return Err(FeatureStoreError::invalid_state(format!(
                "Writer cannot move from {} to {}",
                self.phase.name(),
                next.name()
            )));
        }
        tracing::debug!(
            table = self.builder.table_name(),
            from = self.phase.name(),
            to = next.name(),
            "Writer phase change"
        );

        match std::mem::replace(&mut self.phase, next) {
            WriterPhase::Updating(mut update) => update.close(),
            WriterPhase::Inserting(mut insert) => {
                insert.release_borrowed();
                Ok(())
            }
            WriterPhase::Closed => Ok(()),
        }
    }

    fn start_inserting(&mut self) -> Result<()> {
        let insert = InsertCursor::new(self.builder.clone(), self.statement.view());
        self.transition(WriterPhase::Inserting(insert))
    }
}

fn closed_error(builder: &FeatureBuilder) -> FeatureStoreError {
    FeatureStoreError::invalid_state(format!(
        "Writer on '{}' is closed",
        builder.table_name()
    ))
}

impl FeatureWriter for UpdateInsertWriter {
    fn has_next(&mut self) -> Result<bool> {
        match &mut self.phase {
            WriterPhase::Updating(update) => {
                if update.has_next()? {
                    return Ok(true);
                }
                self.start_inserting()?;
                Ok(false)
            }
            WriterPhase::Inserting(insert) => insert.has_next(),
            WriterPhase::Closed => Err(closed_error(&self.builder)),
        }
    }

    fn next(&mut self) -> Result<&mut Feature> {
        if let WriterPhase::Updating(update) = &mut self.phase {
            if !update.has_next()? {
                self.start_inserting()?;
            }
        }
        match &mut self.phase {
            WriterPhase::Updating(update) => update.next(),
            WriterPhase::Inserting(insert) => insert.next(),
            WriterPhase::Closed => Err(closed_error(&self.builder)),
        }
    }

    fn write(&mut self) -> Result<()> {
        match &mut self.phase {
            WriterPhase::Updating(update) => update.write(),
            WriterPhase::Inserting(insert) => insert.write(),
            WriterPhase::Closed => Err(closed_error(&self.builder)),
        }
    }

    fn remove(&mut self) -> Result<()> {
        match &mut self.phase {
            WriterPhase::Updating(update) => update.remove(),
            WriterPhase::Inserting(insert) => insert.remove(),
            WriterPhase::Closed => Err(closed_error(&self.builder)),
        }
    }

    /// Finish the current phase, then close the statement and release the
    /// connection lease; closing twice is a no-op
    fn close(&mut self) -> Result<()> {
        let phase_result = match self.phase {
            WriterPhase::Closed => Ok(()),
            _ => self.transition(WriterPhase::Closed),
        };
        let statement_result = self.statement.close();
        let lease_result = match self.lease.take() {
            Some(lease) => lease.release().map(|failures| self.failures.extend(failures)),
            None => Ok(()),
        };
        phase_result.and(statement_result).and(lease_result)
    }
}

impl Drop for UpdateInsertWriter {
    fn drop(&mut self) {
        if !matches!(self.phase, WriterPhase::Closed) || self.lease.is_some() {
            tracing::debug!(table = self.builder.table_name(), "Writer dropped without close, closing");
            if let Err(e) = self.close() {
                tracing::error!(error = %e, "Failed to close dropped writer");
            }
        }
    }
}
