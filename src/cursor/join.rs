//! Join-filter reader
//!
//! Joined queries carry each branch's nested value in its own attribute. The
//! cursor keeps a feature only when every branch filter accepts that value.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::cursor::FeatureReader;
use crate::error::{FeatureStoreError, Result};
use crate::feature::{Feature, FeatureFilter};

/// One joined branch: the attribute holding its nested value and an optional filter
#[derive(Clone)]
pub struct JoinBranch {
    pub attribute: String,
    pub filter: Option<Arc<dyn FeatureFilter>>,
}

impl JoinBranch {
    /// Branch that accepts everything
    pub fn unfiltered(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            filter: None,
        }
    }

    pub fn filtered(attribute: impl Into<String>, filter: Arc<dyn FeatureFilter>) -> Self {
        Self {
            attribute: attribute.into(),
            filter: Some(filter),
        }
    }

    fn accepts(&self, feature: &Feature) -> bool {
        match &self.filter {
            None => true,
            Some(filter) => filter.accepts(feature.get(&self.attribute).unwrap_or(&Value::Null)),
        }
    }
}

impl fmt::Debug for JoinBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinBranch")
            .field("attribute", &self.attribute)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// Reader that only surfaces features every branch accepts
///
/// Rejected features are skipped inside `has_next`, so a long run of rejected
/// rows makes a single call arbitrarily slow. Order is preserved.
pub struct JoinFilterCursor<R> {
    inner: R,
    branches: Vec<JoinBranch>,
    pending: Option<Feature>,
    closed: bool,
}

impl<R: FeatureReader> JoinFilterCursor<R> {
    pub fn new(inner: R, branches: Vec<JoinBranch>) -> Self {
        Self {
            inner,
            branches,
            pending: None,
            closed: false,
        }
    }

    /// The wrapped reader
    pub fn inner(&self) -> &R {
        &self.inner
    }

    fn accepts(&self, feature: &Feature) -> bool {
        self.branches.iter().all(|b| b.accepts(feature))
    }
}

impl<R: FeatureReader> FeatureReader for JoinFilterCursor<R> {
    fn has_next(&mut self) -> Result<bool> {
        if self.closed {
            return Err(FeatureStoreError::invalid_state("Join reader is closed"));
        }
        if self.pending.is_some() {
            return Ok(true);
        }

        while self.inner.has_next()? {
            let feature = self.inner.next()?;
            if self.accepts(&feature) {
                self.pending = Some(feature);
                return Ok(true);
            }
            tracing::trace!(feature = %feature.id, "Join filter rejected feature");
        }
        Ok(false)
    }

    fn next(&mut self) -> Result<Feature> {
        if self.closed {
            return Err(FeatureStoreError::invalid_state("Join reader is closed"));
        }
        self.pending.take().ok_or_else(|| {
            FeatureStoreError::exhausted("No joined feature pending; call has_next first")
        })
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending = None;
        self.inner.close()
    }
}
