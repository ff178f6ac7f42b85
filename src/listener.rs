//! Connection lifecycle listeners
//!
//! Listeners are notified in registration order. A listener that fails does not
//! stop the remaining listeners from running and does not fail the operation it
//! observes; its error is logged and handed back as a [`ListenerFailure`].

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::ConnectionView;
use crate::error::{FeatureStoreError, Result};

/// Points at which listeners are notified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Borrow,
    Release,
    Commit,
    Rollback,
    Query,
    Fetch,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleEvent::Borrow => "borrow",
            LifecycleEvent::Release => "release",
            LifecycleEvent::Commit => "commit",
            LifecycleEvent::Rollback => "rollback",
            LifecycleEvent::Query => "query",
            LifecycleEvent::Fetch => "fetch",
        };
        f.write_str(name)
    }
}

/// Observer of connection borrow / release / commit / rollback
///
/// Hooks receive a [`ConnectionView`], so a listener can run statements on the
/// connection (session settings, auditing) but can never end its transaction.
pub trait ConnectionLifecycleListener: Send + Sync {
    /// Called right after a connection is taken from the pool
    fn on_borrow(&self, connection: &mut ConnectionView<'_>) -> Result<()>;

    /// Called right before a connection goes back to the pool
    fn on_release(&self, connection: &mut ConnectionView<'_>) -> Result<()>;

    /// Called right before a transaction commits
    fn on_commit(&self, connection: &mut ConnectionView<'_>) -> Result<()>;

    /// Called right before a transaction rolls back
    fn on_rollback(&self, connection: &mut ConnectionView<'_>) -> Result<()>;

    /// Called before a reader runs its query
    fn on_query(&self, _table: &str, _sql: &str) -> Result<()> {
        Ok(())
    }

    /// Called after a reader surfaces a feature
    fn on_fetch(&self, _table: &str, _feature_id: &str) -> Result<()> {
        Ok(())
    }
}

/// A listener hook that returned an error
#[derive(Debug)]
pub struct ListenerFailure {
    /// Position of the listener in registration order
    pub listener: usize,
    pub event: LifecycleEvent,
    pub error: FeatureStoreError,
}

/// Ordered list of lifecycle listeners
#[derive(Default)]
pub struct ListenerChain {
    listeners: RwLock<Vec<Arc<dyn ConnectionLifecycleListener>>>,
}

impl ListenerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn ConnectionLifecycleListener>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Run `hook` against every listener in order, collecting failures
    pub fn dispatch<F>(&self, event: LifecycleEvent, mut hook: F) -> Vec<ListenerFailure>
    where
        F: FnMut(&dyn ConnectionLifecycleListener) -> Result<()>,
    {
        // snapshot so a listener registering another listener cannot deadlock
        let listeners: Vec<_> = self.listeners.read().clone();
        let mut failures = Vec::new();

        for (index, listener) in listeners.iter().enumerate() {
            if let Err(error) = hook(listener.as_ref()) {
                tracing::warn!(
                    listener = index,
                    event = %event,
                    error = %error,
                    "Connection lifecycle listener failed"
                );
                failures.push(ListenerFailure {
                    listener: index,
                    event,
                    error,
                });
            }
        }

        failures
    }
}

impl fmt::Debug for ListenerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerChain")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Listener doubles shared by the unit tests
#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::*;

    /// Appends `"{name}:{event}"` to a shared journal; optionally fails one event
    pub struct JournalListener {
        pub name: &'static str,
        pub journal: Arc<Mutex<Vec<String>>>,
        pub fail_on: Option<LifecycleEvent>,
    }

    impl JournalListener {
        pub fn new(name: &'static str, journal: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                journal,
                fail_on: None,
            }
        }

        pub fn failing_on(mut self, event: LifecycleEvent) -> Self {
            self.fail_on = Some(event);
            self
        }

        fn record(&self, event: LifecycleEvent) -> Result<()> {
            self.journal.lock().push(format!("{}:{}", self.name, event));
            if self.fail_on == Some(event) {
                return Err(FeatureStoreError::data_access(
                    format!("listener {}", self.name),
                    "audit table unavailable",
                ));
            }
            Ok(())
        }
    }

    impl ConnectionLifecycleListener for JournalListener {
        fn on_borrow(&self, _connection: &mut ConnectionView<'_>) -> Result<()> {
            self.record(LifecycleEvent::Borrow)
        }

        fn on_release(&self, _connection: &mut ConnectionView<'_>) -> Result<()> {
            self.record(LifecycleEvent::Release)
        }

        fn on_commit(&self, _connection: &mut ConnectionView<'_>) -> Result<()> {
            self.record(LifecycleEvent::Commit)
        }

        fn on_rollback(&self, _connection: &mut ConnectionView<'_>) -> Result<()> {
            self.record(LifecycleEvent::Rollback)
        }

        fn on_query(&self, _table: &str, _sql: &str) -> Result<()> {
            self.record(LifecycleEvent::Query)
        }

        fn on_fetch(&self, _table: &str, _feature_id: &str) -> Result<()> {
            self.record(LifecycleEvent::Fetch)
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::testing::JournalListener;
    use super::*;
    use crate::connection::testing::{SpyConnection, SpyLog};

    #[test]
    fn test_dispatch_in_registration_order() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let chain = ListenerChain::new();
        chain.register(Arc::new(JournalListener::new("a", journal.clone())));
        chain.register(Arc::new(JournalListener::new("b", journal.clone())));
        chain.register(Arc::new(JournalListener::new("c", journal.clone())));

        let mut cx = SpyConnection::new(Arc::new(SpyLog::default()));
        let failures = chain.dispatch(LifecycleEvent::Borrow, |l| {
            l.on_borrow(&mut ConnectionView::new(&mut cx))
        });

        assert!(failures.is_empty());
        assert_eq!(
            journal.lock().as_slice(),
            ["a:borrow", "b:borrow", "c:borrow"]
        );
    }

    #[test]
    fn test_failing_listener_does_not_stop_the_rest() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let chain = ListenerChain::new();
        chain.register(Arc::new(JournalListener::new("a", journal.clone())));
        chain.register(Arc::new(
            JournalListener::new("b", journal.clone()).failing_on(LifecycleEvent::Commit),
        ));
        chain.register(Arc::new(JournalListener::new("c", journal.clone())));

        let mut cx = SpyConnection::new(Arc::new(SpyLog::default()));
        let failures = chain.dispatch(LifecycleEvent::Commit, |l| {
            l.on_commit(&mut ConnectionView::new(&mut cx))
        });

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].listener, 1);
        assert_eq!(failures[0].event, LifecycleEvent::Commit);
        assert!(failures[0].error.is_data_access());
        assert_eq!(journal.lock().len(), 3);
    }

    #[test]
    fn test_empty_chain() {
        let chain = ListenerChain::new();
        assert!(chain.is_empty());
        let failures = chain.dispatch(LifecycleEvent::Fetch, |l| l.on_fetch("roads", "roads.1"));
        assert!(failures.is_empty());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(LifecycleEvent::Rollback.to_string(), "rollback");
        assert_eq!(LifecycleEvent::Fetch.to_string(), "fetch");
    }
}
