//! The owning store handle subscriptions are created from.

use crate::changes::controller::{self, Changes};
use crate::changes::registry::SubscriptionRegistry;
use crate::changes::ChangesOptions;
use crate::filter::PredicateCompiler;
use crate::selector::SelectorCompiler;
use crate::source::ChangeSource;
use crate::taskqueue::TaskQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Database configuration.
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    /// Name used in logs.
    pub name: String,

    /// Whether the database accepts work immediately. When false, changes
    /// requests queue until [`Database::mark_ready`].
    pub start_ready: bool,

    /// Max events buffered in a subscription's unread event channel before
    /// the channel is closed. Listeners are unaffected.
    /// Default: 1000
    pub buffer_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "db".to_string(),
            start_ready: true,
            buffer_size: 1000,
        }
    }
}

pub(crate) struct DatabaseInner {
    pub(crate) config: DatabaseConfig,
    pub(crate) source: Arc<dyn ChangeSource>,
    pub(crate) compiler: Arc<dyn PredicateCompiler>,
    pub(crate) queue: TaskQueue,
    pub(crate) registry: SubscriptionRegistry,
    destroyed: AtomicBool,
}

impl DatabaseInner {
    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// A change source plus the readiness and teardown signals subscriptions
/// observe. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Create a database over `source`, compiling stored filters with
    /// [`SelectorCompiler`].
    pub fn new(source: Arc<dyn ChangeSource>, config: DatabaseConfig) -> Self {
        Self::with_compiler(source, Arc::new(SelectorCompiler), config)
    }

    pub fn with_compiler(
        source: Arc<dyn ChangeSource>,
        compiler: Arc<dyn PredicateCompiler>,
        config: DatabaseConfig,
    ) -> Self {
        let queue = TaskQueue::new(config.start_ready);
        Self {
            inner: Arc::new(DatabaseInner {
                config,
                source,
                compiler,
                queue,
                registry: SubscriptionRegistry::new(),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn source(&self) -> &Arc<dyn ChangeSource> {
        &self.inner.source
    }

    /// Subscribe to changes.
    pub fn changes(&self, options: ChangesOptions) -> Changes {
        controller::subscribe(&self.inner, options)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.queue.is_ready()
    }

    /// Signal readiness and start every queued subscription.
    pub fn mark_ready(&self) {
        tracing::debug!(db = %self.inner.config.name, "database ready");
        self.inner.queue.mark_ready();
    }

    /// Tear down: every active subscription is detached without further
    /// events and queued work is discarded.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscriptions = self.inner.registry.drain();
        tracing::debug!(
            db = %self.inner.config.name,
            subscriptions = subscriptions.len(),
            "database destroyed"
        );
        for subscription in subscriptions {
            subscription.detach();
        }
        self.inner.queue.clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// Number of subscriptions that have not terminated.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.registry.count()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.inner.config)
            .field("ready", &self.is_ready())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
