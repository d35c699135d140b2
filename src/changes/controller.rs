//! Lifecycle of a single change-feed subscription.
//!
//! A subscription runs its pipeline on a dedicated worker thread:
//!
//! 1. wait for the database to become ready (via its task queue)
//! 2. resolve `since: latest` with one current-sequence read
//! 3. for continuous feeds, fetch the "caught up" watermark concurrently
//! 4. resolve a named filter or view into an inline predicate
//! 5. start the raw feed and relay normalized changes in delivery order
//!
//! Every path ends in [`Subscription::finish`], which lets exactly one
//! outcome through.

use super::emitter::{CompletionGate, Emitter, Listener};
use super::normalize::normalize_change;
use super::types::{ChangeEvent, ChangesOptions, ChangesResult, Since, SubscriptionId};
use crate::database::DatabaseInner;
use crate::error::{FeedError, Result};
use crate::filter::{ChangesFilter, PredicateResolver, Resolution};
use crate::source::{Canceller, ChangeSource, RawEvent};
use crate::types::{Change, Sequence};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type SharedCanceller = Arc<dyn Fn() + Send + Sync>;

/// Progress towards the sequence that was current when a live feed started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Watermark {
    /// Not fetched yet.
    Pending,
    At(Sequence),
    /// `uptodate` has been emitted.
    Reached,
}

impl Watermark {
    /// Returns true exactly once, for the first `seq` at or past the mark.
    fn cross(&mut self, seq: Sequence) -> bool {
        match *self {
            Watermark::At(mark) if seq >= mark => {
                *self = Watermark::Reached;
                true
            }
            _ => false,
        }
    }
}

/// Shared state of one subscription.
pub(crate) struct Subscription {
    id: SubscriptionId,
    db: Arc<DatabaseInner>,
    cancelled: AtomicBool,
    watermark: Mutex<Watermark>,
    canceller: Mutex<Option<SharedCanceller>>,
    /// Dropped on cancel so a worker blocked on the raw feed wakes up even
    /// when the source has no cancel hook.
    stop: Mutex<Option<Sender<()>>>,
    stopped: Receiver<()>,
    emitter: Emitter,
    gate: CompletionGate,
}

/// Create a subscription on `db` and start it.
pub(crate) fn subscribe(db: &Arc<DatabaseInner>, options: ChangesOptions) -> Changes {
    let (sender, events) = bounded(db.config.buffer_size.max(1));
    let (stop, stopped) = bounded(0);
    let subscription = Arc::new(Subscription {
        id: db.registry.next_id(),
        db: Arc::clone(db),
        cancelled: AtomicBool::new(false),
        watermark: Mutex::new(Watermark::Pending),
        canceller: Mutex::new(None),
        stop: Mutex::new(Some(stop)),
        stopped,
        emitter: Emitter::new(sender),
        gate: CompletionGate::new(),
    });

    if let Some(on_change) = options.on_change.clone() {
        subscription.emitter.on(Arc::new(move |event: &ChangeEvent| {
            if let ChangeEvent::Change(change) = event {
                on_change(change);
            }
        }));
    }
    if let Some(complete) = options.complete.clone() {
        subscription.emitter.on(Arc::new(move |event: &ChangeEvent| match event {
            ChangeEvent::Complete(result) => complete(Ok(result)),
            ChangeEvent::Error(err) => complete(Err(err)),
            _ => {}
        }));
    }

    db.registry.register(&subscription);
    if db.is_destroyed() {
        subscription.detach();
    } else {
        subscription.start(options);
    }

    Changes {
        subscription,
        events,
    }
}

impl Subscription {
    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn start(self: &Arc<Self>, options: ChangesOptions) {
        if self.db.queue.is_ready() {
            self.spawn_run(options);
            return;
        }

        tracing::debug!(subscription = %self.id, "queued until database is ready");
        let subscription = Arc::clone(self);
        self.db.queue.add_task(Box::new(move || {
            if subscription.is_cancelled() {
                subscription.complete_cancelled();
            } else {
                subscription.spawn_run(options);
            }
        }));
    }

    fn spawn_run(self: &Arc<Self>, options: ChangesOptions) {
        if self.gate.is_closed() {
            return;
        }

        let subscription = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(self.id.to_string())
            .spawn(move || {
                let outcome = subscription.run(options);
                subscription.finish(outcome);
            });

        if let Err(e) = spawned {
            tracing::warn!(subscription = %self.id, error = %e, "failed to spawn changes worker");
            self.finish(Err(FeedError::Backend(format!(
                "failed to spawn changes worker: {}",
                e
            ))));
        }
    }

    fn run(self: &Arc<Self>, mut options: ChangesOptions) -> Result<ChangesResult> {
        if self.is_cancelled() {
            return Ok(ChangesResult::cancelled());
        }
        let source = Arc::clone(&self.db.source);
        options.normalize();

        let since = match options.since {
            Since::Seq(seq) => seq,
            Since::Latest => {
                let current = source.current_sequence()?;
                if self.is_cancelled() {
                    return Ok(ChangesResult::cancelled());
                }
                let since = current.saturating_prev();
                tracing::debug!(
                    subscription = %self.id,
                    since = since.0,
                    "resolved latest sequence"
                );
                options.since = Since::Seq(since);
                since
            }
        };

        if options.is_continuous() {
            self.spawn_watermark_fetch();
        }

        if !source.supports_named_filters() && options.filter.is_named() {
            let resolver = PredicateResolver::new(source.as_ref(), self.db.compiler.as_ref());
            let resolution = resolver.resolve(&options.filter, options.view.as_deref(), || {
                self.is_cancelled()
            })?;
            match resolution {
                Resolution::Cancelled => return Ok(ChangesResult::cancelled()),
                Resolution::Resolved(predicate) => {
                    options.filter = ChangesFilter::Inline(predicate);
                }
            }
        }

        if self.is_cancelled() {
            return Ok(ChangesResult::cancelled());
        }
        self.stream(source.as_ref(), &options, since)
    }

    fn stream(
        &self,
        source: &dyn ChangeSource,
        options: &ChangesOptions,
        since: Sequence,
    ) -> Result<ChangesResult> {
        let feed = source.changes(options.to_raw(since))?;
        let (events, canceller) = feed.into_parts();
        self.install_canceller(canceller);
        tracing::debug!(
            subscription = %self.id,
            since = since.0,
            continuous = options.is_continuous(),
            "raw feed started"
        );

        let keep_results = options.return_docs && !options.is_continuous();
        let mut results = Vec::new();

        loop {
            let event = select! {
                recv(events) -> event => event,
                recv(self.stopped) -> _ => return Ok(ChangesResult::cancelled()),
            };
            // Disconnected without a terminal event.
            let Ok(event) = event else { break };
            if self.is_cancelled() {
                return Ok(ChangesResult::cancelled());
            }
            match event {
                RawEvent::Change(raw) => {
                    tracing::trace!(
                        subscription = %self.id,
                        seq = raw.seq.0,
                        id = %raw.id,
                        "change"
                    );
                    let change = normalize_change(raw, options.style, options.conflicts, source);
                    self.relay(&change);
                    if keep_results {
                        results.push(change);
                    }
                }
                RawEvent::Complete { last_seq } => {
                    return Ok(ChangesResult::complete(results, last_seq));
                }
                RawEvent::Error(err) => return Err(err),
            }
        }

        if self.is_cancelled() {
            Ok(ChangesResult::cancelled())
        } else {
            Err(FeedError::Backend(
                "change feed closed before completing".to_string(),
            ))
        }
    }

    /// Emit `change` plus its kind, then `uptodate` if it reaches the watermark.
    fn relay(&self, change: &Change) {
        let _order = self.emitter.hold();
        if self.gate.is_closed() {
            return;
        }

        self.emitter.emit(ChangeEvent::Change(change.clone()));
        let kind = if change.deleted {
            ChangeEvent::Delete(change.clone())
        } else if change.is_create() {
            ChangeEvent::Create(change.clone())
        } else {
            ChangeEvent::Update(change.clone())
        };
        self.emitter.emit(kind);

        if self.watermark.lock().cross(change.seq) {
            tracing::debug!(subscription = %self.id, seq = change.seq.0, "up to date");
            self.emitter.emit(ChangeEvent::UpToDate);
        }
    }

    fn spawn_watermark_fetch(self: &Arc<Self>) {
        let subscription = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-watermark", self.id))
            .spawn(move || match subscription.db.source.current_sequence() {
                Ok(current) => subscription.set_watermark(current.saturating_prev()),
                Err(e) => {
                    tracing::warn!(
                        subscription = %subscription.id,
                        error = %e,
                        "watermark fetch failed"
                    );
                }
            });

        if let Err(e) = spawned {
            tracing::warn!(subscription = %self.id, error = %e, "failed to spawn watermark fetch");
        }
    }

    fn set_watermark(&self, mark: Sequence) {
        if self.gate.is_closed() || self.is_cancelled() {
            return;
        }
        let mut watermark = self.watermark.lock();
        if *watermark == Watermark::Pending {
            *watermark = Watermark::At(mark);
            tracing::debug!(subscription = %self.id, mark = mark.0, "watermark set");
        }
    }

    fn install_canceller(&self, canceller: Option<Canceller>) {
        let canceller: Option<SharedCanceller> = canceller.map(Arc::from);
        *self.canceller.lock() = canceller;
        // A cancel that raced the feed start must still reach the feed.
        if self.is_cancelled() {
            self.forward_cancel();
        }
    }

    fn signal_stop(&self) {
        self.stop.lock().take();
    }

    fn forward_cancel(&self) {
        let canceller = self.canceller.lock().clone();
        if let Some(cancel) = canceller {
            cancel();
        }
    }

    pub(crate) fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            tracing::debug!(subscription = %self.id, "cancel requested");
        }
        self.signal_stop();
        self.forward_cancel();
        // Before readiness the queued task observes the flag instead.
        if self.db.queue.is_ready() {
            self.complete_cancelled();
        }
    }

    fn complete_cancelled(&self) {
        let _order = self.emitter.hold();
        if self.gate.is_closed() {
            return;
        }
        self.emitter.emit(ChangeEvent::Cancel);
        self.finish(Ok(ChangesResult::cancelled()));
    }

    /// Terminate with `outcome` unless another path already did.
    fn finish(&self, outcome: Result<ChangesResult>) {
        let _order = self.emitter.hold();
        if !self.gate.try_close() {
            return;
        }

        let event = match &outcome {
            Ok(result) => {
                tracing::debug!(
                    subscription = %self.id,
                    status = ?result.status,
                    "changes complete"
                );
                ChangeEvent::Complete(result.clone())
            }
            Err(err) => {
                tracing::debug!(subscription = %self.id, error = %err, "changes failed");
                ChangeEvent::Error(err.clone())
            }
        };
        self.emitter.emit(event);
        self.gate.settle(outcome);
        self.emitter.release();
        self.db.registry.unregister(self.id);
    }

    /// Silent teardown when the owning database is destroyed.
    pub(crate) fn detach(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.signal_stop();
        self.forward_cancel();

        let _order = self.emitter.hold();
        if !self.gate.try_close() {
            return;
        }
        tracing::debug!(subscription = %self.id, "detached by database teardown");
        self.gate.settle(Err(FeedError::StoreDestroyed));
        self.emitter.release();
        self.db.registry.unregister(self.id);
    }
}

/// Caller-side handle of a change-feed subscription.
///
/// Events are available both through [`Changes::on`] listeners and through
/// the channel returned by [`Changes::events`], which buffers from the moment
/// the subscription is created, up to [`DatabaseConfig::buffer_size`]
/// events. A channel that fills up is closed; see [`Changes::events_overflowed`].
/// Dropping the handle does not stop the feed; call [`Changes::cancel`].
///
/// [`DatabaseConfig::buffer_size`]: crate::DatabaseConfig::buffer_size
pub struct Changes {
    subscription: Arc<Subscription>,
    events: Receiver<ChangeEvent>,
}

impl Changes {
    pub fn id(&self) -> SubscriptionId {
        self.subscription.id
    }

    /// Channel of every event, closed after the terminal one.
    pub fn events(&self) -> &Receiver<ChangeEvent> {
        &self.events
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> std::result::Result<ChangeEvent, crossbeam_channel::RecvError> {
        self.events.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<ChangeEvent, crossbeam_channel::TryRecvError> {
        self.events.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<ChangeEvent, crossbeam_channel::RecvTimeoutError> {
        self.events.recv_timeout(timeout)
    }

    /// Register a listener for events emitted from now on.
    ///
    /// Returns false if the subscription has already terminated.
    pub fn on(&self, listener: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> bool {
        self.subscription.emitter.on(Arc::new(listener))
    }

    /// Two-callback completion: exactly one of them runs, once.
    ///
    /// If the subscription already terminated, the matching callback runs
    /// immediately on the calling thread.
    pub fn then(
        &self,
        on_success: impl Fn(&ChangesResult) + Send + Sync + 'static,
        on_failure: impl Fn(&FeedError) + Send + Sync + 'static,
    ) {
        let listener: Listener = Arc::new(move |event: &ChangeEvent| match event {
            ChangeEvent::Complete(result) => on_success(result),
            ChangeEvent::Error(err) => on_failure(err),
            _ => {}
        });
        if self.subscription.emitter.on(Arc::clone(&listener)) {
            return;
        }
        match self.subscription.gate.outcome() {
            Some(Ok(result)) => listener(&ChangeEvent::Complete(result)),
            // Teardown is silent.
            Some(Err(FeedError::StoreDestroyed)) | None => {}
            Some(Err(err)) => listener(&ChangeEvent::Error(err)),
        }
    }

    /// Request cancellation. Safe to call repeatedly and after completion.
    pub fn cancel(&self) {
        self.subscription.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.subscription.is_cancelled()
    }

    /// Whether the event channel was closed because nobody drained it.
    ///
    /// Listeners registered with [`Changes::on`] still receive every event.
    pub fn events_overflowed(&self) -> bool {
        self.subscription.emitter.is_overflowed()
    }

    /// Whether a terminal outcome has been reached.
    pub fn is_complete(&self) -> bool {
        self.subscription.gate.is_closed()
    }

    /// Block until the subscription terminates.
    pub fn wait(&self) -> Result<ChangesResult> {
        self.subscription.gate.wait()
    }

    /// Like [`Changes::wait`], giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<ChangesResult>> {
        self.subscription.gate.wait_timeout(timeout)
    }
}

impl std::fmt::Debug for Changes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Changes")
            .field("id", &self.subscription.id)
            .field("cancelled", &self.is_cancelled())
            .field("complete", &self.is_complete())
            .finish()
    }
}
