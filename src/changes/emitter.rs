//! Listener set and once-only completion gate of a subscription.
//!
//! Emission is serialized by a reentrant lock: events reach listeners in
//! emission order, a listener may call back into the subscription (for
//! example to cancel it), and nothing is delivered after [`Emitter::release`].
//!
//! The event channel is bounded. When it fills up because nobody reads it,
//! the channel is closed and only listeners keep receiving events.

use super::types::{ChangeEvent, ChangesResult};
use crate::error::Result;
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::{Condvar, Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Closure type for event listeners.
pub type Listener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

struct EmitterState {
    listeners: Vec<Listener>,
    sender: Option<Sender<ChangeEvent>>,
    released: bool,
    overflowed: bool,
}

pub(crate) struct Emitter {
    state: Mutex<EmitterState>,
    order: ReentrantMutex<()>,
}

impl Emitter {
    pub(crate) fn new(sender: Sender<ChangeEvent>) -> Self {
        Self {
            state: Mutex::new(EmitterState {
                listeners: Vec::new(),
                sender: Some(sender),
                released: false,
                overflowed: false,
            }),
            order: ReentrantMutex::new(()),
        }
    }

    /// Hold the emission order. Events emitted by other threads wait until
    /// the guard is dropped.
    pub(crate) fn hold(&self) -> ReentrantMutexGuard<'_, ()> {
        self.order.lock()
    }

    /// Register a listener. Returns false once the emitter is released.
    pub(crate) fn on(&self, listener: Listener) -> bool {
        let _order = self.hold();
        let mut state = self.state.lock();
        if state.released {
            return false;
        }
        state.listeners.push(listener);
        true
    }

    pub(crate) fn emit(&self, event: ChangeEvent) {
        let _order = self.hold();
        // Snapshot under the state lock; callbacks run without it.
        let (listeners, sender) = {
            let state = self.state.lock();
            if state.released {
                return;
            }
            (state.listeners.clone(), state.sender.clone())
        };

        for listener in &listeners {
            listener(&event);
        }
        if let Some(sender) = sender {
            match sender.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => self.close_channel(sender.capacity()),
                // The caller may have dropped its receiver.
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    /// Stop feeding an unread channel. Readers drain what is buffered and
    /// then see it disconnect.
    fn close_channel(&self, capacity: Option<usize>) {
        let mut state = self.state.lock();
        if state.sender.take().is_some() {
            state.overflowed = true;
            tracing::warn!(?capacity, "event buffer full, closing event channel");
        }
    }

    /// Whether the event channel was closed because it filled up.
    pub(crate) fn is_overflowed(&self) -> bool {
        self.state.lock().overflowed
    }

    /// Drop every listener and close the event channel.
    pub(crate) fn release(&self) {
        let _order = self.hold();
        let mut state = self.state.lock();
        state.released = true;
        state.listeners.clear();
        state.sender = None;
    }

    #[cfg(test)]
    pub(crate) fn is_released(&self) -> bool {
        self.state.lock().released
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }
}

/// Once-only terminal outcome.
pub(crate) struct CompletionGate {
    closed: AtomicBool,
    outcome: Mutex<Option<Result<ChangesResult>>>,
    settled: Condvar,
}

impl CompletionGate {
    pub(crate) fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            outcome: Mutex::new(None),
            settled: Condvar::new(),
        }
    }

    /// Claim the right to terminate. Only the first caller gets `true`.
    pub(crate) fn try_close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Store the outcome and wake waiters.
    pub(crate) fn settle(&self, outcome: Result<ChangesResult>) {
        *self.outcome.lock() = Some(outcome);
        self.settled.notify_all();
    }

    pub(crate) fn outcome(&self) -> Option<Result<ChangesResult>> {
        self.outcome.lock().clone()
    }

    pub(crate) fn wait(&self) -> Result<ChangesResult> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            self.settled.wait(&mut outcome);
        }
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<Result<ChangesResult>> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return Some(result.clone());
            }
            if self.settled.wait_until(&mut outcome, deadline).timed_out() {
                return (*outcome).clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FeedError;
    use crossbeam_channel::{bounded, unbounded};

    #[test]
    fn test_emit_reaches_listeners_then_channel() {
        let (tx, rx) = unbounded();
        let emitter = Emitter::new(tx);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        assert!(emitter.on(Arc::new(move |e: &ChangeEvent| log.lock().push(e.name()))));

        emitter.emit(ChangeEvent::UpToDate);
        assert_eq!(*seen.lock(), vec!["uptodate"]);
        assert_eq!(rx.try_recv().unwrap(), ChangeEvent::UpToDate);
    }

    #[test]
    fn test_release_silences_and_disconnects() {
        let (tx, rx) = unbounded();
        let emitter = Emitter::new(tx);
        emitter.on(Arc::new(|_: &ChangeEvent| panic!("released listener called")));

        emitter.release();
        assert!(emitter.is_released());
        assert_eq!(emitter.listener_count(), 0);
        emitter.emit(ChangeEvent::UpToDate);
        assert!(rx.try_recv().is_err());
        assert!(!emitter.on(Arc::new(|_: &ChangeEvent| {})));
    }

    #[test]
    fn test_full_channel_closes_but_listeners_continue() {
        let (tx, rx) = bounded(2);
        let emitter = Emitter::new(tx);
        let seen = Arc::new(Mutex::new(0usize));
        let count = Arc::clone(&seen);
        emitter.on(Arc::new(move |_: &ChangeEvent| *count.lock() += 1));

        for _ in 0..5 {
            emitter.emit(ChangeEvent::UpToDate);
        }

        assert_eq!(*seen.lock(), 5);
        assert!(emitter.is_overflowed());
        assert_eq!(rx.len(), 2);
        assert_eq!(rx.try_recv().unwrap(), ChangeEvent::UpToDate);
        assert_eq!(rx.try_recv().unwrap(), ChangeEvent::UpToDate);
        assert!(rx.try_recv().unwrap_err().is_disconnected());
    }

    #[test]
    fn test_reentrant_emit_from_listener() {
        let (tx, rx) = unbounded();
        let emitter = Arc::new(Emitter::new(tx));
        let inner = Arc::clone(&emitter);
        emitter.on(Arc::new(move |e: &ChangeEvent| {
            if *e == ChangeEvent::Cancel {
                inner.emit(ChangeEvent::UpToDate);
            }
        }));

        emitter.emit(ChangeEvent::Cancel);
        // The nested emit completes first.
        assert_eq!(rx.try_recv().unwrap(), ChangeEvent::UpToDate);
        assert_eq!(rx.try_recv().unwrap(), ChangeEvent::Cancel);
    }

    #[test]
    fn test_gate_closes_once() {
        let gate = CompletionGate::new();
        assert!(gate.try_close());
        assert!(!gate.try_close());
        assert!(gate.is_closed());

        assert!(gate.wait_timeout(Duration::from_millis(10)).is_none());
        gate.settle(Err(FeedError::Backend("boom".into())));
        assert_eq!(gate.wait(), Err(FeedError::Backend("boom".into())));
        assert!(gate.outcome().is_some());
    }
}
