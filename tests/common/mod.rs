//! Shared fixtures for integration tests.
#![allow(dead_code)]

use changefeed::{
    ChangeEvent, ChangeSource, Changes, FeedError, RawChange, RawChangesOptions, RawEvent,
    RawFeed, Result, RevNode, RevTree, Revision, RevisionMetadata, RevisionOps, Sequence,
};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Route subscription logs to the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Call counters for a [`ScriptedSource`].
#[derive(Default)]
pub struct Calls {
    pub current_sequence: AtomicUsize,
    pub changes: AtomicUsize,
    pub get_document: AtomicUsize,
}

impl Calls {
    pub fn current_sequence(&self) -> usize {
        self.current_sequence.load(Ordering::SeqCst)
    }

    pub fn changes(&self) -> usize {
        self.changes.load(Ordering::SeqCst)
    }

    pub fn get_document(&self) -> usize {
        self.get_document.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.current_sequence() + self.changes() + self.get_document()
    }
}

/// A change source whose every answer is scripted by the test.
pub struct ScriptedSource {
    pub calls: Calls,
    current: Mutex<Result<Sequence>>,
    docs: Mutex<HashMap<String, Value>>,
    script: Mutex<Vec<RawEvent>>,
    named_filters: bool,
    cancellable: bool,
    feed_sender: Mutex<Option<Sender<RawEvent>>>,
    last_options: Mutex<Option<RawChangesOptions>>,
    document_gate: Mutex<Option<Receiver<()>>>,
    sequence_gate: Mutex<Option<Receiver<()>>>,
    pub cancelled: Arc<AtomicBool>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            calls: Calls::default(),
            current: Mutex::new(Ok(Sequence(0))),
            docs: Mutex::new(HashMap::new()),
            script: Mutex::new(Vec::new()),
            named_filters: false,
            cancellable: true,
            feed_sender: Mutex::new(None),
            last_options: Mutex::new(None),
            document_gate: Mutex::new(None),
            sequence_gate: Mutex::new(None),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_current(self, seq: u64) -> Self {
        *self.current.lock() = Ok(Sequence(seq));
        self
    }

    pub fn with_current_error(self, message: &str) -> Self {
        *self.current.lock() = Err(FeedError::Backend(message.to_string()));
        self
    }

    pub fn with_doc(self, id: &str, doc: Value) -> Self {
        self.docs.lock().insert(id.to_string(), doc);
        self
    }

    /// Events sent as soon as a feed starts. The feed stays open afterwards
    /// unless the script contains a terminal event.
    pub fn with_script(self, events: Vec<RawEvent>) -> Self {
        *self.script.lock() = events;
        self
    }

    pub fn with_named_filters(mut self) -> Self {
        self.named_filters = true;
        self
    }

    pub fn without_cancel_hook(mut self) -> Self {
        self.cancellable = false;
        self
    }

    /// Block `get_document` until the returned sender fires (or is dropped).
    pub fn gate_documents(&self) -> Sender<()> {
        let (tx, rx) = bounded(1);
        *self.document_gate.lock() = Some(rx);
        tx
    }

    /// Block `current_sequence` until the returned sender fires (or is dropped).
    pub fn gate_sequence(&self) -> Sender<()> {
        let (tx, rx) = bounded(1);
        *self.sequence_gate.lock() = Some(rx);
        tx
    }

    /// Push an event into the open feed. Returns false once the subscription
    /// stopped reading it.
    pub fn push(&self, event: RawEvent) -> bool {
        match self.feed_sender.lock().as_ref() {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Drop the feed's sender without a terminal event.
    pub fn close_feed(&self) {
        self.feed_sender.lock().take();
    }

    pub fn last_options(&self) -> Option<RawChangesOptions> {
        self.last_options.lock().clone()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

fn wait_gate(gate: &Mutex<Option<Receiver<()>>>) {
    let receiver = gate.lock().clone();
    if let Some(receiver) = receiver {
        let _ = receiver.recv_timeout(TIMEOUT);
    }
}

impl RevisionOps for ScriptedSource {}

impl ChangeSource for ScriptedSource {
    fn current_sequence(&self) -> Result<Sequence> {
        self.calls.current_sequence.fetch_add(1, Ordering::SeqCst);
        wait_gate(&self.sequence_gate);
        self.current.lock().clone()
    }

    fn changes(&self, options: RawChangesOptions) -> Result<RawFeed> {
        self.calls.changes.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock() = Some(options);

        let (tx, rx) = unbounded();
        for event in self.script.lock().iter() {
            tx.send(event.clone()).unwrap();
        }
        *self.feed_sender.lock() = Some(tx);

        let feed = RawFeed::new(rx);
        if !self.cancellable {
            return Ok(feed);
        }
        let cancelled = Arc::clone(&self.cancelled);
        Ok(feed.with_canceller(move || cancelled.store(true, Ordering::SeqCst)))
    }

    fn get_document(&self, id: &str) -> Result<Value> {
        self.calls.get_document.fetch_add(1, Ordering::SeqCst);
        wait_gate(&self.document_gate);
        self.docs
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| FeedError::NotFound("missing".to_string()))
    }

    fn supports_named_filters(&self) -> bool {
        self.named_filters
    }
}

/// A raw record for a single-revision document.
pub fn raw(seq: u64, id: &str, rev: &str) -> RawChange {
    raw_with(seq, id, rev, false)
}

pub fn raw_deleted(seq: u64, id: &str, rev: &str) -> RawChange {
    raw_with(seq, id, rev, true)
}

fn raw_with(seq: u64, id: &str, rev: &str, deleted: bool) -> RawChange {
    let mut doc = json!({"_id": id, "_rev": rev});
    if deleted {
        doc["_deleted"] = json!(true);
    }
    RawChange {
        seq: Sequence(seq),
        id: id.to_string(),
        doc,
        metadata: RevisionMetadata {
            id: id.to_string(),
            rev_tree: RevTree {
                roots: vec![RevNode::leaf(Revision::from(rev), deleted)],
            },
            seq: Sequence(seq),
        },
        deleted,
    }
}

/// Receive events until the channel closes.
pub fn drain(changes: &Changes) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = changes.recv_timeout(TIMEOUT) {
        events.push(event);
    }
    events
}

/// Receive events up to and including the first matching one.
pub fn recv_until(changes: &Changes, pred: impl Fn(&ChangeEvent) -> bool) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = changes.recv_timeout(TIMEOUT) {
        let done = pred(&event);
        events.push(event);
        if done {
            break;
        }
    }
    events
}

pub fn names(events: &[ChangeEvent]) -> Vec<&'static str> {
    events.iter().map(ChangeEvent::name).collect()
}

/// Poll until `cond` holds or the timeout elapses.
pub fn eventually(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
