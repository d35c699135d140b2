//! In-process [`ChangeSource`] backed by a revision tree per document.
//!
//! Every write assigns the next sequence; a document appears in the change
//! log once, at the sequence of its latest write. Feeds run on their own
//! thread and can be cancelled.

use crate::error::{FeedError, Result};
use crate::filter::FilterContext;
use crate::revs;
use crate::source::{ChangeSource, RawChangesOptions, RawEvent, RawFeed, RevisionOps};
use crate::types::{RawChange, RevNode, RevTree, Revision, RevisionMetadata, Sequence};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How long a live feed sleeps between checks for new writes or cancellation.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct StoredDoc {
    metadata: RevisionMetadata,
    bodies: HashMap<Revision, Value>,
}

#[derive(Default)]
struct MemoryState {
    docs: HashMap<String, StoredDoc>,
    by_seq: BTreeMap<Sequence, String>,
    update_seq: Sequence,
    failure: Option<String>,
}

struct Shared {
    state: Mutex<MemoryState>,
    written: Condvar,
    poll_interval: Duration,
    feeds_started: AtomicUsize,
}

/// A thread-safe in-memory document store with a change log.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MemoryState::default()),
                written: Condvar::new(),
                poll_interval,
                feeds_started: AtomicUsize::new(0),
            }),
        }
    }

    /// Write a new revision of `doc`, extending the current winner.
    ///
    /// `doc` must be an object with a string `_id`.
    pub fn put(&self, doc: Value) -> Result<Revision> {
        let id = doc_id(&doc)?;
        self.write(&id, doc, false, false)
    }

    /// Write a sibling of the current winning revision, creating a conflict.
    pub fn put_conflict(&self, doc: Value) -> Result<Revision> {
        let id = doc_id(&doc)?;
        self.write(&id, doc, false, true)
    }

    /// Write a deletion revision for `id`.
    pub fn remove(&self, id: &str) -> Result<Revision> {
        self.write(id, json!({ "_id": id }), true, false)
    }

    /// Make every subsequent read and feed start fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        self.shared.state.lock().failure = Some(message.into());
    }

    pub fn clear_failure(&self) {
        self.shared.state.lock().failure = None;
    }

    /// Number of raw feeds started so far.
    pub fn feeds_started(&self) -> usize {
        self.shared.feeds_started.load(Ordering::SeqCst)
    }

    /// Revision metadata for a document.
    pub fn metadata(&self, id: &str) -> Option<RevisionMetadata> {
        self.shared
            .state
            .lock()
            .docs
            .get(id)
            .map(|stored| stored.metadata.clone())
    }

    fn write(&self, id: &str, body: Value, deleted: bool, sibling: bool) -> Result<Revision> {
        let mut state = self.shared.state.lock();
        let seq = state.update_seq.next();

        let stored = state.docs.entry(id.to_string()).or_insert_with(|| StoredDoc {
            metadata: RevisionMetadata {
                id: id.to_string(),
                rev_tree: RevTree::default(),
                seq,
            },
            bodies: HashMap::new(),
        });

        let winner = revs::winning_rev(&stored.metadata);
        let (generation, parent) = match (&winner, sibling) {
            (None, _) => (1, None),
            (Some(rev), false) => (rev.generation().unwrap_or(0) + 1, Some(rev.clone())),
            (Some(rev), true) => (
                rev.generation().unwrap_or(1),
                parent_of(&stored.metadata.rev_tree.roots, rev),
            ),
        };
        let rev = Revision::new(generation, &revision_hash(parent.as_ref(), &body, deleted));

        let leaf = RevNode::leaf(rev.clone(), deleted);
        match parent.as_ref().and_then(|p| find_node_mut(&mut stored.metadata.rev_tree.roots, p)) {
            Some(parent_node) => parent_node.children.push(leaf),
            None => stored.metadata.rev_tree.roots.push(leaf),
        }

        let mut body = body;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("_id".into(), Value::String(id.to_string()));
            obj.insert("_rev".into(), Value::String(rev.0.clone()));
            obj.remove("_conflicts");
            if deleted {
                obj.insert("_deleted".into(), Value::Bool(true));
            }
        }
        stored.bodies.insert(rev.clone(), body);

        let previous_seq = stored.metadata.seq;
        stored.metadata.seq = seq;
        state.by_seq.remove(&previous_seq);
        state.by_seq.insert(seq, id.to_string());
        state.update_seq = seq;
        drop(state);

        self.shared.written.notify_all();
        tracing::trace!(id, rev = %rev, seq = seq.0, "memory store write");
        Ok(rev)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn check_failure(&self) -> Result<()> {
        match &self.state.lock().failure {
            Some(message) => Err(FeedError::Backend(message.clone())),
            None => Ok(()),
        }
    }

    /// Records after `since` in log order, optionally reversed.
    fn snapshot_after(&self, since: Sequence, descending: bool) -> Vec<RawChange> {
        let state = self.state.lock();
        let mut changes: Vec<RawChange> = state
            .by_seq
            .range(since.next()..)
            .filter_map(|(seq, id)| {
                let stored = state.docs.get(id)?;
                let winner = revs::winning_rev(&stored.metadata)?;
                let doc = stored.bodies.get(&winner)?.clone();
                Some(RawChange {
                    seq: *seq,
                    id: id.clone(),
                    doc,
                    metadata: stored.metadata.clone(),
                    deleted: revs::is_deleted(&stored.metadata, Some(&winner)),
                })
            })
            .collect();
        if descending {
            changes.reverse();
        }
        changes
    }

    fn produce(&self, options: RawChangesOptions, tx: Sender<RawEvent>, cancelled: &AtomicBool) {
        let ctx = FilterContext {
            query: options.query_params.clone(),
        };
        let mut last_seq = options.since;
        let mut delivered = 0usize;

        loop {
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            if options.limit.map_or(false, |limit| delivered >= limit) {
                let _ = tx.send(RawEvent::Complete { last_seq });
                return;
            }

            let descending = options.descending && !options.continuous;
            for raw in self.snapshot_after(last_seq, descending) {
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }
                last_seq = last_seq.max(raw.seq);

                if !wanted(&options, &raw, &ctx) {
                    continue;
                }
                if tx.send(RawEvent::Change(raw)).is_err() {
                    return;
                }
                delivered += 1;
                if options.limit.map_or(false, |limit| delivered >= limit) {
                    let _ = tx.send(RawEvent::Complete { last_seq });
                    return;
                }
            }

            if !options.continuous {
                let _ = tx.send(RawEvent::Complete { last_seq });
                return;
            }

            let mut state = self.state.lock();
            while state.update_seq <= last_seq && !cancelled.load(Ordering::SeqCst) {
                self.written.wait_for(&mut state, self.poll_interval);
            }
        }
    }
}

fn wanted(options: &RawChangesOptions, raw: &RawChange, ctx: &FilterContext) -> bool {
    if let Some(ids) = &options.doc_ids {
        if !ids.iter().any(|id| id == &raw.id) {
            return false;
        }
    }
    options.filter.matches(&raw.doc, ctx)
}

impl RevisionOps for MemoryStore {}

impl ChangeSource for MemoryStore {
    fn current_sequence(&self) -> Result<Sequence> {
        self.shared.check_failure()?;
        Ok(self.shared.state.lock().update_seq)
    }

    fn changes(&self, options: RawChangesOptions) -> Result<RawFeed> {
        self.shared.check_failure()?;
        if options.filter.is_named() {
            return Err(FeedError::BadRequest(
                "named filters must be resolved before reaching the memory store".to_string(),
            ));
        }
        self.shared.feeds_started.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(&self.shared);
        let flag = Arc::clone(&cancelled);
        thread::Builder::new()
            .name("memory-changes".to_string())
            .spawn(move || shared.produce(options, tx, &flag))
            .map_err(|e| FeedError::Backend(format!("failed to start change feed: {}", e)))?;

        let shared = Arc::clone(&self.shared);
        Ok(RawFeed::new(rx).with_canceller(move || {
            cancelled.store(true, Ordering::SeqCst);
            shared.written.notify_all();
        }))
    }

    fn get_document(&self, id: &str) -> Result<Value> {
        self.shared.check_failure()?;
        let state = self.shared.state.lock();
        let stored = state
            .docs
            .get(id)
            .ok_or_else(|| FeedError::NotFound("missing".to_string()))?;
        let winner = revs::winning_rev(&stored.metadata)
            .ok_or_else(|| FeedError::NotFound("missing".to_string()))?;
        if revs::is_deleted(&stored.metadata, Some(&winner)) {
            return Err(FeedError::NotFound("deleted".to_string()));
        }
        stored
            .bodies
            .get(&winner)
            .cloned()
            .ok_or_else(|| FeedError::NotFound("missing".to_string()))
    }
}

fn doc_id(doc: &Value) -> Result<String> {
    doc.get("_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| FeedError::BadRequest("document must have a string _id".to_string()))
}

fn revision_hash(parent: Option<&Revision>, body: &Value, deleted: bool) -> String {
    let mut hasher = Sha256::new();
    if let Some(parent) = parent {
        hasher.update(parent.as_str().as_bytes());
    }
    hasher.update([deleted as u8]);
    hasher.update(body.to_string().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

fn find_node_mut<'a>(nodes: &'a mut [RevNode], rev: &Revision) -> Option<&'a mut RevNode> {
    for node in nodes {
        if &node.rev == rev {
            return Some(node);
        }
        if let Some(found) = find_node_mut(&mut node.children, rev) {
            return Some(found);
        }
    }
    None
}

fn parent_of(nodes: &[RevNode], rev: &Revision) -> Option<Revision> {
    for node in nodes {
        if node.children.iter().any(|child| &child.rev == rev) {
            return Some(node.rev.clone());
        }
        if let Some(found) = parent_of(&node.children, rev) {
            return Some(found);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(feed: RawFeed) -> (Vec<RawChange>, Option<Sequence>) {
        let mut changes = Vec::new();
        for event in feed.events.iter() {
            match event {
                RawEvent::Change(raw) => changes.push(raw),
                RawEvent::Complete { last_seq } => return (changes, Some(last_seq)),
                RawEvent::Error(e) => panic!("unexpected error: {}", e),
            }
        }
        (changes, None)
    }

    #[test]
    fn test_put_assigns_generations() {
        let store = MemoryStore::new();
        let r1 = store.put(json!({"_id": "a", "v": 1})).unwrap();
        let r2 = store.put(json!({"_id": "a", "v": 2})).unwrap();

        assert_eq!(r1.generation(), Some(1));
        assert_eq!(r2.generation(), Some(2));
        assert_eq!(store.current_sequence().unwrap(), Sequence(2));

        let doc = store.get_document("a").unwrap();
        assert_eq!(doc["v"], 2);
        assert_eq!(doc["_rev"], r2.0.as_str());
    }

    #[test]
    fn test_document_listed_once_at_latest_seq() {
        let store = MemoryStore::new();
        store.put(json!({"_id": "a"})).unwrap();
        store.put(json!({"_id": "b"})).unwrap();
        store.put(json!({"_id": "a", "again": true})).unwrap();

        let (changes, last) = collect(store.changes(RawChangesOptions::default()).unwrap());
        let ids: Vec<_> = changes.iter().map(|c| (c.id.as_str(), c.seq.0)).collect();
        assert_eq!(ids, vec![("b", 2), ("a", 3)]);
        assert_eq!(last, Some(Sequence(3)));
    }

    #[test]
    fn test_conflict_and_delete() {
        let store = MemoryStore::new();
        store.put(json!({"_id": "a"})).unwrap();
        store.put(json!({"_id": "a", "n": 1})).unwrap();
        store.put_conflict(json!({"_id": "a", "n": 2})).unwrap();

        let meta = store.metadata("a").unwrap();
        assert_eq!(revs::collect_leaves(&meta.rev_tree).len(), 2);
        assert_eq!(revs::collect_conflicts(&meta).len(), 1);

        let gone = store.put(json!({"_id": "b"})).and_then(|_| store.remove("b")).unwrap();
        assert_eq!(gone.generation(), Some(2));
        assert!(matches!(store.get_document("b"), Err(FeedError::NotFound(_))));
    }

    #[test]
    fn test_limit_descending_and_doc_ids() {
        let store = MemoryStore::new();
        for id in ["a", "b", "c", "d"] {
            store.put(json!({ "_id": id })).unwrap();
        }

        let (changes, _) = collect(
            store
                .changes(RawChangesOptions {
                    descending: true,
                    limit: Some(2),
                    ..Default::default()
                })
                .unwrap(),
        );
        let ids: Vec<_> = changes.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "c"]);

        let (changes, _) = collect(
            store
                .changes(RawChangesOptions {
                    doc_ids: Some(vec!["b".into(), "d".into()]),
                    ..Default::default()
                })
                .unwrap(),
        );
        let ids: Vec<_> = changes.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d"]);
    }

    #[test]
    fn test_live_feed_sees_new_writes_and_cancels() {
        let store = MemoryStore::with_poll_interval(Duration::from_millis(5));
        store.put(json!({"_id": "a"})).unwrap();

        let feed = store
            .changes(RawChangesOptions {
                continuous: true,
                ..Default::default()
            })
            .unwrap();
        assert!(feed.is_cancellable());

        let first = feed.events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(first, RawEvent::Change(ref c) if c.id == "a"));

        store.put(json!({"_id": "b"})).unwrap();
        let second = feed.events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(second, RawEvent::Change(ref c) if c.id == "b"));

        feed.cancel();
        // The producer exits and drops its sender.
        let end = feed.events.recv_timeout(Duration::from_secs(1));
        assert!(end.is_err());
    }

    #[test]
    fn test_failure_injection() {
        let store = MemoryStore::new();
        store.fail_with("disk on fire");
        assert_eq!(
            store.current_sequence().unwrap_err(),
            FeedError::Backend("disk on fire".into())
        );
        assert!(store.changes(RawChangesOptions::default()).is_err());

        store.clear_failure();
        assert!(store.current_sequence().is_ok());
    }
}
