//! The storage-side contract a subscription consumes.

use crate::error::Result;
use crate::filter::ChangesFilter;
use crate::revs;
use crate::types::{Leaf, RawChange, RevTree, Revision, RevisionMetadata, Sequence, Style};
use crossbeam_channel::Receiver;
use serde_json::{Map, Value};

/// Stops an in-flight raw feed. Must tolerate being called more than once.
pub type Canceller = Box<dyn Fn() + Send + Sync>;

/// Options handed to [`ChangeSource::changes`] once a subscription has
/// resolved `since`, its filter and its limit.
#[derive(Clone, Debug, Default)]
pub struct RawChangesOptions {
    /// Deliver changes strictly after this sequence.
    pub since: Sequence,
    pub continuous: bool,
    pub descending: bool,
    /// Stop after this many delivered records.
    pub limit: Option<usize>,
    /// `Inline` for embedded sources; `Named`/`View` only reach sources that
    /// report [`ChangeSource::supports_named_filters`].
    pub filter: ChangesFilter,
    pub view: Option<String>,
    pub query_params: Map<String, Value>,
    pub doc_ids: Option<Vec<String>>,
    pub conflicts: bool,
    pub style: Style,
}

/// Items delivered by a raw feed. A feed ends with exactly one
/// `Complete` or `Error`, unless it is cancelled first.
#[derive(Clone, Debug)]
pub enum RawEvent {
    Change(RawChange),
    Complete { last_seq: Sequence },
    Error(crate::error::FeedError),
}

/// A started raw change stream.
pub struct RawFeed {
    pub events: Receiver<RawEvent>,
    canceller: Option<Canceller>,
}

impl RawFeed {
    pub fn new(events: Receiver<RawEvent>) -> Self {
        Self {
            events,
            canceller: None,
        }
    }

    /// Attach a cancel hook.
    pub fn with_canceller(mut self, cancel: impl Fn() + Send + Sync + 'static) -> Self {
        self.canceller = Some(Box::new(cancel));
        self
    }

    pub fn is_cancellable(&self) -> bool {
        self.canceller.is_some()
    }

    pub fn cancel(&self) {
        if let Some(cancel) = &self.canceller {
            cancel();
        }
    }

    pub fn into_parts(self) -> (Receiver<RawEvent>, Option<Canceller>) {
        (self.events, self.canceller)
    }
}

/// Revision tree queries a source provides. Defaults use [`crate::revs`].
pub trait RevisionOps {
    fn is_deleted(&self, metadata: &RevisionMetadata, rev: Option<&Revision>) -> bool {
        revs::is_deleted(metadata, rev)
    }

    fn collect_leaves(&self, tree: &RevTree) -> Vec<Leaf> {
        revs::collect_leaves(tree)
    }

    fn collect_conflicts(&self, metadata: &RevisionMetadata) -> Vec<Revision> {
        revs::collect_conflicts(metadata)
    }
}

/// A store that can produce a raw change log.
pub trait ChangeSource: RevisionOps + Send + Sync {
    /// The store's latest assigned sequence.
    fn current_sequence(&self) -> Result<Sequence>;

    /// Start a raw change stream.
    fn changes(&self, options: RawChangesOptions) -> Result<RawFeed>;

    /// Point read of a document. Used for design-document lookups.
    fn get_document(&self, id: &str) -> Result<Value>;

    /// Whether the source evaluates `"ddoc/name"` filters itself.
    fn supports_named_filters(&self) -> bool {
        false
    }
}
