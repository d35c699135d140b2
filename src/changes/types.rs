//! Subscription options, events and results.

use crate::error::FeedError;
use crate::filter::{ChangesFilter, FilterContext};
use crate::source::RawChangesOptions;
use crate::types::{Change, Sequence, Style};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Legacy per-change callback.
pub type ChangeCallback = Arc<dyn Fn(&Change) + Send + Sync>;

/// Legacy completion callback, called once with the terminal outcome.
pub type CompleteCallback =
    Arc<dyn Fn(std::result::Result<&ChangesResult, &FeedError>) + Send + Sync>;

/// Where a feed starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Since {
    /// Changes strictly after this sequence.
    Seq(Sequence),
    /// Only changes from the store's latest write onwards.
    Latest,
}

impl Default for Since {
    fn default() -> Self {
        Since::Seq(Sequence(0))
    }
}

impl From<u64> for Since {
    fn from(seq: u64) -> Self {
        Since::Seq(Sequence(seq))
    }
}

impl FromStr for Since {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "latest" || s == "now" {
            return Ok(Since::Latest);
        }
        s.parse::<u64>()
            .map(Since::from)
            .map_err(|_| FeedError::BadRequest(format!("invalid since value: {:?}", s)))
    }
}

/// Options for a change-feed subscription.
///
/// The subscription takes ownership, so later changes on the caller's side
/// never affect a running feed.
#[derive(Clone)]
pub struct ChangesOptions {
    pub since: Since,
    /// Alias for `continuous`, consulted only when `continuous` is unset.
    pub live: Option<bool>,
    pub continuous: Option<bool>,
    pub descending: Option<bool>,
    /// Maximum records. `Some(0)` behaves like `Some(1)`.
    pub limit: Option<usize>,
    pub filter: ChangesFilter,
    /// `"ddoc/view"` for [`ChangesFilter::View`].
    pub view: Option<String>,
    pub query_params: Map<String, Value>,
    pub doc_ids: Option<Vec<String>>,
    /// Attach `doc._conflicts` when conflicting leaves exist.
    pub conflicts: bool,
    pub style: Style,
    /// Collect delivered changes into the completion result (one-shot feeds only).
    pub return_docs: bool,
    pub on_change: Option<ChangeCallback>,
    pub complete: Option<CompleteCallback>,
}

impl Default for ChangesOptions {
    fn default() -> Self {
        Self {
            since: Since::default(),
            live: None,
            continuous: None,
            descending: None,
            limit: None,
            filter: ChangesFilter::None,
            view: None,
            query_params: Map::new(),
            doc_ids: None,
            conflicts: false,
            style: Style::MainOnly,
            return_docs: true,
            on_change: None,
            complete: None,
        }
    }
}

impl ChangesOptions {
    pub fn since(mut self, since: impl Into<Since>) -> Self {
        self.since = since.into();
        self
    }

    pub fn latest(mut self) -> Self {
        self.since = Since::Latest;
        self
    }

    pub fn live(mut self) -> Self {
        self.live = Some(true);
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = Some(true);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Filter by name: `"ddoc/name"` or `"_view"`.
    pub fn filter(mut self, name: impl Into<String>) -> Self {
        self.filter = ChangesFilter::named(name);
        self
    }

    pub fn inline_filter(
        mut self,
        predicate: impl Fn(&Value, &FilterContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = ChangesFilter::inline(predicate);
        self
    }

    pub fn view(mut self, view: impl Into<String>) -> Self {
        self.view = Some(view.into());
        self
    }

    pub fn query_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.query_params.insert(key.into(), value);
        self
    }

    pub fn doc_ids(mut self, ids: Vec<String>) -> Self {
        self.doc_ids = Some(ids);
        self
    }

    pub fn conflicts(mut self) -> Self {
        self.conflicts = true;
        self
    }

    pub fn style(mut self, style: Style) -> Self {
        self.style = style;
        self
    }

    pub fn on_change(mut self, callback: impl Fn(&Change) + Send + Sync + 'static) -> Self {
        self.on_change = Some(Arc::new(callback));
        self
    }

    pub fn on_complete(
        mut self,
        callback: impl Fn(std::result::Result<&ChangesResult, &FeedError>) + Send + Sync + 'static,
    ) -> Self {
        self.complete = Some(Arc::new(callback));
        self
    }

    /// `continuous` if given, otherwise `live`, otherwise false.
    pub fn is_continuous(&self) -> bool {
        self.continuous.or(self.live).unwrap_or(false)
    }

    /// Fold `live` into `continuous`.
    pub(crate) fn normalize(&mut self) {
        if self.continuous.is_none() {
            self.continuous = self.live;
        }
    }

    /// Options for the raw source once `since` has been resolved.
    pub(crate) fn to_raw(&self, since: Sequence) -> RawChangesOptions {
        RawChangesOptions {
            since,
            continuous: self.is_continuous(),
            descending: self.descending.unwrap_or(false),
            // 0 and 1 both return one record.
            limit: self.limit.map(|limit| limit.max(1)),
            filter: self.filter.clone(),
            view: self.view.clone(),
            query_params: self.query_params.clone(),
            doc_ids: self.doc_ids.clone(),
            conflicts: self.conflicts,
            style: self.style,
        }
    }
}

impl fmt::Debug for ChangesOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangesOptions")
            .field("since", &self.since)
            .field("live", &self.live)
            .field("continuous", &self.continuous)
            .field("descending", &self.descending)
            .field("limit", &self.limit)
            .field("filter", &self.filter)
            .field("view", &self.view)
            .field("doc_ids", &self.doc_ids)
            .field("conflicts", &self.conflicts)
            .field("style", &self.style)
            .field("return_docs", &self.return_docs)
            .finish_non_exhaustive()
    }
}

/// How a subscription finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Complete,
    Cancelled,
}

/// Payload of the terminal `complete` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangesResult {
    pub status: CompletionStatus,
    pub results: Vec<Change>,
    pub last_seq: Sequence,
}

impl ChangesResult {
    pub fn complete(results: Vec<Change>, last_seq: Sequence) -> Self {
        Self {
            status: CompletionStatus::Complete,
            results,
            last_seq,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: CompletionStatus::Cancelled,
            results: Vec::new(),
            last_seq: Sequence::default(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == CompletionStatus::Cancelled
    }
}

/// Events emitted by a subscription.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeEvent {
    /// Every delivered record.
    Change(Change),
    /// First version of a new document.
    Create(Change),
    /// Any other non-deleted record.
    Update(Change),
    /// A deletion.
    Delete(Change),
    /// The feed has reached the sequence that was current when it started.
    UpToDate,
    /// Cancellation was requested.
    Cancel,
    /// Terminal: finished or cancelled.
    Complete(ChangesResult),
    /// Terminal: failed.
    Error(FeedError),
}

impl ChangeEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChangeEvent::Complete(_) | ChangeEvent::Error(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChangeEvent::Change(_) => "change",
            ChangeEvent::Create(_) => "create",
            ChangeEvent::Update(_) => "update",
            ChangeEvent::Delete(_) => "delete",
            ChangeEvent::UpToDate => "uptodate",
            ChangeEvent::Cancel => "cancel",
            ChangeEvent::Complete(_) => "complete",
            ChangeEvent::Error(_) => "error",
        }
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "changes-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_folds_into_continuous() {
        let mut options = ChangesOptions::default().live();
        assert!(options.is_continuous());
        options.normalize();
        assert_eq!(options.continuous, Some(true));

        // An explicit continuous wins over live.
        let mut options = ChangesOptions {
            live: Some(true),
            continuous: Some(false),
            ..Default::default()
        };
        options.normalize();
        assert!(!options.is_continuous());
    }

    #[test]
    fn test_raw_defaults() {
        let raw = ChangesOptions::default().to_raw(Sequence(4));
        assert_eq!(raw.since, Sequence(4));
        assert!(!raw.descending);
        assert!(!raw.continuous);
        assert_eq!(raw.limit, None);
    }

    #[test]
    fn test_limit_zero_means_one() {
        assert_eq!(ChangesOptions::default().limit(0).to_raw(Sequence(0)).limit, Some(1));
        assert_eq!(ChangesOptions::default().limit(1).to_raw(Sequence(0)).limit, Some(1));
        assert_eq!(ChangesOptions::default().limit(5).to_raw(Sequence(0)).limit, Some(5));
    }

    #[test]
    fn test_since_parsing() {
        assert_eq!("latest".parse::<Since>().unwrap(), Since::Latest);
        assert_eq!("12".parse::<Since>().unwrap(), Since::Seq(Sequence(12)));
        assert!("soon".parse::<Since>().is_err());
    }
}
