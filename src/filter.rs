//! Filter predicates and resolution of named filters and views.
//!
//! A named filter `"ddoc/name"` refers to `filters.name` inside the design
//! document `_design/ddoc`; the `_view` filter refers to
//! `views.<name>.map` through the separate `view` option. Either is fetched,
//! compiled by a [`PredicateCompiler`] and installed as an inline predicate.

use crate::error::{FeedError, Result};
use crate::source::ChangeSource;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Request context passed to predicates alongside each document.
#[derive(Clone, Debug, Default)]
pub struct FilterContext {
    pub query: Map<String, Value>,
}

/// A compiled filter: `(document, context) -> keep?`.
pub type Predicate = Arc<dyn Fn(&Value, &FilterContext) -> bool + Send + Sync>;

/// Emission primitive handed to map functions: `emit(key, value)`.
pub type Emit<'a> = dyn FnMut(Value, Value) + 'a;

/// A compiled view map function.
pub type MapFunction = Arc<dyn Fn(&Value, &mut Emit<'_>) + Send + Sync>;

/// Which records a subscription wants.
#[derive(Clone, Default)]
pub enum ChangesFilter {
    #[default]
    None,
    /// `"ddoc/name"` filter stored in a design document.
    Named(String),
    /// A view map function used as a filter; the view comes from the `view` option.
    View,
    /// A ready-to-call predicate.
    Inline(Predicate),
}

impl ChangesFilter {
    /// Parse a filter name. `"_view"` selects view filtering.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        if name == "_view" {
            ChangesFilter::View
        } else {
            ChangesFilter::Named(name)
        }
    }

    pub fn inline(
        predicate: impl Fn(&Value, &FilterContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        ChangesFilter::Inline(Arc::new(predicate))
    }

    /// True for filters that must be resolved from a design document.
    pub fn is_named(&self) -> bool {
        matches!(self, ChangesFilter::Named(_) | ChangesFilter::View)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ChangesFilter::None)
    }

    /// Evaluate against a document. Unresolved named filters never match.
    pub fn matches(&self, doc: &Value, ctx: &FilterContext) -> bool {
        match self {
            ChangesFilter::None => true,
            ChangesFilter::Inline(predicate) => predicate(doc, ctx),
            ChangesFilter::Named(_) | ChangesFilter::View => false,
        }
    }
}

impl fmt::Debug for ChangesFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangesFilter::None => f.write_str("None"),
            ChangesFilter::Named(name) => f.debug_tuple("Named").field(name).finish(),
            ChangesFilter::View => f.write_str("View"),
            ChangesFilter::Inline(_) => f.write_str("Inline(..)"),
        }
    }
}

/// Turns stored source text into callables.
///
/// Implementations must evaluate untrusted text in a restricted
/// environment; see [`SelectorCompiler`](crate::selector::SelectorCompiler).
pub trait PredicateCompiler: Send + Sync {
    fn compile_filter(&self, source: &str) -> Result<Predicate>;
    fn compile_map(&self, source: &str) -> Result<MapFunction>;
}

/// Wrap a map function into a predicate that keeps a document iff the map
/// function emitted at least once for it. Emitted values are discarded.
pub fn view_predicate(map: MapFunction) -> Predicate {
    Arc::new(move |doc: &Value, _ctx: &FilterContext| {
        let mut emitted = false;
        map(doc, &mut |_key: Value, _value: Value| emitted = true);
        emitted
    })
}

/// Outcome of resolving a named filter.
pub enum Resolution {
    Resolved(Predicate),
    /// The subscription was cancelled while the design document was fetched.
    Cancelled,
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Resolved(_) => f.write_str("Resolved(..)"),
            Resolution::Cancelled => f.write_str("Cancelled"),
        }
    }
}

/// Resolves named filters and views against a source's design documents.
pub struct PredicateResolver<'a> {
    source: &'a dyn ChangeSource,
    compiler: &'a dyn PredicateCompiler,
}

impl<'a> PredicateResolver<'a> {
    pub fn new(source: &'a dyn ChangeSource, compiler: &'a dyn PredicateCompiler) -> Self {
        Self { source, compiler }
    }

    /// Resolve `filter` into a predicate.
    ///
    /// `is_cancelled` is consulted once the design document read returns;
    /// a cancellation observed there wins over both success and failure.
    pub fn resolve(
        &self,
        filter: &ChangesFilter,
        view: Option<&str>,
        is_cancelled: impl Fn() -> bool,
    ) -> Result<Resolution> {
        match filter {
            ChangesFilter::Named(name) => {
                let (ddoc_name, filter_name) = split_reference(name, "filter")?;
                let ddoc = match self.fetch_design_doc(ddoc_name, &is_cancelled)? {
                    Some(ddoc) => ddoc,
                    None => return Ok(Resolution::Cancelled),
                };
                let source = lookup(&ddoc, "filters", filter_name)?;
                let predicate = self.compiler.compile_filter(&source_text(source))?;
                tracing::debug!(filter = %name, "resolved named filter");
                Ok(Resolution::Resolved(predicate))
            }
            ChangesFilter::View => {
                let view = match view {
                    Some(view) if !view.is_empty() => view,
                    _ => {
                        return Err(FeedError::BadRequest(
                            "`view` filter parameter is not provided.".to_string(),
                        ))
                    }
                };
                let (ddoc_name, view_name) = split_reference(view, "view")?;
                let ddoc = match self.fetch_design_doc(ddoc_name, &is_cancelled)? {
                    Some(ddoc) => ddoc,
                    None => return Ok(Resolution::Cancelled),
                };
                let definition = lookup(&ddoc, "views", view_name)?;
                let map_source = definition
                    .get("map")
                    .ok_or_else(|| FeedError::missing_key("map"))?;
                let map = self.compiler.compile_map(&source_text(map_source))?;
                tracing::debug!(view = %view, "resolved view filter");
                Ok(Resolution::Resolved(view_predicate(map)))
            }
            ChangesFilter::Inline(predicate) => Ok(Resolution::Resolved(Arc::clone(predicate))),
            ChangesFilter::None => Ok(Resolution::Resolved(Arc::new(
                |_: &Value, _: &FilterContext| true,
            ))),
        }
    }

    /// `Ok(None)` means the subscription was cancelled during the read.
    fn fetch_design_doc(
        &self,
        name: &str,
        is_cancelled: &impl Fn() -> bool,
    ) -> Result<Option<Value>> {
        let fetched = self.source.get_document(&format!("_design/{}", name));
        if is_cancelled() {
            return Ok(None);
        }
        fetched.map(Some)
    }
}

/// Split `"ddoc/name"` into its two parts.
fn split_reference<'n>(reference: &'n str, what: &str) -> Result<(&'n str, &'n str)> {
    let mut parts = reference.split('/');
    match (parts.next(), parts.next()) {
        (Some(ddoc), Some(name)) if !ddoc.is_empty() && !name.is_empty() => Ok((ddoc, name)),
        _ => Err(FeedError::BadRequest(format!(
            "{} must be of the form \"ddoc/name\", got {:?}",
            what, reference
        ))),
    }
}

fn lookup<'d>(ddoc: &'d Value, section: &str, name: &str) -> Result<&'d Value> {
    let entries = ddoc
        .get(section)
        .and_then(Value::as_object)
        .ok_or_else(|| FeedError::missing_key(section))?;
    entries.get(name).ok_or_else(|| FeedError::missing_key(name))
}

fn source_text(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(text) => Cow::Borrowed(text),
        other => Cow::Owned(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_named_parses_view_sentinel() {
        assert!(matches!(ChangesFilter::named("_view"), ChangesFilter::View));
        assert!(matches!(ChangesFilter::named("a/b"), ChangesFilter::Named(ref n) if n == "a/b"));
        assert!(ChangesFilter::named("a/b").is_named());
        assert!(!ChangesFilter::default().is_named());
    }

    #[test]
    fn test_view_predicate_tracks_emission() {
        let map: MapFunction = Arc::new(|doc: &Value, emit: &mut Emit<'_>| {
            if doc["kind"] == "post" {
                emit(doc["_id"].clone(), json!({"ignored": true}));
                emit(doc["_id"].clone(), Value::Null);
            }
        });
        let predicate = view_predicate(map);
        let ctx = FilterContext::default();

        assert!(predicate(&json!({"_id": "a", "kind": "post"}), &ctx));
        assert!(!predicate(&json!({"_id": "b", "kind": "comment"}), &ctx));
    }

    #[test]
    fn test_split_reference() {
        assert_eq!(split_reference("authors/byName", "filter").unwrap(), ("authors", "byName"));
        assert!(matches!(split_reference("authors", "filter"), Err(FeedError::BadRequest(_))));
        assert!(matches!(split_reference("authors/", "filter"), Err(FeedError::BadRequest(_))));
    }

    #[test]
    fn test_lookup_distinguishes_section_and_name() {
        let no_section = json!({"_id": "_design/authors"});
        assert_eq!(
            lookup(&no_section, "filters", "byName").unwrap_err(),
            FeedError::NotFound("missing json key: filters".into())
        );

        let no_name = json!({"_id": "_design/authors", "filters": {"other": "{}"}});
        assert_eq!(
            lookup(&no_name, "filters", "byName").unwrap_err(),
            FeedError::NotFound("missing json key: byName".into())
        );
    }

    #[test]
    fn test_source_text_accepts_objects() {
        assert_eq!(source_text(&json!("{\"a\":1}")), "{\"a\":1}");
        assert_eq!(source_text(&json!({"a": 1})), "{\"a\":1}");
    }
}
