//! # Changefeed
//!
//! Cancellable change-feed subscriptions over a store's raw change log.
//!
//! ## Core Concepts
//!
//! - **Change sources**: Stores exposing a raw, possibly infinite log of
//!   document revisions ([`ChangeSource`])
//! - **Subscriptions**: One-shot or live feeds of normalized [`Change`]s with
//!   a single terminal outcome ([`Changes`])
//! - **Filters**: Inline predicates, or named filters and views stored in
//!   design documents and compiled by a sandboxed [`PredicateCompiler`]
//! - **Readiness**: Requests made before the store is ready are queued
//!
//! ## Example
//!
//! ```ignore
//! use changefeed::{ChangesOptions, Database, DatabaseConfig, MemoryStore};
//!
//! let store = Arc::new(MemoryStore::new());
//! store.put(json!({"_id": "a", "type": "post"}))?;
//!
//! let db = Database::new(store, DatabaseConfig::default());
//! let result = db.changes(ChangesOptions::default().since(0)).wait()?;
//! assert_eq!(result.results.len(), 1);
//! ```

pub mod changes;
pub mod database;
pub mod error;
pub mod filter;
pub mod memory;
pub mod revs;
pub mod selector;
pub mod source;
pub mod taskqueue;
pub mod types;

// Re-exports
pub use changes::{
    normalize_change, ChangeEvent, Changes, ChangesOptions, ChangesResult, CompletionStatus,
    Since, SubscriptionId,
};
pub use database::{Database, DatabaseConfig};
pub use error::{FeedError, Result};
pub use filter::{
    ChangesFilter, Emit, FilterContext, MapFunction, Predicate, PredicateCompiler,
    PredicateResolver, Resolution,
};
pub use memory::MemoryStore;
pub use selector::{Selector, SelectorCompiler};
pub use source::{Canceller, ChangeSource, RawChangesOptions, RawEvent, RawFeed, RevisionOps};
pub use taskqueue::TaskQueue;
pub use types::*;
