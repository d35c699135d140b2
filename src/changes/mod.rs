//! Change-feed subscriptions.
//!
//! A subscription turns a [`ChangeSource`](crate::ChangeSource)'s raw log
//! into a stream of [`ChangeEvent`]s:
//! - `Change` for every record, plus one of `Create`, `Update` or `Delete`
//! - `UpToDate` once a live feed reaches the sequence current at its start
//! - exactly one terminal `Complete` or `Error`
//!
//! Subscriptions support:
//! - one-shot and live (continuous) feeds, `since: latest`
//! - named filters and views resolved from design documents
//! - cooperative cancellation before or after the feed has started
//!
//! # Example
//!
//! ```ignore
//! let db = Database::new(Arc::new(MemoryStore::new()), DatabaseConfig::default());
//!
//! let changes = db.changes(ChangesOptions::default().live().filter("app/onlyPosts"));
//! loop {
//!     match changes.recv() {
//!         Ok(ChangeEvent::Change(change)) => println!("{} at {}", change.id, change.seq),
//!         Ok(ChangeEvent::UpToDate) => println!("caught up"),
//!         Ok(event) if event.is_terminal() => break,
//!         Ok(_) => {}
//!         Err(_) => break,
//!     }
//! }
//! ```

pub(crate) mod controller;
mod emitter;
pub mod normalize;
pub(crate) mod registry;
mod types;

pub use controller::Changes;
pub use emitter::Listener;
pub use normalize::normalize_change;
pub use types::{
    ChangeCallback, ChangeEvent, ChangesOptions, ChangesResult, CompleteCallback,
    CompletionStatus, Since, SubscriptionId,
};
