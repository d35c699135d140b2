//! Error types for change-feed subscriptions.

use thiserror::Error;

/// Main error type for change-feed operations.
///
/// Cancellation is not represented here: a cancelled subscription completes
/// successfully with [`CompletionStatus::Cancelled`](crate::CompletionStatus).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FeedError {
    /// A required request parameter is missing or malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A referenced design document, filter or view is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// The change source or a store read failed. The message is passed
    /// through from the backend unchanged.
    #[error("{0}")]
    Backend(String),

    /// The owning database was destroyed while the subscription was active.
    #[error("database was destroyed")]
    StoreDestroyed,
}

impl FeedError {
    /// HTTP-style status code for this error.
    pub fn status(&self) -> u16 {
        match self {
            FeedError::BadRequest(_) => 400,
            FeedError::NotFound(_) => 404,
            FeedError::Backend(_) | FeedError::StoreDestroyed => 500,
        }
    }

    /// Stable machine-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            FeedError::BadRequest(_) => "bad_request",
            FeedError::NotFound(_) => "not_found",
            FeedError::Backend(_) => "backend_error",
            FeedError::StoreDestroyed => "destroyed",
        }
    }

    pub(crate) fn missing_key(key: &str) -> Self {
        FeedError::NotFound(format!("missing json key: {}", key))
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::BadRequest(format!("invalid predicate source: {}", e))
    }
}

/// Result type for change-feed operations.
pub type Result<T> = std::result::Result<T, FeedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_name() {
        let err = FeedError::missing_key("filters");
        assert_eq!(err.status(), 404);
        assert_eq!(err.name(), "not_found");
        assert_eq!(err.to_string(), "not found: missing json key: filters");

        let err = FeedError::BadRequest("nope".into());
        assert_eq!(err.status(), 400);
        assert_eq!(err.name(), "bad_request");
    }

    #[test]
    fn test_backend_message_passes_through() {
        let err = FeedError::Backend("connection reset".into());
        assert_eq!(err.to_string(), "connection reset");
        assert_eq!(err.status(), 500);
    }
}
