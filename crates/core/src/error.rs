//! Store error model.

use thiserror::Error;

/// Result type used across the message store.
pub type StoreResult<T> = Result<T, StoreError>;

/// Message store error.
///
/// "Not found" and "transition conflict" are deliberately absent: a lookup
/// miss is `Ok(None)` and a transition that touched no row is `Ok(false)`.
///
/// ## Error Categories
///
/// - **Validation**: the caller handed in a malformed record or an illegal
///   transition. Not retried.
/// - **Unavailable**: transient infrastructure failure (timeout, connection
///   loss, pool exhaustion). The caller should back off and retry the whole
///   operation.
/// - **Corrupted**: a stored row could not be decoded into a record.
/// - **Storage**: any other backend failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("corrupted record: {0}")]
    Corrupted(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}
