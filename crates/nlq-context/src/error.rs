//! Error types for the context store.

use nlq_core::error::NlqError;

/// Errors from transcript storage and summarization.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("transcript not found for session: {0}")]
    SessionNotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("summarization failed: {0}")]
    Summarization(String),
}

impl From<ContextError> for NlqError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::SessionNotFound(id) => NlqError::SessionNotFound(id),
            other => NlqError::Storage(other.to_string()),
        }
    }
}
