use nlq_core::error::NlqError;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("retry ledger error: {0}")]
    Storage(String),
}

impl From<RecoveryError> for NlqError {
    fn from(err: RecoveryError) -> Self {
        NlqError::Storage(err.to_string())
    }
}
