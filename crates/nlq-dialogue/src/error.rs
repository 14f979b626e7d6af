use nlq_context::ContextError;
use nlq_core::error::NlqError;
use nlq_recovery::RecoveryError;
use nlq_semantic::SemanticError;

use crate::types::Stage;

/// Errors raised while wiring or driving the orchestrator.
///
/// Turn failures never surface as this type; they become a `TurnResult`.
#[derive(Debug, thiserror::Error)]
pub enum DialogueError {
    #[error("invalid stage transition: {from} -> {to}")]
    InvalidTransition { from: Stage, to: Stage },
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("missing capability: {0}")]
    MissingCapability(&'static str),
    #[error("session registry error: {0}")]
    Storage(String),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Semantic(#[from] SemanticError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

impl From<DialogueError> for NlqError {
    fn from(err: DialogueError) -> Self {
        match err {
            DialogueError::SessionNotFound(id) => NlqError::SessionNotFound(id),
            DialogueError::InvalidInput(msg) => NlqError::Validation(msg),
            DialogueError::MissingCapability(name) => {
                NlqError::Config(format!("missing capability: {}", name))
            }
            DialogueError::Context(e) => e.into(),
            DialogueError::Semantic(e) => e.into(),
            DialogueError::Recovery(e) => e.into(),
            other => NlqError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DialogueError::MissingCapability("sql_executor");
        assert_eq!(err.to_string(), "missing capability: sql_executor");
    }

    #[test]
    fn test_into_nlq_error() {
        let err: NlqError = DialogueError::SessionNotFound("s9".into()).into();
        assert!(matches!(err, NlqError::SessionNotFound(ref id) if id == "s9"));

        let err: NlqError = DialogueError::InvalidInput("empty".into()).into();
        assert!(matches!(err, NlqError::Validation(_)));

        let err: NlqError = DialogueError::Semantic(SemanticError::InvalidBudget {
            total: 1,
            reserved: 2,
        })
        .into();
        assert!(matches!(err, NlqError::InvalidBudget { .. }));
    }
}
