//! Error types for semantic context assembly.

use nlq_core::error::NlqError;

#[derive(Debug, thiserror::Error)]
pub enum SemanticError {
    #[error("invalid token budget: reserved {reserved} exceeds total {total}")]
    InvalidBudget { total: usize, reserved: usize },
    #[error("unknown module: {0}")]
    UnknownModule(String),
    #[error("unknown priority: {0}")]
    UnknownPriority(String),
    #[error("provider {module} failed: {message}")]
    Provider { module: String, message: String },
}

impl From<SemanticError> for NlqError {
    fn from(err: SemanticError) -> Self {
        match err {
            SemanticError::InvalidBudget { total, reserved } => {
                NlqError::InvalidBudget { total, reserved }
            }
            other => NlqError::Config(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SemanticError::Provider {
            module: "dictionary".to_string(),
            message: "timed out".to_string(),
        };
        assert_eq!(err.to_string(), "provider dictionary failed: timed out");
    }

    #[test]
    fn test_invalid_budget_converts() {
        let err: NlqError = SemanticError::InvalidBudget {
            total: 10,
            reserved: 20,
        }
        .into();
        assert!(matches!(
            err,
            NlqError::InvalidBudget {
                total: 10,
                reserved: 20
            }
        ));
    }
}
