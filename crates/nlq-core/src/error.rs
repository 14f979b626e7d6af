use thiserror::Error;

/// Top-level error type for the nlq workspace.
///
/// Subsystem crates define their own error enums and convert into
/// `NlqError` where a failure has to cross a crate boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NlqError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid token budget: reserved {reserved} exceeds total {total}")]
    InvalidBudget { total: usize, reserved: usize },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<toml::de::Error> for NlqError {
    fn from(err: toml::de::Error) -> Self {
        NlqError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for NlqError {
    fn from(err: toml::ser::Error) -> Self {
        NlqError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for NlqError {
    fn from(err: serde_json::Error) -> Self {
        NlqError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for nlq operations.
pub type Result<T> = std::result::Result<T, NlqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NlqError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");
    }

    #[test]
    fn test_invalid_budget_display() {
        let err = NlqError::InvalidBudget {
            total: 100,
            reserved: 200,
        };
        assert_eq!(
            err.to_string(),
            "Invalid token budget: reserved 200 exceeds total 100"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: NlqError = io_err.into();
        assert!(matches!(err, NlqError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_toml_de() {
        let bad_toml = "invalid = [[[";
        let err: std::result::Result<toml::Value, _> = toml::from_str(bad_toml);
        let nlq_err: NlqError = err.unwrap_err().into();
        assert!(matches!(nlq_err, NlqError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let nlq_err: NlqError = err.unwrap_err().into();
        assert!(matches!(nlq_err, NlqError::Serialization(_)));
    }

    #[test]
    fn test_result_type_with_question_mark() {
        fn inner() -> Result<String> {
            let io_result: std::result::Result<i32, std::io::Error> = Ok(42);
            let value = io_result?;
            Ok(value.to_string())
        }

        assert_eq!(inner().unwrap(), "42");
    }

    #[test]
    fn test_session_not_found_preserves_id() {
        let err = NlqError::SessionNotFound("sess-42".to_string());
        assert_eq!(err.to_string(), "Session not found: sess-42");
    }
}
