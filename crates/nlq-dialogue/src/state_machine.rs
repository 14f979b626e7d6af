//! Stage transitions with validation.
//!
//! Pipeline: IntentRecognition -> TableSelection -> SqlGeneration ->
//! SqlExecution -> DataAnalysis -> ResultPresentation -> Completed, with
//! IntentClarification and ErrorHandling as detours.

use crate::error::DialogueError;
use crate::types::Stage;

/// Validate that a stage transition is allowed.
///
/// Valid transitions:
/// - IntentRecognition -> TableSelection | IntentClarification | DataAnalysis
/// - TableSelection -> IntentClarification | SqlGeneration
/// - IntentClarification -> IntentRecognition | TableSelection | SqlGeneration
/// - SqlGeneration -> SqlExecution
/// - SqlExecution -> DataAnalysis | SqlGeneration (regenerate) | IntentClarification
/// - DataAnalysis -> ResultPresentation
/// - ResultPresentation -> Completed
/// - ErrorHandling -> SqlGeneration | Completed
/// - Completed -> IntentRecognition (new question)
/// - any non-terminal stage -> ErrorHandling
pub fn validate_transition(from: Stage, to: Stage) -> Result<(), DialogueError> {
    let valid = matches!(
        (from, to),
        (Stage::IntentRecognition, Stage::TableSelection)
            | (Stage::IntentRecognition, Stage::IntentClarification)
            | (Stage::IntentRecognition, Stage::DataAnalysis)
            | (Stage::TableSelection, Stage::IntentClarification)
            | (Stage::TableSelection, Stage::SqlGeneration)
            | (Stage::IntentClarification, Stage::IntentRecognition)
            | (Stage::IntentClarification, Stage::TableSelection)
            | (Stage::IntentClarification, Stage::SqlGeneration)
            | (Stage::SqlGeneration, Stage::SqlExecution)
            | (Stage::SqlExecution, Stage::DataAnalysis)
            | (Stage::SqlExecution, Stage::SqlGeneration)
            | (Stage::SqlExecution, Stage::IntentClarification)
            | (Stage::DataAnalysis, Stage::ResultPresentation)
            | (Stage::ResultPresentation, Stage::Completed)
            | (Stage::ErrorHandling, Stage::SqlGeneration)
            | (Stage::ErrorHandling, Stage::Completed)
            | (Stage::Completed, Stage::IntentRecognition)
    ) || (to == Stage::ErrorHandling && !matches!(from, Stage::ErrorHandling | Stage::Completed));

    if valid {
        Ok(())
    } else {
        Err(DialogueError::InvalidTransition { from, to })
    }
}

/// Stages at which a turn waits for the user.
pub fn awaits_user(stage: Stage) -> bool {
    matches!(
        stage,
        Stage::IntentClarification | Stage::ErrorHandling | Stage::Completed
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // =====================================================================
    // Valid transitions
    // =====================================================================

    #[test]
    fn test_happy_path() {
        let path = [
            Stage::IntentRecognition,
            Stage::TableSelection,
            Stage::SqlGeneration,
            Stage::SqlExecution,
            Stage::DataAnalysis,
            Stage::ResultPresentation,
            Stage::Completed,
            Stage::IntentRecognition,
        ];
        for pair in path.windows(2) {
            assert!(
                validate_transition(pair[0], pair[1]).is_ok(),
                "{} -> {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_error_handling_reachable_from_every_active_stage() {
        for from in Stage::ALL {
            let expected = !matches!(from, Stage::ErrorHandling | Stage::Completed);
            assert_eq!(
                validate_transition(from, Stage::ErrorHandling).is_ok(),
                expected,
                "{from}"
            );
        }
    }

    #[test]
    fn test_error_handling_exits() {
        assert!(validate_transition(Stage::ErrorHandling, Stage::SqlGeneration).is_ok());
        assert!(validate_transition(Stage::ErrorHandling, Stage::Completed).is_ok());
        assert!(validate_transition(Stage::ErrorHandling, Stage::SqlExecution).is_err());
        assert!(validate_transition(Stage::ErrorHandling, Stage::IntentRecognition).is_err());
    }

    #[test]
    fn test_retry_and_clarify_loops() {
        assert!(validate_transition(Stage::SqlExecution, Stage::SqlGeneration).is_ok());
        assert!(validate_transition(Stage::SqlExecution, Stage::IntentClarification).is_ok());
        assert!(validate_transition(Stage::IntentClarification, Stage::SqlGeneration).is_ok());
        assert!(validate_transition(Stage::IntentClarification, Stage::TableSelection).is_ok());
    }

    #[test]
    fn test_followup_skips_sql() {
        assert!(validate_transition(Stage::IntentRecognition, Stage::DataAnalysis).is_ok());
    }

    // =====================================================================
    // Invalid transitions
    // =====================================================================

    #[test]
    fn test_completed_only_restarts() {
        for to in Stage::ALL {
            let ok = validate_transition(Stage::Completed, to).is_ok();
            assert_eq!(ok, to == Stage::IntentRecognition, "completed -> {to}");
        }
    }

    #[test]
    fn test_no_skipping_execution() {
        assert!(validate_transition(Stage::SqlGeneration, Stage::DataAnalysis).is_err());
        assert!(validate_transition(Stage::TableSelection, Stage::SqlExecution).is_err());
        assert!(validate_transition(Stage::IntentRecognition, Stage::Completed).is_err());
    }

    #[test]
    fn test_self_transitions_invalid() {
        for stage in Stage::ALL {
            assert!(validate_transition(stage, stage).is_err(), "{stage}");
        }
    }

    #[test]
    fn test_invalid_transition_error_names_stages() {
        let err = validate_transition(Stage::DataAnalysis, Stage::SqlGeneration).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid stage transition: data_analysis -> sql_generation"
        );
    }

    #[test]
    fn test_awaits_user() {
        assert!(awaits_user(Stage::IntentClarification));
        assert!(awaits_user(Stage::Completed));
        assert!(!awaits_user(Stage::SqlExecution));
    }
}
