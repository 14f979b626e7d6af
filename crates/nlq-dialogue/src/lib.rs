//! Multi-turn natural-language-to-SQL dialogue orchestration.
//!
//! A per-session stage machine sequences intent recognition, table
//! selection, clarification, SQL generation and execution, analysis and
//! presentation. External capabilities (models, the database) are reached
//! through the traits in [`capabilities`]; everything the stages need is
//! held by one [`OrchestratorContext`].

pub mod capabilities;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod state_machine;
pub mod types;

pub use capabilities::{
    Analysis, Analyzer, CapabilityError, GeneratedSql, IntentClassifier, IntentDecision,
    KeywordIntentClassifier, SqlExecutor, SqlGenerator, TableCandidate, TableSelector,
};
pub use context::{OrchestratorContext, OrchestratorContextBuilder};
pub use error::DialogueError;
pub use orchestrator::DialogueOrchestrator;
pub use state_machine::validate_transition;
pub use types::{
    Intent, PendingClarification, Session, SessionSnapshot, Stage, StartRequest, TurnError,
    TurnErrorKind, TurnResult,
};
