//! Session state and turn results.

use std::fmt;

use nlq_core::types::{QueryResult, Timestamp};
use nlq_recovery::SqlErrorKind;
use serde::{Deserialize, Serialize};

// =============================================================================
// Stage
// =============================================================================

/// Stages of a turn, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    IntentRecognition,
    TableSelection,
    IntentClarification,
    SqlGeneration,
    SqlExecution,
    DataAnalysis,
    ResultPresentation,
    ErrorHandling,
    Completed,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::IntentRecognition,
        Stage::TableSelection,
        Stage::IntentClarification,
        Stage::SqlGeneration,
        Stage::SqlExecution,
        Stage::DataAnalysis,
        Stage::ResultPresentation,
        Stage::ErrorHandling,
        Stage::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::IntentRecognition => "intent_recognition",
            Stage::TableSelection => "table_selection",
            Stage::IntentClarification => "intent_clarification",
            Stage::SqlGeneration => "sql_generation",
            Stage::SqlExecution => "sql_execution",
            Stage::DataAnalysis => "data_analysis",
            Stage::ResultPresentation => "result_presentation",
            Stage::ErrorHandling => "error_handling",
            Stage::Completed => "completed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("Unknown stage: {}", s))
    }
}

// =============================================================================
// Intent
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Generate and execute SQL.
    SmartQuery,
    ReportGeneration,
    /// Answer from the previous result without new SQL.
    DataFollowup,
    /// The user is answering a pending clarification question.
    Clarification,
    /// Low confidence; degrades to a clarification prompt.
    Unknown,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::SmartQuery => write!(f, "smart_query"),
            Intent::ReportGeneration => write!(f, "report_generation"),
            Intent::DataFollowup => write!(f, "data_followup"),
            Intent::Clarification => write!(f, "clarification"),
            Intent::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for Intent {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "smart_query" => Ok(Intent::SmartQuery),
            "report_generation" => Ok(Intent::ReportGeneration),
            "data_followup" => Ok(Intent::DataFollowup),
            "clarification" => Ok(Intent::Clarification),
            "unknown" => Ok(Intent::Unknown),
            _ => Err(format!("Unknown intent: {}", s)),
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// What a pending clarification question was asked for.
///
/// Decides which stage the user's reply resumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingClarification {
    /// Intent was unclear; the reply re-runs intent recognition.
    Intent { question: String },
    /// No table qualified; the reply re-runs table selection.
    Tables { question: String },
    /// Execution hit a missing table; the reply goes to generation along
    /// with the stored feedback.
    SqlError { question: String, feedback: String },
}

impl PendingClarification {
    pub fn question(&self) -> &str {
        match self {
            PendingClarification::Intent { question }
            | PendingClarification::Tables { question }
            | PendingClarification::SqlError { question, .. } => question,
        }
    }
}

/// One conversation. Mutated only by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub data_source_id: Option<String>,
    /// Question the current turn is answering.
    pub question: String,
    pub stage: Stage,
    pub intent: Intent,
    pub selected_tables: Vec<String>,
    pub join_hints: Vec<String>,
    pub generated_sql: Option<String>,
    /// Failures over the session's lifetime.
    pub error_count: u32,
    /// Regeneration attempts this turn; reset by a successful execution.
    pub retry_count: u32,
    /// Same-SQL re-executions after connection failures this turn.
    pub backoff_attempts: u32,
    /// Timeout retries of the model-side capabilities (intent, tables,
    /// generation, analysis) this turn. Kept apart from `backoff_attempts`
    /// so a slow generator cannot use up the execution retries.
    #[serde(default)]
    pub capability_backoffs: u32,
    pub previous_result: Option<QueryResult>,
    pub intent_history: Vec<Intent>,
    /// Corrective feedback for the next generation.
    pub pending_feedback: Option<String>,
    pub pending_clarification: Option<PendingClarification>,
    pub last_error: Option<TurnError>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Session {
    pub fn new(session_id: &str, question: &str, data_source_id: Option<&str>) -> Self {
        let now = Timestamp::now();
        Self {
            session_id: session_id.to_string(),
            data_source_id: data_source_id.map(str::to_string),
            question: question.to_string(),
            stage: Stage::IntentRecognition,
            intent: Intent::Unknown,
            selected_tables: Vec::new(),
            join_hints: Vec::new(),
            generated_sql: None,
            error_count: 0,
            retry_count: 0,
            backoff_attempts: 0,
            capability_backoffs: 0,
            previous_result: None,
            intent_history: Vec::new(),
            pending_feedback: None,
            pending_clarification: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Clear per-turn state for a new question. Conversation-level state
    /// (previous result, intent history, error count) is kept, and so is the
    /// stage: moving back to intent recognition is the orchestrator's job.
    pub fn reset_for_question(&mut self, question: &str) {
        self.question = question.to_string();
        self.intent = Intent::Unknown;
        self.selected_tables.clear();
        self.join_hints.clear();
        self.retry_count = 0;
        self.backoff_attempts = 0;
        self.capability_backoffs = 0;
        self.pending_feedback = None;
        self.pending_clarification = None;
        self.last_error = None;
        self.updated_at = Timestamp::now();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            data_source_id: self.data_source_id.clone(),
            question: self.question.clone(),
            stage: self.stage,
            intent: self.intent,
            selected_tables: self.selected_tables.clone(),
            generated_sql: self.generated_sql.clone(),
            error_count: self.error_count,
            retry_count: self.retry_count,
            has_previous_result: self.previous_result.is_some(),
            awaiting_clarification: self.pending_clarification.is_some(),
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub data_source_id: Option<String>,
    pub question: String,
    pub stage: Stage,
    pub intent: Intent,
    pub selected_tables: Vec<String>,
    pub generated_sql: Option<String>,
    pub error_count: u32,
    pub retry_count: u32,
    pub has_previous_result: bool,
    pub awaiting_clarification: bool,
    pub last_error: Option<TurnError>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

// =============================================================================
// Turn results
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnErrorKind {
    /// SQL execution failed; see `sql_error`.
    SqlError,
    CapabilityFailed,
    Timeout,
    InvalidInput,
    SessionNotFound,
    /// The operation does not apply to the session's current stage.
    InvalidState,
    StepLimit,
    Internal,
}

impl fmt::Display for TurnErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnErrorKind::SqlError => "sql_error",
            TurnErrorKind::CapabilityFailed => "capability_failed",
            TurnErrorKind::Timeout => "timeout",
            TurnErrorKind::InvalidInput => "invalid_input",
            TurnErrorKind::SessionNotFound => "session_not_found",
            TurnErrorKind::InvalidState => "invalid_state",
            TurnErrorKind::StepLimit => "step_limit",
            TurnErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// User-visible failure of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnError {
    pub kind: TurnErrorKind,
    /// Classified SQL error, for execution failures.
    pub sql_error: Option<SqlErrorKind>,
    pub message: String,
    /// Last attempted SQL, if any.
    pub sql: Option<String>,
    /// Stage that failed.
    pub stage: Stage,
}

/// Outcome of one `start`, `continue` or retry call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnResult {
    pub session_id: String,
    pub success: bool,
    pub stage: Stage,
    pub intent: Intent,
    pub tables: Vec<String>,
    pub sql: Option<String>,
    pub result: Option<QueryResult>,
    pub analysis: Option<String>,
    pub needs_clarification: bool,
    pub clarification_question: Option<String>,
    pub retry_available: bool,
    pub error: Option<TurnError>,
}

impl TurnResult {
    /// Failure that did not touch any session state.
    pub fn rejected(session_id: &str, stage: Stage, intent: Intent, error: TurnError) -> Self {
        Self {
            session_id: session_id.to_string(),
            success: false,
            stage,
            intent,
            tables: Vec::new(),
            sql: error.sql.clone(),
            result: None,
            analysis: None,
            needs_clarification: false,
            clarification_question: None,
            retry_available: false,
            error: Some(error),
        }
    }
}

/// One entry of a bulk start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    pub session_id: Option<String>,
    pub question: String,
    pub data_source_id: Option<String>,
}

impl StartRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            session_id: None,
            question: question.into(),
            data_source_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_data_source(mut self, data_source_id: impl Into<String>) -> Self {
        self.data_source_id = Some(data_source_id.into());
        self
    }
}
