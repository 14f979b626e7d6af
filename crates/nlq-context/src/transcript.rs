//! Transcript message shapes.
//!
//! Remote messages are plain text tagged with the kind of turn they record.
//! Local messages additionally carry a typed payload with the full data.

use std::collections::BTreeSet;

use nlq_core::types::{QueryResult, Role, Timestamp};
use serde::{Deserialize, Serialize};

/// Kind of turn a message records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    User,
    Sql,
    Analysis,
    Clarification,
    Summary,
}

/// Entry of the remote-safe transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: Timestamp,
    pub kind: TurnKind,
}

/// An executed statement with its full result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlTurn {
    pub sql: String,
    pub result: QueryResult,
}

/// Analysis text plus any structured data the analyzer produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisTurn {
    pub text: String,
    pub data: Option<serde_json::Value>,
}

/// A question put back to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationTurn {
    pub question: String,
}

/// Typed payload of a local message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocalPayload {
    Text,
    Sql(SqlTurn),
    Analysis(AnalysisTurn),
    Clarification(ClarificationTurn),
}

/// Entry of the local-full transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: Timestamp,
    pub payload: LocalPayload,
}

impl LocalMessage {
    /// Full result of an SQL turn, if this is one.
    pub fn sql_result(&self) -> Option<&QueryResult> {
        match &self.payload {
            LocalPayload::Sql(turn) => Some(&turn.result),
            _ => None,
        }
    }
}

/// Both transcripts of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DualTranscript {
    pub session_id: String,
    pub remote_messages: Vec<RemoteMessage>,
    pub local_messages: Vec<LocalMessage>,
    /// Token cost of `remote_messages`.
    pub total_tokens: usize,
    /// Token cost of `local_messages`, never sent anywhere.
    pub local_tokens: usize,
    /// How many times the remote transcript has been summarized.
    pub summaries_applied: u32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Cell values seen in local results; scrubbed from remote text.
    #[serde(skip)]
    pub(crate) sensitive_values: BTreeSet<String>,
}

impl DualTranscript {
    pub fn new(session_id: &str) -> Self {
        let now = Timestamp::now();
        Self {
            session_id: session_id.to_string(),
            remote_messages: Vec::new(),
            local_messages: Vec::new(),
            total_tokens: 0,
            local_tokens: 0,
            summaries_applied: 0,
            created_at: now,
            updated_at: now,
            sensitive_values: BTreeSet::new(),
        }
    }

    /// Most recent full query result in the local transcript.
    pub fn last_result(&self) -> Option<&QueryResult> {
        self.local_messages.iter().rev().find_map(|m| m.sql_result())
    }
}
