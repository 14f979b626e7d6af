//! Per-session record of every SQL execution attempt.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use nlq_core::types::Timestamp;
use serde::Serialize;
use tracing::debug;

use crate::classifier::{RetryStrategy, SqlErrorKind};
use crate::error::RecoveryError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded {
        row_count: usize,
        execution_time_ms: u64,
    },
    Failed {
        error_type: SqlErrorKind,
        retry_strategy: RetryStrategy,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryAttempt {
    /// 1-based position in the session's history.
    pub attempt: u32,
    pub sql: String,
    pub outcome: AttemptOutcome,
    /// Regeneration attempts already used when this one ran.
    pub retry_count: u32,
    /// Backoff re-executions already used when this one ran.
    pub backoff_attempts: u32,
    pub timestamp: Timestamp,
}

impl RetryAttempt {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Succeeded { .. })
    }
}

#[derive(Debug, Default)]
pub struct RetryLedger {
    attempts: Mutex<HashMap<String, Vec<RetryAttempt>>>,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        session_id: &str,
        sql: &str,
        outcome: AttemptOutcome,
        retry_count: u32,
        backoff_attempts: u32,
    ) -> Result<RetryAttempt, RecoveryError> {
        let mut map = self.lock()?;
        let history = map.entry(session_id.to_string()).or_default();
        let attempt = RetryAttempt {
            attempt: history.len() as u32 + 1,
            sql: sql.to_string(),
            outcome,
            retry_count,
            backoff_attempts,
            timestamp: Timestamp::now(),
        };
        debug!(session_id, attempt = attempt.attempt, ok = attempt.succeeded(), "execution attempt recorded");
        history.push(attempt.clone());
        Ok(attempt)
    }

    /// All attempts of a session, oldest first. Empty if none were made.
    pub fn history(&self, session_id: &str) -> Result<Vec<RetryAttempt>, RecoveryError> {
        Ok(self.lock()?.get(session_id).cloned().unwrap_or_default())
    }

    pub fn clear(&self, session_id: &str) -> bool {
        match self.lock() {
            Ok(mut map) => map.remove(session_id).is_some(),
            Err(_) => false,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<RetryAttempt>>>, RecoveryError> {
        self.attempts
            .lock()
            .map_err(|e| RecoveryError::Storage(format!("ledger lock poisoned: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> AttemptOutcome {
        AttemptOutcome::Failed {
            error_type: SqlErrorKind::SyntaxError,
            retry_strategy: RetryStrategy::RegenerateSql,
            message: "syntax error".into(),
        }
    }

    #[test]
    fn test_record_numbers_attempts() {
        let ledger = RetryLedger::new();
        ledger.record("s1", "SELEC 1", failed(), 0, 0).unwrap();
        let second = ledger
            .record(
                "s1",
                "SELECT 1",
                AttemptOutcome::Succeeded {
                    row_count: 1,
                    execution_time_ms: 2,
                },
                1,
                0,
            )
            .unwrap();
        assert_eq!(second.attempt, 2);
        assert!(second.succeeded());

        let history = ledger.history("s1").unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].succeeded());
    }

    #[test]
    fn test_sessions_are_separate() {
        let ledger = RetryLedger::new();
        ledger.record("a", "SELECT 1", failed(), 0, 0).unwrap();
        assert!(ledger.history("b").unwrap().is_empty());
        assert_eq!(ledger.history("a").unwrap().len(), 1);
    }

    #[test]
    fn test_clear() {
        let ledger = RetryLedger::new();
        ledger.record("a", "SELECT 1", failed(), 0, 0).unwrap();
        assert!(ledger.clear("a"));
        assert!(!ledger.clear("a"));
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let value = serde_json::to_value(failed()).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error_type"], "syntax_error");
    }
}
