//! Per-session dual-transcript storage with token accounting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use nlq_core::config::{BudgetProfile, ContextConfig};
use nlq_core::tokens::TokenCounter;
use nlq_core::types::{QueryResult, Role, Timestamp};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::ContextError;
use crate::redaction::{RedactionDecision, RedactionGate};
use crate::summarizer::TranscriptSummarizer;
use crate::transcript::{
    AnalysisTurn, ClarificationTurn, DualTranscript, LocalMessage, LocalPayload, RemoteMessage,
    SqlTurn, TurnKind,
};

/// Effect of one summarization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SummaryOutcome {
    pub messages_before: usize,
    pub messages_after: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// Owns the dual transcripts of every session.
pub struct ContextStore {
    transcripts: Mutex<HashMap<String, DualTranscript>>,
    counter: Arc<dyn TokenCounter>,
    gate: RedactionGate,
}

impl ContextStore {
    pub fn new(counter: Arc<dyn TokenCounter>, config: &ContextConfig) -> Self {
        Self {
            transcripts: Mutex::new(HashMap::new()),
            counter,
            gate: RedactionGate::new(config.min_redaction_len),
        }
    }

    /// Record a user utterance in both transcripts.
    pub fn add_user_message(&self, session_id: &str, text: &str) -> Result<(), ContextError> {
        let mut map = self.lock()?;
        let t = map
            .entry(session_id.to_string())
            .or_insert_with(|| DualTranscript::new(session_id));
        self.push(
            t,
            Role::User,
            text.to_string(),
            TurnKind::User,
            text.to_string(),
            LocalPayload::Text,
        );
        Ok(())
    }

    /// Record an executed statement.
    ///
    /// The remote entry holds only the SQL text and a status line; the full
    /// result goes to the local entry.
    pub fn add_sql_response(
        &self,
        session_id: &str,
        sql: &str,
        result: &QueryResult,
    ) -> Result<(), ContextError> {
        let mut map = self.lock()?;
        let t = map
            .entry(session_id.to_string())
            .or_insert_with(|| DualTranscript::new(session_id));

        for cell in result.cell_texts() {
            if self.gate.tracks(&cell) {
                t.sensitive_values.insert(cell.trim().to_string());
            }
        }

        let status = result.status_line();
        let remote = format!("{}\n-- {}", sql.trim(), status);
        let payload = LocalPayload::Sql(SqlTurn {
            sql: sql.to_string(),
            result: result.clone(),
        });
        let local = format!("{}\n-- {}", sql.trim(), status);
        self.push(t, Role::Assistant, remote, TurnKind::Sql, local, payload);
        debug!(session_id, rows = result.row_count, "sql response recorded");
        Ok(())
    }

    /// Record an analysis; values quoted from results are scrubbed from the
    /// remote copy and structured data stays local.
    pub fn add_analysis_response(
        &self,
        session_id: &str,
        text: &str,
        data: Option<serde_json::Value>,
    ) -> Result<(), ContextError> {
        let mut map = self.lock()?;
        let t = map
            .entry(session_id.to_string())
            .or_insert_with(|| DualTranscript::new(session_id));

        let remote = match self.gate.check(text, &t.sensitive_values) {
            RedactionDecision::Allow => text.to_string(),
            RedactionDecision::Redacted {
                text: scrubbed,
                redaction_count,
            } => {
                debug!(session_id, redaction_count, "analysis text redacted for remote transcript");
                scrubbed
            }
        };
        let payload = LocalPayload::Analysis(AnalysisTurn {
            text: text.to_string(),
            data,
        });
        self.push(
            t,
            Role::Assistant,
            remote,
            TurnKind::Analysis,
            text.to_string(),
            payload,
        );
        Ok(())
    }

    /// Record a clarification question put to the user.
    pub fn add_clarification(&self, session_id: &str, question: &str) -> Result<(), ContextError> {
        let mut map = self.lock()?;
        let t = map
            .entry(session_id.to_string())
            .or_insert_with(|| DualTranscript::new(session_id));
        let payload = LocalPayload::Clarification(ClarificationTurn {
            question: question.to_string(),
        });
        self.push(
            t,
            Role::Assistant,
            question.to_string(),
            TurnKind::Clarification,
            question.to_string(),
            payload,
        );
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Result<DualTranscript, ContextError> {
        self.lock()?
            .get(session_id)
            .cloned()
            .ok_or_else(|| ContextError::SessionNotFound(session_id.to_string()))
    }

    pub fn remote_view(&self, session_id: &str) -> Result<Vec<RemoteMessage>, ContextError> {
        self.lock()?
            .get(session_id)
            .map(|t| t.remote_messages.clone())
            .ok_or_else(|| ContextError::SessionNotFound(session_id.to_string()))
    }

    pub fn local_view(&self, session_id: &str) -> Result<Vec<LocalMessage>, ContextError> {
        self.lock()?
            .get(session_id)
            .map(|t| t.local_messages.clone())
            .ok_or_else(|| ContextError::SessionNotFound(session_id.to_string()))
    }

    /// True once the remote transcript is over the profile's threshold.
    pub fn should_summarize(&self, session_id: &str, profile: &BudgetProfile) -> bool {
        match self.lock() {
            Ok(map) => map
                .get(session_id)
                .map(|t| t.total_tokens > profile.summarize_threshold)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Collapse everything but the last `recent_window` remote messages into
    /// a single summary entry. The local transcript is never touched.
    ///
    /// Returns `None` when there is nothing older to collapse, including
    /// when the older part is already a single summary.
    pub async fn summarize(
        &self,
        session_id: &str,
        profile: &BudgetProfile,
        summarizer: &dyn TranscriptSummarizer,
    ) -> Result<Option<SummaryOutcome>, ContextError> {
        let older: Vec<RemoteMessage> = {
            let map = self.lock()?;
            let t = map
                .get(session_id)
                .ok_or_else(|| ContextError::SessionNotFound(session_id.to_string()))?;
            let split = t.remote_messages.len().saturating_sub(profile.recent_window);
            t.remote_messages[..split].to_vec()
        };

        let already_collapsed = older.len() == 1 && older[0].kind == TurnKind::Summary;
        if older.is_empty() || already_collapsed {
            return Ok(None);
        }

        let summary = summarizer.summarize(&older).await?;

        let mut map = self.lock()?;
        let t = map
            .get_mut(session_id)
            .ok_or_else(|| ContextError::SessionNotFound(session_id.to_string()))?;
        if t.remote_messages.len() < older.len() {
            return Err(ContextError::Summarization(
                "transcript shrank while summarizing".to_string(),
            ));
        }

        let messages_before = t.remote_messages.len();
        let tokens_before = t.total_tokens;
        let recent = t.remote_messages.split_off(older.len());
        let entry = RemoteMessage {
            role: Role::System,
            content: summary,
            timestamp: Timestamp::now(),
            kind: TurnKind::Summary,
        };
        t.remote_messages = std::iter::once(entry).chain(recent).collect();
        t.total_tokens = t
            .remote_messages
            .iter()
            .map(|m| self.counter.count(&m.content))
            .sum();
        t.summaries_applied += 1;
        t.updated_at = Timestamp::now();

        let outcome = SummaryOutcome {
            messages_before,
            messages_after: t.remote_messages.len(),
            tokens_before,
            tokens_after: t.total_tokens,
        };
        info!(
            session_id,
            messages_before,
            messages_after = outcome.messages_after,
            tokens_before,
            tokens_after = outcome.tokens_after,
            "remote transcript summarized"
        );
        Ok(Some(outcome))
    }

    /// Summarize only if the profile's threshold has been crossed.
    pub async fn maybe_summarize(
        &self,
        session_id: &str,
        profile: &BudgetProfile,
        summarizer: &dyn TranscriptSummarizer,
    ) -> Result<Option<SummaryOutcome>, ContextError> {
        if !self.should_summarize(session_id, profile) {
            return Ok(None);
        }
        self.summarize(session_id, profile, summarizer).await
    }

    /// Drop both transcripts of a session. Returns whether one existed.
    pub fn remove(&self, session_id: &str) -> bool {
        match self.lock() {
            Ok(mut map) => map.remove(session_id).is_some(),
            Err(_) => false,
        }
    }

    pub fn session_ids(&self) -> Vec<String> {
        match self.lock() {
            Ok(map) => map.keys().cloned().collect(),
            Err(_) => vec![],
        }
    }

    // -- Private helpers --

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, DualTranscript>>, ContextError> {
        self.transcripts
            .lock()
            .map_err(|e| ContextError::Storage(format!("transcript lock poisoned: {}", e)))
    }

    fn push(
        &self,
        t: &mut DualTranscript,
        role: Role,
        remote_content: String,
        kind: TurnKind,
        local_content: String,
        payload: LocalPayload,
    ) {
        let now = Timestamp::now();
        t.total_tokens += self.counter.count(&remote_content);
        t.local_tokens += self.counter.count(&local_content) + self.payload_cost(&payload);
        t.remote_messages.push(RemoteMessage {
            role,
            content: remote_content,
            timestamp: now,
            kind,
        });
        t.local_messages.push(LocalMessage {
            role,
            content: local_content,
            timestamp: now,
            payload,
        });
        t.updated_at = now;
    }

    fn payload_cost(&self, payload: &LocalPayload) -> usize {
        match payload {
            LocalPayload::Sql(turn) => serde_json::to_string(&turn.result.rows)
                .map(|s| self.counter.count(&s))
                .unwrap_or(0),
            LocalPayload::Analysis(AnalysisTurn {
                data: Some(data), ..
            }) => self.counter.count(&data.to_string()),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summarizer::ExtractiveSummarizer;
    use nlq_core::tokens::HeuristicCounter;
    use serde_json::json;

    fn make_store() -> ContextStore {
        ContextStore::new(Arc::new(HeuristicCounter::default()), &ContextConfig::default())
    }

    fn sales_result() -> QueryResult {
        QueryResult::new(
            vec!["customer".into(), "revenue".into()],
            vec![
                vec![json!("Globex Corporation"), json!(98412.75)],
                vec![json!("Initech"), json!(51200)],
            ],
            17,
        )
    }

    fn tiny_profile(threshold: usize, window: usize) -> BudgetProfile {
        BudgetProfile {
            hard_ceiling: 10_000,
            summarize_threshold: threshold,
            recent_window: window,
        }
    }

    // ---- Basic recording ----

    #[test]
    fn test_user_message_creates_transcript() {
        let store = make_store();
        store.add_user_message("s1", "revenue by customer").unwrap();
        let t = store.get("s1").unwrap();
        assert_eq!(t.remote_messages.len(), 1);
        assert_eq!(t.local_messages.len(), 1);
        assert_eq!(t.remote_messages[0].kind, TurnKind::User);
        assert!(t.total_tokens > 0);
    }

    #[test]
    fn test_get_unknown_session() {
        let store = make_store();
        assert!(matches!(
            store.get("missing"),
            Err(ContextError::SessionNotFound(_))
        ));
        assert!(store.remote_view("missing").is_err());
        assert!(store.local_view("missing").is_err());
    }

    // ---- Redaction ----

    #[test]
    fn test_sql_remote_entry_has_only_sql_and_status() {
        let store = make_store();
        let sql = "SELECT customer, SUM(amount) AS revenue FROM orders GROUP BY customer";
        store.add_sql_response("s1", sql, &sales_result()).unwrap();

        let remote = store.remote_view("s1").unwrap();
        assert_eq!(
            remote[0].content,
            format!("{}\n-- returned 2 rows in 17 ms", sql)
        );
        assert!(!remote[0].content.contains("Globex"));
        assert!(!remote[0].content.contains("98412.75"));

        let local = store.local_view("s1").unwrap();
        assert_eq!(local[0].sql_result(), Some(&sales_result()));
    }

    #[test]
    fn test_analysis_values_scrubbed_remotely_only() {
        let store = make_store();
        store
            .add_sql_response("s1", "SELECT * FROM orders", &sales_result())
            .unwrap();
        store
            .add_analysis_response(
                "s1",
                "Globex Corporation leads with 98412.75, ahead of Initech.",
                Some(json!({"top": "Globex Corporation"})),
            )
            .unwrap();

        let remote = store.remote_view("s1").unwrap();
        let text = &remote[1].content;
        assert!(!text.contains("Globex"));
        assert!(!text.contains("98412.75"));
        assert!(!text.contains("Initech"));
        assert!(text.contains("[VALUE]"));

        let local = store.local_view("s1").unwrap();
        assert!(local[1].content.contains("Globex Corporation"));
        match &local[1].payload {
            LocalPayload::Analysis(turn) => assert!(turn.data.is_some()),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_no_result_value_ever_reaches_remote() {
        let store = make_store();
        let results = [
            sales_result(),
            QueryResult::new(
                vec!["sku".into()],
                vec![vec![json!("SKU-77731")], vec![json!("SKU-90210")]],
                4,
            ),
        ];
        for (i, r) in results.iter().enumerate() {
            store.add_user_message("s1", &format!("question {i}")).unwrap();
            store.add_sql_response("s1", "SELECT 1", r).unwrap();
        }
        store
            .add_analysis_response(
                "s1",
                "Top entries: Initech, SKU-90210, Globex Corporation at 51200",
                None,
            )
            .unwrap();

        let remote = store.remote_view("s1").unwrap();
        for r in &results {
            for cell in r.cell_texts() {
                for m in &remote {
                    assert!(!m.content.contains(&cell), "{cell} leaked into remote");
                }
            }
        }
    }

    #[test]
    fn test_short_cell_values_scrubbed_remotely() {
        let store = make_store();
        let result = QueryResult::new(
            vec!["state".into(), "customers".into()],
            vec![vec![json!("WY"), json!(17)]],
            3,
        );
        store
            .add_sql_response("s1", "SELECT state, COUNT(*) FROM customers GROUP BY state", &result)
            .unwrap();
        store
            .add_analysis_response("s1", "Only state is WY with 17 customers", None)
            .unwrap();

        let remote = store.remote_view("s1").unwrap();
        assert_eq!(remote[1].content, "Only state is [VALUE] with [VALUE] customers");
        let local = store.local_view("s1").unwrap();
        assert_eq!(local[1].content, "Only state is WY with 17 customers");
    }

    #[test]
    fn test_local_tokens_exceed_remote_for_sql() {
        let store = make_store();
        store
            .add_sql_response("s1", "SELECT * FROM orders", &sales_result())
            .unwrap();
        let t = store.get("s1").unwrap();
        assert!(t.local_tokens > t.total_tokens);
    }

    #[test]
    fn test_clarification_recorded_in_both() {
        let store = make_store();
        store.add_clarification("s1", "Which fiscal year?").unwrap();
        let t = store.get("s1").unwrap();
        assert_eq!(t.remote_messages[0].kind, TurnKind::Clarification);
        assert!(matches!(
            t.local_messages[0].payload,
            LocalPayload::Clarification(_)
        ));
    }

    // ---- Summarization ----

    #[test]
    fn test_should_summarize_threshold() {
        let store = make_store();
        store.add_user_message("s1", &"x".repeat(400)).unwrap(); // 100 tokens
        assert!(!store.should_summarize("s1", &tiny_profile(100, 2)));
        assert!(store.should_summarize("s1", &tiny_profile(99, 2)));
        assert!(!store.should_summarize("other", &tiny_profile(0, 2)));
    }

    #[tokio::test]
    async fn test_summarize_keeps_recent_window() {
        let store = make_store();
        for i in 0..10 {
            store
                .add_user_message("s1", &format!("question number {i}"))
                .unwrap();
        }
        let summarizer = ExtractiveSummarizer::new();
        let outcome = store
            .summarize("s1", &tiny_profile(0, 4), &summarizer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.messages_before, 10);
        assert_eq!(outcome.messages_after, 5);

        let remote = store.remote_view("s1").unwrap();
        assert_eq!(remote[0].kind, TurnKind::Summary);
        assert_eq!(remote[1].content, "question number 6");
        assert_eq!(remote[4].content, "question number 9");

        // Local transcript untouched.
        assert_eq!(store.local_view("s1").unwrap().len(), 10);
        assert_eq!(store.get("s1").unwrap().summaries_applied, 1);
    }

    #[tokio::test]
    async fn test_summarize_recomputes_tokens() {
        let store = make_store();
        for _ in 0..8 {
            store.add_user_message("s1", &"y".repeat(400)).unwrap();
        }
        let before = store.get("s1").unwrap().total_tokens;
        let outcome = store
            .summarize("s1", &tiny_profile(0, 2), &ExtractiveSummarizer::new())
            .await
            .unwrap()
            .unwrap();
        let after = store.get("s1").unwrap().total_tokens;
        assert_eq!(outcome.tokens_before, before);
        assert_eq!(outcome.tokens_after, after);
        assert!(after < before);
    }

    #[tokio::test]
    async fn test_summarize_twice_is_stable() {
        let store = make_store();
        for i in 0..9 {
            store.add_user_message("s1", &format!("turn {i}")).unwrap();
        }
        let profile = tiny_profile(0, 4);
        let summarizer = ExtractiveSummarizer::new();
        store.summarize("s1", &profile, &summarizer).await.unwrap();
        let first = store.remote_view("s1").unwrap();

        let second = store.summarize("s1", &profile, &summarizer).await.unwrap();
        assert!(second.is_none());
        assert_eq!(store.remote_view("s1").unwrap(), first);
    }

    #[tokio::test]
    async fn test_summarize_short_transcript_is_noop() {
        let store = make_store();
        store.add_user_message("s1", "only one").unwrap();
        let outcome = store
            .summarize("s1", &tiny_profile(0, 4), &ExtractiveSummarizer::new())
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_maybe_summarize_respects_threshold() {
        let store = make_store();
        for i in 0..6 {
            store.add_user_message("s1", &format!("short {i}")).unwrap();
        }
        let summarizer = ExtractiveSummarizer::new();
        let skipped = store
            .maybe_summarize("s1", &tiny_profile(10_000, 2), &summarizer)
            .await
            .unwrap();
        assert!(skipped.is_none());

        let applied = store
            .maybe_summarize("s1", &tiny_profile(1, 2), &summarizer)
            .await
            .unwrap();
        assert!(applied.is_some());
    }

    #[tokio::test]
    async fn test_summarize_unknown_session() {
        let store = make_store();
        let result = store
            .summarize("nope", &tiny_profile(0, 2), &ExtractiveSummarizer::new())
            .await;
        assert!(matches!(result, Err(ContextError::SessionNotFound(_))));
    }

    // ---- Removal ----

    #[test]
    fn test_remove_is_idempotent() {
        let store = make_store();
        store.add_user_message("s1", "hi").unwrap();
        assert!(store.remove("s1"));
        assert!(!store.remove("s1"));
        assert!(store.session_ids().is_empty());
    }
}
