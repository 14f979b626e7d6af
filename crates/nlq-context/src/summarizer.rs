//! Summarization of older remote-transcript messages.

use std::collections::BTreeSet;

use async_trait::async_trait;
use regex::Regex;

use crate::error::ContextError;
use crate::transcript::{RemoteMessage, TurnKind};

const TOPIC_PREFIX: &str = "- Topic: ";
const TABLES_PREFIX: &str = "- Tables queried: ";
const MAX_TOPIC_CHARS: usize = 160;

/// Collapses a run of older messages into one prose summary.
///
/// Only ever sees the remote-safe transcript, so implementations may call an
/// externally hosted model.
#[async_trait]
pub trait TranscriptSummarizer: Send + Sync {
    async fn summarize(&self, older: &[RemoteMessage]) -> Result<String, ContextError>;
}

/// Extractive summarizer that needs no model: core topic, tables already
/// queried, and open threads.
pub struct ExtractiveSummarizer {
    table_pattern: Regex,
}

impl ExtractiveSummarizer {
    pub fn new() -> Self {
        Self {
            table_pattern: Regex::new(r#"(?i)\b(?:from|join)\s+[`"\[]?([A-Za-z_][\w.]*)"#)
                .expect("Invalid table regex"),
        }
    }

    /// Table names referenced by SQL text.
    fn tables_in(&self, sql: &str) -> Vec<String> {
        self.table_pattern
            .captures_iter(sql)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .collect()
    }

    fn compose(&self, older: &[RemoteMessage]) -> String {
        let mut topic: Option<String> = None;
        let mut tables: BTreeSet<String> = BTreeSet::new();
        let mut queries = 0usize;
        let mut open_threads: Vec<String> = Vec::new();
        let mut last_question: Option<String> = None;
        let mut answered_last = true;

        for msg in older {
            match msg.kind {
                TurnKind::Summary => {
                    for line in msg.content.lines() {
                        if let Some(rest) = line.strip_prefix(TOPIC_PREFIX) {
                            topic.get_or_insert_with(|| rest.to_string());
                        } else if let Some(rest) = line.strip_prefix(TABLES_PREFIX) {
                            tables.extend(rest.split(", ").map(str::to_string));
                        }
                    }
                }
                TurnKind::User => {
                    let text = clip(msg.content.trim(), MAX_TOPIC_CHARS);
                    topic.get_or_insert_with(|| text.clone());
                    last_question = Some(text);
                    answered_last = false;
                }
                TurnKind::Sql => {
                    queries += 1;
                    tables.extend(self.tables_in(&msg.content));
                    answered_last = true;
                }
                TurnKind::Analysis => answered_last = true,
                TurnKind::Clarification => {
                    open_threads.push(clip(msg.content.trim(), MAX_TOPIC_CHARS));
                }
            }
        }

        if !answered_last {
            if let Some(q) = last_question {
                open_threads.push(format!("unanswered: {}", q));
            }
        }

        let mut out = format!("Conversation summary ({} earlier messages):\n", older.len());
        out.push_str(TOPIC_PREFIX);
        out.push_str(topic.as_deref().unwrap_or("(none)"));
        out.push('\n');
        if !tables.is_empty() {
            out.push_str(TABLES_PREFIX);
            out.push_str(&tables.into_iter().collect::<Vec<_>>().join(", "));
            out.push('\n');
        }
        out.push_str(&format!("- Queries run: {}\n", queries));
        if !open_threads.is_empty() {
            out.push_str("- Open threads: ");
            out.push_str(&open_threads.join("; "));
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranscriptSummarizer for ExtractiveSummarizer {
    async fn summarize(&self, older: &[RemoteMessage]) -> Result<String, ContextError> {
        Ok(self.compose(older))
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nlq_core::types::{Role, Timestamp};

    fn msg(kind: TurnKind, content: &str) -> RemoteMessage {
        let role = match kind {
            TurnKind::User => Role::User,
            TurnKind::Summary => Role::System,
            _ => Role::Assistant,
        };
        RemoteMessage {
            role,
            content: content.to_string(),
            timestamp: Timestamp::now(),
            kind,
        }
    }

    #[tokio::test]
    async fn test_summary_has_topic_tables_and_count() {
        let s = ExtractiveSummarizer::new();
        let older = vec![
            msg(TurnKind::User, "What was revenue by region in 2023?"),
            msg(
                TurnKind::Sql,
                "SELECT r.name, SUM(o.total) FROM orders o JOIN regions r ON r.id = o.region_id\n-- returned 4 rows in 12 ms",
            ),
            msg(TurnKind::Analysis, "Revenue is concentrated in two regions."),
        ];
        let out = s.summarize(&older).await.unwrap();
        assert!(out.starts_with("Conversation summary (3 earlier messages):"));
        assert!(out.contains("- Topic: What was revenue by region in 2023?"));
        assert!(out.contains("- Tables queried: orders, regions"));
        assert!(out.contains("- Queries run: 1"));
        assert!(!out.contains("Open threads"));
    }

    #[tokio::test]
    async fn test_open_threads_reported() {
        let s = ExtractiveSummarizer::new();
        let older = vec![
            msg(TurnKind::User, "show churn"),
            msg(TurnKind::Clarification, "Which product line do you mean?"),
            msg(TurnKind::User, "the enterprise tier"),
        ];
        let out = s.summarize(&older).await.unwrap();
        assert!(out.contains("Which product line do you mean?"));
        assert!(out.contains("unanswered: the enterprise tier"));
    }

    #[tokio::test]
    async fn test_previous_summary_folded_in() {
        let s = ExtractiveSummarizer::new();
        let older = vec![
            msg(
                TurnKind::Summary,
                "Conversation summary (6 earlier messages):\n- Topic: quarterly revenue\n- Tables queried: orders\n- Queries run: 2",
            ),
            msg(TurnKind::User, "and by customer?"),
            msg(TurnKind::Sql, "SELECT * FROM customers\n-- returned 10 rows in 5 ms"),
        ];
        let out = s.summarize(&older).await.unwrap();
        assert!(out.contains("- Topic: quarterly revenue"));
        assert!(out.contains("- Tables queried: customers, orders"));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let s = ExtractiveSummarizer::new();
        let out = s.summarize(&[]).await.unwrap();
        assert!(out.contains("- Topic: (none)"));
    }

    #[test]
    fn test_tables_in_handles_quotes_and_schema() {
        let s = ExtractiveSummarizer::new();
        let tables = s.tables_in(r#"SELECT * FROM "public.sales" s JOIN `dim_date` d ON 1=1"#);
        assert_eq!(tables, vec!["public.sales", "dim_date"]);
    }

    #[test]
    fn test_clip_long_text() {
        let long = "a".repeat(200);
        let clipped = clip(&long, 10);
        assert_eq!(clipped, format!("{}...", "a".repeat(10)));
    }
}
