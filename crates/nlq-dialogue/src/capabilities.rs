//! External capabilities the orchestrator calls out to.
//!
//! Models and the database live behind these traits. Every call is wrapped
//! in a timeout by the orchestrator; implementations may also report their
//! own timeouts through [`CapabilityError::Timeout`].

use async_trait::async_trait;
use nlq_context::LocalMessage;
use nlq_core::types::{QueryResult, SqlDialect};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::Intent;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("timed out after {0} ms")]
    Timeout(u64),
    /// For the executor this is the raw driver error message.
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentDecision {
    pub intent: Intent,
    pub confidence: f32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCandidate {
    pub name: String,
    pub relevance: f32,
    /// Join conditions the selector suggests, e.g. `orders.customer_id = customers.id`.
    pub join_hints: Vec<String>,
}

impl TableCandidate {
    pub fn new(name: impl Into<String>, relevance: f32) -> Self {
        Self {
            name: name.into(),
            relevance,
            join_hints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedSql {
    pub sql: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub text: String,
    /// Structured output (chart data, report tables); stays local.
    pub data: Option<serde_json::Value>,
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(
        &self,
        question: &str,
        recent_intents: &[Intent],
    ) -> Result<IntentDecision, CapabilityError>;
}

#[async_trait]
pub trait TableSelector: Send + Sync {
    /// Candidate tables ranked by relevance, best first.
    async fn select(
        &self,
        question: &str,
        data_source_id: Option<&str>,
    ) -> Result<Vec<TableCandidate>, CapabilityError>;
}

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(
        &self,
        question: &str,
        context: &str,
        dialect: SqlDialect,
    ) -> Result<GeneratedSql, CapabilityError>;
}

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(
        &self,
        sql: &str,
        data_source_id: Option<&str>,
    ) -> Result<QueryResult, CapabilityError>;
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Analyze a result against the full local transcript.
    async fn analyze(
        &self,
        question: &str,
        intent: Intent,
        result: &QueryResult,
        transcript: &[LocalMessage],
    ) -> Result<Analysis, CapabilityError>;
}

// =============================================================================
// KeywordIntentClassifier
// =============================================================================

struct IntentPattern {
    regex: Regex,
    intent: Intent,
    base_confidence: f32,
}

/// Regex-based intent classifier that needs no model.
pub struct KeywordIntentClassifier {
    followup: Vec<IntentPattern>,
    patterns: Vec<IntentPattern>,
}

impl Default for KeywordIntentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl KeywordIntentClassifier {
    pub fn new() -> Self {
        // Only considered when there is an earlier turn to follow up on.
        let followup: Vec<(&str, f32)> = vec![
            (
                r"(?i)\b(?:in|from|of|among|sort|rank|explain)\s+(?:those|these|them|that|the\s+(?:previous|last|above)\s+(?:result|results|data|numbers|rows))\b",
                0.85,
            ),
            (r"(?i)^\s*(?:why|explain|interpret)\b", 0.7),
            (r"(?i)\b(?:that|this|the last|the previous)\s+(?:result|table|chart|answer)\b", 0.75),
        ];

        let general: Vec<(&str, Intent, f32)> = vec![
            (
                r"(?i)\b(?:report|summary|summari[sz]e|overview|dashboard|breakdown)\b",
                Intent::ReportGeneration,
                0.8,
            ),
            (
                r"(?i)\b(?:how many|how much|which|who|list|show|count|total|sum|average|avg|top|trend|compare|revenue|sales|orders?|customers?|users?)\b",
                Intent::SmartQuery,
                0.75,
            ),
            (r"(?i)^\s*(?:what|when|where)\b", Intent::SmartQuery, 0.65),
        ];

        Self {
            followup: followup
                .into_iter()
                .map(|(pat, conf)| IntentPattern {
                    regex: Regex::new(pat).expect("Invalid followup regex"),
                    intent: Intent::DataFollowup,
                    base_confidence: conf,
                })
                .collect(),
            patterns: general
                .into_iter()
                .map(|(pat, intent, conf)| IntentPattern {
                    regex: Regex::new(pat).expect("Invalid intent regex"),
                    intent,
                    base_confidence: conf,
                })
                .collect(),
        }
    }

    pub fn decide(&self, question: &str, recent_intents: &[Intent]) -> IntentDecision {
        let followup: &[IntentPattern] = if recent_intents.is_empty() {
            &[]
        } else {
            &self.followup
        };
        let best = self
            .patterns
            .iter()
            .chain(followup.iter())
            .filter(|p| p.regex.is_match(question))
            .max_by(|a, b| a.base_confidence.total_cmp(&b.base_confidence));

        match best {
            Some(p) => IntentDecision {
                intent: p.intent,
                confidence: p.base_confidence,
                reason: format!("matched pattern for {}", p.intent),
            },
            None => IntentDecision {
                intent: Intent::Unknown,
                confidence: 0.3,
                reason: "no intent pattern matched".to_string(),
            },
        }
    }
}

#[async_trait]
impl IntentClassifier for KeywordIntentClassifier {
    async fn classify(
        &self,
        question: &str,
        recent_intents: &[Intent],
    ) -> Result<IntentDecision, CapabilityError> {
        Ok(self.decide(question, recent_intents))
    }
}
