//! Everything a stage needs, constructed once and passed explicitly.

use std::sync::Arc;
use std::time::Duration;

use nlq_context::{ContextStore, ExtractiveSummarizer, TranscriptSummarizer};
use nlq_core::config::{BudgetProfile, NlqConfig};
use nlq_core::tokens::TokenCounter;
use nlq_core::types::SqlDialect;
use nlq_recovery::{RetryLedger, RetryPolicy, SqlErrorClassifier};
use nlq_semantic::{ModuleProvider, SemanticAggregator, TokenBudget};

use crate::capabilities::{
    Analyzer, IntentClassifier, KeywordIntentClassifier, SqlExecutor, SqlGenerator, TableSelector,
};
use crate::error::DialogueError;

/// Services and capabilities shared by every session.
pub struct OrchestratorContext {
    pub config: NlqConfig,
    pub context_store: ContextStore,
    pub aggregator: SemanticAggregator,
    pub budget: TokenBudget,
    pub classifier: SqlErrorClassifier,
    pub policy: RetryPolicy,
    pub ledger: RetryLedger,
    pub summarizer: Arc<dyn TranscriptSummarizer>,
    pub intent_classifier: Arc<dyn IntentClassifier>,
    pub table_selector: Arc<dyn TableSelector>,
    pub sql_generator: Arc<dyn SqlGenerator>,
    pub sql_executor: Arc<dyn SqlExecutor>,
    pub analyzer: Arc<dyn Analyzer>,
}

impl OrchestratorContext {
    pub fn builder(config: NlqConfig, counter: Arc<dyn TokenCounter>) -> OrchestratorContextBuilder {
        OrchestratorContextBuilder {
            config,
            counter,
            providers: Vec::new(),
            summarizer: None,
            intent_classifier: None,
            table_selector: None,
            sql_generator: None,
            sql_executor: None,
            analyzer: None,
        }
    }

    pub fn capability_timeout(&self) -> Duration {
        Duration::from_millis(self.config.dialogue.capability_timeout_ms)
    }

    pub fn dialect(&self) -> SqlDialect {
        self.config.dialogue.default_dialect
    }

    /// Transcript profile of the configured model family.
    pub fn profile(&self) -> BudgetProfile {
        self.config.context.profile(self.config.dialogue.model_profile)
    }
}

/// Builder for [`OrchestratorContext`].
///
/// Table selection, generation, execution and analysis are required. Intent
/// classification defaults to [`KeywordIntentClassifier`] and summarization
/// to [`ExtractiveSummarizer`].
pub struct OrchestratorContextBuilder {
    config: NlqConfig,
    counter: Arc<dyn TokenCounter>,
    providers: Vec<Arc<dyn ModuleProvider>>,
    summarizer: Option<Arc<dyn TranscriptSummarizer>>,
    intent_classifier: Option<Arc<dyn IntentClassifier>>,
    table_selector: Option<Arc<dyn TableSelector>>,
    sql_generator: Option<Arc<dyn SqlGenerator>>,
    sql_executor: Option<Arc<dyn SqlExecutor>>,
    analyzer: Option<Arc<dyn Analyzer>>,
}

impl OrchestratorContextBuilder {
    pub fn module_provider(mut self, provider: Arc<dyn ModuleProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn TranscriptSummarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn intent_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.intent_classifier = Some(classifier);
        self
    }

    pub fn table_selector(mut self, selector: Arc<dyn TableSelector>) -> Self {
        self.table_selector = Some(selector);
        self
    }

    pub fn sql_generator(mut self, generator: Arc<dyn SqlGenerator>) -> Self {
        self.sql_generator = Some(generator);
        self
    }

    pub fn sql_executor(mut self, executor: Arc<dyn SqlExecutor>) -> Self {
        self.sql_executor = Some(executor);
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn build(self) -> Result<OrchestratorContext, DialogueError> {
        let budget = TokenBudget::from_config(&self.config.semantic)?;
        let mut aggregator =
            SemanticAggregator::new(Arc::clone(&self.counter), &self.config.semantic)?;
        for provider in self.providers {
            aggregator = aggregator.with_provider(provider);
        }

        Ok(OrchestratorContext {
            context_store: ContextStore::new(Arc::clone(&self.counter), &self.config.context),
            aggregator,
            budget,
            classifier: SqlErrorClassifier::new(),
            policy: RetryPolicy::from_config(&self.config.recovery),
            ledger: RetryLedger::new(),
            summarizer: self
                .summarizer
                .unwrap_or_else(|| Arc::new(ExtractiveSummarizer::new())),
            intent_classifier: self
                .intent_classifier
                .unwrap_or_else(|| Arc::new(KeywordIntentClassifier::new())),
            table_selector: self
                .table_selector
                .ok_or(DialogueError::MissingCapability("table_selector"))?,
            sql_generator: self
                .sql_generator
                .ok_or(DialogueError::MissingCapability("sql_generator"))?,
            sql_executor: self
                .sql_executor
                .ok_or(DialogueError::MissingCapability("sql_executor"))?,
            analyzer: self
                .analyzer
                .ok_or(DialogueError::MissingCapability("analyzer"))?,
            config: self.config,
        })
    }
}
