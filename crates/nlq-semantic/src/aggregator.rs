//! Greedy, priority-first packing of semantic modules under a token budget.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use nlq_core::config::SemanticConfig;
use nlq_core::tokens::TokenCounter;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::budget::TokenBudget;
use crate::error::SemanticError;
use crate::module::{clamp_relevance, ModuleContent, ModuleKind, ModuleProvider, Priority, PriorityMap};

/// One module as seen by the packer.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleCandidate {
    pub kind: ModuleKind,
    pub priority: Priority,
    pub text: String,
    pub relevance: f32,
    /// False when no provider answered (missing, failed, or timed out).
    pub available: bool,
}

impl ModuleCandidate {
    pub fn new(kind: ModuleKind, priority: Priority, content: ModuleContent) -> Self {
        Self {
            kind,
            priority,
            text: content.text,
            relevance: clamp_relevance(content.relevance),
            available: true,
        }
    }

    pub fn unavailable(kind: ModuleKind, priority: Priority) -> Self {
        Self {
            kind,
            priority,
            text: String::new(),
            relevance: 0.0,
            available: false,
        }
    }
}

/// Why a module was left out of the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No provider, or the provider failed or timed out.
    Unavailable,
    /// The provider returned no text.
    Empty,
    /// Did not fit and its tier may not be truncated.
    OverBudget,
}

/// Packed context plus the accounting behind it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationResult {
    pub enhanced_context: String,
    pub modules_used: BTreeSet<ModuleKind>,
    /// Sum of the token cost of every included section.
    pub total_tokens_used: usize,
    pub token_budget_remaining: usize,
    /// Relevance of all five modules, included or not.
    pub relevance_scores: BTreeMap<ModuleKind, f32>,
    /// Modules included in truncated form.
    pub truncated: BTreeSet<ModuleKind>,
    pub skipped: Vec<(ModuleKind, SkipReason)>,
}

fn section_label(kind: ModuleKind) -> String {
    format!("[{}]\n", kind)
}

/// Labelled section as it appears in the packed context.
fn render_section(kind: ModuleKind, text: &str) -> String {
    format!("{}{}", section_label(kind), text.trim())
}

/// Fit a section into `remaining` tokens by cutting its body.
///
/// The label is paid for first. When not even the label fits, a bare prefix
/// of the body is returned instead so the section still carries content.
fn truncate_section(
    kind: ModuleKind,
    text: &str,
    remaining: usize,
    counter: &dyn TokenCounter,
) -> Option<String> {
    let label = section_label(kind);
    let body = text.trim();
    let label_cost = counter.count(&label);

    if label_cost < remaining {
        let mut body_budget = remaining - label_cost;
        while body_budget > 0 {
            let cut = counter.truncate(body, body_budget);
            if cut.trim().is_empty() {
                break;
            }
            let section = format!("{}{}", label, cut);
            let cost = counter.count(&section);
            if cost <= remaining {
                return Some(section);
            }
            // Joining can cost more than the parts; shrink by the overshoot.
            body_budget = body_budget.saturating_sub(cost - remaining);
        }
    }

    let cut = counter.truncate(body, remaining);
    (!cut.trim().is_empty() && counter.count(&cut) <= remaining).then_some(cut)
}

/// Pack candidates into one context string.
///
/// Candidates are visited by priority (descending), then relevance
/// (descending), then declaration order. A section that fits is included
/// verbatim. One that does not fit is truncated to the remaining budget if it
/// is critical and any budget remains, or if it is high priority and at
/// least `min_truncated_tokens` remain; otherwise it is skipped.
pub fn pack(
    candidates: &[ModuleCandidate],
    budget: &TokenBudget,
    counter: &dyn TokenCounter,
    min_truncated_tokens: usize,
) -> AggregationResult {
    let available = budget.available_for_context();
    let mut remaining = available;

    let mut relevance_scores: BTreeMap<ModuleKind, f32> =
        ModuleKind::ALL.into_iter().map(|k| (k, 0.0)).collect();
    for c in candidates {
        relevance_scores.insert(c.kind, clamp_relevance(c.relevance));
    }

    let mut ordered: Vec<&ModuleCandidate> = candidates.iter().collect();
    ordered.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.relevance.total_cmp(&a.relevance))
            .then_with(|| a.kind.cmp(&b.kind))
    });

    let mut sections: Vec<String> = Vec::new();
    let mut modules_used = BTreeSet::new();
    let mut truncated = BTreeSet::new();
    let mut skipped = Vec::new();

    for c in ordered {
        if !c.available {
            skipped.push((c.kind, SkipReason::Unavailable));
            continue;
        }
        if c.text.trim().is_empty() {
            skipped.push((c.kind, SkipReason::Empty));
            continue;
        }

        let section = render_section(c.kind, &c.text);
        let cost = counter.count(&section);
        if cost <= remaining {
            remaining -= cost;
            sections.push(section);
            modules_used.insert(c.kind);
            continue;
        }

        let may_truncate = match c.priority {
            Priority::Critical => remaining > 0,
            Priority::High => remaining > 0 && remaining >= min_truncated_tokens,
            Priority::Medium | Priority::Low => false,
        };
        if !may_truncate {
            skipped.push((c.kind, SkipReason::OverBudget));
            continue;
        }

        let Some(cut) = truncate_section(c.kind, &c.text, remaining, counter) else {
            skipped.push((c.kind, SkipReason::OverBudget));
            continue;
        };
        let cut_cost = counter.count(&cut);
        debug!(module = %c.kind, full = cost, kept = cut_cost, "module truncated to fit budget");
        remaining -= cut_cost;
        sections.push(cut);
        modules_used.insert(c.kind);
        truncated.insert(c.kind);
    }

    AggregationResult {
        enhanced_context: sections.join("\n\n"),
        modules_used,
        total_tokens_used: available - remaining,
        token_budget_remaining: remaining,
        relevance_scores,
        truncated,
        skipped,
    }
}

// =============================================================================
// SemanticAggregator
// =============================================================================

/// Fetches every module provider concurrently and packs the results.
pub struct SemanticAggregator {
    providers: BTreeMap<ModuleKind, Arc<dyn ModuleProvider>>,
    counter: Arc<dyn TokenCounter>,
    priorities: PriorityMap,
    min_truncated_tokens: usize,
    provider_timeout: Duration,
}

impl SemanticAggregator {
    /// Build an aggregator with no providers registered.
    ///
    /// Fails if the configured priority overrides name an unknown module or
    /// tier.
    pub fn new(
        counter: Arc<dyn TokenCounter>,
        config: &SemanticConfig,
    ) -> Result<Self, SemanticError> {
        Ok(Self {
            providers: BTreeMap::new(),
            counter,
            priorities: PriorityMap::from_overrides(&config.priorities)?,
            min_truncated_tokens: config.min_truncated_tokens,
            provider_timeout: Duration::from_millis(config.provider_timeout_ms),
        })
    }

    /// Register a provider, replacing any previous one of the same kind.
    pub fn with_provider(mut self, provider: Arc<dyn ModuleProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn priorities(&self) -> &PriorityMap {
        &self.priorities
    }

    pub fn counter(&self) -> &Arc<dyn TokenCounter> {
        &self.counter
    }

    /// Fetch all modules for a question and pack them into `budget`.
    ///
    /// `overrides` replace the configured priority of individual modules for
    /// this request only.
    pub async fn aggregate(
        &self,
        question: &str,
        table_scope: Option<&[String]>,
        budget: &TokenBudget,
        overrides: &BTreeMap<ModuleKind, Priority>,
    ) -> AggregationResult {
        let priorities = self.priorities.overlay(overrides);
        let mut fetched = self.fetch_all(question, table_scope).await;

        let candidates: Vec<ModuleCandidate> = ModuleKind::ALL
            .into_iter()
            .map(|kind| match fetched.remove(&kind) {
                Some(content) => ModuleCandidate::new(kind, priorities.get(kind), content),
                None => ModuleCandidate::unavailable(kind, priorities.get(kind)),
            })
            .collect();

        let result = pack(
            &candidates,
            budget,
            self.counter.as_ref(),
            self.min_truncated_tokens,
        );
        debug!(
            used = result.total_tokens_used,
            remaining = result.token_budget_remaining,
            modules = result.modules_used.len(),
            truncated = result.truncated.len(),
            "semantic context packed"
        );
        result
    }

    async fn fetch_all(
        &self,
        question: &str,
        table_scope: Option<&[String]>,
    ) -> BTreeMap<ModuleKind, ModuleContent> {
        let mut tasks = JoinSet::new();
        for (kind, provider) in &self.providers {
            let kind = *kind;
            let provider = Arc::clone(provider);
            let question = question.to_string();
            let scope: Option<Vec<String>> = table_scope.map(<[String]>::to_vec);
            let limit = self.provider_timeout;
            tasks.spawn(async move {
                let outcome =
                    tokio::time::timeout(limit, provider.fetch(&question, scope.as_deref())).await;
                (kind, outcome)
            });
        }

        let mut out = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((kind, Ok(Ok(content)))) => {
                    out.insert(kind, content);
                }
                Ok((kind, Ok(Err(e)))) => {
                    warn!(module = %kind, error = %e, "module provider failed");
                }
                Ok((kind, Err(_))) => {
                    warn!(
                        module = %kind,
                        timeout_ms = self.provider_timeout.as_millis() as u64,
                        "module provider timed out"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "module provider task aborted");
                }
            }
        }
        out
    }
}
