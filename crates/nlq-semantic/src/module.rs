//! Semantic modules, their priorities, and the provider capability.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SemanticError;

/// The five metadata modules, in declaration order.
///
/// Declaration order is the final tie-breaker when packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    DataSource,
    TableStructure,
    TableRelation,
    Dictionary,
    Knowledge,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 5] = [
        ModuleKind::DataSource,
        ModuleKind::TableStructure,
        ModuleKind::TableRelation,
        ModuleKind::Dictionary,
        ModuleKind::Knowledge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::DataSource => "data_source",
            ModuleKind::TableStructure => "table_structure",
            ModuleKind::TableRelation => "table_relation",
            ModuleKind::Dictionary => "dictionary",
            ModuleKind::Knowledge => "knowledge",
        }
    }

    pub fn default_priority(&self) -> Priority {
        match self {
            ModuleKind::TableStructure => Priority::Critical,
            ModuleKind::Dictionary | ModuleKind::DataSource => Priority::High,
            ModuleKind::TableRelation | ModuleKind::Knowledge => Priority::Medium,
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModuleKind {
    type Err = SemanticError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModuleKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| SemanticError::UnknownModule(s.to_string()))
    }
}

/// Priority tier; higher tiers are packed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = SemanticError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(SemanticError::UnknownPriority(s.to_string())),
        }
    }
}

/// Priority of every module, defaults overlaid with overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityMap {
    tiers: BTreeMap<ModuleKind, Priority>,
}

impl PriorityMap {
    /// Parse string-keyed overrides, as found in configuration.
    pub fn from_overrides(overrides: &BTreeMap<String, String>) -> Result<Self, SemanticError> {
        let mut map = Self::default();
        for (module, priority) in overrides {
            map.set(module.parse()?, priority.parse()?);
        }
        Ok(map)
    }

    pub fn get(&self, kind: ModuleKind) -> Priority {
        self.tiers
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_priority())
    }

    pub fn set(&mut self, kind: ModuleKind, priority: Priority) {
        self.tiers.insert(kind, priority);
    }

    /// Copy of this map with per-request overrides applied.
    pub fn overlay(&self, overrides: &BTreeMap<ModuleKind, Priority>) -> Self {
        let mut merged = self.clone();
        for (kind, priority) in overrides {
            merged.set(*kind, *priority);
        }
        merged
    }
}

impl Default for PriorityMap {
    fn default() -> Self {
        Self {
            tiers: ModuleKind::ALL
                .into_iter()
                .map(|k| (k, k.default_priority()))
                .collect(),
        }
    }
}

/// What a provider returns for one question.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleContent {
    pub text: String,
    /// Relevance to the question, in `[0, 1]`.
    pub relevance: f32,
}

impl ModuleContent {
    pub fn new(text: impl Into<String>, relevance: f32) -> Self {
        Self {
            text: text.into(),
            relevance: clamp_relevance(relevance),
        }
    }

    pub fn empty() -> Self {
        Self {
            text: String::new(),
            relevance: 0.0,
        }
    }
}

pub(crate) fn clamp_relevance(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Source of one semantic module.
#[async_trait]
pub trait ModuleProvider: Send + Sync {
    fn kind(&self) -> ModuleKind;

    /// Fetch the module text for a question, optionally scoped to tables.
    async fn fetch(
        &self,
        question: &str,
        table_scope: Option<&[String]>,
    ) -> Result<ModuleContent, SemanticError>;
}

// =============================================================================
// StaticModuleProvider
// =============================================================================

/// Provider over fixed text sections, scored by keyword overlap.
///
/// Sections may be bound to a table; those are only returned when the table
/// is in scope (or no scope is given).
#[derive(Debug, Clone)]
pub struct StaticModuleProvider {
    kind: ModuleKind,
    sections: Vec<(Option<String>, String)>,
}

impl StaticModuleProvider {
    pub fn new(kind: ModuleKind) -> Self {
        Self {
            kind,
            sections: Vec::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.sections.push((None, text.into()));
        self
    }

    pub fn with_table_text(mut self, table: &str, text: impl Into<String>) -> Self {
        self.sections.push((Some(table.to_string()), text.into()));
        self
    }

    fn in_scope(table: &Option<String>, scope: Option<&[String]>) -> bool {
        match (table, scope) {
            (None, _) | (_, None) => true,
            (Some(t), Some(scope)) => scope.iter().any(|s| s.eq_ignore_ascii_case(t)),
        }
    }
}

#[async_trait]
impl ModuleProvider for StaticModuleProvider {
    fn kind(&self) -> ModuleKind {
        self.kind
    }

    async fn fetch(
        &self,
        question: &str,
        table_scope: Option<&[String]>,
    ) -> Result<ModuleContent, SemanticError> {
        let text = self
            .sections
            .iter()
            .filter(|(table, _)| Self::in_scope(table, table_scope))
            .map(|(_, text)| text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if text.is_empty() {
            return Ok(ModuleContent::empty());
        }
        let relevance = keyword_overlap(question, &text);
        Ok(ModuleContent::new(text, relevance))
    }
}

/// Share of the question's terms that occur in `text`.
pub fn keyword_overlap(question: &str, text: &str) -> f32 {
    let terms = terms_of(question);
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = terms_of(text);
    let hits = terms.iter().filter(|t| haystack.contains(*t)).count();
    hits as f32 / terms.len() as f32
}

fn terms_of(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.chars().count() >= 3)
        .map(|w| w.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declaration_order() {
        let mut kinds = vec![
            ModuleKind::Knowledge,
            ModuleKind::DataSource,
            ModuleKind::Dictionary,
        ];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                ModuleKind::DataSource,
                ModuleKind::Dictionary,
                ModuleKind::Knowledge
            ]
        );
    }

    #[test]
    fn test_default_priorities() {
        let map = PriorityMap::default();
        assert_eq!(map.get(ModuleKind::TableStructure), Priority::Critical);
        assert_eq!(map.get(ModuleKind::Dictionary), Priority::High);
        assert_eq!(map.get(ModuleKind::DataSource), Priority::High);
        assert_eq!(map.get(ModuleKind::TableRelation), Priority::Medium);
        assert_eq!(map.get(ModuleKind::Knowledge), Priority::Medium);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn test_overrides_from_config_strings() {
        let mut raw = BTreeMap::new();
        raw.insert("knowledge".to_string(), "Critical".to_string());
        let map = PriorityMap::from_overrides(&raw).unwrap();
        assert_eq!(map.get(ModuleKind::Knowledge), Priority::Critical);
        assert_eq!(map.get(ModuleKind::Dictionary), Priority::High);
    }

    #[test]
    fn test_bad_override_rejected() {
        let mut raw = BTreeMap::new();
        raw.insert("glossary".to_string(), "high".to_string());
        assert!(matches!(
            PriorityMap::from_overrides(&raw),
            Err(SemanticError::UnknownModule(_))
        ));

        let mut raw = BTreeMap::new();
        raw.insert("knowledge".to_string(), "urgent".to_string());
        assert!(matches!(
            PriorityMap::from_overrides(&raw),
            Err(SemanticError::UnknownPriority(_))
        ));
    }

    #[test]
    fn test_overlay_does_not_mutate_base() {
        let base = PriorityMap::default();
        let mut req = BTreeMap::new();
        req.insert(ModuleKind::TableRelation, Priority::Low);
        let merged = base.overlay(&req);
        assert_eq!(merged.get(ModuleKind::TableRelation), Priority::Low);
        assert_eq!(base.get(ModuleKind::TableRelation), Priority::Medium);
    }

    #[test]
    fn test_relevance_clamped() {
        assert_eq!(ModuleContent::new("x", 1.7).relevance, 1.0);
        assert_eq!(ModuleContent::new("x", -0.2).relevance, 0.0);
        assert_eq!(ModuleContent::new("x", f32::NAN).relevance, 0.0);
    }

    #[test]
    fn test_keyword_overlap() {
        let r = keyword_overlap("monthly revenue by region", "orders(region, revenue, month)");
        // "monthly", "revenue", "region" -> revenue and region hit
        assert!((r - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(keyword_overlap("", "anything"), 0.0);
    }

    #[tokio::test]
    async fn test_static_provider_respects_scope() {
        let provider = StaticModuleProvider::new(ModuleKind::TableStructure)
            .with_table_text("orders", "orders(id, region, revenue)")
            .with_table_text("users", "users(id, email)");

        let scope = vec!["orders".to_string()];
        let content = provider.fetch("revenue", Some(&scope)).await.unwrap();
        assert!(content.text.contains("orders("));
        assert!(!content.text.contains("users("));
        assert_eq!(content.relevance, 1.0);

        let all = provider.fetch("revenue", None).await.unwrap();
        assert!(all.text.contains("users("));
    }

    #[tokio::test]
    async fn test_static_provider_empty() {
        let provider = StaticModuleProvider::new(ModuleKind::Knowledge);
        let content = provider.fetch("anything", None).await.unwrap();
        assert_eq!(content, ModuleContent::empty());
    }
}
