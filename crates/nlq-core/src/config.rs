use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{NlqError, Result};
use crate::types::SqlDialect;

/// Top-level configuration for the dialogue engine.
///
/// Loaded from `~/.nlq/config.toml` by default. Each section corresponds to
/// one crate of the workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NlqConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub dialogue: DialogueConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub semantic: SemanticConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl NlqConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NlqConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| NlqError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Stage machine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Intent classifications below this confidence degrade to `unknown`.
    pub intent_min_confidence: f32,
    /// Candidate tables below this relevance are not selected.
    pub table_min_relevance: f32,
    /// Timeout applied to every external capability call.
    pub capability_timeout_ms: u64,
    /// Sessions idle for longer than this are eligible for eviction.
    pub session_idle_timeout_minutes: u32,
    /// Maximum accepted question length in characters.
    pub max_question_length: usize,
    /// Dialect passed to SQL generation and error classification.
    pub default_dialect: SqlDialect,
    /// Transcript budget profile used for summarization.
    pub model_profile: ProfileKind,
    /// Number of recent intents handed to the intent classifier.
    pub recent_intents: usize,
    /// Upper bound on stage steps within a single turn.
    pub max_stage_steps: usize,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            intent_min_confidence: 0.5,
            table_min_relevance: 0.3,
            capability_timeout_ms: 30_000,
            session_idle_timeout_minutes: 60,
            max_question_length: 4000,
            default_dialect: SqlDialect::MySql,
            model_profile: ProfileKind::Constrained,
            recent_intents: 5,
            max_stage_steps: 32,
        }
    }
}

/// Which transcript budget profile applies to a model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    Constrained,
    Expansive,
}

impl std::fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProfileKind::Constrained => write!(f, "constrained"),
            ProfileKind::Expansive => write!(f, "expansive"),
        }
    }
}

/// Token limits for one transcript profile.
///
/// The thresholds and window sizes are heuristics; tune them per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetProfile {
    /// Hard ceiling of the model context.
    pub hard_ceiling: usize,
    /// Remote transcript size above which summarization kicks in.
    pub summarize_threshold: usize,
    /// Number of most recent messages kept verbatim by summarization.
    pub recent_window: usize,
}

impl BudgetProfile {
    pub fn constrained() -> Self {
        Self {
            hard_ceiling: 32_000,
            summarize_threshold: 15_000,
            recent_window: 4,
        }
    }

    pub fn expansive() -> Self {
        Self {
            hard_ceiling: 1_000_000,
            summarize_threshold: 800_000,
            recent_window: 15,
        }
    }
}

/// Dual-transcript settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub constrained: BudgetProfile,
    pub expansive: BudgetProfile,
    /// Cell values shorter than this are scrubbed from remote analysis text
    /// only where they stand as whole words.
    pub min_redaction_len: usize,
}

impl ContextConfig {
    pub fn profile(&self, kind: ProfileKind) -> BudgetProfile {
        match kind {
            ProfileKind::Constrained => self.constrained,
            ProfileKind::Expansive => self.expansive,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            constrained: BudgetProfile::constrained(),
            expansive: BudgetProfile::expansive(),
            min_redaction_len: 3,
        }
    }
}

/// Semantic context packing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    /// Total prompt budget for SQL generation.
    pub total_budget: usize,
    /// Portion of the budget kept free for the model response.
    pub reserved_for_response: usize,
    /// High-priority modules are truncated only if at least this much remains.
    pub min_truncated_tokens: usize,
    /// Timeout for a single module provider fetch.
    pub provider_timeout_ms: u64,
    /// Priority overrides keyed by module name, e.g. `knowledge = "high"`.
    pub priorities: BTreeMap<String, String>,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            total_budget: 8_000,
            reserved_for_response: 2_000,
            min_truncated_tokens: 32,
            provider_timeout_ms: 10_000,
            priorities: BTreeMap::new(),
        }
    }
}

/// SQL error recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Regeneration attempts allowed per turn.
    pub max_retries: u32,
    /// Same-SQL re-executions allowed for connection-class failures.
    pub max_backoff_attempts: u32,
    /// Delay before the first backoff retry.
    pub initial_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive backoff delays.
    pub backoff_multiplier: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_backoff_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
            backoff_multiplier: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profiles() {
        let ctx = ContextConfig::default();
        assert_eq!(ctx.constrained.hard_ceiling, 32_000);
        assert_eq!(ctx.constrained.summarize_threshold, 15_000);
        assert_eq!(ctx.constrained.recent_window, 4);
        assert_eq!(ctx.expansive.hard_ceiling, 1_000_000);
        assert_eq!(ctx.expansive.summarize_threshold, 800_000);
        assert_eq!(ctx.expansive.recent_window, 15);
    }

    #[test]
    fn test_profile_lookup() {
        let ctx = ContextConfig::default();
        assert_eq!(ctx.profile(ProfileKind::Expansive).recent_window, 15);
        assert_eq!(ctx.profile(ProfileKind::Constrained).recent_window, 4);
    }

    #[test]
    fn test_default_recovery_ceiling() {
        assert_eq!(RecoveryConfig::default().max_retries, 3);
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config: NlqConfig = toml::from_str("").unwrap();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.dialogue.default_dialect, SqlDialect::MySql);
        assert_eq!(config.semantic.total_budget, 8_000);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let toml_str = r#"
            [dialogue]
            default_dialect = "postgres"
            model_profile = "expansive"

            [context.constrained]
            hard_ceiling = 32000
            summarize_threshold = 12000
            recent_window = 6
        "#;
        let config: NlqConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.dialogue.default_dialect, SqlDialect::Postgres);
        assert_eq!(config.dialogue.model_profile, ProfileKind::Expansive);
        assert_eq!(config.dialogue.max_stage_steps, 32);
        assert_eq!(config.context.constrained.recent_window, 6);
        assert_eq!(config.context.constrained.summarize_threshold, 12_000);
        assert_eq!(config.context.expansive.recent_window, 15);
    }

    #[test]
    fn test_priority_overrides_parse() {
        let toml_str = r#"
            [semantic.priorities]
            knowledge = "high"
        "#;
        let config: NlqConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.semantic.priorities.get("knowledge").map(String::as_str),
            Some("high")
        );
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = NlqConfig::default();
        config.recovery.max_backoff_attempts = 5;
        config.save(&path).unwrap();

        let loaded = NlqConfig::load(&path).unwrap();
        assert_eq!(loaded.recovery.max_backoff_attempts, 5);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let result = NlqConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(NlqError::Io(_))));
    }

    #[test]
    fn test_load_or_default_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is = = not toml").unwrap();
        let config = NlqConfig::load_or_default(&path);
        assert_eq!(config.dialogue.recent_intents, 5);
    }
}
