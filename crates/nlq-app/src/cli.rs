//! CLI argument definitions for the `nlq` binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::Parser;
use nlq_core::tokens::ModelFamily;
use nlq_core::types::SqlDialect;
use std::path::PathBuf;

/// nlq: ask a database questions in natural language, one dialogue at a time.
#[derive(Parser, Debug)]
#[command(name = "nlq", version, about)]
pub struct CliArgs {
    /// Question to ask. Omit with --interactive to read questions from stdin.
    pub question: Option<String>,

    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// SQL dialect (mysql, postgres).
    #[arg(short = 'd', long = "dialect")]
    pub dialect: Option<SqlDialect>,

    /// Session id to start or reuse.
    #[arg(short = 's', long = "session")]
    pub session: Option<String>,

    /// Tokenizer family (openai, anthropic, generic).
    #[arg(long = "model-family", default_value = "generic")]
    pub model_family: ModelFamily,

    /// Keep reading replies and follow-up questions from stdin.
    #[arg(short = 'i', long = "interactive")]
    pub interactive: bool,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > NLQ_CONFIG env var > ~/.nlq/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("NLQ_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the log filter directive.
    ///
    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".nlq").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".nlq").join("config.toml");
    }
    PathBuf::from("config.toml")
}
