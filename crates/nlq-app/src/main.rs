//! nlq binary - composition root.
//!
//! 1. Parse CLI args and load configuration from TOML
//! 2. Initialize tracing
//! 3. Wire the demo catalog into an orchestrator
//! 4. Run one turn, or keep a dialogue going on stdin with --interactive
//!
//! Every turn result is printed to stdout as pretty JSON; logs go to stderr.

mod cli;
mod demo;

use std::sync::Arc;

use clap::Parser;
use nlq_core::config::NlqConfig;
use nlq_dialogue::{DialogueOrchestrator, OrchestratorContext, TurnResult};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::cli::CliArgs;
use crate::demo::DemoCatalog;

fn print_result(result: &TurnResult) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}

fn build_orchestrator(
    config: NlqConfig,
    args: &CliArgs,
) -> Result<DialogueOrchestrator, Box<dyn std::error::Error>> {
    let catalog = Arc::new(DemoCatalog::new());
    let counter = args.model_family.counter();

    let mut builder = OrchestratorContext::builder(config, counter)
        .table_selector(catalog.clone())
        .sql_generator(catalog.clone())
        .sql_executor(catalog.clone())
        .analyzer(catalog.clone());
    for provider in catalog.module_providers() {
        builder = builder.module_provider(Arc::new(provider));
    }
    Ok(DialogueOrchestrator::new(builder.build()?))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let config_file = args.resolve_config_path();
    let mut config = NlqConfig::load_or_default(&config_file);
    if let Some(dialect) = args.dialect {
        config.dialogue.default_dialect = dialect;
    }

    // Tracing. RUST_LOG wins over the flag and config.
    let level = args.resolve_log_level(&config.general.log_level);
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&level)),
        )
        .init();

    tracing::info!("Starting nlq v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), dialect = %config.dialogue.default_dialect, "Configuration loaded");

    let orchestrator = build_orchestrator(config, &args)?;

    let mut session_id = args.session.clone();
    if let Some(question) = args.question.as_deref() {
        let result = orchestrator
            .start(session_id.as_deref(), question, None)
            .await;
        print_result(&result)?;
        session_id = Some(result.session_id);
    } else if !args.interactive {
        eprintln!("nothing to ask: pass a question or --interactive");
        return Ok(());
    }

    if !args.interactive {
        return Ok(());
    }

    // Each line is a reply to the last turn, or a new question once the
    // previous one is answered. An empty line or `quit` ends the dialogue.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.eq_ignore_ascii_case("quit") {
            break;
        }
        let result = match session_id.as_deref() {
            Some(id) if orchestrator.status(id).is_ok() => {
                orchestrator.continue_turn(id, line).await
            }
            id => orchestrator.start(id, line, None).await,
        };
        print_result(&result)?;
        session_id = Some(result.session_id);
    }

    if let Some(id) = session_id {
        orchestrator.cleanup(&id).await;
    }
    Ok(())
}
