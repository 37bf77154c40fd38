use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use source_sync::connectors::{ConnectorContext, ConnectorRegistry};
use source_sync::pipeline::{Detectors, PipelineOrchestrator, RunTracker};
use source_sync::{
    AppConfig, BoundedDataStore, ConnectorService, IncrementalStateManager, StoreConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "source-sync")]
#[command(about = "Incremental sync of SQL, REST, SaaS, spreadsheet and stream sources")]
struct Cli {
    /// Connector definitions (overrides SYNC_CONNECTORS_FILE)
    #[arg(long)]
    connectors: Option<PathBuf>,

    /// Sync state file (overrides SYNC_STATE_FILE)
    #[arg(long)]
    state_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every enabled connector whose schedule is due
    Sync,
    /// Run one connector now
    Run {
        id: String,
        #[arg(long, default_value = "cli")]
        triggered_by: String,
    },
    /// Check connectivity of one connector
    Test { id: String },
    /// Inspect or reset incremental state
    State {
        #[command(subcommand)]
        action: StateAction,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// Print the state document as JSON
    Export,
    /// Zero cursors and counts of a source, or of one of its streams
    Reset { source: String, stream: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env().context("Failed to load configuration")?;
    if let Some(path) = cli.connectors {
        config.connectors_file = path;
    }
    if let Some(path) = cli.state_file {
        config.state_file = path;
    }

    let state = Arc::new(
        IncrementalStateManager::load_from_file(&config.state_file)
            .with_context(|| format!("Failed to load state from {}", config.state_file.display()))?,
    );

    if let Command::State { action } = &cli.command {
        match action {
            StateAction::Export => println!("{}", state.export_json()?),
            StateAction::Reset { source, stream } => {
                match stream {
                    Some(stream) => state.reset_stream_state(source, stream)?,
                    None => state.reset_source_state(source)?,
                }
                state.save_to_file(&config.state_file)?;
                info!("State reset for {}", source);
            }
        }
        return Ok(());
    }

    let store = BoundedDataStore::new(StoreConfig::from_app_config(&config))?;
    let orchestrator = PipelineOrchestrator::new(
        Arc::new(store),
        state.clone(),
        Arc::new(RunTracker::new()),
        Detectors::basic(),
    );
    let definitions = ConnectorService::load_definitions(&config.connectors_file)
        .with_context(|| format!("Failed to read {}", config.connectors_file.display()))?;
    let service = ConnectorService::new(
        definitions,
        ConnectorRegistry::with_builtin(),
        ConnectorContext::from_config(&config),
        orchestrator,
    )?;

    match cli.command {
        Command::Sync => {
            let summary = service.sync_all_scheduled().await;
            state.save_to_file(&config.state_file)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Run { id, triggered_by } => {
            let record = service.run_connector(&id, &triggered_by).await?;
            state.save_to_file(&config.state_file)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Test { id } => {
            let ok = service.test_connector(&id).await?;
            println!("{}: {}", id, if ok { "ok" } else { "unhealthy" });
        }
        Command::State { .. } => {}
    }

    Ok(())
}
