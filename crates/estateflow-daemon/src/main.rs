mod cli;
mod logging;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use estateflow_core::agents::MarketMonitorAgent;
use estateflow_core::{AgentManager, AgentServices, AgentsConfig, StateStore};
use estateflow_storage::{Storage, paths};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = resolve_data_dir(cli.data_dir.clone())?;
    let log_dir = paths::ensure_logs_dir(&data_dir)?;
    let _guard = logging::init(&log_dir, cli.log_stderr)?;

    let config = load_config(cli.config.clone())?;
    let storage = Storage::new(paths::database_path(&data_dir))?;
    info!(data_dir = %data_dir.display(), "Opened storage");

    let store: Arc<dyn StateStore> = Arc::new(storage.agent_state.clone());
    let services = AgentServices::new().with_store(Arc::new(storage.kv_store.clone()));
    let manager = AgentManager::new(config, services, Some(store));

    manager
        .register(Arc::new(MarketMonitorAgent::new()), true)
        .await;
    manager.spawn_health_monitor();

    let printer = cli.print_events.then(|| {
        let mut events = manager.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(err) => warn!("Failed to encode event: {}", err),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event printer lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    });

    info!(agents = ?manager.agent_names(), "EstateFlow agents running");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    manager.cleanup().await;
    if let Some(printer) = printer {
        printer.abort();
    }
    Ok(())
}

fn resolve_data_dir(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            Ok(dir)
        }
        None => paths::ensure_data_dir(),
    }
}

fn load_config(explicit: Option<PathBuf>) -> Result<AgentsConfig> {
    let Some(path) = explicit.or_else(AgentsConfig::default_path) else {
        return Ok(AgentsConfig::default());
    };
    let config = AgentsConfig::load_from_path(&path)?;
    info!(path = %path.display(), "Loaded agent config");
    Ok(config)
}
