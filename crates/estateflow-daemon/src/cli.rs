use clap::Parser;
use std::path::PathBuf;

/// Runs EstateFlow background agents until interrupted.
#[derive(Debug, Parser)]
#[command(name = "estateflow", version, about)]
pub struct Cli {
    /// Agent configuration file (defaults to ~/.config/estateflow/agents.toml)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Data directory for the database and logs
    #[arg(long, env = "ESTATEFLOW_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Also write logs to stderr
    #[arg(long)]
    pub log_stderr: bool,

    /// Print agent events to stdout as JSON lines
    #[arg(long)]
    pub print_events: bool,
}
