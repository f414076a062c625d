//! Runner daemon entry point.

mod commands;

use clap::{Parser, Subcommand};
use runner_config::RunnerConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "runner")]
#[command(about = "CI runner daemon", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: RunnerConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register with the control plane and poll it for jobs until stopped.
    Run,
    /// Execute a single job document read from disk, without a control
    /// plane, for local debugging.
    Local {
        /// Path to a JSON-encoded `RunnableJob`.
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => commands::run::run(cli.config).await,
        Commands::Local { path } => commands::local::run(cli.config, &path).await,
    }
}
