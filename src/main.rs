mod backend;
mod cli;
mod config;
mod discovery;
mod engine;
mod error;
mod metrics;
mod model;
mod orchestrator;
mod text_summary;

use anyhow::Result;
use clap::Parser;

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    init_logging();

    match cli::run(args).await? {
        cli::RunStatus::Completed => Ok(()),
        // The summary is already printed; report the interruption through the exit code.
        cli::RunStatus::Interrupted => std::process::exit(1),
    }
}
