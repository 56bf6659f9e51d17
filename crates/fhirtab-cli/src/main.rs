mod cli;
mod commands;
mod observability;
mod views;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};
use fhirtab_config::RunnerConfig;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = RunnerConfig::load(cli.config.as_deref())?;
    observability::init_tracing(
        config.effective_log_level(),
        config.logs_folder.as_deref(),
    )?;

    match &cli.command {
        Commands::Run(args) => commands::run::execute(&config, args).await,
        Commands::Validate => commands::validate::execute(&config),
    }
}
