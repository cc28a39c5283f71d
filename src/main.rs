//! Conductor CLI entry point.

use anyhow::Result;
use clap::Parser;

use conductor::cli::{commands, handle_error, Cli, Commands};
use conductor::domain::models::Config;
use conductor::infrastructure::config::ConfigLoader;
use conductor::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json = cli.json;

    if let Err(err) = run(cli).await {
        handle_error(err, json);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };

    let mut log_config = LogConfig::try_from(&config.logging)?;
    if cli.verbose {
        log_config = log_config.with_level("debug");
    } else if !matches!(cli.command, Commands::Run(_)) {
        // One-shot commands print their own output.
        log_config = log_config.with_level("warn");
    }
    let _logger = LoggerImpl::init(&log_config)?;

    dispatch(cli.command, config, cli.json).await
}

async fn dispatch(command: Commands, config: Config, json: bool) -> Result<()> {
    match command {
        Commands::Run(args) => commands::run::execute(args, config, json).await,
        Commands::Task(args) => commands::task::execute(args, &config, json).await,
        Commands::Agent(args) => commands::agent::execute(args, &config, json).await,
        Commands::Status => commands::status::execute(&config, json).await,
        Commands::Config => commands::config::execute(&config, json),
    }
}
