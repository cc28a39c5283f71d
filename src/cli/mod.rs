//! `conductor` command-line surface.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::{agent::AgentArgs, task::TaskArgs};

#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(about = "Conductor - event-driven task orchestrator", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Load this config file instead of `.conductor/`
    #[arg(short, long, global = true, env = "CONDUCTOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the orchestrator in the foreground until Ctrl-C
    Run(commands::run::RunArgs),

    /// Task management
    Task(TaskArgs),

    /// Agent management
    Agent(AgentArgs),

    /// Print a one-shot status snapshot
    Status,

    /// Print the effective configuration (YAML, or JSON with --json)
    Config,
}

/// Print an error the way the rest of the output is formatted and exit.
pub fn handle_error(err: anyhow::Error, json: bool) -> ! {
    if json {
        let chain: Vec<String> = err.chain().skip(1).map(ToString::to_string).collect();
        let body = serde_json::json!({
            "error": err.to_string(),
            "caused_by": chain,
        });
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&body).unwrap_or_else(|_| err.to_string())
        );
    } else {
        eprintln!("Error: {err}");
        for cause in err.chain().skip(1) {
            eprintln!("  caused by: {cause}");
        }
    }
    std::process::exit(1);
}
