//! Orion CLI - run and inspect WASI modules

mod cli;
mod commands;
mod error;
mod output;

use clap::Parser;
use cli::{Cli, Commands};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so guest stdout stays clean; RUST_LOG overrides.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    match rt.block_on(run_command_async(cli)) {
        Ok(code) => {
            drop(rt);
            std::process::exit(code);
        }
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            drop(rt);
            std::process::exit(1);
        }
    }
}

async fn run_command_async(cli: Cli) -> Result<i32, error::CliError> {
    match cli.command {
        Commands::Run(args) => commands::run::run(args).await,
        Commands::Inspect { module, json } => commands::inspect::run(&module, json).await,
    }
}
